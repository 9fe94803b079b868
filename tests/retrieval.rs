use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use kb_harness::config::parse_config;
use kb_harness::kb::KnowledgeBase;
use kb_harness::migrate::migrate_pool;
use kb_harness::search::{search_lines, SearchSettings};
use kb_harness::sqlite_store::SqliteStore;
use kb_harness_core::embedding::{DisabledEmbedder, EmbedPurpose, EmbeddingProvider, HashEmbedder};
use kb_harness_core::error::EmbeddingError;
use kb_harness_core::models::{ChunkContent, KnowledgeChunk, SourceVersion};
use kb_harness_core::search::{search, SearchMode, SearchOutcome, SearchParams, SearchRequest};
use kb_harness_core::store::memory::InMemoryStore;
use kb_harness_core::store::KnowledgeStore;

const DIMS: usize = 256;

struct DownEmbedder;

#[async_trait]
impl EmbeddingProvider for DownEmbedder {
    fn model_name(&self) -> &str {
        "fnv1a-256"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed_batch(
        &self,
        _texts: &[String],
        _purpose: EmbedPurpose,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::Transient("timed out".into()))
    }
}

fn corpus() -> Vec<KnowledgeChunk> {
    let provider = HashEmbedder::new(DIMS);
    let rows = [
        (
            "scb_faq_141",
            "FAQ",
            "How much does a jump pass cost?",
            "$15 +tax per hour",
            vec!["pricing", "jump"],
        ),
        (
            "scb_contact_003",
            "Contact",
            "What is your phone number?",
            "289-454-5555",
            vec!["contact"],
        ),
        (
            "scb_hours_001",
            "FAQ",
            "What are your opening hours?",
            "Open daily from 10am to 8pm",
            vec!["hours"],
        ),
        (
            "scb_party_010",
            "Parties",
            "How much does a birthday party cost?",
            "Party packages start at $299",
            vec!["pricing", "party"],
        ),
    ];
    rows.into_iter()
        .map(|(id, category, question, answer, tags)| {
            let content = ChunkContent {
                category: category.into(),
                subcategory: "General".into(),
                question: question.into(),
                answer: answer.into(),
                tags: tags.into_iter().map(String::from).collect(),
                location: (id == "scb_faq_141").then(|| "Scarborough".to_string()),
            };
            let embedding = provider.embed_sync(&content.embed_text());
            KnowledgeChunk::new(id, content, embedding, "fnv1a-256", SourceVersion::new("1"))
        })
        .collect()
}

async fn fill(store: &dyn KnowledgeStore) {
    for chunk in corpus() {
        store.upsert(&chunk).await.unwrap();
    }
}

async fn sqlite_store(tmp: &TempDir) -> SqliteStore {
    let pool = kb_harness::db::connect_path(&tmp.path().join("kb.sqlite"))
        .await
        .unwrap();
    migrate_pool(&pool).await.unwrap();
    SqliteStore::new(pool)
}

fn ids(outcome: &SearchOutcome) -> Vec<String> {
    outcome
        .results()
        .iter()
        .map(|r| r.chunk_id.clone())
        .collect()
}

async fn top_hit(store: &dyn KnowledgeStore, query: &str) -> String {
    let provider = HashEmbedder::new(DIMS);
    let outcome = search(
        store,
        &provider,
        &SearchRequest::new(query, 3),
        &SearchParams::default(),
    )
    .await;
    assert!(matches!(outcome, SearchOutcome::Ranked { .. }), "{outcome:?}");
    ids(&outcome).into_iter().next().unwrap()
}

#[tokio::test]
async fn example_queries_rank_expected_chunk_first() {
    let memory = InMemoryStore::new();
    fill(&memory).await;
    let tmp = TempDir::new().unwrap();
    let sqlite = sqlite_store(&tmp).await;
    fill(&sqlite).await;

    for store in [&memory as &dyn KnowledgeStore, &sqlite] {
        assert_eq!(top_hit(store, "cost to jump").await, "scb_faq_141");
        assert_eq!(top_hit(store, "phone number").await, "scb_contact_003");
    }
}

#[tokio::test]
async fn both_backends_return_identical_rankings() {
    let memory = InMemoryStore::new();
    fill(&memory).await;
    let tmp = TempDir::new().unwrap();
    let sqlite = sqlite_store(&tmp).await;
    fill(&sqlite).await;
    let provider = HashEmbedder::new(DIMS);
    let params = SearchParams::default();

    for query in ["how much does it cost", "hours", "party pricing", "5555"] {
        let request = SearchRequest::new(query, 4);
        let a = search(&memory, &provider, &request, &params).await;
        let b = search(&sqlite, &provider, &request, &params).await;
        assert_eq!(ids(&a), ids(&b), "query {query:?}");
        // Repeated queries are deterministic.
        let again = search(&sqlite, &provider, &request, &params).await;
        assert_eq!(b, again);
    }
}

#[tokio::test]
async fn scores_are_bounded_and_sorted() {
    let store = InMemoryStore::new();
    fill(&store).await;
    let provider = HashEmbedder::new(DIMS);
    let outcome = search(
        &store,
        &provider,
        &SearchRequest::new("how much does a party cost", 4),
        &SearchParams::default(),
    )
    .await;
    let results = outcome.results();
    assert!(!results.is_empty());
    for pair in results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    for r in results {
        assert!((0.0..=1.0).contains(&r.score));
    }
}

#[tokio::test]
async fn provider_outage_degrades_to_keyword_results() {
    let store = InMemoryStore::new();
    fill(&store).await;
    let outcome = search(
        &store,
        &DownEmbedder,
        &SearchRequest::new("phone number", 3),
        &SearchParams::default(),
    )
    .await;
    match &outcome {
        SearchOutcome::KeywordOnly { results, reason } => {
            assert_eq!(results[0].chunk_id, "scb_contact_003");
            assert_eq!(results[0].semantic_score, 0.0);
            assert!(reason.contains("timed out"));
        }
        other => panic!("expected keyword-only results, got {other:?}"),
    }
}

#[tokio::test]
async fn dimension_mismatch_blocks_search() {
    let store = InMemoryStore::new();
    fill(&store).await;
    let provider = HashEmbedder::new(DIMS / 2);
    let outcome = search(
        &store,
        &provider,
        &SearchRequest::new("phone number", 3),
        &SearchParams::default(),
    )
    .await;
    assert_eq!(
        outcome,
        SearchOutcome::DimensionMismatch {
            configured: DIMS / 2,
            stored: vec![DIMS]
        }
    );
}

#[tokio::test]
async fn keyword_mode_and_category_filter() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&tmp).await;
    fill(&store).await;

    let request = SearchRequest {
        query: "how much does it cost",
        k: 5,
        mode: SearchMode::Keyword,
        category: Some("parties"),
    };
    let outcome = search(&store, &DisabledEmbedder, &request, &SearchParams::default()).await;
    assert!(matches!(outcome, SearchOutcome::Ranked { .. }));
    assert_eq!(ids(&outcome), vec!["scb_party_010".to_string()]);
}

#[tokio::test]
async fn knowledge_base_handle_searches_with_configured_weights() {
    let tmp = TempDir::new().unwrap();
    let config = parse_config(&format!(
        "[db]\npath = \"{}\"\n[embedding]\nprovider = \"hash\"\ndims = {DIMS}\n",
        tmp.path().join("kb.sqlite").display()
    ))
    .unwrap();
    let kb = KnowledgeBase::open_with_provider(&config, Arc::new(HashEmbedder::new(DIMS)))
        .await
        .unwrap();
    fill(kb.store()).await;

    let outcome = kb.search("cost to jump", 2).await.unwrap();
    assert_eq!(ids(&outcome)[0], "scb_faq_141");
    kb.close().await;
}

#[tokio::test]
async fn results_carry_the_chunk_location() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&tmp).await;
    fill(&store).await;

    let stored = store.get("scb_faq_141").await.unwrap().unwrap();
    assert_eq!(stored.location.as_deref(), Some("Scarborough"));

    for mode in [SearchMode::Keyword, SearchMode::Semantic, SearchMode::Hybrid] {
        let request = SearchRequest {
            query: "jump pass cost",
            k: 4,
            mode,
            category: None,
        };
        let outcome = search(&store, &HashEmbedder::new(DIMS), &request, &SearchParams::default()).await;
        let results = outcome.results();
        let faq = results.iter().find(|r| r.chunk_id == "scb_faq_141").unwrap();
        assert_eq!(faq.location.as_deref(), Some("Scarborough"), "{mode:?}");
        let contact = results.iter().find(|r| r.chunk_id == "scb_contact_003");
        assert!(contact.map_or(true, |r| r.location.is_none()));
    }
}

#[tokio::test]
async fn interactive_search_reads_queries_until_end_of_input() {
    let tmp = TempDir::new().unwrap();
    let config = parse_config(&format!(
        "[db]\npath = \"{}\"\n[embedding]\nprovider = \"hash\"\ndims = {DIMS}\n",
        tmp.path().join("kb.sqlite").display()
    ))
    .unwrap();
    let kb = KnowledgeBase::open_with_provider(&config, Arc::new(HashEmbedder::new(DIMS)))
        .await
        .unwrap();
    fill(kb.store()).await;

    let settings = SearchSettings {
        k: 1,
        mode: SearchMode::Hybrid,
        category: None,
        json: false,
    };
    let input: &[u8] = b"cost to jump\n\n   \nwhat is your phone number\n";
    let mut out = Vec::new();
    let searched = search_lines(&kb, input, &settings, &mut out).await.unwrap();
    assert_eq!(searched, 2);

    let text = String::from_utf8(out).unwrap();
    assert_eq!(text.matches("Query> ").count(), 5);
    assert!(text.contains("scb_faq_141"));
    assert!(text.contains("@ Scarborough"));
    assert!(text.contains("scb_contact_003"));
    kb.close().await;
}
