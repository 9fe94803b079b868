use anyhow::{bail, Result};
use tracing::{info, warn};

use kb_harness_core::embedding::{EmbedPurpose, EmbeddingProvider};
use kb_harness_core::models::KnowledgeChunk;
use kb_harness_core::store::{KnowledgeStore, WriteEffect};

use crate::kb::KnowledgeBase;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    pub total: usize,
    pub embedded: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// Re-embeds every live chunk whose vector was not produced by `provider`.
///
/// This is how a store with mixed or outdated vector dimensions is brought
/// back to a searchable state. Chunks already embedded with the provider's
/// model and dimension are counted as unchanged without an embedding call.
/// Content and source version are preserved.
pub async fn rebuild_embeddings(
    store: &dyn KnowledgeStore,
    provider: &dyn EmbeddingProvider,
    batch_size: usize,
) -> Result<RebuildReport> {
    if !provider.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }
    let chunks = store.list_chunks().await?;
    let (current, stale): (Vec<_>, Vec<_>) = chunks.into_iter().partition(|c| {
        c.embedding_model == provider.model_name()
            && c.embedding_dim == provider.dims()
            && c.embedding.len() == provider.dims()
    });
    let mut report = RebuildReport {
        total: current.len() + stale.len(),
        unchanged: current.len(),
        ..Default::default()
    };

    for batch in stale.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(KnowledgeChunk::embed_text).collect();
        let vectors = match provider.embed_batch(&texts, EmbedPurpose::Document).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, chunks = batch.len(), "embedding batch failed");
                report.failed += batch.len();
                continue;
            }
        };

        for (chunk, vector) in batch.iter().zip(vectors) {
            let rebuilt = KnowledgeChunk::new(
                chunk.chunk_id.clone(),
                chunk.content(),
                vector,
                provider.model_name(),
                chunk.source_version.clone(),
            );
            match store.upsert(&rebuilt).await {
                Ok(WriteEffect::Unchanged) => report.unchanged += 1,
                Ok(_) => report.embedded += 1,
                Err(e) => {
                    warn!(chunk_id = %chunk.chunk_id, error = %e, "failed to store embedding");
                    report.failed += 1;
                }
            }
        }
    }

    info!(
        total = report.total,
        embedded = report.embedded,
        failed = report.failed,
        model = provider.model_name(),
        dims = provider.dims(),
        "embedding rebuild finished"
    );
    Ok(report)
}

/// `kb embed rebuild`.
pub async fn run_embed_rebuild(kb: &KnowledgeBase, batch_size_override: Option<usize>) -> Result<()> {
    let batch_size = batch_size_override.unwrap_or(kb.config().embedding.batch_size);
    let report = rebuild_embeddings(kb.store(), kb.provider(), batch_size).await?;

    println!("embed rebuild");
    println!(
        "  provider: {} ({} dims)",
        kb.provider().model_name(),
        kb.provider().dims()
    );
    println!("  total chunks: {}", report.total);
    println!("  embedded: {}", report.embedded);
    println!("  unchanged: {}", report.unchanged);
    println!("  failed: {}", report.failed);
    println!("ok");
    Ok(())
}
