//! `kb search`: terminal front-end over the hybrid ranker.
//!
//! With a query argument one search runs and the command exits. Without
//! one, queries are read line by line from stdin until end of input.

use anyhow::Result;
use std::io::Write;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use kb_harness_core::search::{SearchMode, SearchOutcome, SearchRequest};

use crate::kb::KnowledgeBase;

const PROMPT: &str = "Query> ";

/// Per-query knobs shared by one-shot and interactive search.
#[derive(Debug, Clone, Copy)]
pub struct SearchSettings<'a> {
    pub k: usize,
    pub mode: SearchMode,
    pub category: Option<&'a str>,
    pub json: bool,
}

pub async fn run_search(
    kb: &KnowledgeBase,
    query: Option<&str>,
    k: Option<usize>,
    mode: &str,
    category: Option<&str>,
    json: bool,
) -> Result<()> {
    let settings = SearchSettings {
        k: k.unwrap_or(kb.config().retrieval.default_k),
        mode: mode.parse()?,
        category,
        json,
    };
    let mut out = std::io::stdout();
    match query {
        Some(query) => search_once(kb, query, &settings, &mut out).await,
        None => {
            let stdin = BufReader::new(tokio::io::stdin());
            search_lines(kb, stdin, &settings, &mut out).await?;
            Ok(())
        }
    }
}

/// Runs one search per non-empty input line until end of input.
///
/// Returns the number of searches run.
pub async fn search_lines<R, W>(
    kb: &KnowledgeBase,
    input: R,
    settings: &SearchSettings<'_>,
    out: &mut W,
) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut lines = input.lines();
    let mut searched = 0;
    loop {
        write!(out, "{PROMPT}")?;
        out.flush()?;
        let Some(line) = lines.next_line().await? else {
            writeln!(out)?;
            break;
        };
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        search_once(kb, query, settings, out).await?;
        searched += 1;
    }
    Ok(searched)
}

async fn search_once<W: Write>(
    kb: &KnowledgeBase,
    query: &str,
    settings: &SearchSettings<'_>,
    out: &mut W,
) -> Result<()> {
    let request = SearchRequest {
        query,
        k: settings.k,
        mode: settings.mode,
        category: settings.category,
    };
    let outcome = kb.search_with(&request).await?;

    if settings.json {
        writeln!(out, "{}", serde_json::to_string_pretty(&outcome)?)?;
        return Ok(());
    }
    print_outcome(&outcome, out)?;
    Ok(())
}

fn print_outcome<W: Write>(outcome: &SearchOutcome, out: &mut W) -> std::io::Result<()> {
    match outcome {
        SearchOutcome::DimensionMismatch { configured, stored } => {
            writeln!(
                out,
                "Search unavailable: provider produces {}-dimensional vectors but the store holds {:?}.",
                configured, stored
            )?;
            writeln!(out, "Run `kb embed rebuild` to re-embed the corpus.")?;
            return Ok(());
        }
        SearchOutcome::Unavailable { reason } => {
            writeln!(out, "Search unavailable: {}", reason)?;
            return Ok(());
        }
        SearchOutcome::KeywordOnly { reason, .. } => {
            writeln!(out, "(keyword-only results: {})", reason)?;
        }
        SearchOutcome::Ranked { .. } => {}
    }

    let results = outcome.results();
    if results.is_empty() {
        writeln!(out, "No results.")?;
        return Ok(());
    }
    for (i, r) in results.iter().enumerate() {
        write!(
            out,
            "{}. [{:.2}] {}  ({} / {})",
            i + 1,
            r.score,
            r.chunk_id,
            r.category,
            r.subcategory
        )?;
        match &r.location {
            Some(location) => writeln!(out, "  @ {}", location)?,
            None => writeln!(out)?,
        }
        writeln!(
            out,
            "    semantic: {:.2}  keyword: {:.2}",
            r.semantic_score, r.keyword_score
        )?;
        writeln!(out, "    Q: {}", r.question)?;
        writeln!(out, "    A: {}", r.answer)?;
        writeln!(out)?;
    }
    Ok(())
}
