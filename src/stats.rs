//! Knowledge base status and audit history.
//!
//! `kb status` summarizes what is stored: chunk count, the vector dimensions
//! present, the configured provider, and how far the change log has been
//! applied. `kb history` lists the most recent audit rows.

use anyhow::Result;
use chrono::{DateTime, Utc};

use kb_harness_core::store::{check_dimensions, KnowledgeStore};

use crate::kb::KnowledgeBase;

/// Run the status command: query the store and print a summary.
pub async fn run_status(kb: &KnowledgeBase) -> Result<()> {
    let store = kb.store();
    let provider = kb.provider();
    let total_chunks = store.count().await?;
    let census = store.dimension_census().await?;
    let state = store.sync_state().await?;
    let retired = store.retired_ids().await?.len();

    let db_size = std::fs::metadata(&kb.config().db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Knowledge Base Status");
    println!("=====================");
    println!();
    println!("  Database:    {}", kb.config().db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Chunks:      {}", total_chunks);
    println!("  Retired ids: {}", retired);
    if provider.is_enabled() {
        println!(
            "  Provider:    {} ({} dims)",
            provider.model_name(),
            provider.dims()
        );
    } else {
        println!("  Provider:    disabled (keyword-only search)");
    }

    if !census.is_empty() {
        println!();
        println!("  {:<10} {:>8}", "DIMS", "CHUNKS");
        println!("  {}", "-".repeat(19));
        for c in &census {
            println!("  {:<10} {:>8}", c.dims, c.chunks);
        }
    }
    let mismatch = if provider.is_enabled() {
        check_dimensions(&census, provider.dims()).err()
    } else if census.len() > 1 {
        check_dimensions(&census, 0).err()
    } else {
        None
    };
    if let Some(e) = mismatch {
        println!();
        println!("  WARNING: {}", e);
        println!("  Search is blocked until `kb embed rebuild` completes.");
    }

    println!();
    println!(
        "  Synced version: {}",
        state
            .last_synced_version
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "never".to_string())
    );
    println!(
        "  Last sync:      {}",
        state
            .last_synced_at
            .map(format_relative)
            .unwrap_or_else(|| "never".to_string())
    );
    println!();
    Ok(())
}

/// Run the history command: print the most recent audit rows.
pub async fn run_history(kb: &KnowledgeBase, limit: usize) -> Result<()> {
    let entries = kb.store().history(limit).await?;
    if entries.is_empty() {
        println!("No sync history.");
        return Ok(());
    }

    println!(
        "{:<17} {:<12} {:<8} {:<20} {:<12} {}",
        "APPLIED", "VERSION", "TYPE", "CHUNK", "OUTCOME", "DETAIL"
    );
    println!("{}", "-".repeat(90));
    for e in &entries {
        println!(
            "{:<17} {:<12} {:<8} {:<20} {:<12} {}",
            e.applied_at.format("%Y-%m-%d %H:%M").to_string(),
            e.version.as_str(),
            e.change_type,
            e.chunk_id,
            e.outcome.as_str(),
            e.detail.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a timestamp relative to now (e.g. "3 hours ago").
fn format_relative(at: DateTime<Utc>) -> String {
    let delta = (Utc::now() - at).num_seconds();

    if delta < 0 {
        return at.format("%Y-%m-%d %H:%M").to_string();
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        at.format("%Y-%m-%d %H:%M").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn recent_times_are_relative() {
        assert_eq!(format_relative(Utc::now()), "just now");
        let two_hours = Utc::now() - chrono::Duration::hours(2);
        assert_eq!(format_relative(two_hours), "2 hours ago");
    }
}
