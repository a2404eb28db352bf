//! Card store statistics.
//!
//! Used by `smoothbrain stats` to show how many cards each state holds,
//! which decks exist, and when the last successful sync finished.

use anyhow::Result;
use sqlx::Row;

use smoothbrain_core::card::CardState;
use smoothbrain_core::store::CardStore;

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::sqlite_store::SqliteStore;

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    let store = SqliteStore::new(pool.clone());

    let counts = store.count_by_state().await?;
    let total: i64 = counts.iter().map(|(_, n)| n).sum();
    let watermark = store.load_watermark().await?;
    let undo_depth = store.undo_depth().await?;

    let last_sync: Option<i64> =
        sqlx::query_scalar("SELECT updated_at FROM checkpoints WHERE source = 'readwise'")
            .fetch_optional(&pool)
            .await?;

    let deck_rows = sqlx::query(
        r#"
        SELECT d.name, COUNT(c.highlight_id) AS card_count
        FROM decks d
        LEFT JOIN cards c ON c.deck_id = d.id
        GROUP BY d.id
        ORDER BY d.name
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("SmoothBrain Card Stats");
    println!("======================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Cards:       {}", total);
    for (state, n) in &counts {
        println!("    {:<11} {:>6}{}", state.as_str(), n, state_hint(*state, *n));
    }

    if !deck_rows.is_empty() {
        println!();
        println!("  {:<32} {:>6}", "DECK", "CARDS");
        println!("  {}", "-".repeat(39));
        for row in &deck_rows {
            let name: String = row.get("name");
            let card_count: i64 = row.get("card_count");
            println!("  {:<32} {:>6}", name, card_count);
        }
    }

    println!();
    match (watermark, last_sync) {
        (Some(wm), Some(ts)) => println!(
            "  Last sync:   {} (highlights up to {})",
            format_ts_relative(ts),
            wm.format("%Y-%m-%d %H:%M")
        ),
        _ => println!("  Last sync:   never"),
    }
    println!("  Undo depth:  {}", undo_depth);
    println!();

    pool.close().await;
    Ok(())
}

fn state_hint(state: CardState, n: i64) -> &'static str {
    match state {
        CardState::Pending if n > 0 => "   (retried on next sync)",
        CardState::Failed if n > 0 => "   (sync --retry-failed)",
        _ => "",
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        format_ts_iso(ts)
    } else if delta < 60 {
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
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
