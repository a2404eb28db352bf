use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the database and every table. Safe to run repeatedly.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Apply the schema to an open pool.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS decks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // highlight_id is the lookup-before-insert index; rowid keeps creation order.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cards (
            highlight_id TEXT PRIMARY KEY,
            deck_id INTEGER NOT NULL,
            question TEXT NOT NULL DEFAULT '',
            answer TEXT NOT NULL DEFAULT '',
            state TEXT NOT NULL,
            fields_json TEXT NOT NULL,
            tags_json TEXT NOT NULL DEFAULT '[]',
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (deck_id) REFERENCES decks(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            source TEXT PRIMARY KEY,
            cursor TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // AUTOINCREMENT so an evicted checkpoint id is never handed out again.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS undo_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL CHECK (kind IN ('checkpoint', 'step')),
            label TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // seq is global application order; merging only rewrites entry_id.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS undo_ops (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_id INTEGER NOT NULL,
            op_json TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_cards_state ON cards(state)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_cards_deck_id ON cards(deck_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_undo_ops_entry ON undo_ops(entry_id, seq)")
        .execute(pool)
        .await?;

    Ok(())
}
