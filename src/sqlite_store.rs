//! SQLite-backed [`CardStore`] implementation.
//!
//! Each card mutation runs in one transaction together with the rows it
//! appends to the undo log, so the cards table and the log never disagree
//! about what a step changed. The log lives in `undo_entries` (one row per
//! checkpoint or step) and `undo_ops` (one row per reversible operation).
//! Recording a step only appends, and merging a checkpoint only re-points
//! the later operations at it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use smoothbrain_core::card::{Card, CardFields, CardState, DeckId};
use smoothbrain_core::store::{CardStore, UndoSummary};
use smoothbrain_core::undo::{CheckpointId, UndoError, UndoOp, UNDO_CAPACITY};

/// Checkpoint row the watermark is stored under.
const WATERMARK_SOURCE: &str = "readwise";

const CARD_COLUMNS: &str = "highlight_id, deck_id, question, answer, state, fields_json, \
                            tags_json, last_error, created_at, updated_at";

/// SQLite implementation of the [`CardStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Card counts per state, in [`CardState::ALL`] order.
    pub async fn count_by_state(&self) -> Result<Vec<(CardState, i64)>> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM cards GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut counts: Vec<(CardState, i64)> = CardState::ALL.iter().map(|s| (*s, 0)).collect();
        for row in rows {
            let state: CardState = row.get::<String, _>("state").parse()?;
            let n: i64 = row.get("n");
            if let Some(entry) = counts.iter_mut().find(|(s, _)| *s == state) {
                entry.1 = n;
            }
        }
        Ok(counts)
    }

    /// Number of entries currently in the undo log.
    pub async fn undo_depth(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM undo_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid timestamp in store: {}", value))?
        .with_timezone(&Utc))
}

fn row_to_card(row: &SqliteRow) -> Result<Card> {
    let state: String = row.get("state");
    let fields_json: String = row.get("fields_json");
    let tags_json: String = row.get("tags_json");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Card {
        highlight_id: row.get("highlight_id"),
        deck_id: DeckId(row.get("deck_id")),
        question: row.get("question"),
        answer: row.get("answer"),
        state: state.parse()?,
        fields: serde_json::from_str::<CardFields>(&fields_json)?,
        tags: serde_json::from_str(&tags_json)?,
        last_error: row.get("last_error"),
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

/// Append an entry with its operations and evict whatever falls past
/// [`UNDO_CAPACITY`]. Returns the new entry's id.
async fn append_entry(
    conn: &mut SqliteConnection,
    kind: &str,
    label: &str,
    ops: &[UndoOp],
) -> Result<i64> {
    let entry_id = sqlx::query("INSERT INTO undo_entries (kind, label) VALUES (?, ?)")
        .bind(kind)
        .bind(label)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();

    for op in ops {
        sqlx::query("INSERT INTO undo_ops (entry_id, op_json) VALUES (?, ?)")
            .bind(entry_id)
            .bind(serde_json::to_string(op)?)
            .execute(&mut *conn)
            .await?;
    }

    let evicted: Vec<i64> =
        sqlx::query_scalar("SELECT id FROM undo_entries ORDER BY id DESC LIMIT -1 OFFSET ?")
            .bind(UNDO_CAPACITY as i64)
            .fetch_all(&mut *conn)
            .await?;
    for id in evicted {
        delete_entry(conn, id).await?;
    }
    Ok(entry_id)
}

async fn delete_entry(conn: &mut SqliteConnection, entry_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM undo_ops WHERE entry_id = ?")
        .bind(entry_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM undo_entries WHERE id = ?")
        .bind(entry_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Record one step. Steps without operations are not recorded.
async fn record_step(conn: &mut SqliteConnection, label: &str, ops: &[UndoOp]) -> Result<()> {
    if ops.is_empty() {
        return Ok(());
    }
    append_entry(conn, "step", label, ops).await?;
    Ok(())
}

async fn fetch_card(conn: &mut SqliteConnection, highlight_id: &str) -> Result<Option<Card>> {
    let sql = format!("SELECT {} FROM cards WHERE highlight_id = ?", CARD_COLUMNS);
    let row = sqlx::query(&sql)
        .bind(highlight_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(row_to_card).transpose()
}

/// Insert or overwrite the full row for `card`.
async fn write_card(conn: &mut SqliteConnection, card: &Card) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO cards (highlight_id, deck_id, question, answer, state, fields_json,
                           tags_json, last_error, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(highlight_id) DO UPDATE SET
            deck_id = excluded.deck_id,
            question = excluded.question,
            answer = excluded.answer,
            state = excluded.state,
            fields_json = excluded.fields_json,
            tags_json = excluded.tags_json,
            last_error = excluded.last_error,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&card.highlight_id)
    .bind(card.deck_id.0)
    .bind(&card.question)
    .bind(&card.answer)
    .bind(card.state.as_str())
    .bind(serde_json::to_string(&card.fields)?)
    .bind(serde_json::to_string(&card.tags)?)
    .bind(&card.last_error)
    .bind(card.created_at.to_rfc3339())
    .bind(card.updated_at.to_rfc3339())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn revert(conn: &mut SqliteConnection, op: UndoOp) -> Result<()> {
    match op {
        UndoOp::Created { highlight_id } => {
            sqlx::query("DELETE FROM cards WHERE highlight_id = ?")
                .bind(highlight_id)
                .execute(&mut *conn)
                .await?;
        }
        UndoOp::Updated { before } => write_card(conn, &before).await?,
    }
    Ok(())
}

#[async_trait]
impl CardStore for SqliteStore {
    async fn ensure_deck(&self, name: &str) -> Result<DeckId> {
        sqlx::query("INSERT OR IGNORE INTO decks (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await?;
        let id: i64 = sqlx::query_scalar("SELECT id FROM decks WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(DeckId(id))
    }

    async fn find_card(&self, highlight_id: &str) -> Result<Option<Card>> {
        let mut conn = self.pool.acquire().await?;
        fetch_card(&mut conn, highlight_id).await
    }

    async fn create_card(&self, card: &Card) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        if fetch_card(&mut tx, &card.highlight_id).await?.is_some() {
            anyhow::bail!("card for highlight {} already exists", card.highlight_id);
        }
        write_card(&mut tx, card).await?;

        record_step(
            &mut tx,
            "Create card",
            &[UndoOp::Created {
                highlight_id: card.highlight_id.clone(),
            }],
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_cards(&self, cards: &[Card]) -> Result<()> {
        if cards.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        let mut ops = Vec::with_capacity(cards.len());
        for card in cards {
            let before = fetch_card(&mut tx, &card.highlight_id)
                .await?
                .with_context(|| format!("no card for highlight {}", card.highlight_id))?;
            write_card(&mut tx, card).await?;
            ops.push(UndoOp::Updated {
                before: Box::new(before),
            });
        }

        record_step(&mut tx, "Update cards", &ops).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn cards_in_state(&self, state: CardState) -> Result<Vec<Card>> {
        let sql = format!(
            "SELECT {} FROM cards WHERE state = ? ORDER BY rowid",
            CARD_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_card).collect()
    }

    async fn all_cards(&self) -> Result<Vec<Card>> {
        let sql = format!("SELECT {} FROM cards ORDER BY rowid", CARD_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_card).collect()
    }

    async fn open_checkpoint(&self, name: &str) -> Result<CheckpointId> {
        let mut tx = self.pool.begin().await?;
        let id = append_entry(&mut tx, "checkpoint", name, &[]).await?;
        tx.commit().await?;
        Ok(CheckpointId(id as u64))
    }

    async fn merge_checkpoint(&self, checkpoint: CheckpointId) -> Result<()> {
        let id = checkpoint.0 as i64;
        let mut tx = self.pool.begin().await?;

        let kind: Option<String> = sqlx::query_scalar("SELECT kind FROM undo_entries WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if kind.as_deref() != Some("checkpoint") {
            return Err(UndoError::CheckpointDiscarded(checkpoint).into());
        }

        sqlx::query("UPDATE undo_ops SET entry_id = ? WHERE entry_id > ?")
            .bind(id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM undo_entries WHERE id > ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn undo_last(&self) -> Result<Option<UndoSummary>> {
        let mut tx = self.pool.begin().await?;
        let Some(row) = sqlx::query("SELECT id, label FROM undo_entries ORDER BY id DESC LIMIT 1")
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };
        let entry_id: i64 = row.get("id");
        let label: String = row.get("label");

        let ops: Vec<String> = sqlx::query_scalar(
            "SELECT op_json FROM undo_ops WHERE entry_id = ? ORDER BY seq DESC",
        )
        .bind(entry_id)
        .fetch_all(&mut *tx)
        .await?;
        let reverted_ops = ops.len();
        for json in ops {
            let op: UndoOp = serde_json::from_str(&json).context("corrupt undo operation")?;
            revert(&mut tx, op).await?;
        }
        delete_entry(&mut tx, entry_id).await?;
        tx.commit().await?;

        Ok(Some(UndoSummary {
            label,
            reverted_ops,
        }))
    }

    async fn load_watermark(&self) -> Result<Option<DateTime<Utc>>> {
        let cursor: Option<String> =
            sqlx::query_scalar("SELECT cursor FROM checkpoints WHERE source = ?")
                .bind(WATERMARK_SOURCE)
                .fetch_optional(&self.pool)
                .await?;
        cursor.as_deref().map(parse_ts).transpose()
    }

    async fn save_watermark(&self, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (source, cursor, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(source) DO UPDATE SET
                cursor = excluded.cursor,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(WATERMARK_SOURCE)
        .bind(at.to_rfc3339())
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
