//! Anki-importable export of completed cards.
//!
//! `smoothbrain export` writes one tab-separated line per completed
//! card: question, answer, the highlight as HTML, the source title, and
//! the space-separated tags. The header lines tell Anki's importer how to
//! read the file (Anki 2.1.55+).

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use smoothbrain_core::card::{Card, CardState};
use smoothbrain_core::store::CardStore;

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::sqlite_store::SqliteStore;

/// Export completed cards to a TSV file, or stdout when `output` is `None`.
pub async fn run_export(config: &Config, output: Option<&Path>) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    let store = SqliteStore::new(pool.clone());
    let cards = store.cards_in_state(CardState::Completed).await?;
    pool.close().await;

    let tsv = render_tsv(&config.sync.deck_name, &cards);

    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create directory: {}", parent.display())
                    })?;
                }
            }
            std::fs::write(path, tsv)
                .with_context(|| format!("Failed to write export to {}", path.display()))?;
            eprintln!("Exported {} cards to {}", cards.len(), path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(tsv.as_bytes())?;
            stdout.flush()?;
        }
    }

    Ok(())
}

/// Render `cards` as Anki import text. Only completed cards are written.
pub fn render_tsv(deck_name: &str, cards: &[Card]) -> String {
    let mut out = String::new();
    out.push_str("#separator:tab\n");
    out.push_str("#html:true\n");
    out.push_str(&format!("#deck:{}\n", field(deck_name)));
    out.push_str("#tags column:5\n");

    for card in cards.iter().filter(|c| c.state == CardState::Completed) {
        let tags: Vec<String> = card.tags.iter().map(|t| t.replace(' ', "_")).collect();
        let columns = [
            field(&card.question),
            field(&card.answer),
            field(&card.fields.text_html),
            field(&card.fields.readable_title),
            field(&tags.join(" ")),
        ];
        out.push_str(&columns.join("\t"));
        out.push('\n');
    }
    out
}

/// Make `value` safe for one TSV cell.
fn field(value: &str) -> String {
    value
        .replace("\r\n", "<br>")
        .replace(['\n', '\r'], "<br>")
        .replace('\t', " ")
}
