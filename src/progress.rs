//! Sync progress reporting and cooperative cancellation.
//!
//! The engine calls a [`ProgressSink`] synchronously from its
//! coordinating task: `report` after each unit of work, `is_cancelled`
//! at the two polling points (between documents while materializing,
//! between results while reconciling). Progress goes to **stderr** so
//! stdout remains parseable for scripts.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Receives progress and answers the cancellation poll.
pub trait ProgressSink: Send + Sync {
    fn report(&self, message: &str, completed: usize, total: usize);
    fn is_cancelled(&self) -> bool;
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Set the flag on the first Ctrl-C. Must be called inside a tokio runtime.
    pub fn cancel_on_ctrl_c(&self) {
        let flag = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, finishing in-flight work");
                flag.cancel();
            }
        });
    }
}

/// Human-friendly progress on stderr: "Generating question 12 of 1,234".
pub struct StderrProgress {
    cancel: CancelFlag,
}

impl StderrProgress {
    pub fn new(cancel: CancelFlag) -> Self {
        Self { cancel }
    }
}

impl ProgressSink for StderrProgress {
    fn report(&self, message: &str, completed: usize, total: usize) {
        let line = if total > 0 {
            format!(
                "{}  [{} / {}]\n",
                message,
                format_number(completed as u64),
                format_number(total as u64)
            )
        } else {
            format!("{}\n", message)
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress {
    cancel: CancelFlag,
}

impl JsonProgress {
    pub fn new(cancel: CancelFlag) -> Self {
        Self { cancel }
    }
}

impl ProgressSink for JsonProgress {
    fn report(&self, message: &str, completed: usize, total: usize) {
        let obj = serde_json::json!({
            "event": "progress",
            "message": message,
            "n": completed,
            "total": total,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Reports nothing but still honours cancellation.
#[derive(Default)]
pub struct NoProgress {
    cancel: CancelFlag,
}

impl NoProgress {
    pub fn new(cancel: CancelFlag) -> Self {
        Self { cancel }
    }
}

impl ProgressSink for NoProgress {
    fn report(&self, _message: &str, _completed: usize, _total: usize) {}

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn sink(&self, cancel: CancelFlag) -> Box<dyn ProgressSink> {
        match self {
            ProgressMode::Off => Box::new(NoProgress::new(cancel)),
            ProgressMode::Human => Box::new(StderrProgress::new(cancel)),
            ProgressMode::Json => Box::new(JsonProgress::new(cancel)),
        }
    }
}
