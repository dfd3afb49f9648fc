use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::time::Timestamp;

const MAX_SESSIONS: usize = 10;

/// Async transcript writer for a debug session (`<log_dir>/latest.log`).
///
/// `log()` only pushes into a channel; a background task owns the file.
#[derive(Clone)]
pub struct SessionLogger {
    tx: mpsc::UnboundedSender<Entry>,
}

impl SessionLogger {
    /// Rotates the previous `latest.log` to `session-{unix}.log`, prunes old
    /// sessions and spawns the writer. Returns `None` if the directory or
    /// file cannot be opened; the transcript is optional.
    pub async fn new(log_dir: &Path) -> Option<Self> {
        if let Err(e) = tokio::fs::create_dir_all(log_dir).await {
            tracing::warn!("session log disabled, cannot create {}: {e}", log_dir.display());
            return None;
        }

        let latest = log_dir.join("latest.log");
        if latest.exists() {
            let ts = Timestamp::now().as_unix_millis() / 1000;
            let rotated = log_dir.join(format!("session-{ts}.log"));
            let _ = tokio::fs::rename(&latest, &rotated).await;
        }

        cleanup_old_sessions(log_dir, MAX_SESSIONS).await;

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&latest)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("session log disabled, cannot open {}: {e}", latest.display());
                return None;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_transcript(file, rx, Timestamp::now()));
        Some(Self { tx })
    }

    pub fn log(&self, prefix: &str, line: &str) {
        let _ = self.tx.send(Entry {
            at: Timestamp::now(),
            prefix: prefix.to_string(),
            line: line.to_string(),
        });
    }
}

struct Entry {
    at: Timestamp,
    prefix: String,
    line: String,
}

impl Entry {
    /// Controller rejections, engine errors and undelivered stops.
    fn is_failure(&self) -> bool {
        matches!(self.prefix.as_str(), "error" | "ctrl-err" | "ESTOP")
    }
}

fn format_line(ts: Timestamp, prefix: &str, line: &str) -> String {
    format!("[{ts}] [{prefix}] {line}\n")
}

/// Entries written between flushes when the queue is backed up.
const FLUSH_BATCH: usize = 64;

/// Owns the file. Writes whatever is queued, flushes once per batch, and
/// closes with a footer counting entries and failures.
async fn write_transcript(file: tokio::fs::File, mut rx: mpsc::UnboundedReceiver<Entry>, started: Timestamp) {
    let mut writer = tokio::io::BufWriter::new(file);
    let _ = writer
        .write_all(format!("=== G-code debugger session: {started} ===\n\n").as_bytes())
        .await;

    let (mut entries, mut failures) = (0usize, 0usize);
    while let Some(first) = rx.recv().await {
        let mut next = Some(first);
        let mut batch = 0;
        while let Some(entry) = next {
            entries += 1;
            failures += usize::from(entry.is_failure());
            let _ = writer
                .write_all(format_line(entry.at, &entry.prefix, &entry.line).as_bytes())
                .await;
            batch += 1;
            next = if batch < FLUSH_BATCH { rx.try_recv().ok() } else { None };
        }
        let _ = writer.flush().await;
    }

    let footer = format!(
        "\n=== Session ended: {} ({entries} entries, {failures} failures) ===\n",
        Timestamp::now()
    );
    let _ = writer.write_all(footer.as_bytes()).await;
    let _ = writer.flush().await;
}

/// Keep only the `keep` most recent `session-*.log` files.
async fn cleanup_old_sessions(log_dir: &Path, keep: usize) {
    let mut entries = match tokio::fs::read_dir(log_dir).await {
        Ok(rd) => rd,
        Err(_) => return,
    };

    let mut sessions: Vec<(u64, PathBuf)> = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let stamp = name
            .strip_prefix("session-")
            .and_then(|rest| rest.strip_suffix(".log"))
            .and_then(|ts| ts.parse::<u64>().ok());
        if let Some(stamp) = stamp {
            sessions.push((stamp, entry.path()));
        }
    }

    // Numeric sort: lexicographic order breaks once timestamps change width
    sessions.sort();

    let excess = sessions.len().saturating_sub(keep);
    for (_, path) in sessions.into_iter().take(excess) {
        let _ = tokio::fs::remove_file(path).await;
    }
}
