//! Newline-delimited JSON intent file, followed from the last consumed line.
//!
//! The byte offset after each consumed line is checkpointed in the store, so a
//! restart resumes where the previous run stopped instead of replaying the file.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::executor::Executor;

/// Reader positioned after the last complete line handed to the executor.
pub struct NdjsonTail {
    path: PathBuf,
    source: String,
    db: Database,
    reader: BufReader<File>,
    pending: Vec<u8>,
    offset: u64,
    line: u64,
}

impl NdjsonTail {
    /// Open `path` at the checkpoint recorded for it, or at the start when there
    /// is none or the file is now shorter than the checkpoint.
    pub async fn open(path: &Path, db: Database) -> Result<Self> {
        let mut file = File::open(path)
            .await
            .with_context(|| format!("Failed to open intent file {}", path.display()))?;
        let source = tokio::fs::canonicalize(path)
            .await
            .with_context(|| format!("Failed to resolve {}", path.display()))?
            .display()
            .to_string();

        let len = file.metadata().await?.len();
        let offset = match db.intent_file_offset(&source).await? {
            Some(saved) if saved <= len => saved,
            Some(saved) => {
                warn!(path = %path.display(), saved, len, "Intent file shrank, reading from the start");
                0
            }
            None => 0,
        };
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
            info!(path = %path.display(), offset, "Resuming intent file");
        }

        Ok(Self {
            path: path.to_path_buf(),
            source,
            db,
            reader: BufReader::new(file),
            pending: Vec::new(),
            offset,
            line: 0,
        })
    }

    /// Byte offset just past the last consumed line.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Ingest every complete line currently in the file. A trailing line
    /// without its newline is kept until the writer finishes it. Lines that are
    /// not UTF-8 are logged as malformed intents.
    ///
    /// Returns the number of intents handed to the executor.
    pub async fn drain(&mut self, executor: &Executor) -> Result<usize> {
        let mut ingested = 0;
        loop {
            let read = self
                .reader
                .read_until(b'\n', &mut self.pending)
                .await
                .with_context(|| format!("Failed to read {}", self.path.display()))?;
            if read == 0 || self.pending.last() != Some(&b'\n') {
                return Ok(ingested);
            }

            self.line += 1;
            let consumed = self.pending.len() as u64;
            let location = format!("{}:{}", self.path.display(), self.line);

            let outcome = match std::str::from_utf8(&self.pending) {
                Ok(text) if text.trim().is_empty() => None,
                Ok(text) => Some(executor.ingest_json(text.trim()).await),
                Err(e) => {
                    let payload = String::from_utf8_lossy(&self.pending).trim().to_string();
                    Some(
                        executor
                            .reject_malformed(&payload, format!("invalid utf-8: {}", e))
                            .await,
                    )
                }
            };
            if let Some(outcome) = outcome {
                let outcome = outcome.with_context(|| location.clone())?;
                debug!(line = self.line, outcome = ?outcome.rejection(), "Intent line processed");
                ingested += 1;
            }

            self.offset += consumed;
            self.pending.clear();
            self.db
                .save_intent_file_offset(&self.source, self.offset)
                .await
                .with_context(|| location)?;
        }
    }
}

/// Follow `path` forever, polling for appended lines every `poll`.
///
/// Returns only on a read error or a fatal executor error.
pub async fn tail_ndjson(path: PathBuf, db: Database, executor: Executor, poll: Duration) -> Result<()> {
    let mut tail = NdjsonTail::open(&path, db).await?;
    info!(path = %path.display(), offset = tail.offset(), "Following intent file");
    loop {
        tail.drain(&executor).await?;
        sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allowlist::{AllowlistHandle, AllowlistSnapshot};
    use crate::api::{DryRunClient, LogDispatcher};
    use crate::db::Database;
    use crate::risk::{RiskConfig, RiskKernel};
    use crate::tracker::PositionTracker;
    use crate::validation::IntentValidator;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;

    async fn executor() -> (Database, Executor) {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let tracker = PositionTracker::load(
            db.clone(),
            RiskKernel::new(RiskConfig::default()),
            dec!(1000),
            Utc::now(),
        )
        .await
        .unwrap();
        let executor = Executor::new(
            tracker,
            IntentValidator::default(),
            AllowlistHandle::new(AllowlistSnapshot::new(["0xmarket"], Vec::<String>::new())),
            Arc::new(DryRunClient),
            Arc::new(LogDispatcher),
        );
        (db, executor)
    }

    fn line(id: &str) -> String {
        format!(
            r#"{{"intent_id":"{}","timestamp":"{}","source_trader":"0xw","market_id":"0xmarket","outcome":"YES","side":"BUY","price_limit":"0.5","size_usdc":"10"}}"#,
            id,
            Utc::now().to_rfc3339()
        )
    }

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("copygate-{}.ndjson", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_drain_follows_appends() {
        let (db, executor) = executor().await;
        let path = temp_path();

        let mut file = File::create(&path).await.unwrap();
        file.write_all(format!("{}\n\n{}\n", line("a"), line("b")).as_bytes())
            .await
            .unwrap();
        file.flush().await.unwrap();

        let mut tail = NdjsonTail::open(&path, db.clone()).await.unwrap();
        assert_eq!(tail.drain(&executor).await.unwrap(), 2);

        // half-written line waits for its newline
        let next = line("c");
        let (head, rest) = next.split_at(20);
        file.write_all(head.as_bytes()).await.unwrap();
        file.flush().await.unwrap();
        assert_eq!(tail.drain(&executor).await.unwrap(), 0);

        file.write_all(format!("{}\n", rest).as_bytes()).await.unwrap();
        file.flush().await.unwrap();
        assert_eq!(tail.drain(&executor).await.unwrap(), 1);

        assert_eq!(db.recent_intents(10).await.unwrap().len(), 3);
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_logged_as_malformed() {
        let (db, executor) = executor().await;
        let path = temp_path();

        let mut bytes = b"{\"intent_id\":\"x\xff\"}\n".to_vec();
        bytes.extend_from_slice(format!("{}\n", line("ok")).as_bytes());
        tokio::fs::write(&path, &bytes).await.unwrap();

        let mut tail = NdjsonTail::open(&path, db.clone()).await.unwrap();
        assert_eq!(tail.drain(&executor).await.unwrap(), 2);

        let logged = db.recent_intents(10).await.unwrap();
        assert_eq!(logged.len(), 2);
        assert_eq!(logged[1].reason.as_deref(), Some("malformed"));
        assert!(logged[1].detail.as_deref().unwrap().contains("utf-8"));
        assert!(logged[0].accepted);
        assert_eq!(logged[0].intent_id.as_deref(), Some("ok"));
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_reopen_resumes_after_consumed_lines() {
        let (db, executor) = executor().await;
        let path = temp_path();

        let mut file = File::create(&path).await.unwrap();
        file.write_all(format!("{}\n{}\n", line("a"), line("b")).as_bytes())
            .await
            .unwrap();
        file.flush().await.unwrap();

        let mut tail = NdjsonTail::open(&path, db.clone()).await.unwrap();
        assert_eq!(tail.drain(&executor).await.unwrap(), 2);
        let consumed = tail.offset();
        drop(tail);

        file.write_all(format!("{}\n", line("c")).as_bytes()).await.unwrap();
        file.flush().await.unwrap();

        let mut reopened = NdjsonTail::open(&path, db.clone()).await.unwrap();
        assert_eq!(reopened.offset(), consumed);
        assert_eq!(reopened.drain(&executor).await.unwrap(), 1);

        let logged = db.recent_intents(10).await.unwrap();
        assert_eq!(logged.len(), 3);
        assert!(logged.iter().all(|e| e.reason.as_deref() != Some("duplicate")));
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_truncated_file_is_read_from_start() {
        let (db, executor) = executor().await;
        let path = temp_path();
        tokio::fs::write(&path, format!("{}\n", line("a"))).await.unwrap();

        let source = tokio::fs::canonicalize(&path).await.unwrap().display().to_string();
        db.save_intent_file_offset(&source, 1_000_000).await.unwrap();

        let mut tail = NdjsonTail::open(&path, db.clone()).await.unwrap();
        assert_eq!(tail.offset(), 0);
        assert_eq!(tail.drain(&executor).await.unwrap(), 1);
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_missing_file_fails() {
        let (db, _executor) = executor().await;
        assert!(NdjsonTail::open(Path::new("/nonexistent/intents.ndjson"), db)
            .await
            .is_err());
    }
}
