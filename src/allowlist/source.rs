//! File-backed allowlist source with periodic refresh.
//!
//! Accepted file formats:
//! - `{"markets": ["0x..."], "categories": ["politics"]}`
//! - `["0x...", "0x..."]` (market ids only)

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::{AllowlistHandle, AllowlistSnapshot};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AllowlistFile {
    Markets(Vec<String>),
    Full {
        #[serde(default)]
        markets: Vec<String>,
        #[serde(default)]
        categories: Vec<String>,
    },
}

/// Parse allowlist JSON.
pub fn parse(contents: &str) -> Result<AllowlistSnapshot> {
    let file: AllowlistFile =
        serde_json::from_str(contents).context("Failed to parse allowlist JSON")?;
    let snapshot = match file {
        AllowlistFile::Full {
            markets,
            categories,
        } => AllowlistSnapshot::new(clean(markets), clean(categories)),
        AllowlistFile::Markets(markets) => {
            AllowlistSnapshot::new(clean(markets), Vec::<String>::new())
        }
    };
    Ok(snapshot)
}

fn clean(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Read and parse an allowlist file.
pub async fn load(path: &Path) -> Result<AllowlistSnapshot> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read allowlist {}", path.display()))?;
    parse(&contents)
}

/// Reload `path` every `every` and publish into `handle`.
///
/// A read or parse failure publishes an empty snapshot: the gate rejects
/// everything until a good file is seen again.
pub fn spawn_refresh(handle: AllowlistHandle, path: PathBuf, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        loop {
            ticker.tick().await;
            match load(&path).await {
                Ok(snapshot) => {
                    if snapshot.is_empty() {
                        warn!(path = %path.display(), "Allowlist is empty, all intents will be rejected");
                    } else {
                        debug!(entries = snapshot.len(), "Allowlist refreshed");
                    }
                    handle.replace(snapshot).await;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Allowlist refresh failed, publishing empty snapshot");
                    handle.replace(AllowlistSnapshot::empty()).await;
                }
            }
        }
    })
}

/// Load once at startup, logging the result.
pub async fn initial(path: &Path) -> AllowlistSnapshot {
    match load(path).await {
        Ok(snapshot) => {
            info!(path = %path.display(), entries = snapshot.len(), "Allowlist loaded");
            snapshot
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Allowlist unavailable, starting empty");
            AllowlistSnapshot::empty()
        }
    }
}
