//! Market allowlist: the latest snapshot of markets and categories eligible for trading.
//!
//! The snapshot is supplied from outside (see `source`); the gate only reads the most
//! recent one. An empty snapshot is a valid state that rejects every intent.

pub mod source;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Eligible market identifiers and categories at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllowlistSnapshot {
    #[serde(default)]
    pub markets: HashSet<String>,

    #[serde(default)]
    pub categories: HashSet<String>,

    #[serde(default = "Utc::now")]
    pub refreshed_at: DateTime<Utc>,
}

/// Result of a membership lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Allowed,
    Empty,
    NotListed,
}

impl AllowlistSnapshot {
    pub fn new<M, C>(markets: M, categories: C) -> Self
    where
        M: IntoIterator,
        M::Item: Into<String>,
        C: IntoIterator,
        C::Item: Into<String>,
    {
        Self {
            markets: markets.into_iter().map(Into::into).collect(),
            categories: categories
                .into_iter()
                .map(|c| c.into().to_lowercase())
                .collect(),
            refreshed_at: Utc::now(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty() && self.categories.is_empty()
    }

    pub fn len(&self) -> usize {
        self.markets.len() + self.categories.len()
    }

    /// Market ids match exactly; categories match case-insensitively.
    pub fn lookup(&self, market_id: &str, category: Option<&str>) -> Membership {
        if self.is_empty() {
            return Membership::Empty;
        }
        if self.markets.contains(market_id) {
            return Membership::Allowed;
        }
        match category {
            Some(c) if self.categories.contains(&c.to_lowercase()) => Membership::Allowed,
            _ => Membership::NotListed,
        }
    }
}

/// Shared handle to the latest snapshot. Cloning shares the same slot.
#[derive(Debug, Clone, Default)]
pub struct AllowlistHandle {
    current: Arc<RwLock<Arc<AllowlistSnapshot>>>,
}

impl AllowlistHandle {
    pub fn new(initial: AllowlistSnapshot) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    /// Latest snapshot. Readers keep an immutable copy for the whole check.
    pub async fn current(&self) -> Arc<AllowlistSnapshot> {
        self.current.read().await.clone()
    }

    /// Publish a new snapshot.
    pub async fn replace(&self, snapshot: AllowlistSnapshot) {
        *self.current.write().await = Arc::new(snapshot);
    }
}
