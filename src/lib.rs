//! Fail-closed risk gate for Polymarket copy-trading intents.
//!
//! Intents from an untrusted source pass the validator, then the risk kernel,
//! then go to an execution client. Every decision, fill, close and kill is
//! written to a SQLite audit store so the gate resumes exactly where it stopped.

pub mod allowlist;
pub mod api;
pub mod clock;
pub mod config;
pub mod db;
pub mod executor;
pub mod ingest;
pub mod models;
pub mod risk;
pub mod tracker;
pub mod validation;
