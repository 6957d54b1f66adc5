//! Intent ingestion surfaces: an appended NDJSON file and a local HTTP endpoint.

mod http;
mod ndjson;

pub use http::{router, serve, CloseRequest, KillRequest};
pub use ndjson::{tail_ndjson, NdjsonTail};
