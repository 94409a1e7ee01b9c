//! REST Snapshot Adapter
//!
//! Batched snapshot requests against the provider's REST API, used to seed
//! symbols before push data arrives and to serve `get_snapshot`.

mod client;

pub use client::{RestError, SnapshotClient};
