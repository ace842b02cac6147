//! Normalized client-side record store.
//!
//! Server responses are flattened into records keyed by [`DataId`] and kept in
//! three layers: optimistic (queued), server-confirmed (committed) and
//! disk-hydrated (cached). [`StoreData`] is the entry point; it writes
//! payloads through the [`writer`], fills the cached layer from a
//! [`cache::CacheManager`], and frees unsubscribed records with the
//! [`gc::GarbageCollector`].

#![warn(missing_docs)]

pub mod cache;
pub mod gc;
pub mod logging;
pub mod query;
pub mod storage;
pub mod tracker;
pub mod types;
pub mod writer;

mod store_data;

pub use store_data::StoreData;
pub use types::{DataId, Result, StoreError};
