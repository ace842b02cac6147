//! Persistent record cache.
//!
//! A [`CacheManager`] answers record and root-call lookups through callbacks,
//! possibly long after the request. [`DiskCacheReader`] drives one read of a
//! set of root queries against it, hydrating the cached layer.

mod fs;
mod memory;
mod reader;

use crate::storage::Record;
use crate::types::{DataId, Result};

pub use fs::FsCacheManager;
pub use memory::MemoryCacheManager;
pub use reader::{DiskCacheReader, ReadCallbacks, ReadState};

/// Answer to one cache lookup.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheLookup<T> {
    /// The cache knows nothing about the key.
    Miss,
    /// The cache knows the key resolves to nothing.
    Absent,
    /// The cached value.
    Hit(T),
}

impl<T> CacheLookup<T> {
    /// Whether the cache returned an answer (value or known absence).
    pub fn is_hit(&self) -> bool {
        !matches!(self, CacheLookup::Miss)
    }
}

/// Callback receiving a cache lookup result.
pub type CacheCallback<T> = Box<dyn FnOnce(Result<CacheLookup<T>>)>;

/// Pluggable persistent cache.
///
/// Reads answer through `callback`, synchronously or later; the caller must
/// not assume either. Writes mirror committed data into the cache.
pub trait CacheManager {
    /// Looks up the record `id`.
    fn read_node(&self, id: &DataId, callback: CacheCallback<Record>);

    /// Looks up the record a root call resolves to.
    fn read_root_call(&self, storage_key: &str, identifying_arg: &str, callback: CacheCallback<DataId>);

    /// Persists `record`; `None` persists known absence.
    fn write_node(&self, _id: &DataId, _record: Option<&Record>) -> Result<()> {
        Ok(())
    }

    /// Persists a root call; `None` persists a call that resolved to nothing.
    fn write_root_call(&self, _storage_key: &str, _identifying_arg: &str, _id: Option<&DataId>) -> Result<()> {
        Ok(())
    }
}
