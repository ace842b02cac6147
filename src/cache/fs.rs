use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::storage::Record;
use crate::types::{DataId, Result, StoreError};

use super::{CacheCallback, CacheLookup, CacheManager};

const NODES_DIR: &str = "nodes";
const ROOTS_DIR: &str = "roots";

/// One JSON file per record and per root call under a directory.
///
/// File names are hex-encoded keys; a file holding `null` records known
/// absence. Callbacks run before the read call returns.
#[derive(Debug, Clone)]
pub struct FsCacheManager {
    root: PathBuf,
}

impl FsCacheManager {
    /// Opens (creating if needed) a cache rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(NODES_DIR))?;
        fs::create_dir_all(root.join(ROOTS_DIR))?;
        Ok(Self { root })
    }

    /// Directory the cache lives in.
    pub fn path(&self) -> &Path {
        &self.root
    }

    fn node_path(&self, id: &DataId) -> PathBuf {
        self.root
            .join(NODES_DIR)
            .join(format!("{}.json", hex::encode(id.as_str())))
    }

    fn root_call_path(&self, storage_key: &str, identifying_arg: &str) -> PathBuf {
        self.root.join(ROOTS_DIR).join(format!(
            "{}-{}.json",
            hex::encode(storage_key),
            hex::encode(identifying_arg)
        ))
    }

    fn load<T: DeserializeOwned>(path: &Path) -> Result<CacheLookup<T>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(CacheLookup::Miss),
            Err(err) => return Err(err.into()),
        };
        let value: Option<T> = serde_json::from_slice(&bytes)?;
        Ok(match value {
            Some(value) => CacheLookup::Hit(value),
            None => CacheLookup::Absent,
        })
    }

    fn store<T: Serialize>(path: &Path, value: Option<&T>) -> Result<()> {
        let bytes = serde_json::to_vec(&value)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl CacheManager for FsCacheManager {
    fn read_node(&self, id: &DataId, callback: CacheCallback<Record>) {
        let result = Self::load::<Record>(&self.node_path(id)).and_then(|lookup| match lookup {
            CacheLookup::Hit(record) if record.id() != id => Err(StoreError::Cache(format!(
                "cache file for `{id}` holds record `{}`",
                record.id()
            ))),
            lookup => Ok(lookup),
        });
        trace!(data_id = %id, ok = result.is_ok(), "store.cache.fs_read_node");
        callback(result);
    }

    fn read_root_call(&self, storage_key: &str, identifying_arg: &str, callback: CacheCallback<DataId>) {
        let result = Self::load::<DataId>(&self.root_call_path(storage_key, identifying_arg));
        trace!(storage_key, identifying_arg, ok = result.is_ok(), "store.cache.fs_read_root_call");
        callback(result);
    }

    fn write_node(&self, id: &DataId, record: Option<&Record>) -> Result<()> {
        Self::store(&self.node_path(id), record)
    }

    fn write_root_call(&self, storage_key: &str, identifying_arg: &str, id: Option<&DataId>) -> Result<()> {
        Self::store(&self.root_call_path(storage_key, identifying_arg), id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FieldValue;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn capture<T: 'static>() -> (Rc<RefCell<Option<Result<CacheLookup<T>>>>>, CacheCallback<T>) {
        let slot = Rc::new(RefCell::new(None));
        let sink = slot.clone();
        (slot, Box::new(move |result| *sink.borrow_mut() = Some(result)))
    }

    #[test]
    fn nodes_round_trip_through_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = FsCacheManager::open(dir.path())?;
        let id = DataId::from("4");
        let mut record = Record::new(id.clone(), Some("User".into()));
        record.set_field("name", FieldValue::Scalar(json!("Zuck")));

        let (slot, callback) = capture();
        cache.read_node(&id, callback);
        assert!(matches!(slot.borrow_mut().take(), Some(Ok(CacheLookup::Miss))));

        cache.write_node(&id, Some(&record))?;
        let (slot, callback) = capture();
        cache.read_node(&id, callback);
        assert!(matches!(slot.borrow_mut().take(), Some(Ok(CacheLookup::Hit(r))) if r == record));

        cache.write_node(&id, None)?;
        let (slot, callback) = capture();
        cache.read_node(&id, callback);
        assert!(matches!(slot.borrow_mut().take(), Some(Ok(CacheLookup::Absent))));
        Ok(())
    }

    #[test]
    fn root_calls_and_corrupt_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = FsCacheManager::open(dir.path())?;
        cache.write_root_call("node", "4", Some(&DataId::from("4")))?;
        cache.write_root_call("viewer", "", None)?;

        let (slot, callback) = capture();
        cache.read_root_call("node", "4", callback);
        assert!(matches!(slot.borrow_mut().take(), Some(Ok(CacheLookup::Hit(id))) if id.as_str() == "4"));
        let (slot, callback) = capture();
        cache.read_root_call("viewer", "", callback);
        assert!(matches!(slot.borrow_mut().take(), Some(Ok(CacheLookup::Absent))));

        fs::write(cache.node_path(&DataId::from("9")), b"{not json")?;
        let (slot, callback) = capture::<Record>();
        cache.read_node(&DataId::from("9"), callback);
        assert!(matches!(slot.borrow_mut().take(), Some(Err(StoreError::Serialization(_)))));
        Ok(())
    }
}
