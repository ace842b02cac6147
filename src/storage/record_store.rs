use rustc_hash::FxHashMap;

use crate::query::QueryPath;
use crate::types::{DataId, Result, StoreError};

use super::value::{FieldValue, RangeData, Record, RANGE_FIELD};

/// Whether a record is known to exist.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RecordState {
    /// The record is present.
    Existent,
    /// The record is known to be absent (deleted, or `null` on the server).
    Nonexistent,
    /// Nothing is known about the record.
    Unknown,
}

/// Result of resolving a root call such as `node(id: "4")`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RootCallLookup {
    /// The root call was never resolved; the disk cache may know it.
    Unknown,
    /// The root call was resolved and the server returned nothing.
    Missing,
    /// The root call resolves to this record.
    Found(DataId),
}

/// One layer of records: identity → record, plus its root-call index.
///
/// A `None` record is a tombstone ([`RecordState::Nonexistent`]); an absent
/// entry is [`RecordState::Unknown`].
#[derive(Default, Debug)]
pub struct RecordStore {
    records: FxHashMap<DataId, Option<Record>>,
    root_calls: FxHashMap<String, FxHashMap<String, Option<DataId>>>,
    paths: FxHashMap<DataId, QueryPath>,
    mutation_ids: FxHashMap<DataId, Vec<String>>,
}

impl RecordStore {
    /// Creates an empty layer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries (records and tombstones).
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the layer holds no records and no root calls.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.root_calls.is_empty()
    }

    /// State of `id` in this layer alone.
    pub fn record_state(&self, id: &DataId) -> RecordState {
        match self.records.get(id) {
            Some(Some(_)) => RecordState::Existent,
            Some(None) => RecordState::Nonexistent,
            None => RecordState::Unknown,
        }
    }

    /// The layer's entry for `id`: `None` when unknown, `Some(None)` for a tombstone.
    pub fn entry(&self, id: &DataId) -> Option<Option<&Record>> {
        self.records.get(id).map(Option::as_ref)
    }

    /// The record for `id` when it exists in this layer.
    pub fn record(&self, id: &DataId) -> Option<&Record> {
        self.records.get(id).and_then(Option::as_ref)
    }

    /// Identities with an entry in this layer.
    pub fn record_ids(&self) -> impl Iterator<Item = &DataId> {
        self.records.keys()
    }

    /// Value stored for `storage_key`; `None` when the field (or record) is unknown here.
    pub fn field(&self, id: &DataId, storage_key: &str) -> Option<&FieldValue> {
        self.record(id).and_then(|record| record.field(storage_key))
    }

    /// Linked identity of `storage_key`; errors when the field holds a non-link.
    pub fn linked_record_id(&self, id: &DataId, storage_key: &str) -> Result<Option<&DataId>> {
        match self.field(id, storage_key) {
            None | Some(FieldValue::Null) => Ok(None),
            Some(FieldValue::Link(linked)) => Ok(Some(linked)),
            Some(_) => Err(StoreError::invariant(format!(
                "expected field `{storage_key}` of `{id}` to be a linked record"
            ))),
        }
    }

    /// Linked identities of plural `storage_key`; errors when the field holds a non-list.
    pub fn linked_record_ids(&self, id: &DataId, storage_key: &str) -> Result<Option<&[DataId]>> {
        match self.field(id, storage_key) {
            None | Some(FieldValue::Null) => Ok(None),
            Some(FieldValue::Links(ids)) => Ok(Some(ids)),
            Some(_) => Err(StoreError::invariant(format!(
                "expected field `{storage_key}` of `{id}` to be a list of linked records"
            ))),
        }
    }

    /// Range stored on the range record `id`.
    pub fn range(&self, id: &DataId) -> Option<&RangeData> {
        self.field(id, RANGE_FIELD).and_then(FieldValue::as_range)
    }

    /// Creates an empty record unless one already exists in this layer.
    ///
    /// Returns `true` when a record was created. Paths are only kept for
    /// client identities; server identities are refetchable through `node`.
    pub fn put_record(&mut self, id: &DataId, typename: Option<&str>, path: Option<QueryPath>) -> bool {
        if let Some(Some(record)) = self.records.get_mut(id) {
            if let (None, Some(typename)) = (record.typename(), typename) {
                record.set_typename(typename);
            }
            return false;
        }
        self.records.insert(
            id.clone(),
            Some(Record::new(id.clone(), typename.map(str::to_owned))),
        );
        if let Some(path) = path.filter(|_| id.is_client()) {
            self.paths.insert(id.clone(), path);
        }
        true
    }

    /// Inserts a whole record, replacing any previous entry.
    pub fn insert_record(&mut self, record: Record) {
        self.records.insert(record.id().clone(), Some(record));
    }

    /// Marks `id` as known-absent.
    pub fn delete_record(&mut self, id: &DataId) {
        self.records.insert(id.clone(), None);
        self.paths.remove(id);
    }

    /// Drops every trace of `id` from this layer, returning the removed record.
    pub fn remove_record(&mut self, id: &DataId) -> Option<Option<Record>> {
        self.paths.remove(id);
        self.mutation_ids.remove(id);
        self.records.remove(id)
    }

    /// Stores `value` under `storage_key`; the record must exist in this layer.
    pub fn put_field(&mut self, id: &DataId, storage_key: &str, value: FieldValue) -> Result<()> {
        let record = self.record_for_write(id, "put_field")?;
        record.set_field(storage_key, value);
        Ok(())
    }

    /// Sets `storage_key` to a known `null`.
    pub fn delete_field(&mut self, id: &DataId, storage_key: &str) -> Result<()> {
        self.put_field(id, storage_key, FieldValue::Null)
    }

    /// Links `storage_key` of `id` to `linked`.
    pub fn put_linked_record_id(&mut self, id: &DataId, storage_key: &str, linked: DataId) -> Result<()> {
        self.put_field(id, storage_key, FieldValue::Link(linked))
    }

    /// Links plural `storage_key` of `id` to `linked`, in order.
    pub fn put_linked_record_ids(
        &mut self,
        id: &DataId,
        storage_key: &str,
        linked: Vec<DataId>,
    ) -> Result<()> {
        self.put_field(id, storage_key, FieldValue::Links(linked))
    }

    /// Stores the range held by range record `id`.
    pub fn put_range(&mut self, id: &DataId, range: RangeData) -> Result<()> {
        self.put_field(id, RANGE_FIELD, FieldValue::Range(range))
    }

    /// Resolves a root call in this layer alone.
    pub fn data_id(&self, storage_key: &str, identifying_arg: &str) -> RootCallLookup {
        match self
            .root_calls
            .get(storage_key)
            .and_then(|calls| calls.get(identifying_arg))
        {
            None => RootCallLookup::Unknown,
            Some(None) => RootCallLookup::Missing,
            Some(Some(id)) => RootCallLookup::Found(id.clone()),
        }
    }

    /// Records that the root call resolves to `id`.
    pub fn put_data_id(&mut self, storage_key: &str, identifying_arg: &str, id: DataId) {
        self.root_calls
            .entry(storage_key.to_owned())
            .or_default()
            .insert(identifying_arg.to_owned(), Some(id));
    }

    /// Records that the root call was attempted and resolved to nothing.
    pub fn put_missing_root_call(&mut self, storage_key: &str, identifying_arg: &str) {
        self.root_calls
            .entry(storage_key.to_owned())
            .or_default()
            .insert(identifying_arg.to_owned(), None);
    }

    /// Query path recorded for client identity `id`.
    pub fn path(&self, id: &DataId) -> Option<&QueryPath> {
        self.paths.get(id)
    }

    /// Notes that `client_mutation_id` wrote to `id` in this layer.
    pub fn add_mutation_id(&mut self, id: &DataId, client_mutation_id: &str) {
        let ids = self.mutation_ids.entry(id.clone()).or_default();
        if !ids.iter().any(|existing| existing == client_mutation_id) {
            ids.push(client_mutation_id.to_owned());
        }
    }

    /// Mutations that wrote to `id` in this layer, in first-write order.
    pub fn mutation_ids(&self, id: &DataId) -> &[String] {
        self.mutation_ids.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Empties the layer.
    pub fn clear(&mut self) {
        self.records.clear();
        self.root_calls.clear();
        self.paths.clear();
        self.mutation_ids.clear();
    }

    fn record_for_write(&mut self, id: &DataId, op: &'static str) -> Result<&mut Record> {
        match self.records.get_mut(id) {
            Some(Some(record)) => Ok(record),
            _ => Err(StoreError::invariant(format!(
                "{op}(): expected record `{id}` to exist"
            ))),
        }
    }
}
