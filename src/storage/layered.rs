use std::collections::BTreeSet;

use crate::query::QueryPath;
use crate::types::{DataId, Result, StoreError};

use super::record_store::{RecordState, RecordStore, RootCallLookup};
use super::value::{FieldValue, RangeData, Record, RANGE_FIELD};

static NULL_FIELD: FieldValue = FieldValue::Null;

/// One of the three record layers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Layer {
    /// Records hydrated from the persistent cache.
    Cached,
    /// Server-confirmed records.
    Committed,
    /// Optimistic mutation overlay.
    Queued,
}

/// The cached, committed and queued layers owned by one store.
#[derive(Default, Debug)]
pub struct StoreLayers {
    cached: RecordStore,
    committed: RecordStore,
    queued: RecordStore,
}

impl StoreLayers {
    /// Creates three empty layers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read access to one layer.
    pub fn layer(&self, layer: Layer) -> &RecordStore {
        match layer {
            Layer::Cached => &self.cached,
            Layer::Committed => &self.committed,
            Layer::Queued => &self.queued,
        }
    }

    /// Write access to one layer.
    pub fn layer_mut(&mut self, layer: Layer) -> &mut RecordStore {
        match layer {
            Layer::Cached => &mut self.cached,
            Layer::Committed => &mut self.committed,
            Layer::Queued => &mut self.queued,
        }
    }

    /// Read-through view over all three layers.
    pub fn view(&self) -> StoreView<'_> {
        StoreView {
            layers: self,
            include_queued: true,
        }
    }

    /// Read-through view that ignores optimistic data.
    pub fn committed_view(&self) -> StoreView<'_> {
        StoreView {
            layers: self,
            include_queued: false,
        }
    }

    /// Whether any layer holds a record or root call.
    pub fn has_data(&self) -> bool {
        !(self.cached.is_empty() && self.committed.is_empty() && self.queued.is_empty())
    }

    /// Every identity known to any layer, sorted.
    pub fn record_ids(&self) -> BTreeSet<DataId> {
        self.queued
            .record_ids()
            .chain(self.committed.record_ids())
            .chain(self.cached.record_ids())
            .cloned()
            .collect()
    }

    /// Identities referenced by `id` in any layer, queued first, without duplicates.
    pub fn linked_ids(&self, id: &DataId) -> Vec<DataId> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for layer in [&self.queued, &self.committed, &self.cached] {
            if let Some(record) = layer.record(id) {
                for linked in record.linked_ids() {
                    if seen.insert(linked.clone()) {
                        out.push(linked.clone());
                    }
                }
            }
        }
        out
    }

    /// Removes `id` from every layer, returning the records that were present.
    pub fn remove_everywhere(&mut self, id: &DataId) -> Vec<Record> {
        [&mut self.queued, &mut self.committed, &mut self.cached]
            .into_iter()
            .filter_map(|layer| layer.remove_record(id).flatten())
            .collect()
    }
}

/// Read-through accessor resolving queued → committed → cached.
///
/// At record level the first layer with an entry decides existence. At field
/// level an unfetched field falls through to the next layer, while a `null`
/// (or a tombstoned record) is terminal.
#[derive(Clone, Copy)]
pub struct StoreView<'a> {
    layers: &'a StoreLayers,
    include_queued: bool,
}

impl<'a> StoreView<'a> {
    fn stack(&self) -> impl Iterator<Item = &'a RecordStore> {
        let queued = self.include_queued.then_some(&self.layers.queued);
        queued
            .into_iter()
            .chain([&self.layers.committed, &self.layers.cached])
    }

    /// Existence of `id` across the layers.
    pub fn record_state(&self, id: &DataId) -> RecordState {
        self.stack()
            .map(|layer| layer.record_state(id))
            .find(|state| *state != RecordState::Unknown)
            .unwrap_or(RecordState::Unknown)
    }

    /// Resolves a field; `None` means unfetched in every layer.
    pub fn field(&self, id: &DataId, storage_key: &str) -> Option<&'a FieldValue> {
        for layer in self.stack() {
            match layer.entry(id) {
                None => continue,
                Some(None) => return Some(&NULL_FIELD),
                Some(Some(record)) => {
                    if let Some(value) = record.field(storage_key) {
                        return Some(value);
                    }
                }
            }
        }
        None
    }

    /// Linked identity of `storage_key`; `None` when null or unfetched.
    pub fn linked_record_id(&self, id: &DataId, storage_key: &str) -> Result<Option<&'a DataId>> {
        match self.field(id, storage_key) {
            None | Some(FieldValue::Null) => Ok(None),
            Some(FieldValue::Link(linked)) => Ok(Some(linked)),
            Some(_) => Err(StoreError::invariant(format!(
                "expected field `{storage_key}` of `{id}` to be a linked record"
            ))),
        }
    }

    /// Linked identities of plural `storage_key`; `None` when null or unfetched.
    pub fn linked_record_ids(
        &self,
        id: &DataId,
        storage_key: &str,
    ) -> Result<Option<&'a [DataId]>> {
        match self.field(id, storage_key) {
            None | Some(FieldValue::Null) => Ok(None),
            Some(FieldValue::Links(ids)) => Ok(Some(ids)),
            Some(_) => Err(StoreError::invariant(format!(
                "expected field `{storage_key}` of `{id}` to be a list of linked records"
            ))),
        }
    }

    /// Range stored on range record `id`.
    pub fn range(&self, id: &DataId) -> Option<&'a RangeData> {
        self.field(id, RANGE_FIELD).and_then(FieldValue::as_range)
    }

    /// Concrete type of `id`, from the highest layer that knows it.
    pub fn typename(&self, id: &DataId) -> Option<&'a str> {
        self.stack()
            .filter_map(|layer| layer.record(id))
            .find_map(Record::typename)
    }

    /// Resolves a root call; the first layer that attempted it wins.
    pub fn data_id(&self, storage_key: &str, identifying_arg: &str) -> RootCallLookup {
        self.stack()
            .map(|layer| layer.data_id(storage_key, identifying_arg))
            .find(|lookup| *lookup != RootCallLookup::Unknown)
            .unwrap_or(RootCallLookup::Unknown)
    }

    /// Query path recorded for client identity `id`.
    pub fn path(&self, id: &DataId) -> Option<&'a QueryPath> {
        self.stack().find_map(|layer| layer.path(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scalar(v: serde_json::Value) -> FieldValue {
        FieldValue::Scalar(v)
    }

    #[test]
    fn fields_resolve_queued_then_committed_then_cached() -> Result<()> {
        let mut layers = StoreLayers::new();
        let id = DataId::from("4");
        for layer in [Layer::Cached, Layer::Committed, Layer::Queued] {
            layers.layer_mut(layer).put_record(&id, Some("User"), None);
        }
        layers.layer_mut(Layer::Cached).put_field(&id, "a", scalar(json!("cached")))?;
        layers.layer_mut(Layer::Cached).put_field(&id, "b", scalar(json!("cached")))?;
        layers.layer_mut(Layer::Committed).put_field(&id, "b", scalar(json!("committed")))?;
        layers.layer_mut(Layer::Committed).put_field(&id, "c", scalar(json!("committed")))?;
        layers.layer_mut(Layer::Queued).put_field(&id, "c", FieldValue::Null)?;

        let view = layers.view();
        assert_eq!(view.field(&id, "a"), Some(&scalar(json!("cached"))));
        assert_eq!(view.field(&id, "b"), Some(&scalar(json!("committed"))));
        assert_eq!(view.field(&id, "c"), Some(&FieldValue::Null));
        assert_eq!(view.field(&id, "d"), None);
        assert_eq!(
            layers.committed_view().field(&id, "c"),
            Some(&scalar(json!("committed")))
        );
        Ok(())
    }

    #[test]
    fn tombstones_are_terminal() -> Result<()> {
        let mut layers = StoreLayers::new();
        let id = DataId::from("4");
        layers.layer_mut(Layer::Cached).put_record(&id, None, None);
        layers.layer_mut(Layer::Cached).put_field(&id, "a", scalar(json!(1)))?;
        layers.layer_mut(Layer::Committed).delete_record(&id);
        assert_eq!(layers.view().record_state(&id), RecordState::Nonexistent);
        assert_eq!(layers.view().field(&id, "a"), Some(&FieldValue::Null));
        Ok(())
    }

    #[test]
    fn root_calls_fall_through_unknown_layers() {
        let mut layers = StoreLayers::new();
        layers
            .layer_mut(Layer::Cached)
            .put_data_id("viewer", "", DataId::from("client:1"));
        assert_eq!(
            layers.view().data_id("viewer", ""),
            RootCallLookup::Found(DataId::from("client:1"))
        );
        layers.layer_mut(Layer::Committed).put_missing_root_call("viewer", "");
        assert_eq!(layers.view().data_id("viewer", ""), RootCallLookup::Missing);
    }

    #[test]
    fn linked_ids_merge_layers() -> Result<()> {
        let mut layers = StoreLayers::new();
        let id = DataId::from("a");
        layers.layer_mut(Layer::Committed).put_record(&id, None, None);
        layers
            .layer_mut(Layer::Committed)
            .put_linked_record_id(&id, "x", DataId::from("b"))?;
        layers.layer_mut(Layer::Queued).put_record(&id, None, None);
        layers
            .layer_mut(Layer::Queued)
            .put_linked_record_ids(&id, "y", vec![DataId::from("c"), DataId::from("b")])?;
        assert_eq!(
            layers.linked_ids(&id),
            vec![DataId::from("c"), DataId::from("b")]
        );
        assert_eq!(layers.remove_everywhere(&id).len(), 2);
        assert_eq!(layers.view().record_state(&id), RecordState::Unknown);
        Ok(())
    }
}
