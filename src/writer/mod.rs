//! Normalisation of response payloads into a record layer.
//!
//! The writer walks a payload and its selection tree in lockstep, assigning an
//! identity to every object and storing scalars and references on flat
//! records. Writes are compared against the target layer only, so a second
//! identical write to the same layer is a no-op while a queued write that
//! merely repeats committed data is still recorded.

mod configs;

use std::collections::BTreeSet;

use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::query::{
    applicable_fields, find_field, payload_id, Field, FieldKind, QueryPath, RootQuery, Selection,
    Variables,
};
use crate::storage::{
    FieldValue, Layer, RangeData, RecordState, RootCallLookup, StoreLayers, StoreView, RANGE_FIELD,
};
use crate::tracker::QueryTracker;
use crate::types::{ClientIdGenerator, DataId, Result, StoreError};

pub use configs::{MutationConfig, RangeBehavior, UpdateOptions};

/// Identities touched by a write.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Records that did not exist before the write.
    pub created: BTreeSet<DataId>,
    /// Existing records whose fields changed.
    pub updated: BTreeSet<DataId>,
}

impl ChangeSet {
    /// Whether nothing was created or updated.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty()
    }

    /// Folds `other` into `self`; a record created by either side stays created.
    pub fn merge(&mut self, other: ChangeSet) {
        self.created.extend(other.created);
        self.updated.extend(other.updated);
        let created = &self.created;
        self.updated.retain(|id| !created.contains(id));
    }

    /// Every touched identity.
    pub fn ids(&self) -> impl Iterator<Item = &DataId> {
        self.created.iter().chain(self.updated.iter())
    }
}

/// Writes payloads into one layer of a [`StoreLayers`].
pub struct PayloadWriter<'a> {
    layers: &'a mut StoreLayers,
    target: Layer,
    ids: &'a ClientIdGenerator,
    tracker: Option<&'a dyn QueryTracker>,
    client_mutation_id: Option<String>,
    changes: ChangeSet,
}

impl<'a> PayloadWriter<'a> {
    /// Creates a writer targeting the committed or queued layer.
    pub fn new(layers: &'a mut StoreLayers, target: Layer, ids: &'a ClientIdGenerator) -> Result<Self> {
        if target == Layer::Cached {
            return Err(StoreError::invariant(
                "payloads are written to the committed or queued layer; the cached layer is filled from disk",
            ));
        }
        Ok(Self {
            layers,
            target,
            ids,
            tracker: None,
            client_mutation_id: None,
            changes: ChangeSet::default(),
        })
    }

    /// Records written selections in `tracker` (committed writes only).
    pub fn with_tracker(mut self, tracker: &'a dyn QueryTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Tags every touched record with `client_mutation_id`.
    pub fn with_mutation_id(mut self, client_mutation_id: Option<&str>) -> Self {
        self.client_mutation_id = client_mutation_id.map(str::to_owned);
        self
    }

    /// Changes accumulated so far.
    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    /// Consumes the writer, returning the accumulated changes.
    pub fn into_changes(self) -> ChangeSet {
        self.changes
    }

    /// Writes the response of a root query.
    ///
    /// `response` is keyed by the root field's response key. A `null` root
    /// value records the root call as resolved-to-nothing.
    pub fn write_query_payload(&mut self, query: &RootQuery, response: &Value) -> Result<()> {
        let Value::Object(response) = response else {
            return Err(StoreError::payload("query response must be an object"));
        };
        let field = &query.field;
        let value = response.get(field.response_key()).ok_or_else(|| {
            StoreError::payload(format!(
                "response to `{}` has no root field `{}`",
                query.name,
                field.response_key()
            ))
        })?;
        let root_key = query.root_call_key()?;
        let arg_keys = query.identifying_arg_keys()?;
        let path = QueryPath::root(query);
        debug!(query = %query.name, root = %root_key, roots = arg_keys.len(), "store.writer.query_payload");

        if query.is_plural_root() {
            match value {
                Value::Null => {
                    for arg_key in &arg_keys {
                        self.write_root(query, &root_key, arg_key, &Value::Null, &path)?;
                    }
                }
                Value::Array(items) if items.len() == arg_keys.len() => {
                    for (arg_key, item) in arg_keys.iter().zip(items) {
                        self.write_root(query, &root_key, arg_key, item, &path)?;
                    }
                }
                _ => {
                    return Err(StoreError::payload(format!(
                        "expected {} results for plural root `{root_key}`",
                        arg_keys.len()
                    )))
                }
            }
            return Ok(());
        }
        let arg_key = arg_keys.first().map(String::as_str).unwrap_or("");
        self.write_root(query, &root_key, arg_key, value, &path)
    }

    /// Writes `payload` for `selections` directly onto record `id`.
    ///
    /// Client identities need a path, given here or recorded by an earlier write.
    pub fn write_fragment(
        &mut self,
        id: &DataId,
        selections: &[Selection],
        variables: &Variables,
        payload: &Value,
        path: Option<QueryPath>,
    ) -> Result<()> {
        let Value::Object(object) = payload else {
            return Err(StoreError::payload(format!(
                "fragment payload for `{id}` must be an object"
            )));
        };
        let path = match path.or_else(|| self.view().path(id).cloned()) {
            Some(path) => path,
            None if !id.is_client() => QueryPath::node(id, "FragmentRefetch"),
            None => {
                return Err(StoreError::invariant(format!(
                    "no query path is known for client record `{id}`"
                )))
            }
        };
        self.write_record(id, &path, selections, object, variables)
    }

    /// Writes a mutation payload: merges every top-level object carrying an
    /// `id`, then applies `configs`.
    ///
    /// `payload` is the object returned for the mutation's root field.
    pub fn write_update_payload(
        &mut self,
        mutation: &RootQuery,
        payload: &Value,
        configs: &[MutationConfig],
    ) -> Result<()> {
        let Value::Object(payload) = payload else {
            return Err(StoreError::payload(format!(
                "payload of mutation `{}` must be an object",
                mutation.name
            )));
        };
        let variables = &mutation.variables;
        for field in applicable_fields(&mutation.field.selections, None) {
            let objects: Vec<&Map<String, Value>> = match payload.get(field.response_key()) {
                Some(Value::Object(object)) => vec![object],
                Some(Value::Array(items)) => items.iter().filter_map(Value::as_object).collect(),
                _ => continue,
            };
            for object in objects {
                if let Some(id) = payload_id(object) {
                    let path = QueryPath::node(&id, &mutation.name);
                    self.write_record(&id, &path, &field.selections, object, variables)?;
                }
            }
        }
        for config in configs {
            match config {
                MutationConfig::FieldsChange { field_ids } => {
                    for id in field_ids {
                        if !self.changes.created.contains(id)
                            && self.view().record_state(id) == RecordState::Existent
                        {
                            self.changes.updated.insert(id.clone());
                        }
                    }
                }
                MutationConfig::RangeAdd {
                    parent_id,
                    connection_name,
                    edge_name,
                    behavior,
                } => self.range_add(mutation, payload, parent_id, connection_name, edge_name, *behavior)?,
                MutationConfig::NodeDelete {
                    parent_id,
                    connection_name,
                    deleted_id_field_name,
                } => self.node_delete(payload, parent_id, connection_name, deleted_id_field_name)?,
            }
        }
        Ok(())
    }

    fn view(&self) -> StoreView<'_> {
        match self.target {
            Layer::Queued => self.layers.view(),
            _ => self.layers.committed_view(),
        }
    }

    fn write_root(
        &mut self,
        query: &RootQuery,
        root_key: &str,
        arg_key: &str,
        value: &Value,
        path: &QueryPath,
    ) -> Result<()> {
        match value {
            Value::Null => {
                let store = self.layers.layer_mut(self.target);
                if store.data_id(root_key, arg_key) != RootCallLookup::Missing {
                    store.put_missing_root_call(root_key, arg_key);
                }
                Ok(())
            }
            Value::Object(object) => {
                let known = match self.view().data_id(root_key, arg_key) {
                    RootCallLookup::Found(id) => Some(id),
                    _ => None,
                };
                let id = payload_id(object)
                    .or(known)
                    .unwrap_or_else(|| self.ids.next_id());
                let store = self.layers.layer_mut(self.target);
                if store.data_id(root_key, arg_key) != RootCallLookup::Found(id.clone()) {
                    store.put_data_id(root_key, arg_key, id.clone());
                }
                self.write_record(&id, path, &query.field.selections, object, &query.variables)
            }
            other => Err(StoreError::payload(format!(
                "root `{root_key}` must be an object or null, got {other}"
            ))),
        }
    }

    /// Makes sure `id` exists in the target layer, noting creation.
    fn ensure_record(&mut self, id: &DataId, typename: Option<&str>, path: &QueryPath) {
        let store = self.layers.layer_mut(self.target);
        if store.put_record(id, typename, Some(path.clone())) {
            // A queued record shadowing committed data is an update of that data.
            let shadowed = self.target == Layer::Queued
                && self.layers.committed_view().record_state(id) == RecordState::Existent;
            if shadowed {
                self.changes.updated.insert(id.clone());
            } else {
                self.changes.created.insert(id.clone());
            }
        }
        if let Some(client_mutation_id) = self.client_mutation_id.as_deref() {
            self.layers
                .layer_mut(self.target)
                .add_mutation_id(id, client_mutation_id);
        }
    }

    fn write_record(
        &mut self,
        id: &DataId,
        path: &QueryPath,
        selections: &[Selection],
        object: &Map<String, Value>,
        variables: &Variables,
    ) -> Result<()> {
        let typename = object.get("__typename").and_then(Value::as_str);
        self.ensure_record(id, typename, path);
        if self.target == Layer::Committed {
            if let Some(tracker) = self.tracker {
                tracker.track_node_for_id(selections, id);
            }
        }
        let typename = match typename {
            Some(typename) => Some(typename.to_owned()),
            None => self.view().typename(id).map(str::to_owned),
        };
        for field in applicable_fields(selections, typename.as_deref()) {
            if let Some(value) = object.get(field.response_key()) {
                self.write_field(id, path, field, value, variables)?;
            }
        }
        Ok(())
    }

    fn write_field(
        &mut self,
        id: &DataId,
        path: &QueryPath,
        field: &Field,
        value: &Value,
        variables: &Variables,
    ) -> Result<()> {
        let storage_key = field.storage_key(variables)?;
        match (field.kind, value) {
            (_, Value::Null) => self.put_value(id, &storage_key, FieldValue::Null),
            (FieldKind::Scalar, value) => {
                self.put_value(id, &storage_key, FieldValue::Scalar(value.clone()))
            }
            (FieldKind::Linked, Value::Object(object)) => {
                let child = self.link_id(id, &storage_key, object)?;
                self.put_value(id, &storage_key, FieldValue::Link(child.clone()))?;
                let child_path = path.child(field, &child);
                self.write_record(&child, &child_path, &field.selections, object, variables)
            }
            (FieldKind::PluralLinked, Value::Array(items)) => {
                self.write_plural(id, path, field, &storage_key, items, variables)
            }
            (FieldKind::Connection, Value::Object(object)) => {
                self.write_connection(id, path, field, &storage_key, object, variables)
            }
            (kind, value) => Err(StoreError::payload(format!(
                "expected a {kind:?} value for `{storage_key}` of `{id}`, got {value}"
            ))),
        }
    }

    /// Stores `value` unless the target layer already holds an equal one.
    fn put_value(&mut self, id: &DataId, storage_key: &str, value: FieldValue) -> Result<()> {
        let store = self.layers.layer_mut(self.target);
        if store.field(id, storage_key) == Some(&value) {
            return Ok(());
        }
        store.put_field(id, storage_key, value)?;
        trace!(data_id = %id, field = storage_key, "store.writer.field_written");
        if !self.changes.created.contains(id) {
            self.changes.updated.insert(id.clone());
        }
        Ok(())
    }

    /// Identity for a linked object: its own `id`, else the record already
    /// linked from `parent`, else a fresh client identity.
    fn link_id(&self, parent: &DataId, storage_key: &str, object: &Map<String, Value>) -> Result<DataId> {
        if let Some(id) = payload_id(object) {
            return Ok(id);
        }
        if let Some(previous) = self.view().linked_record_id(parent, storage_key)? {
            return Ok(previous.clone());
        }
        Ok(self.ids.next_id())
    }

    fn write_plural(
        &mut self,
        id: &DataId,
        path: &QueryPath,
        field: &Field,
        storage_key: &str,
        items: &[Value],
        variables: &Variables,
    ) -> Result<()> {
        let previous: Vec<DataId> = self
            .view()
            .linked_record_ids(id, storage_key)?
            .map(<[DataId]>::to_vec)
            .unwrap_or_default();
        let mut children = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let Value::Object(object) = item else {
                return Err(StoreError::payload(format!(
                    "element {index} of `{storage_key}` on `{id}` must be an object"
                )));
            };
            let child = payload_id(object)
                .or_else(|| previous.get(index).cloned())
                .unwrap_or_else(|| self.ids.next_id());
            children.push((child, object));
        }
        let linked = children.iter().map(|(child, _)| child.clone()).collect();
        self.put_value(id, storage_key, FieldValue::Links(linked))?;
        for (child, object) in children {
            let child_path = path.child(field, &child);
            self.write_record(&child, &child_path, &field.selections, object, variables)?;
        }
        Ok(())
    }

    fn write_connection(
        &mut self,
        parent: &DataId,
        path: &QueryPath,
        field: &Field,
        storage_key: &str,
        object: &Map<String, Value>,
        variables: &Variables,
    ) -> Result<()> {
        let range_id = match self.view().linked_record_id(parent, storage_key)? {
            Some(id) => id.clone(),
            None => self.ids.next_id(),
        };
        self.put_value(parent, storage_key, FieldValue::Link(range_id.clone()))?;
        let range_path = path.child(field, &range_id);
        let typename = object.get("__typename").and_then(Value::as_str);
        self.ensure_record(&range_id, typename, &range_path);

        let previous = self.view().range(&range_id).cloned().unwrap_or_default();
        let replaces = !has_range_call(field, variables, "after") && !has_range_call(field, variables, "before");
        let reusable: &[DataId] = if replaces { &previous.edges } else { &[] };
        let mut edges = None;
        let mut page_info = None;
        for child in applicable_fields(&field.selections, typename) {
            let Some(value) = object.get(child.response_key()) else {
                continue;
            };
            match (child.name.as_str(), value) {
                ("edges", value) => {
                    edges = Some(self.write_edges(&range_id, &range_path, child, value, reusable, variables)?);
                }
                ("pageInfo", Value::Object(info)) => page_info = Some(info.clone()),
                ("pageInfo", Value::Null) => page_info = Some(Map::new()),
                ("pageInfo", other) => {
                    return Err(StoreError::payload(format!(
                        "pageInfo of `{storage_key}` on `{parent}` must be an object, got {other}"
                    )))
                }
                _ => self.write_field(&range_id, &range_path, child, value, variables)?,
            }
        }
        if edges.is_none() && page_info.is_none() {
            return Ok(());
        }
        let edges = match edges {
            Some(page) => merge_page(field, variables, &previous.edges, page),
            None => previous.edges.clone(),
        };
        let range = RangeData {
            edges,
            page_info: page_info.unwrap_or_else(|| previous.page_info.clone()),
        };
        self.put_value(&range_id, RANGE_FIELD, FieldValue::Range(range))
    }

    fn write_edges(
        &mut self,
        range_id: &DataId,
        range_path: &QueryPath,
        edges_field: &Field,
        value: &Value,
        reusable: &[DataId],
        variables: &Variables,
    ) -> Result<Vec<DataId>> {
        let items = match value {
            Value::Array(items) => items,
            Value::Null => return Ok(Vec::new()),
            other => {
                return Err(StoreError::payload(format!(
                    "edges of range `{range_id}` must be a list, got {other}"
                )))
            }
        };
        let mut edge_ids = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let Value::Object(edge) = item else {
                return Err(StoreError::payload(format!(
                    "edges of range `{range_id}` must be objects"
                )));
            };
            // Edges of nodes without an identity keep their position's edge id.
            let edge_id = match edge.get("node").and_then(Value::as_object).and_then(payload_id) {
                Some(node_id) => DataId::client_edge(range_id, &node_id),
                None => reusable
                    .get(index)
                    .filter(|id| !edge_ids.contains(*id))
                    .cloned()
                    .unwrap_or_else(|| self.ids.next_id()),
            };
            let edge_path = range_path.child(edges_field, &edge_id);
            self.write_record(&edge_id, &edge_path, &edges_field.selections, edge, variables)?;
            if !edge_ids.contains(&edge_id) {
                edge_ids.push(edge_id);
            }
        }
        Ok(edge_ids)
    }

    /// Range records linked from every `connection_name` field of `parent`.
    fn connection_ranges(&self, parent: &DataId, connection_name: &str) -> Result<Vec<DataId>> {
        let prefix = format!("{connection_name}{{");
        let mut keys = BTreeSet::new();
        for layer in [Layer::Queued, Layer::Committed, Layer::Cached] {
            if layer == Layer::Queued && self.target != Layer::Queued {
                continue;
            }
            if let Some(record) = self.layers.layer(layer).record(parent) {
                keys.extend(
                    record
                        .fields()
                        .map(|(key, _)| key)
                        .filter(|key| *key == connection_name || key.starts_with(&prefix))
                        .map(str::to_owned),
                );
            }
        }
        let view = self.view();
        let mut ranges = Vec::new();
        for key in keys {
            if let Some(range_id) = view.linked_record_id(parent, &key)? {
                if !ranges.contains(range_id) {
                    ranges.push(range_id.clone());
                }
            }
        }
        Ok(ranges)
    }

    fn range_add(
        &mut self,
        mutation: &RootQuery,
        payload: &Map<String, Value>,
        parent_id: &DataId,
        connection_name: &str,
        edge_name: &str,
        behavior: RangeBehavior,
    ) -> Result<()> {
        let edge_field = find_field(&mutation.field.selections, edge_name).ok_or_else(|| {
            StoreError::invariant(format!(
                "mutation `{}` does not select edge `{edge_name}`",
                mutation.name
            ))
        })?;
        let Some(Value::Object(edge)) = payload.get(edge_name) else {
            debug!(edge = edge_name, "store.writer.range_add_without_edge");
            return Ok(());
        };
        let node_id = edge
            .get("node")
            .and_then(Value::as_object)
            .and_then(payload_id)
            .ok_or_else(|| {
                StoreError::payload(format!("edge `{edge_name}` has no node with an id"))
            })?;
        for range_id in self.connection_ranges(parent_id, connection_name)? {
            let range_path = self
                .view()
                .path(&range_id)
                .cloned()
                .unwrap_or_else(|| QueryPath::node(parent_id, &mutation.name));
            self.ensure_record(&range_id, None, &range_path);
            let edge_id = DataId::client_edge(&range_id, &node_id);
            let edge_path = range_path.child(edge_field, &edge_id);
            self.write_record(&edge_id, &edge_path, &edge_field.selections, edge, &mutation.variables)?;

            let mut range = self.view().range(&range_id).cloned().unwrap_or_default();
            if behavior == RangeBehavior::Ignore || range.edges.contains(&edge_id) {
                continue;
            }
            match behavior {
                RangeBehavior::Append => range.edges.push(edge_id),
                RangeBehavior::Prepend => range.edges.insert(0, edge_id),
                RangeBehavior::Ignore => {}
            }
            self.put_value(&range_id, RANGE_FIELD, FieldValue::Range(range))?;
        }
        Ok(())
    }

    fn node_delete(
        &mut self,
        payload: &Map<String, Value>,
        parent_id: &DataId,
        connection_name: &str,
        deleted_id_field_name: &str,
    ) -> Result<()> {
        let deleted: Vec<DataId> = match payload.get(deleted_id_field_name) {
            Some(Value::String(id)) => vec![DataId::from(id.as_str())],
            Some(Value::Array(ids)) => ids
                .iter()
                .filter_map(Value::as_str)
                .map(DataId::from)
                .collect(),
            _ => return Ok(()),
        };
        for range_id in self.connection_ranges(parent_id, connection_name)? {
            let Some(range) = self.view().range(&range_id).cloned() else {
                continue;
            };
            let view = self.view();
            let mut kept = Vec::with_capacity(range.edges.len());
            for edge in &range.edges {
                let node = view.linked_record_id(edge, "node")?;
                if !node.is_some_and(|node| deleted.contains(node)) {
                    kept.push(edge.clone());
                }
            }
            if kept.len() == range.edges.len() {
                continue;
            }
            let range_path = view
                .path(&range_id)
                .cloned()
                .unwrap_or_else(|| QueryPath::node(parent_id, "NodeDelete"));
            self.ensure_record(&range_id, None, &range_path);
            self.put_value(
                &range_id,
                RANGE_FIELD,
                FieldValue::Range(RangeData {
                    edges: kept,
                    page_info: range.page_info,
                }),
            )?;
        }
        for id in deleted {
            let store = self.layers.layer_mut(self.target);
            if store.record_state(&id) == RecordState::Nonexistent {
                continue;
            }
            store.delete_record(&id);
            if let Some(client_mutation_id) = self.client_mutation_id.as_deref() {
                store.add_mutation_id(&id, client_mutation_id);
            }
            self.changes.created.remove(&id);
            self.changes.updated.insert(id);
        }
        Ok(())
    }
}

/// Combines a freshly fetched page with the edges already stored.
///
/// Whether `field` carries a non-null `name` range call.
fn has_range_call(field: &Field, variables: &Variables, name: &str) -> bool {
    field
        .args
        .iter()
        .any(|arg| arg.name == name && arg.resolve(variables).is_some_and(|v| !v.is_null()))
}

/// Pages fetched `after` a cursor extend the range, pages fetched `before` a
/// cursor are placed in front of it; any other fetch replaces it.
fn merge_page(field: &Field, variables: &Variables, previous: &[DataId], page: Vec<DataId>) -> Vec<DataId> {
    let fresh = || page.iter().filter(|id| !previous.contains(id)).cloned();
    if has_range_call(field, variables, "after") {
        previous.iter().cloned().chain(fresh()).collect()
    } else if has_range_call(field, variables, "before") {
        fresh().chain(previous.iter().cloned()).collect()
    } else {
        page
    }
}
