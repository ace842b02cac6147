use crate::storage::{FieldValue, RecordState, StoreView};
use crate::types::DataId;

use super::{applicable_fields, Field, FieldKind, Selection, Variables};

/// A record that must be loaded before `selections` can be answered.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingNode {
    /// Record to load.
    pub data_id: DataId,
    /// Selections to satisfy on that record.
    pub selections: Vec<Selection>,
    /// Whether the record is a connection's range record; `selections` then
    /// select from the connection (`edges`, `pageInfo`, ...).
    pub connection: bool,
}

impl PendingNode {
    /// An ordinary record.
    pub fn record(data_id: DataId, selections: Vec<Selection>) -> Self {
        Self {
            data_id,
            selections,
            connection: false,
        }
    }

    /// The record `field` links to.
    pub fn for_field(data_id: DataId, field: &Field) -> Self {
        Self {
            data_id,
            selections: field.selections.clone(),
            connection: field.kind == FieldKind::Connection,
        }
    }
}

/// Outcome of a missing-data walk.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MissingData {
    /// Some field is unfetched in every layer.
    pub missing: bool,
    /// Records unknown to every layer that the walk could not enter.
    pub pending: Vec<PendingNode>,
}

impl MissingData {
    /// Whether the selections are fully answerable from memory.
    pub fn is_complete(&self) -> bool {
        !self.missing && self.pending.is_empty()
    }
}

/// Decides which parts of a selection tree the in-memory layers cannot answer.
pub trait MissingDataFinder {
    /// Walks `node` through `view`.
    fn find(&self, view: &StoreView<'_>, node: &PendingNode, variables: &Variables) -> MissingData;
}

/// Walks the layered view, stopping at unknown records.
#[derive(Clone, Copy, Debug, Default)]
pub struct StoreMissingDataFinder;

impl MissingDataFinder for StoreMissingDataFinder {
    fn find(&self, view: &StoreView<'_>, node: &PendingNode, variables: &Variables) -> MissingData {
        let mut out = MissingData::default();
        let mut walk = Walk {
            view,
            variables,
            out: &mut out,
        };
        walk.node(node);
        out
    }
}

struct Walk<'v, 'a> {
    view: &'v StoreView<'a>,
    variables: &'v Variables,
    out: &'v mut MissingData,
}

impl Walk<'_, '_> {
    fn node(&mut self, node: &PendingNode) {
        match self.view.record_state(&node.data_id) {
            RecordState::Unknown => {
                self.out.pending.push(node.clone());
                return;
            }
            RecordState::Nonexistent => return,
            RecordState::Existent => {}
        }
        if node.connection {
            self.connection(&node.data_id, &node.selections);
        } else {
            self.record(&node.data_id, &node.selections);
        }
    }

    fn record(&mut self, id: &DataId, selections: &[Selection]) {
        for field in applicable_fields(selections, self.view.typename(id)) {
            self.field(id, field);
        }
    }

    fn connection(&mut self, id: &DataId, selections: &[Selection]) {
        let range = self.view.range(id);
        for field in applicable_fields(selections, self.view.typename(id)) {
            match (field.name.as_str(), range) {
                ("edges", Some(range)) => {
                    for edge in &range.edges {
                        self.node(&PendingNode::record(edge.clone(), field.selections.clone()));
                    }
                }
                ("pageInfo", Some(_)) => {}
                ("edges" | "pageInfo", None) => self.out.missing = true,
                _ => self.field(id, field),
            }
        }
    }

    fn field(&mut self, id: &DataId, field: &Field) {
        let Ok(storage_key) = field.storage_key(self.variables) else {
            self.out.missing = true;
            return;
        };
        match (field.kind, self.view.field(id, &storage_key)) {
            (_, None) => self.out.missing = true,
            (_, Some(FieldValue::Null)) => {}
            (FieldKind::Scalar, Some(FieldValue::Scalar(_))) => {}
            (FieldKind::Linked | FieldKind::Connection, Some(FieldValue::Link(child))) => {
                self.node(&PendingNode::for_field(child.clone(), field));
            }
            (FieldKind::PluralLinked, Some(FieldValue::Links(children))) => {
                for child in children {
                    self.node(&PendingNode::for_field(child.clone(), field));
                }
            }
            _ => self.out.missing = true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Layer, StoreLayers};
    use crate::types::Result;
    use serde_json::json;

    #[test]
    fn unknown_links_become_pending_nodes() -> Result<()> {
        let mut layers = StoreLayers::new();
        let store = layers.layer_mut(Layer::Committed);
        let user = DataId::from("4");
        store.put_record(&user, Some("User"), None);
        store.put_field(&user, "name", FieldValue::Scalar(json!("Zuck")))?;
        store.put_linked_record_id(&user, "address", DataId::from("client:1"))?;

        let address_field = Field::linked("address", vec![Field::scalar("city").into()]);
        let selections: Vec<Selection> = vec![Field::scalar("name").into(), address_field.clone().into()];
        let found = StoreMissingDataFinder.find(
            &layers.view(),
            &PendingNode::record(user, selections),
            &Variables::new(),
        );
        assert!(!found.missing);
        assert_eq!(
            found.pending,
            vec![PendingNode::for_field(DataId::from("client:1"), &address_field)]
        );
        Ok(())
    }

    #[test]
    fn unfetched_fields_mark_missing() -> Result<()> {
        let mut layers = StoreLayers::new();
        let user = DataId::from("4");
        layers.layer_mut(Layer::Cached).put_record(&user, None, None);
        let node = PendingNode::record(user.clone(), vec![Field::scalar("name").into()]);
        let found = StoreMissingDataFinder.find(&layers.view(), &node, &Variables::new());
        assert!(found.missing);

        layers
            .layer_mut(Layer::Cached)
            .put_field(&user, "name", FieldValue::Scalar(json!("Zuck")))?;
        let found = StoreMissingDataFinder.find(&layers.view(), &node, &Variables::new());
        assert!(found.is_complete());
        Ok(())
    }

    #[test]
    fn tombstones_and_nulls_are_complete() -> Result<()> {
        let mut layers = StoreLayers::new();
        layers.layer_mut(Layer::Committed).delete_record(&DataId::from("4"));
        let node = PendingNode::record(DataId::from("4"), vec![Field::scalar("name").into()]);
        assert!(StoreMissingDataFinder
            .find(&layers.view(), &node, &Variables::new())
            .is_complete());
        Ok(())
    }
}
