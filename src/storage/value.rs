use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::DataId;

/// Storage key of the field holding a connection's range on its range record.
pub const RANGE_FIELD: &str = "__range__";

/// Value stored under one field of a [`Record`].
///
/// An unfetched field has no entry at all; callers see it as `None`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    /// Known to be absent.
    Null,
    /// Scalar (or list of scalars) exactly as the server returned it.
    Scalar(Value),
    /// Reference to another record.
    Link(DataId),
    /// Ordered references for a plural linked field.
    Links(Vec<DataId>),
    /// Paginated connection edges.
    Range(RangeData),
}

impl FieldValue {
    /// Identities referenced by this value, in stored order.
    pub fn linked_ids(&self) -> Vec<&DataId> {
        match self {
            FieldValue::Link(id) => vec![id],
            FieldValue::Links(ids) => ids.iter().collect(),
            FieldValue::Range(range) => range.edges.iter().collect(),
            FieldValue::Null | FieldValue::Scalar(_) => Vec::new(),
        }
    }

    /// Returns the linked identity when this value is a single link.
    pub fn as_link(&self) -> Option<&DataId> {
        match self {
            FieldValue::Link(id) => Some(id),
            _ => None,
        }
    }

    /// Returns the linked identities when this value is a plural link.
    pub fn as_links(&self) -> Option<&[DataId]> {
        match self {
            FieldValue::Links(ids) => Some(ids),
            _ => None,
        }
    }

    /// Returns the range when this value holds connection edges.
    pub fn as_range(&self) -> Option<&RangeData> {
        match self {
            FieldValue::Range(range) => Some(range),
            _ => None,
        }
    }
}

/// Edges of a connection plus its page info, kept exactly as received.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeData {
    /// Edge record identities in display order.
    pub edges: Vec<DataId>,
    /// The `pageInfo` object from the payload, preserved verbatim.
    pub page_info: Map<String, Value>,
}

/// Flat field map for one identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    id: DataId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typename: Option<String>,
    #[serde(default)]
    fields: BTreeMap<String, FieldValue>,
}

impl Record {
    /// Creates an empty record.
    pub fn new(id: DataId, typename: Option<String>) -> Self {
        Self {
            id,
            typename,
            fields: BTreeMap::new(),
        }
    }

    /// The record's identity.
    pub fn id(&self) -> &DataId {
        &self.id
    }

    /// Concrete type of the record when known.
    pub fn typename(&self) -> Option<&str> {
        self.typename.as_deref()
    }

    pub(crate) fn set_typename(&mut self, typename: &str) {
        self.typename = Some(typename.to_owned());
    }

    /// Value stored under `storage_key`; `None` when never fetched.
    pub fn field(&self, storage_key: &str) -> Option<&FieldValue> {
        self.fields.get(storage_key)
    }

    /// Stores `value` under `storage_key`, returning the previous value.
    pub fn set_field(&mut self, storage_key: impl Into<String>, value: FieldValue) -> Option<FieldValue> {
        self.fields.insert(storage_key.into(), value)
    }

    /// Forgets `storage_key` entirely (back to unfetched).
    pub fn remove_field(&mut self, storage_key: &str) -> Option<FieldValue> {
        self.fields.remove(storage_key)
    }

    /// Iterates over stored fields in key order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Every identity referenced from this record's fields.
    pub fn linked_ids(&self) -> Vec<&DataId> {
        self.fields.values().flat_map(FieldValue::linked_ids).collect()
    }
}
