use serde_json::{Map, Value};

use crate::storage::{FieldValue, RecordState, StoreView};
use crate::types::{DataId, Result, StoreError};

use super::{applicable_fields, Field, FieldKind, Selection, Variables};

/// Denormalises `selections` on record `id` back into a response-shaped tree.
///
/// Returns `None` while the record is unknown and `Some(Value::Null)` when it
/// is known to be absent. Unfetched fields are left out of the result.
pub fn read(
    view: &StoreView<'_>,
    id: &DataId,
    selections: &[Selection],
    variables: &Variables,
) -> Result<Option<Value>> {
    match view.record_state(id) {
        RecordState::Unknown => Ok(None),
        RecordState::Nonexistent => Ok(Some(Value::Null)),
        RecordState::Existent => {
            let mut out = Map::new();
            for field in applicable_fields(selections, view.typename(id)) {
                if let Some(value) = read_field(view, id, field, variables)? {
                    insert_merged(&mut out, field.response_key(), value);
                }
            }
            Ok(Some(Value::Object(out)))
        }
    }
}

fn read_field(
    view: &StoreView<'_>,
    id: &DataId,
    field: &Field,
    variables: &Variables,
) -> Result<Option<Value>> {
    let storage_key = field.storage_key(variables)?;
    let Some(value) = view.field(id, &storage_key) else {
        return Ok(None);
    };
    match (field.kind, value) {
        (_, FieldValue::Null) => Ok(Some(Value::Null)),
        (FieldKind::Scalar, FieldValue::Scalar(value)) => Ok(Some(value.clone())),
        (FieldKind::Linked, FieldValue::Link(child)) => {
            read(view, child, &field.selections, variables)
        }
        (FieldKind::PluralLinked, FieldValue::Links(children)) => {
            read_list(view, children, &field.selections, variables)
        }
        (FieldKind::Connection, FieldValue::Link(range_id)) => {
            read_connection(view, range_id, field, variables)
        }
        _ => Err(StoreError::invariant(format!(
            "field `{storage_key}` of `{id}` does not match its {:?} selection",
            field.kind
        ))),
    }
}

fn read_list(
    view: &StoreView<'_>,
    ids: &[DataId],
    selections: &[Selection],
    variables: &Variables,
) -> Result<Option<Value>> {
    let mut items = Vec::with_capacity(ids.len());
    for id in ids {
        match read(view, id, selections, variables)? {
            Some(item) => items.push(item),
            None => return Ok(None),
        }
    }
    Ok(Some(Value::Array(items)))
}

fn read_connection(
    view: &StoreView<'_>,
    range_id: &DataId,
    field: &Field,
    variables: &Variables,
) -> Result<Option<Value>> {
    match view.record_state(range_id) {
        RecordState::Unknown => return Ok(None),
        RecordState::Nonexistent => return Ok(Some(Value::Null)),
        RecordState::Existent => {}
    }
    let range = view.range(range_id);
    let mut out = Map::new();
    for child in applicable_fields(&field.selections, view.typename(range_id)) {
        let value = match (child.name.as_str(), range) {
            ("edges", Some(range)) => read_list(view, &range.edges, &child.selections, variables)?,
            ("pageInfo", Some(range)) => Some(Value::Object(range.page_info.clone())),
            ("edges" | "pageInfo", None) => None,
            _ => read_field(view, range_id, child, variables)?,
        };
        if let Some(value) = value {
            insert_merged(&mut out, child.response_key(), value);
        }
    }
    Ok(Some(Value::Object(out)))
}

/// Inserts `value`, deep-merging objects selected more than once.
fn insert_merged(out: &mut Map<String, Value>, key: &str, value: Value) {
    match (out.get_mut(key), value) {
        (Some(Value::Object(existing)), Value::Object(incoming)) => {
            for (k, v) in incoming {
                insert_merged(existing, &k, v);
            }
        }
        (_, value) => {
            out.insert(key.to_owned(), value);
        }
    }
}
