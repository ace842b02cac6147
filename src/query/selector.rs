use std::rc::Rc;

use serde_json::Value;

use crate::storage::StoreView;
use crate::types::{DataId, Result};

use super::{reader, Fragment, Variables};

/// What data, for which record, under which argument bindings.
///
/// Two selectors are equal when they name the same record, the very same
/// fragment node (by reference) and deep-equal variables.
#[derive(Clone, Debug)]
pub struct Selector {
    /// Record the fragment is read from.
    pub data_id: DataId,
    /// Fragment describing the fields to read.
    pub node: Rc<Fragment>,
    /// Variable bindings for the fragment's arguments.
    pub variables: Variables,
}

impl Selector {
    /// Creates a selector.
    pub fn new(data_id: DataId, node: Rc<Fragment>, variables: Variables) -> Self {
        Self {
            data_id,
            node,
            variables,
        }
    }

    /// Reads the selected data; `None` while the record is unknown.
    pub fn read(&self, view: &StoreView<'_>) -> Result<Option<Value>> {
        reader::read(
            view,
            &self.data_id,
            std::slice::from_ref(&super::Selection::Fragment(self.node.clone())),
            &self.variables,
        )
    }
}

impl PartialEq for Selector {
    fn eq(&self, other: &Self) -> bool {
        self.data_id == other.data_id
            && Rc::ptr_eq(&self.node, &other.node)
            && self.variables == other.variables
    }
}

impl Eq for Selector {}
