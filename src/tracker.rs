//! Index of the selections that have been written for each record.

use std::cell::RefCell;

use rustc_hash::FxHashMap;

use crate::query::Selection;
use crate::types::DataId;

/// Tracks which selections have been fetched for each record so that
/// mutations can compute what to refetch; told when records are collected.
pub trait QueryTracker {
    /// Notes that `selections` were written for `id`.
    fn track_node_for_id(&self, selections: &[Selection], id: &DataId);
    /// Forgets every selection tracked for `id`.
    fn untrack_nodes_for_id(&self, id: &DataId);
    /// Selections tracked for `id`, in first-tracked order.
    fn tracked_nodes_for_id(&self, id: &DataId) -> Vec<Selection>;
}

/// In-memory [`QueryTracker`].
#[derive(Debug, Default)]
pub struct NodeQueryTracker {
    nodes: RefCell<FxHashMap<DataId, Vec<Selection>>>,
}

impl NodeQueryTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether anything is tracked for `id`.
    pub fn is_tracked(&self, id: &DataId) -> bool {
        self.nodes.borrow().contains_key(id)
    }
}

impl QueryTracker for NodeQueryTracker {
    fn track_node_for_id(&self, selections: &[Selection], id: &DataId) {
        let mut nodes = self.nodes.borrow_mut();
        let tracked = nodes.entry(id.clone()).or_default();
        for selection in selections {
            if !tracked.contains(selection) {
                tracked.push(selection.clone());
            }
        }
    }

    fn untrack_nodes_for_id(&self, id: &DataId) {
        self.nodes.borrow_mut().remove(id);
    }

    fn tracked_nodes_for_id(&self, id: &DataId) -> Vec<Selection> {
        self.nodes.borrow().get(id).cloned().unwrap_or_default()
    }
}
