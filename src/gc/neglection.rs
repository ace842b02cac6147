use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::types::{DataId, Result, StoreError};

/// Collector bookkeeping for one record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NeglectionState {
    /// Record the state belongs to.
    pub data_id: DataId,
    /// Number of live subscriptions reading the record.
    pub subscriptions: u32,
    /// Set by the last sweep that saw the record unsubscribed. A hint only:
    /// removal re-checks `subscriptions`.
    pub collectible: bool,
}

impl NeglectionState {
    fn new(data_id: DataId) -> Self {
        Self {
            data_id,
            subscriptions: 0,
            collectible: false,
        }
    }
}

/// Neglection states keyed by identity, iterated in identity order.
#[derive(Debug, Default)]
pub struct NeglectionStateMap {
    states: BTreeMap<DataId, NeglectionState>,
}

impl NeglectionStateMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id` with no subscriptions; no-op when already registered.
    pub fn register(&mut self, id: &DataId) {
        if !self.states.contains_key(id) {
            self.states.insert(id.clone(), NeglectionState::new(id.clone()));
        }
    }

    /// Adds `by` subscriptions to `id`, registering it if needed.
    pub fn increase(&mut self, id: &DataId, by: u32) {
        self.register(id);
        if let Some(state) = self.states.get_mut(id) {
            state.subscriptions = state.subscriptions.saturating_add(by);
            state.collectible = false;
        }
    }

    /// Removes `by` subscriptions from `id`.
    pub fn decrease(&mut self, id: &DataId, by: u32) -> Result<()> {
        self.register(id);
        let Some(state) = self.states.get_mut(id) else {
            return Ok(());
        };
        state.subscriptions = state.subscriptions.checked_sub(by).ok_or_else(|| {
            StoreError::invariant(format!(
                "cannot decrease subscriptions for `{id}` below zero"
            ))
        })?;
        Ok(())
    }

    /// Forgets `id`.
    pub fn remove(&mut self, id: &DataId) -> Option<NeglectionState> {
        self.states.remove(id)
    }

    /// State of `id` when registered.
    pub fn get(&self, id: &DataId) -> Option<&NeglectionState> {
        self.states.get(id)
    }

    pub(crate) fn set_collectible(&mut self, id: &DataId, collectible: bool) {
        if let Some(state) = self.states.get_mut(id) {
            state.collectible = collectible;
        }
    }

    /// Registered identities in order.
    pub fn ids(&self) -> impl Iterator<Item = &DataId> {
        self.states.keys()
    }

    /// Number of registered records.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// How subscription changes reach the state map.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TrackingMode {
    /// Changes are coalesced per identity until the next flush.
    Buffered,
    /// Changes are applied immediately; used while a sweep is in flight.
    Direct,
}

#[derive(Debug, Default, Clone, Copy)]
struct PendingDelta {
    delta: i64,
    increased: bool,
}

#[derive(Debug, Default)]
struct SubscriptionBuffer {
    registers: BTreeSet<DataId>,
    deltas: BTreeMap<DataId, PendingDelta>,
}

impl SubscriptionBuffer {
    fn is_empty(&self) -> bool {
        self.registers.is_empty() && self.deltas.is_empty()
    }
}

/// The collector's view of every record's neglection state.
#[derive(Debug)]
pub struct NeglectionTracker {
    states: NeglectionStateMap,
    buffer: SubscriptionBuffer,
    mode: TrackingMode,
}

impl NeglectionTracker {
    /// Creates an empty tracker in `mode`.
    pub fn new(mode: TrackingMode) -> Self {
        Self {
            states: NeglectionStateMap::new(),
            buffer: SubscriptionBuffer::default(),
            mode,
        }
    }

    /// Current tracking mode.
    pub fn mode(&self) -> TrackingMode {
        self.mode
    }

    /// Switches modes; entering [`TrackingMode::Direct`] flushes the buffer first.
    pub fn set_mode(&mut self, mode: TrackingMode) {
        if mode == TrackingMode::Direct {
            self.flush_buffer();
        }
        self.mode = mode;
    }

    /// Registers `id` (idempotent).
    pub fn register(&mut self, id: &DataId) {
        match self.mode {
            TrackingMode::Direct => self.states.register(id),
            TrackingMode::Buffered => {
                if self.states.get(id).is_none() {
                    self.buffer.registers.insert(id.clone());
                }
            }
        }
    }

    /// Adds one subscription to `id`.
    pub fn increase(&mut self, id: &DataId) {
        match self.mode {
            TrackingMode::Direct => self.states.increase(id, 1),
            TrackingMode::Buffered => {
                let pending = self.buffer.deltas.entry(id.clone()).or_default();
                pending.delta += 1;
                pending.increased = true;
            }
        }
    }

    /// Removes one subscription from `id`; errors when it has none.
    pub fn decrease(&mut self, id: &DataId) -> Result<()> {
        match self.mode {
            TrackingMode::Direct => self.states.decrease(id, 1),
            TrackingMode::Buffered => {
                if self.subscriptions(id) == 0 {
                    return Err(StoreError::invariant(format!(
                        "cannot decrease subscriptions for `{id}` below zero"
                    )));
                }
                self.buffer.deltas.entry(id.clone()).or_default().delta -= 1;
                Ok(())
            }
        }
    }

    /// Forgets `id`, including any buffered changes.
    pub fn remove(&mut self, id: &DataId) {
        self.buffer.registers.remove(id);
        self.buffer.deltas.remove(id);
        self.states.remove(id);
    }

    /// Applies every buffered change to the state map.
    pub fn flush_buffer(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let buffer = std::mem::take(&mut self.buffer);
        for id in &buffer.registers {
            self.states.register(id);
        }
        for (id, pending) in buffer.deltas {
            self.states.register(&id);
            if pending.delta > 0 {
                self.states
                    .increase(&id, u32::try_from(pending.delta).unwrap_or(u32::MAX));
            } else if pending.delta < 0 {
                let by = u32::try_from(-pending.delta).unwrap_or(u32::MAX);
                // Buffered decreases were checked against the effective count.
                if let Err(err) = self.states.decrease(&id, by) {
                    warn!(error = %err, data_id = %id, "store.gc.flush_underflow");
                }
            }
            if pending.increased {
                self.states.set_collectible(&id, false);
            }
        }
    }

    /// Effective subscription count of `id`, buffered changes included.
    pub fn subscriptions(&self, id: &DataId) -> u32 {
        let base = self.states.get(id).map_or(0, |state| state.subscriptions);
        let delta = self.buffer.deltas.get(id).map_or(0, |pending| pending.delta);
        u32::try_from((i64::from(base) + delta).max(0)).unwrap_or(u32::MAX)
    }

    /// Whether `id` is registered, buffered registrations included.
    pub fn is_registered(&self, id: &DataId) -> bool {
        self.states.get(id).is_some()
            || self.buffer.registers.contains(id)
            || self.buffer.deltas.contains_key(id)
    }

    /// Flushed states.
    pub fn states(&self) -> &NeglectionStateMap {
        &self.states
    }

    pub(crate) fn set_collectible(&mut self, id: &DataId, collectible: bool) {
        self.states.set_collectible(id, collectible);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_counts_and_rejects_underflow() -> Result<()> {
        let mut map = NeglectionStateMap::new();
        let id = DataId::from("4");
        map.register(&id);
        map.register(&id);
        assert_eq!(map.len(), 1);
        map.set_collectible(&id, true);
        map.increase(&id, 2);
        let state = map.get(&id).cloned();
        assert_eq!(
            state,
            Some(NeglectionState {
                data_id: id.clone(),
                subscriptions: 2,
                collectible: false,
            })
        );
        map.decrease(&id, 2)?;
        assert!(matches!(map.decrease(&id, 1), Err(StoreError::Invariant(_))));
        Ok(())
    }

    #[test]
    fn buffered_changes_coalesce_until_flushed() -> Result<()> {
        let mut tracker = NeglectionTracker::new(TrackingMode::Buffered);
        let id = DataId::from("4");
        tracker.register(&id);
        tracker.increase(&id);
        tracker.increase(&id);
        tracker.decrease(&id)?;
        assert!(tracker.states().is_empty());
        assert!(tracker.is_registered(&id));
        assert_eq!(tracker.subscriptions(&id), 1);

        tracker.flush_buffer();
        assert_eq!(tracker.states().get(&id).map(|s| s.subscriptions), Some(1));
        Ok(())
    }

    #[test]
    fn flushed_decreases_reach_the_state_map() -> Result<()> {
        let mut tracker = NeglectionTracker::new(TrackingMode::Buffered);
        let id = DataId::from("4");
        tracker.increase(&id);
        tracker.increase(&id);
        tracker.flush_buffer();
        tracker.decrease(&id)?;
        tracker.decrease(&id)?;
        assert!(tracker.decrease(&id).is_err());
        assert_eq!(tracker.states().get(&id).map(|s| s.subscriptions), Some(2));

        tracker.flush_buffer();
        assert_eq!(tracker.states().get(&id).map(|s| s.subscriptions), Some(0));
        assert_eq!(tracker.subscriptions(&id), 0);
        Ok(())
    }

    #[test]
    fn buffered_decrease_checks_effective_count() {
        let mut tracker = NeglectionTracker::new(TrackingMode::Buffered);
        let id = DataId::from("4");
        tracker.register(&id);
        assert!(tracker.decrease(&id).is_err());
    }

    #[test]
    fn entering_direct_mode_flushes() {
        let mut tracker = NeglectionTracker::new(TrackingMode::Buffered);
        let id = DataId::from("4");
        tracker.increase(&id);
        tracker.set_mode(TrackingMode::Direct);
        assert_eq!(tracker.mode(), TrackingMode::Direct);
        assert_eq!(tracker.states().get(&id).map(|s| s.subscriptions), Some(1));
        tracker.increase(&id);
        assert_eq!(tracker.states().get(&id).map(|s| s.subscriptions), Some(2));
    }
}
