//! Incremental record garbage collection.
//!
//! Records are reference counted through their neglection state: readers
//! increase and decrease a per-record subscription count, and sweeps remove
//! records whose count is zero. A sweep is split into steps of at most
//! `step_length` visits; a [`Scheduler`] decides when each step runs, so the
//! host can yield between steps.
//!
//! Every sweep start bumps the collector's cycle. Only a step belonging to the
//! newest cycle may remove records; steps of older sweeps still flag records
//! as collectible but leave them in place. While a [`GcHold`] is outstanding,
//! steps flag and defer instead of removing; releasing the last hold schedules
//! a drain step that removes the deferred records that are still unsubscribed.

mod neglection;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use rustc_hash::FxHashSet;
use tracing::{debug, trace, warn};

use crate::storage::{GcCfg, Layer, RecordState, StoreLayers, StoreMetrics};
use crate::tracker::QueryTracker;
use crate::types::{DataId, Result, StoreError};

pub use neglection::{NeglectionState, NeglectionStateMap, NeglectionTracker, TrackingMode};

/// Runs collection steps on the host's terms.
///
/// The collector calls the scheduler once per sweep; the scheduler must call
/// [`GcStep::run`] until it returns `false`, now or later.
pub type Scheduler = Box<dyn FnMut(GcStep) -> Result<()>>;

/// Scheduler that runs every step to completion immediately.
pub fn immediate_scheduler() -> Scheduler {
    Box::new(|step: GcStep| {
        while step.run()? {}
        Ok(())
    })
}

struct GcInner {
    layers: Rc<RefCell<StoreLayers>>,
    states: RefCell<NeglectionTracker>,
    scheduler: RefCell<Option<Scheduler>>,
    tracker: Option<Rc<dyn QueryTracker>>,
    metrics: Arc<dyn StoreMetrics>,
    cycle: Cell<u64>,
    active_sweeps: Cell<usize>,
    holds: Cell<usize>,
    deferred: RefCell<Vec<(DataId, u64)>>,
    buffer_subscriptions: bool,
    default_step_length: Option<usize>,
}

/// Reclaims records nobody is subscribed to.
///
/// Cloning yields another handle to the same collector.
#[derive(Clone)]
pub struct GarbageCollector {
    inner: Rc<GcInner>,
}

impl fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("cycle", &self.inner.cycle.get())
            .field("active_sweeps", &self.inner.active_sweeps.get())
            .field("holds", &self.inner.holds.get())
            .finish_non_exhaustive()
    }
}

impl GarbageCollector {
    /// Creates a collector over `layers`; `scheduler` defaults to
    /// [`immediate_scheduler`].
    pub fn new(
        layers: Rc<RefCell<StoreLayers>>,
        cfg: &GcCfg,
        scheduler: Option<Scheduler>,
        tracker: Option<Rc<dyn QueryTracker>>,
        metrics: Arc<dyn StoreMetrics>,
    ) -> Self {
        let mode = if cfg.buffer_subscriptions {
            TrackingMode::Buffered
        } else {
            TrackingMode::Direct
        };
        Self {
            inner: Rc::new(GcInner {
                layers,
                states: RefCell::new(NeglectionTracker::new(mode)),
                scheduler: RefCell::new(Some(scheduler.unwrap_or_else(immediate_scheduler))),
                tracker,
                metrics,
                cycle: Cell::new(0),
                active_sweeps: Cell::new(0),
                holds: Cell::new(0),
                deferred: RefCell::new(Vec::new()),
                buffer_subscriptions: cfg.buffer_subscriptions,
                default_step_length: cfg.step_length,
            }),
        }
    }

    /// Starts tracking `id`; no-op when already tracked.
    pub fn register(&self, id: &DataId) {
        self.inner.states.borrow_mut().register(id);
    }

    /// Notes a new subscription to `id`.
    pub fn increase_subscriptions_for(&self, id: &DataId) {
        self.inner.states.borrow_mut().increase(id);
    }

    /// Notes that a subscription to `id` ended.
    pub fn decrease_subscriptions_for(&self, id: &DataId) -> Result<()> {
        self.inner.states.borrow_mut().decrease(id)
    }

    /// Effective subscription count of `id`.
    pub fn subscriptions(&self, id: &DataId) -> u32 {
        self.inner.states.borrow().subscriptions(id)
    }

    /// Whether `id` is tracked.
    pub fn is_registered(&self, id: &DataId) -> bool {
        self.inner.states.borrow().is_registered(id)
    }

    /// Collectible flag of `id` as of the last flush; `None` when untracked.
    pub fn is_collectible(&self, id: &DataId) -> Option<bool> {
        self.inner
            .states
            .borrow()
            .states()
            .get(id)
            .map(|state| state.collectible)
    }

    /// Current tracking mode.
    pub fn tracking_mode(&self) -> TrackingMode {
        self.inner.states.borrow().mode()
    }

    /// Number of sweeps started so far.
    pub fn cycle(&self) -> u64 {
        self.inner.cycle.get()
    }

    /// Number of outstanding holds.
    pub fn active_holds(&self) -> usize {
        self.inner.holds.get()
    }

    /// Sweeps every tracked record.
    pub fn schedule_collection(&self, step_length: Option<usize>) -> Result<()> {
        let cycle = self.inner.begin_sweep(true);
        let queue: VecDeque<DataId> = self.inner.states.borrow().states().ids().cloned().collect();
        debug!(cycle, records = queue.len(), "store.gc.sweep_scheduled");
        self.inner
            .schedule(self.step(cycle, step_length, SweepKind::All { queue }))
    }

    /// Sweeps the records reachable from `id`, stopping at subscribed records.
    pub fn collect_from_node(&self, id: &DataId, step_length: Option<usize>) -> Result<()> {
        let cycle = self.inner.begin_sweep(true);
        debug!(cycle, data_id = %id, "store.gc.sweep_from_node_scheduled");
        let kind = SweepKind::FromNode {
            queue: VecDeque::from([id.clone()]),
            visited: FxHashSet::default(),
        };
        self.inner.schedule(self.step(cycle, step_length, kind))
    }

    /// Pauses record removal until the returned hold is released.
    pub fn acquire_hold(&self) -> GcHold {
        self.inner.holds.set(self.inner.holds.get() + 1);
        trace!(holds = self.inner.holds.get(), "store.gc.hold_acquired");
        GcHold {
            gc: self.inner.clone(),
            released: Cell::new(false),
        }
    }

    fn step(&self, cycle: u64, step_length: Option<usize>, kind: SweepKind) -> GcStep {
        GcStep {
            gc: self.inner.clone(),
            state: Rc::new(RefCell::new(StepState {
                cycle,
                step_length: step_length.or(self.inner.default_step_length),
                kind,
                finished: false,
            })),
        }
    }
}

impl GcInner {
    fn begin_sweep(&self, new_cycle: bool) -> u64 {
        if new_cycle {
            self.cycle.set(self.cycle.get() + 1);
        }
        self.active_sweeps.set(self.active_sweeps.get() + 1);
        self.states.borrow_mut().set_mode(TrackingMode::Direct);
        self.cycle.get()
    }

    fn end_sweep(&self) {
        let active = self.active_sweeps.get().saturating_sub(1);
        self.active_sweeps.set(active);
        if active == 0 && self.buffer_subscriptions {
            self.states.borrow_mut().set_mode(TrackingMode::Buffered);
        }
    }

    fn schedule(self: &Rc<Self>, step: GcStep) -> Result<()> {
        let taken = self.scheduler.borrow_mut().take();
        match taken {
            Some(mut scheduler) => {
                let result = scheduler(step);
                let mut slot = self.scheduler.borrow_mut();
                if slot.is_none() {
                    *slot = Some(scheduler);
                }
                result
            }
            // Scheduled from inside the scheduler itself.
            None => {
                while step.run()? {}
                Ok(())
            }
        }
    }

    fn release_hold(self: &Rc<Self>) -> Result<()> {
        let holds = self.holds.get().saturating_sub(1);
        self.holds.set(holds);
        trace!(holds, "store.gc.hold_released");
        if holds > 0 {
            return Ok(());
        }
        let queue: VecDeque<(DataId, u64)> = self.deferred.borrow_mut().drain(..).collect();
        if queue.is_empty() {
            return Ok(());
        }
        let cycle = self.begin_sweep(false);
        debug!(cycle, records = queue.len(), "store.gc.drain_scheduled");
        let step = GcStep {
            gc: self.clone(),
            state: Rc::new(RefCell::new(StepState {
                cycle,
                step_length: self.default_step_length,
                kind: SweepKind::Drain { queue },
                finished: false,
            })),
        };
        self.schedule(step)
    }

    /// Flags `id`, then removes or defers it when this step may free memory.
    fn visit(
        &self,
        layers: &mut StoreLayers,
        id: &DataId,
        current: bool,
        cycle: u64,
    ) -> Result<()> {
        let subscriptions = {
            let mut states = self.states.borrow_mut();
            if !states.is_registered(id) {
                return Ok(());
            }
            let subscriptions = states.subscriptions(id);
            states.set_collectible(id, subscriptions == 0);
            subscriptions
        };
        if subscriptions > 0 || !current {
            return Ok(());
        }
        if self.holds.get() > 0 {
            self.deferred.borrow_mut().push((id.clone(), cycle));
            return Ok(());
        }
        self.collect(layers, id);
        Ok(())
    }

    /// Removes `id` plus its unsubscribed client-only descendants from every layer.
    fn collect(&self, layers: &mut StoreLayers, id: &DataId) {
        let mut stack = vec![id.clone()];
        while let Some(id) = stack.pop() {
            let children: Vec<DataId> = layers
                .linked_ids(&id)
                .into_iter()
                .filter(DataId::is_client)
                .collect();
            layers.remove_everywhere(&id);
            self.states.borrow_mut().remove(&id);
            if let Some(tracker) = &self.tracker {
                tracker.untrack_nodes_for_id(&id);
            }
            self.metrics.record_collected();
            trace!(data_id = %id, "store.gc.collected");
            let states = self.states.borrow();
            stack.extend(
                children
                    .into_iter()
                    .filter(|child| is_stored(layers, child) && states.subscriptions(child) == 0),
            );
        }
    }
}

fn is_stored(layers: &StoreLayers, id: &DataId) -> bool {
    [Layer::Queued, Layer::Committed, Layer::Cached]
        .into_iter()
        .any(|layer| layers.layer(layer).record_state(id) != RecordState::Unknown)
}

enum SweepKind {
    All {
        queue: VecDeque<DataId>,
    },
    FromNode {
        queue: VecDeque<DataId>,
        visited: FxHashSet<DataId>,
    },
    Drain {
        queue: VecDeque<(DataId, u64)>,
    },
}

impl SweepKind {
    fn is_empty(&self) -> bool {
        match self {
            SweepKind::All { queue } | SweepKind::FromNode { queue, .. } => queue.is_empty(),
            SweepKind::Drain { queue } => queue.is_empty(),
        }
    }
}

struct StepState {
    cycle: u64,
    step_length: Option<usize>,
    kind: SweepKind,
    finished: bool,
}

/// A resumable unit of collection work handed to the [`Scheduler`].
#[derive(Clone)]
pub struct GcStep {
    gc: Rc<GcInner>,
    state: Rc<RefCell<StepState>>,
}

impl fmt::Debug for GcStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("GcStep")
            .field("cycle", &state.cycle)
            .field("finished", &state.finished)
            .finish_non_exhaustive()
    }
}

impl GcStep {
    /// Cycle the step belongs to.
    pub fn cycle(&self) -> u64 {
        self.state.borrow().cycle
    }

    /// Whether the sweep has run to completion.
    pub fn is_finished(&self) -> bool {
        self.state.borrow().finished
    }

    /// Visits up to `step_length` records; returns whether work remains.
    pub fn run(&self) -> Result<bool> {
        let mut state = self.state.borrow_mut();
        if state.finished {
            return Ok(false);
        }
        let gc = &self.gc;
        let mut layers = gc.layers.try_borrow_mut().map_err(|_| {
            StoreError::invariant("records are borrowed while a collection step runs")
        })?;
        let limit = state.step_length.unwrap_or(usize::MAX).max(1);
        let cycle = state.cycle;
        let current = cycle == gc.cycle.get();
        let mut visited = 0;
        while visited < limit {
            match &mut state.kind {
                SweepKind::All { queue } => {
                    let Some(id) = queue.pop_front() else { break };
                    gc.visit(&mut layers, &id, current, cycle)?;
                }
                SweepKind::FromNode { queue, visited: seen } => {
                    let Some(id) = queue.pop_front() else { break };
                    if !seen.insert(id.clone()) {
                        continue;
                    }
                    let unsubscribed = {
                        let states = gc.states.borrow();
                        states.is_registered(&id) && states.subscriptions(&id) == 0
                    };
                    if unsubscribed {
                        queue.extend(
                            layers
                                .linked_ids(&id)
                                .into_iter()
                                .filter(|linked| !seen.contains(linked)),
                        );
                    }
                    gc.visit(&mut layers, &id, current, cycle)?;
                }
                SweepKind::Drain { queue } => {
                    let Some((id, flagged_in)) = queue.pop_front() else { break };
                    if gc.holds.get() > 0 {
                        gc.deferred.borrow_mut().push((id, flagged_in));
                        continue;
                    }
                    let collectible = {
                        let states = gc.states.borrow();
                        states.is_registered(&id)
                            && states.subscriptions(&id) == 0
                            && states.states().get(&id).is_some_and(|s| s.collectible)
                    };
                    if flagged_in == gc.cycle.get() && collectible {
                        gc.collect(&mut layers, &id);
                    }
                }
            }
            visited += 1;
        }
        let more = !state.kind.is_empty();
        gc.metrics.gc_step(visited);
        debug!(cycle, visited, more, current, "store.gc.step");
        if !more {
            state.finished = true;
            drop(layers);
            gc.end_sweep();
        }
        Ok(more)
    }
}

/// Pauses record removal while held.
///
/// Release explicitly with [`GcHold::release`]; a hold dropped without being
/// released is released on drop.
pub struct GcHold {
    gc: Rc<GcInner>,
    released: Cell<bool>,
}

impl fmt::Debug for GcHold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcHold")
            .field("released", &self.released.get())
            .finish()
    }
}

impl GcHold {
    /// Releases the hold; errors when called twice.
    pub fn release(&self) -> Result<()> {
        if self.released.replace(true) {
            return Err(StoreError::invariant("GC hold released twice"));
        }
        self.gc.release_hold()
    }
}

impl Drop for GcHold {
    fn drop(&mut self) {
        if !self.released.replace(true) {
            if let Err(err) = self.gc.release_hold() {
                warn!(error = %err, "store.gc.hold_release_failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{default_metrics, FieldValue};
    use crate::tracker::NodeQueryTracker;

    fn gc_over(layers: &Rc<RefCell<StoreLayers>>, scheduler: Option<Scheduler>) -> GarbageCollector {
        GarbageCollector::new(layers.clone(), &GcCfg::default(), scheduler, None, default_metrics())
    }

    fn manual_scheduler() -> (Rc<RefCell<Vec<GcStep>>>, Scheduler) {
        let steps = Rc::new(RefCell::new(Vec::new()));
        let sink = steps.clone();
        (
            steps,
            Box::new(move |step: GcStep| {
                sink.borrow_mut().push(step);
                Ok(())
            }),
        )
    }

    fn put(layers: &Rc<RefCell<StoreLayers>>, id: &str, link: Option<&str>) -> Result<()> {
        let mut layers = layers.borrow_mut();
        let store = layers.layer_mut(Layer::Committed);
        let id = DataId::from(id);
        store.put_record(&id, None, None);
        if let Some(link) = link {
            store.put_field(&id, "field", FieldValue::Link(DataId::from(link)))?;
        }
        Ok(())
    }

    fn present(layers: &Rc<RefCell<StoreLayers>>, id: &str) -> bool {
        layers.borrow().view().record_state(&DataId::from(id)) == RecordState::Existent
    }

    #[test]
    fn global_sweep_removes_unsubscribed_records() -> Result<()> {
        let layers = Rc::new(RefCell::new(StoreLayers::new()));
        put(&layers, "a", None)?;
        put(&layers, "b", None)?;
        let gc = gc_over(&layers, None);
        gc.register(&DataId::from("a"));
        gc.register(&DataId::from("b"));
        gc.increase_subscriptions_for(&DataId::from("a"));

        gc.schedule_collection(Some(1))?;
        assert!(present(&layers, "a"));
        assert!(!present(&layers, "b"));
        assert!(!gc.is_registered(&DataId::from("b")));
        assert_eq!(gc.is_collectible(&DataId::from("a")), Some(false));
        assert_eq!(gc.tracking_mode(), TrackingMode::Buffered);
        Ok(())
    }

    #[test]
    fn removal_cascades_to_client_children_and_untracks() -> Result<()> {
        let layers = Rc::new(RefCell::new(StoreLayers::new()));
        put(&layers, "4", Some("client:1"))?;
        put(&layers, "client:1", Some("client:2"))?;
        put(&layers, "client:2", Some("5"))?;
        put(&layers, "5", None)?;
        let tracker = Rc::new(NodeQueryTracker::new());
        tracker.track_node_for_id(&[crate::query::Field::scalar("x").into()], &DataId::from("client:1"));
        let gc = GarbageCollector::new(
            layers.clone(),
            &GcCfg::default(),
            None,
            Some(tracker.clone() as Rc<dyn QueryTracker>),
            default_metrics(),
        );
        gc.register(&DataId::from("4"));
        gc.register(&DataId::from("5"));
        gc.increase_subscriptions_for(&DataId::from("5"));

        gc.schedule_collection(None)?;
        assert!(!present(&layers, "4"));
        assert!(!present(&layers, "client:1"));
        assert!(!present(&layers, "client:2"));
        assert!(present(&layers, "5"));
        assert!(!tracker.is_tracked(&DataId::from("client:1")));
        Ok(())
    }

    #[test]
    fn stale_sweeps_only_flag() -> Result<()> {
        let layers = Rc::new(RefCell::new(StoreLayers::new()));
        put(&layers, "a", None)?;
        let (steps, scheduler) = manual_scheduler();
        let gc = gc_over(&layers, Some(scheduler));
        gc.register(&DataId::from("a"));

        gc.schedule_collection(None)?;
        gc.schedule_collection(None)?;
        let (first, second) = {
            let steps = steps.borrow();
            (steps[0].clone(), steps[1].clone())
        };
        assert!(!first.run()?);
        assert!(present(&layers, "a"));
        assert_eq!(gc.is_collectible(&DataId::from("a")), Some(true));
        assert_eq!(gc.tracking_mode(), TrackingMode::Direct);

        assert!(!second.run()?);
        assert!(!present(&layers, "a"));
        assert_eq!(gc.tracking_mode(), TrackingMode::Buffered);
        Ok(())
    }

    #[test]
    fn holds_defer_removal_until_released() -> Result<()> {
        let layers = Rc::new(RefCell::new(StoreLayers::new()));
        put(&layers, "a", None)?;
        let (steps, scheduler) = manual_scheduler();
        let gc = gc_over(&layers, Some(scheduler));
        gc.register(&DataId::from("a"));

        let hold = gc.acquire_hold();
        gc.collect_from_node(&DataId::from("a"), None)?;
        let sweep = steps.borrow()[0].clone();
        assert!(!sweep.run()?);
        assert!(present(&layers, "a"));

        hold.release()?;
        assert!(matches!(hold.release(), Err(StoreError::Invariant(_))));
        let drain = steps.borrow()[1].clone();
        assert!(present(&layers, "a"));
        assert!(!drain.run()?);
        assert!(!present(&layers, "a"));
        Ok(())
    }

    #[test]
    fn drain_skips_records_subscribed_since_flagging() -> Result<()> {
        let layers = Rc::new(RefCell::new(StoreLayers::new()));
        put(&layers, "a", None)?;
        let gc = gc_over(&layers, None);
        gc.register(&DataId::from("a"));
        {
            let _hold = gc.acquire_hold();
            gc.schedule_collection(None)?;
            gc.increase_subscriptions_for(&DataId::from("a"));
        }
        assert_eq!(gc.active_holds(), 0);
        assert!(present(&layers, "a"));
        Ok(())
    }

    #[test]
    fn step_fails_while_records_are_borrowed() -> Result<()> {
        let layers = Rc::new(RefCell::new(StoreLayers::new()));
        put(&layers, "a", None)?;
        let (steps, scheduler) = manual_scheduler();
        let gc = gc_over(&layers, Some(scheduler));
        gc.register(&DataId::from("a"));
        gc.schedule_collection(None)?;
        let step = steps.borrow()[0].clone();
        let _guard = layers.borrow();
        assert!(matches!(step.run(), Err(StoreError::Invariant(_))));
        Ok(())
    }
}
