use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::gc::GarbageCollector;
use crate::query::{MissingDataFinder, PendingNode, RootQuery, Variables};
use crate::storage::{Layer, Record, RecordState, RootCallLookup, StoreLayers, StoreMetrics};
use crate::types::{DataId, Result, StoreError};
use crate::writer::ChangeSet;

use super::{CacheLookup, CacheManager};

/// Lifecycle of one disk read.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReadState {
    /// `read()` has not been called.
    Pending,
    /// Lookups are in flight.
    Loading,
    /// Finished, failed or aborted; every later answer is ignored.
    Completed,
}

/// Outcome callbacks of a disk read; exactly one of them runs, once.
pub struct ReadCallbacks {
    /// Every selection is answerable from memory; receives the records the
    /// read created or updated.
    pub on_success: Box<dyn FnOnce(ChangeSet)>,
    /// Something could not be recovered from the cache.
    pub on_failure: Box<dyn FnOnce()>,
}

impl ReadCallbacks {
    /// Bundles the two callbacks.
    pub fn new(on_success: impl FnOnce(ChangeSet) + 'static, on_failure: impl FnOnce() + 'static) -> Self {
        Self {
            on_success: Box::new(on_success),
            on_failure: Box::new(on_failure),
        }
    }
}

struct Root {
    query: RootQuery,
    storage_key: String,
    arg_keys: Vec<String>,
}

type RootKey = (String, String);

struct ReaderInner {
    layers: Rc<RefCell<StoreLayers>>,
    cache: Rc<dyn CacheManager>,
    gc: Option<GarbageCollector>,
    finder: Box<dyn MissingDataFinder>,
    metrics: Arc<dyn StoreMetrics>,
    queries: Vec<RootQuery>,
    state: Cell<ReadState>,
    dispatching: Cell<bool>,
    pending_roots: RefCell<BTreeMap<RootKey, Vec<Rc<Root>>>>,
    pending_nodes: RefCell<BTreeMap<DataId, Vec<(PendingNode, Rc<Variables>)>>>,
    changes: RefCell<ChangeSet>,
    callbacks: RefCell<Option<ReadCallbacks>>,
}

/// Hydrates the cached layer with everything a set of root queries needs.
///
/// Root calls unknown in memory are resolved through the cache manager, with
/// concurrent lookups of the same root call sharing one request. Every record
/// reached is checked with the missing-data finder; records unknown in memory
/// are fetched, and anything that cannot be recovered fails the whole read.
pub struct DiskCacheReader {
    inner: Rc<ReaderInner>,
}

impl fmt::Debug for DiskCacheReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskCacheReader")
            .field("state", &self.inner.state.get())
            .field("queries", &self.inner.queries.len())
            .finish_non_exhaustive()
    }
}

impl DiskCacheReader {
    /// Prepares a read of `queries`; nothing happens until [`Self::read`].
    pub fn new(
        layers: Rc<RefCell<StoreLayers>>,
        cache: Rc<dyn CacheManager>,
        gc: Option<GarbageCollector>,
        finder: Box<dyn MissingDataFinder>,
        metrics: Arc<dyn StoreMetrics>,
        queries: Vec<RootQuery>,
        callbacks: ReadCallbacks,
    ) -> Self {
        Self {
            inner: Rc::new(ReaderInner {
                layers,
                cache,
                gc,
                finder,
                metrics,
                queries,
                state: Cell::new(ReadState::Pending),
                dispatching: Cell::new(false),
                pending_roots: RefCell::new(BTreeMap::new()),
                pending_nodes: RefCell::new(BTreeMap::new()),
                changes: RefCell::new(ChangeSet::default()),
                callbacks: RefCell::new(Some(callbacks)),
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> ReadState {
        self.inner.state.get()
    }

    /// Starts the read. May complete before returning.
    pub fn read(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.state.get() != ReadState::Pending {
            return Err(StoreError::invariant(format!(
                "read() called while the disk read is {:?}",
                inner.state.get()
            )));
        }
        let mut roots = Vec::with_capacity(inner.queries.len());
        for query in &inner.queries {
            roots.push(Rc::new(Root {
                storage_key: query.root_call_key()?,
                arg_keys: query.identifying_arg_keys()?,
                query: query.clone(),
            }));
        }
        inner.state.set(ReadState::Loading);
        inner.dispatching.set(true);
        debug!(queries = roots.len(), "store.cache.read_started");
        for root in roots {
            for arg_key in &root.arg_keys {
                ReaderInner::visit_root(inner, &root, arg_key);
            }
        }
        inner.dispatching.set(false);
        inner.check_completed();
        Ok(())
    }

    /// Abandons an in-flight read; no callback runs.
    pub fn abort(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.state.get() != ReadState::Loading {
            return Err(StoreError::invariant(format!(
                "abort() called while the disk read is {:?}",
                inner.state.get()
            )));
        }
        inner.state.set(ReadState::Completed);
        inner.callbacks.borrow_mut().take();
        debug!("store.cache.read_aborted");
        Ok(())
    }
}

impl ReaderInner {
    fn loading(&self) -> bool {
        self.state.get() == ReadState::Loading
    }

    fn visit_root(this: &Rc<Self>, root: &Rc<Root>, arg_key: &str) {
        if !this.loading() {
            return;
        }
        let lookup = this
            .layers
            .borrow()
            .view()
            .data_id(&root.storage_key, arg_key);
        match lookup {
            RootCallLookup::Found(id) => {
                let node = PendingNode::for_field(id, &root.query.field);
                Self::visit_node(this, node, Rc::new(root.query.variables.clone()));
            }
            RootCallLookup::Missing => {}
            RootCallLookup::Unknown => {
                let key = (root.storage_key.clone(), arg_key.to_owned());
                {
                    let mut pending = this.pending_roots.borrow_mut();
                    if let Some(waiting) = pending.get_mut(&key) {
                        waiting.push(root.clone());
                        return;
                    }
                    pending.insert(key.clone(), vec![root.clone()]);
                }
                trace!(storage_key = %key.0, identifying_arg = %key.1, "store.cache.read_root_call");
                let reader = this.clone();
                let (storage_key, identifying_arg) = key.clone();
                this.cache.read_root_call(
                    &storage_key,
                    &identifying_arg,
                    Box::new(move |result| Self::root_loaded(&reader, key, result)),
                );
            }
        }
    }

    fn root_loaded(this: &Rc<Self>, key: RootKey, result: Result<CacheLookup<DataId>>) {
        if !this.loading() {
            return;
        }
        let waiting = this.pending_roots.borrow_mut().remove(&key).unwrap_or_default();
        let (storage_key, identifying_arg) = &key;
        match result {
            Err(err) => {
                this.metrics.cache_read(false);
                debug!(error = %err, storage_key = %storage_key, "store.cache.root_call_failed");
                this.fail();
            }
            Ok(CacheLookup::Miss) => {
                this.metrics.cache_read(false);
                this.fail();
            }
            Ok(CacheLookup::Absent) => {
                this.metrics.cache_read(true);
                this.layers
                    .borrow_mut()
                    .layer_mut(Layer::Cached)
                    .put_missing_root_call(storage_key, identifying_arg);
                this.check_completed();
            }
            Ok(CacheLookup::Hit(id)) => {
                this.metrics.cache_read(true);
                this.layers
                    .borrow_mut()
                    .layer_mut(Layer::Cached)
                    .put_data_id(storage_key, identifying_arg, id.clone());
                for root in waiting {
                    let node = PendingNode::for_field(id.clone(), &root.query.field);
                    Self::visit_node(this, node, Rc::new(root.query.variables.clone()));
                }
                this.check_completed();
            }
        }
    }

    fn visit_node(this: &Rc<Self>, node: PendingNode, variables: Rc<Variables>) {
        if !this.loading() {
            return;
        }
        let found = {
            let layers = this.layers.borrow();
            this.finder.find(&layers.view(), &node, &variables)
        };
        if found.missing {
            debug!(data_id = %node.data_id, "store.cache.missing_data");
            this.fail();
            return;
        }
        for pending in found.pending {
            let id = pending.data_id.clone();
            {
                let mut nodes = this.pending_nodes.borrow_mut();
                if let Some(waiting) = nodes.get_mut(&id) {
                    waiting.push((pending, variables.clone()));
                    continue;
                }
                nodes.insert(id.clone(), vec![(pending, variables.clone())]);
            }
            trace!(data_id = %id, "store.cache.read_node");
            let reader = this.clone();
            let requested = id.clone();
            this.cache.read_node(
                &id,
                Box::new(move |result| Self::node_loaded(&reader, requested, result)),
            );
            if !this.loading() {
                return;
            }
        }
    }

    fn node_loaded(this: &Rc<Self>, id: DataId, result: Result<CacheLookup<Record>>) {
        if !this.loading() {
            return;
        }
        let waiting = this.pending_nodes.borrow_mut().remove(&id).unwrap_or_default();
        match result {
            Err(err) => {
                this.metrics.cache_read(false);
                debug!(error = %err, data_id = %id, "store.cache.node_failed");
                this.fail();
                return;
            }
            Ok(CacheLookup::Miss) => {
                this.metrics.cache_read(false);
                this.fail();
                return;
            }
            Ok(CacheLookup::Absent) => {
                this.metrics.cache_read(true);
                this.layers
                    .borrow_mut()
                    .layer_mut(Layer::Cached)
                    .delete_record(&id);
            }
            Ok(CacheLookup::Hit(record)) => {
                this.metrics.cache_read(true);
                if record.id() != &id {
                    debug!(data_id = %id, found = %record.id(), "store.cache.node_mismatch");
                    this.fail();
                    return;
                }
                let previous = {
                    let mut layers = this.layers.borrow_mut();
                    let previous = layers.view().record_state(&id);
                    layers.layer_mut(Layer::Cached).insert_record(record);
                    previous
                };
                match previous {
                    RecordState::Unknown => {
                        this.changes.borrow_mut().created.insert(id.clone());
                    }
                    RecordState::Existent => {
                        this.changes.borrow_mut().updated.insert(id.clone());
                    }
                    RecordState::Nonexistent => {}
                }
                // Registered before any callback can subscribe to it.
                if let Some(gc) = &this.gc {
                    gc.register(&id);
                }
            }
        }
        for (node, variables) in waiting {
            Self::visit_node(this, node, variables);
        }
        this.check_completed();
    }

    fn check_completed(&self) {
        if !self.loading() || self.dispatching.get() {
            return;
        }
        if !self.pending_roots.borrow().is_empty() || !self.pending_nodes.borrow().is_empty() {
            return;
        }
        self.state.set(ReadState::Completed);
        let changes = self.changes.take();
        self.metrics.records_created(changes.created.len());
        self.metrics.records_updated(changes.updated.len());
        debug!(
            created = changes.created.len(),
            updated = changes.updated.len(),
            "store.cache.read_completed"
        );
        let callbacks = self.callbacks.borrow_mut().take();
        if let Some(callbacks) = callbacks {
            (callbacks.on_success)(changes);
        }
    }

    fn fail(&self) {
        if !self.loading() {
            return;
        }
        self.state.set(ReadState::Completed);
        debug!("store.cache.read_failed");
        let callbacks = self.callbacks.borrow_mut().take();
        if let Some(callbacks) = callbacks {
            (callbacks.on_failure)();
        }
    }
}
