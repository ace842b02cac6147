//! Entry point tying the record layers, the writer, the disk cache and the
//! garbage collector together.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{CacheManager, DiskCacheReader, ReadCallbacks};
use crate::gc::{GarbageCollector, Scheduler};
use crate::query::{Fragment, QueryPath, RootQuery, Selection, Selector, StoreMissingDataFinder, Variables};
use crate::storage::{
    default_metrics, Layer, RootCallLookup, StoreLayers, StoreMetrics, StoreOptions, StoreView,
};
use crate::tracker::{NodeQueryTracker, QueryTracker};
use crate::types::{ClientIdGenerator, DataId, Result, StoreError};
use crate::writer::{ChangeSet, PayloadWriter, UpdateOptions};

/// The normalized client store.
///
/// Server responses are written to the committed layer, optimistic mutation
/// results to the queued layer, and disk reads fill the cached layer. Every
/// read resolves queued, then committed, then cached.
pub struct StoreData {
    layers: Rc<RefCell<StoreLayers>>,
    ids: ClientIdGenerator,
    cache: Option<Rc<dyn CacheManager>>,
    gc: Option<GarbageCollector>,
    tracker: Rc<NodeQueryTracker>,
    options: StoreOptions,
    metrics: Arc<dyn StoreMetrics>,
}

impl fmt::Debug for StoreData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreData")
            .field("has_cache", &self.cache.is_some())
            .field("gc", &self.gc)
            .finish_non_exhaustive()
    }
}

impl Default for StoreData {
    fn default() -> Self {
        Self::new(StoreOptions::default())
    }
}

impl StoreData {
    /// Creates an empty store.
    pub fn new(options: StoreOptions) -> Self {
        let metrics = options.metrics.clone().unwrap_or_else(default_metrics);
        Self {
            layers: Rc::new(RefCell::new(StoreLayers::new())),
            ids: ClientIdGenerator::new(),
            cache: None,
            gc: None,
            tracker: Rc::new(NodeQueryTracker::new()),
            options,
            metrics,
        }
    }

    /// Options the store was created with.
    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Enables garbage collection, stepping sweeps through `scheduler`.
    ///
    /// Meant to be called before any data is written; records already present
    /// are registered, with a warning. Does nothing when collection is
    /// disabled in the options.
    pub fn initialize_garbage_collector(&mut self, scheduler: Option<Scheduler>) -> Result<()> {
        if self.gc.is_some() {
            return Err(StoreError::invariant("the garbage collector is already initialized"));
        }
        if !self.options.gc.enabled {
            info!("store.gc.disabled");
            return Ok(());
        }
        let tracker = self
            .options
            .track_queries
            .then(|| self.tracker.clone() as Rc<dyn QueryTracker>);
        let gc = GarbageCollector::new(
            self.layers.clone(),
            &self.options.gc,
            scheduler,
            tracker,
            self.metrics.clone(),
        );
        let existing = {
            let layers = self.layers.borrow();
            layers.has_data().then(|| layers.record_ids())
        };
        if let Some(existing) = existing {
            warn!(
                records = existing.len(),
                "store.gc.late_init: garbage collector initialized after data was written"
            );
            for id in &existing {
                gc.register(id);
            }
        }
        self.gc = Some(gc);
        Ok(())
    }

    /// The garbage collector, once initialized.
    pub fn garbage_collector(&self) -> Option<&GarbageCollector> {
        self.gc.as_ref()
    }

    /// Plugs in a persistent cache; committed writes are mirrored into it.
    pub fn inject_cache_manager(&mut self, cache: Rc<dyn CacheManager>) {
        self.cache = Some(cache);
    }

    /// Selections written so far per record.
    pub fn query_tracker(&self) -> &NodeQueryTracker {
        &self.tracker
    }

    /// Shared handle to the record layers.
    pub fn layers(&self) -> Rc<RefCell<StoreLayers>> {
        self.layers.clone()
    }

    /// Runs `f` against server-confirmed data (committed over cached).
    pub fn record_store<R>(&self, f: impl FnOnce(&StoreView<'_>) -> R) -> R {
        f(&self.layers.borrow().committed_view())
    }

    /// Runs `f` against the optimistic view (queued over committed over cached).
    pub fn queued_store<R>(&self, f: impl FnOnce(&StoreView<'_>) -> R) -> R {
        f(&self.layers.borrow().view())
    }

    /// Reads `selector` from the optimistic view.
    pub fn read(&self, selector: &Selector) -> Result<Option<Value>> {
        selector.read(&self.layers.borrow().view())
    }

    /// Writes a server response to `query` into the committed layer.
    pub fn handle_query_payload(&self, query: &RootQuery, response: &Value) -> Result<ChangeSet> {
        let changes = {
            let mut layers = self.layers.borrow_mut();
            let mut writer = PayloadWriter::new(&mut layers, Layer::Committed, &self.ids)?;
            if self.options.track_queries {
                writer = writer.with_tracker(self.tracker.as_ref());
            }
            writer.write_query_payload(query, response)?;
            writer.into_changes()
        };
        self.committed(&changes);
        self.mirror_root_calls(query)?;
        Ok(changes)
    }

    /// Writes a mutation payload, to the queued layer when optimistic.
    pub fn handle_update_payload(
        &self,
        mutation: &RootQuery,
        payload: &Value,
        options: &UpdateOptions,
    ) -> Result<ChangeSet> {
        let target = if options.is_optimistic {
            Layer::Queued
        } else {
            Layer::Committed
        };
        let changes = {
            let mut layers = self.layers.borrow_mut();
            let mut writer = PayloadWriter::new(&mut layers, target, &self.ids)?;
            if options.is_optimistic {
                writer = writer.with_mutation_id(options.client_mutation_id.as_deref());
            }
            writer.write_update_payload(mutation, payload, &options.configs)?;
            writer.into_changes()
        };
        debug!(
            mutation = %mutation.name,
            optimistic = options.is_optimistic,
            created = changes.created.len(),
            updated = changes.updated.len(),
            "store.update_payload"
        );
        if options.is_optimistic {
            self.register_created(&changes);
            self.report(&changes);
        } else {
            self.committed(&changes);
        }
        Ok(changes)
    }

    /// Writes `payload` for `fragment` directly onto record `id`.
    pub fn handle_fragment_payload(
        &self,
        id: &DataId,
        fragment: &Rc<Fragment>,
        variables: &Variables,
        payload: &Value,
    ) -> Result<ChangeSet> {
        let selections = [Selection::Fragment(fragment.clone())];
        let changes = {
            let mut layers = self.layers.borrow_mut();
            let mut writer = PayloadWriter::new(&mut layers, Layer::Committed, &self.ids)?;
            if self.options.track_queries {
                writer = writer.with_tracker(self.tracker.as_ref());
            }
            writer.write_fragment(id, &selections, variables, payload, None)?;
            writer.into_changes()
        };
        self.committed(&changes);
        Ok(changes)
    }

    /// Builds a fetchable query for `fragment` on record `id`.
    ///
    /// Server identities refetch through `node(id:)`; client identities need
    /// the path recorded when they were written.
    pub fn build_fragment_query_for_data_id(&self, fragment: &Rc<Fragment>, id: &DataId) -> Result<RootQuery> {
        let selections = vec![Selection::Fragment(fragment.clone())];
        let path = self.layers.borrow().view().path(id).cloned();
        match path {
            Some(path) if id.is_client() => Ok(path.query_for(selections)),
            _ if !id.is_client() => Ok(QueryPath::node(id, &fragment.name).query_for(selections)),
            _ => Err(StoreError::NotFound(format!("no query path is known for `{id}`"))),
        }
    }

    /// Hydrates the cached layer with what `queries` need from the persistent cache.
    ///
    /// The returned reader has already started; keep it to abort the read.
    pub fn read_from_disk(&self, queries: Vec<RootQuery>, callbacks: ReadCallbacks) -> Result<DiskCacheReader> {
        let cache = self
            .cache
            .clone()
            .ok_or_else(|| StoreError::invariant("read_from_disk requires a cache manager"))?;
        let reader = DiskCacheReader::new(
            self.layers.clone(),
            cache,
            self.gc.clone(),
            Box::new(StoreMissingDataFinder),
            self.metrics.clone(),
            queries,
            callbacks,
        );
        reader.read()?;
        Ok(reader)
    }

    /// Discards every optimistic write.
    pub fn clear_queued_data(&self) {
        let mut layers = self.layers.borrow_mut();
        let queued = layers.layer_mut(Layer::Queued);
        debug!(records = queued.len(), "store.queued_cleared");
        queued.clear();
    }

    /// Client mutation ids with pending optimistic writes on `id`.
    pub fn mutation_ids_for(&self, id: &DataId) -> Vec<String> {
        self.layers
            .borrow()
            .layer(Layer::Queued)
            .mutation_ids(id)
            .to_vec()
    }

    fn register_created(&self, changes: &ChangeSet) {
        if let Some(gc) = &self.gc {
            for id in &changes.created {
                gc.register(id);
            }
        }
    }

    fn report(&self, changes: &ChangeSet) {
        self.metrics.records_created(changes.created.len());
        self.metrics.records_updated(changes.updated.len());
    }

    fn committed(&self, changes: &ChangeSet) {
        self.register_created(changes);
        self.report(changes);
        let Some(cache) = &self.cache else {
            return;
        };
        let layers = self.layers.borrow();
        let committed = layers.layer(Layer::Committed);
        for id in changes.ids() {
            let Some(record) = committed.entry(id) else {
                continue;
            };
            // The cache mirrors committed data; the store stays authoritative.
            if let Err(err) = cache.write_node(id, record) {
                warn!(error = %err, data_id = %id, "store.cache.write_failed");
            }
        }
    }

    fn mirror_root_calls(&self, query: &RootQuery) -> Result<()> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };
        let root_key = query.root_call_key()?;
        let layers = self.layers.borrow();
        let committed = layers.layer(Layer::Committed);
        for arg_key in query.identifying_arg_keys()? {
            let written = match committed.data_id(&root_key, &arg_key) {
                RootCallLookup::Found(id) => cache.write_root_call(&root_key, &arg_key, Some(&id)),
                RootCallLookup::Missing => cache.write_root_call(&root_key, &arg_key, None),
                RootCallLookup::Unknown => continue,
            };
            if let Err(err) = written {
                warn!(error = %err, root_call = %root_key, arg = %arg_key, "store.cache.write_failed");
            }
        }
        Ok(())
    }
}
