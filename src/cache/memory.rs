use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::storage::Record;
use crate::types::{DataId, Result, StoreError};

use super::{CacheCallback, CacheLookup, CacheManager};

type Deferred = Box<dyn FnOnce()>;

/// In-memory cache manager.
///
/// In deferred mode, callbacks are queued until [`MemoryCacheManager::run_pending`]
/// is called, which lets hosts and tests interleave work between a request
/// and its answer.
#[derive(Default)]
pub struct MemoryCacheManager {
    nodes: RefCell<FxHashMap<DataId, Option<Record>>>,
    root_calls: RefCell<FxHashMap<(String, String), Option<DataId>>>,
    deferred: bool,
    pending: RefCell<VecDeque<Deferred>>,
    failure: RefCell<Option<String>>,
    node_reads: Cell<usize>,
    root_call_reads: Cell<usize>,
}

impl MemoryCacheManager {
    /// Answers every read immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues every answer until [`Self::run_pending`].
    pub fn deferred() -> Self {
        Self {
            deferred: true,
            ..Self::default()
        }
    }

    /// Makes every subsequent read fail with `message`; `None` clears it.
    pub fn fail_reads(&self, message: Option<&str>) {
        *self.failure.borrow_mut() = message.map(str::to_owned);
    }

    /// Runs queued answers, including those queued while running; returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.pending.borrow_mut().pop_front();
            let Some(answer) = next else { break };
            answer();
            ran += 1;
        }
        ran
    }

    /// Number of answers waiting to run.
    pub fn pending_len(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Number of `read_node` calls received.
    pub fn node_reads(&self) -> usize {
        self.node_reads.get()
    }

    /// Number of `read_root_call` calls received.
    pub fn root_call_reads(&self) -> usize {
        self.root_call_reads.get()
    }

    /// Number of records (including known-absent ones) held.
    pub fn node_count(&self) -> usize {
        self.nodes.borrow().len()
    }

    fn answer<T: 'static>(&self, result: Result<CacheLookup<T>>, callback: CacheCallback<T>) {
        let result = match self.failure.borrow().as_deref() {
            Some(message) => Err(StoreError::Cache(message.to_owned())),
            None => result,
        };
        if self.deferred {
            self.pending
                .borrow_mut()
                .push_back(Box::new(move || callback(result)));
        } else {
            callback(result);
        }
    }
}

fn lookup<T: Clone>(entry: Option<&Option<T>>) -> CacheLookup<T> {
    match entry {
        None => CacheLookup::Miss,
        Some(None) => CacheLookup::Absent,
        Some(Some(value)) => CacheLookup::Hit(value.clone()),
    }
}

impl CacheManager for MemoryCacheManager {
    fn read_node(&self, id: &DataId, callback: CacheCallback<Record>) {
        self.node_reads.set(self.node_reads.get() + 1);
        let found = lookup(self.nodes.borrow().get(id));
        self.answer(Ok(found), callback);
    }

    fn read_root_call(&self, storage_key: &str, identifying_arg: &str, callback: CacheCallback<DataId>) {
        self.root_call_reads.set(self.root_call_reads.get() + 1);
        let key = (storage_key.to_owned(), identifying_arg.to_owned());
        let found = lookup(self.root_calls.borrow().get(&key));
        self.answer(Ok(found), callback);
    }

    fn write_node(&self, id: &DataId, record: Option<&Record>) -> Result<()> {
        self.nodes.borrow_mut().insert(id.clone(), record.cloned());
        Ok(())
    }

    fn write_root_call(&self, storage_key: &str, identifying_arg: &str, id: Option<&DataId>) -> Result<()> {
        self.root_calls.borrow_mut().insert(
            (storage_key.to_owned(), identifying_arg.to_owned()),
            id.cloned(),
        );
        Ok(())
    }
}
