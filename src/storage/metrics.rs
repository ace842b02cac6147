use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for counting record-store activity.
///
/// Implementations receive one call per created, updated or collected record,
/// one per persistent-cache lookup and one per garbage-collection step. The
/// numbers are useful for sizing GC step lengths and judging cache hit rates.
pub trait StoreMetrics: Send + Sync {
    /// Records that a payload or cache read created `count` records.
    fn records_created(&self, count: usize);

    /// Records that a payload or cache read updated `count` records.
    fn records_updated(&self, count: usize);

    /// Records that the garbage collector removed a record.
    fn record_collected(&self);

    /// Records a persistent-cache lookup.
    ///
    /// # Parameters
    /// * `hit` - Whether the cache returned data (`true`) or missed (`false`).
    fn cache_read(&self, hit: bool);

    /// Records one garbage-collection step that visited `visited` records.
    fn gc_step(&self, visited: usize);
}

/// A no-op implementation of [`StoreMetrics`] that discards everything.
#[derive(Default)]
pub struct NoopMetrics;

impl StoreMetrics for NoopMetrics {
    fn records_created(&self, _count: usize) {}
    fn records_updated(&self, _count: usize) {}
    fn record_collected(&self) {}
    fn cache_read(&self, _hit: bool) {}
    fn gc_step(&self, _visited: usize) {}
}

/// Counter-based implementation of [`StoreMetrics`].
#[derive(Default)]
pub struct CounterMetrics {
    /// Number of records created.
    pub records_created: AtomicU64,

    /// Number of records updated.
    pub records_updated: AtomicU64,

    /// Number of records removed by the garbage collector.
    pub records_collected: AtomicU64,

    /// Cache lookups that returned data.
    pub cache_hits: AtomicU64,

    /// Cache lookups that missed or failed.
    pub cache_misses: AtomicU64,

    /// Garbage-collection steps run.
    pub gc_steps: AtomicU64,

    /// Records visited across all garbage-collection steps.
    pub gc_visited: AtomicU64,
}

impl StoreMetrics for CounterMetrics {
    fn records_created(&self, count: usize) {
        self.records_created
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    fn records_updated(&self, count: usize) {
        self.records_updated
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    fn record_collected(&self) {
        self.records_collected.fetch_add(1, Ordering::Relaxed);
    }

    fn cache_read(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn gc_step(&self, visited: usize) {
        self.gc_steps.fetch_add(1, Ordering::Relaxed);
        self.gc_visited.fetch_add(visited as u64, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation wrapped in an [`Arc`].
///
/// The default implementation is [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn StoreMetrics> {
    Arc::new(NoopMetrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = CounterMetrics::default();
        metrics.records_created(3);
        metrics.cache_read(true);
        metrics.cache_read(false);
        metrics.cache_read(false);
        metrics.gc_step(7);
        metrics.gc_step(2);
        assert_eq!(metrics.records_created.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.cache_hits.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.cache_misses.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.gc_steps.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.gc_visited.load(Ordering::Relaxed), 9);
    }
}
