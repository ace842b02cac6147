//! Normalized record storage.
//!
//! Records live in three layers (cached, committed, queued) that are read
//! through a single [`StoreView`]. Each layer is a flat identity → record map
//! plus a root-call index.

mod layered;
mod metrics;
mod options;
mod record_store;
mod value;

/// Layered record access.
pub use layered::{Layer, StoreLayers, StoreView};

/// Metrics and profiling.
pub use metrics::{default_metrics, CounterMetrics, NoopMetrics, StoreMetrics};

/// Store configuration options.
pub use options::{GcCfg, StoreOptions};

/// Single-layer record storage.
pub use record_store::{RecordState, RecordStore, RootCallLookup};

/// Records and field values.
pub use value::{FieldValue, RangeData, Record, RANGE_FIELD};
