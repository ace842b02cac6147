use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::types::Result;

/// Configuration options supplied when creating a [`crate::StoreData`].
#[derive(Clone)]
pub struct StoreOptions {
    /// Garbage-collection configuration.
    pub gc: GcCfg,
    /// Optional metrics collection implementation
    pub metrics: Option<Arc<dyn super::metrics::StoreMetrics>>,
    /// Whether written selections are recorded in the query tracker.
    pub track_queries: bool,
}

impl std::fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOptions")
            .field("gc", &self.gc)
            .field("metrics", &self.metrics.as_ref().map(|_| "<dyn StoreMetrics>"))
            .field("track_queries", &self.track_queries)
            .finish()
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            gc: GcCfg::default(),
            metrics: None,
            track_queries: true,
        }
    }
}

impl StoreOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the garbage-collection configuration.
    pub fn gc(mut self, cfg: GcCfg) -> Self {
        self.gc = cfg;
        self
    }

    /// Sets the metrics collection implementation.
    pub fn metrics(mut self, metrics: Arc<dyn super::metrics::StoreMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Enables or disables query tracking.
    pub fn track_queries(mut self, enabled: bool) -> Self {
        self.track_queries = enabled;
        self
    }

    /// Parses options from a TOML document.
    ///
    /// ```toml
    /// track_queries = true
    ///
    /// [gc]
    /// enabled = true
    /// step_length = 500
    /// buffer_subscriptions = true
    /// ```
    ///
    /// Missing keys keep their defaults; metrics can only be set in code.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(contents)?;
        let defaults = Self::default();
        Ok(Self {
            gc: raw.gc,
            metrics: None,
            track_queries: raw.track_queries.unwrap_or(defaults.track_queries),
        })
    }

    /// Reads options from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    gc: GcCfg,
    track_queries: Option<bool>,
}

/// Configuration for the record garbage collector.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GcCfg {
    /// Whether [`crate::StoreData::initialize_garbage_collector`] installs a collector.
    pub enabled: bool,
    /// Records visited per step when a caller does not pass a step length;
    /// `None` runs each sweep in a single step.
    pub step_length: Option<usize>,
    /// Whether subscription changes outside sweeps are buffered until the next sweep.
    pub buffer_subscriptions: bool,
}

impl Default for GcCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            step_length: None,
            buffer_subscriptions: true,
        }
    }
}
