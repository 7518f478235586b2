//! Metric sinks.
//!
//! Publishers are looked up by name through an explicit
//! [`PublisherRegistry`] owned by the configuration; there is no
//! process-wide registry.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::metric::Metric;

/// A sink for finished metrics.
pub trait Publisher: Send + Sync {
    fn publish(&self, metric: &Metric) -> Result<()>;
}

/// Emits one structured `tracing` event per metric.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

impl Publisher for LogPublisher {
    fn publish(&self, metric: &Metric) -> Result<()> {
        let dimensions = serde_json::to_string(&metric.dimensions)
            .map_err(|e| Error::Publish(format!("{}: {e}", metric.id())))?;
        tracing::info!(
            namespace = %metric.namespace,
            metric_name = %metric.name,
            value = metric.value,
            unit = %metric.unit,
            timestamp = %metric.timestamp.to_rfc3339(),
            dimensions = %dimensions,
            "Published '{}' with value '{}'",
            metric.id(),
            metric.value
        );
        Ok(())
    }
}

/// Writes `Published: <metric>` lines to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutPublisher;

impl Publisher for StdoutPublisher {
    fn publish(&self, metric: &Metric) -> Result<()> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "Published: {metric}")?;
        out.flush()?;
        Ok(())
    }
}

/// Keeps published metrics in memory.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    metrics: Mutex<Vec<Metric>>,
}

impl MemoryPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics published under `id`, oldest first.
    pub fn published(&self, id: &str) -> Vec<Metric> {
        self.metrics
            .lock()
            .iter()
            .filter(|m| m.id() == id)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Metric> {
        self.metrics.lock().clone()
    }

    pub fn clear(&self) {
        self.metrics.lock().clear();
    }
}

impl Publisher for MemoryPublisher {
    fn publish(&self, metric: &Metric) -> Result<()> {
        self.metrics.lock().push(metric.clone());
        Ok(())
    }
}

/// Name → publisher lookup table.
#[derive(Clone)]
pub struct PublisherRegistry {
    publishers: BTreeMap<String, Arc<dyn Publisher>>,
}

impl std::fmt::Debug for PublisherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl Default for PublisherRegistry {
    /// Registry with the built-in `log` and `stdout` publishers.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("log", Arc::new(LogPublisher));
        registry.register("stdout", Arc::new(StdoutPublisher));
        registry
    }
}

impl PublisherRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn empty() -> Self {
        Self {
            publishers: BTreeMap::new(),
        }
    }

    /// Register (or replace) a publisher under `name`.
    pub fn register(&mut self, name: impl Into<String>, publisher: Arc<dyn Publisher>) {
        self.publishers.insert(name.into(), publisher);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Publisher>> {
        self.publishers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Publish(format!("publisher '{name}' is not registered")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.publishers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.publishers.keys().cloned().collect()
    }
}
