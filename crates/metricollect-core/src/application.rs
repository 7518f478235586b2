//! Applications: named sets of metric definitions wired to publishers.
//!
//! The runner only needs [`Application::metric_ids`] and
//! [`Application::publish`]; [`MetricApplication`] is the concrete
//! implementation built from configuration.

use std::sync::Arc;

use crate::error::{Error, MetricError, Result};
use crate::metric::{Metric, MetricDefinition};
use crate::publisher::Publisher;

/// What the runner schedules.
pub trait Application: Send + Sync {
    fn name(&self) -> &str;

    /// Ids eligible under `roles`, in definition order.
    fn metric_ids(&self, roles: &[String]) -> Vec<String>;

    /// Evaluate `id` and hand the result to every sink.
    fn publish(&self, id: &str) -> Result<()>;
}

/// Application backed by [`MetricDefinition`] records.
pub struct MetricApplication {
    name: String,
    prefix: Option<String>,
    definitions: Vec<MetricDefinition>,
    publishers: Vec<Arc<dyn Publisher>>,
}

impl std::fmt::Debug for MetricApplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricApplication")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .field("definitions", &self.definitions.len())
            .field("publishers", &self.publishers.len())
            .finish()
    }
}

impl MetricApplication {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: None,
            definitions: Vec::new(),
            publishers: Vec::new(),
        }
    }

    /// Prefix every metric namespace added after this call.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.prefix = (!prefix.is_empty()).then_some(prefix);
        self
    }

    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    pub fn add_publisher(&mut self, publisher: Arc<dyn Publisher>) {
        self.publishers.push(publisher);
    }

    /// Add a definition. Ids must be unique within the application.
    pub fn define(&mut self, definition: MetricDefinition) -> Result<&mut Self> {
        let definition = match &self.prefix {
            Some(prefix) => definition.prefixed(prefix),
            None => definition,
        };
        let id = definition.id();
        if self.definitions.iter().any(|d| d.id() == id) {
            return Err(MetricError::Duplicate(id).into());
        }
        self.definitions.push(definition);
        Ok(self)
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn definitions(&self) -> &[MetricDefinition] {
        &self.definitions
    }

    pub fn definition(&self, id: &str) -> Option<&MetricDefinition> {
        self.definitions.iter().find(|d| d.id() == id)
    }

    /// Evaluate without publishing.
    pub fn evaluate(&self, id: &str) -> Result<Metric> {
        let definition = self
            .definition(id)
            .ok_or_else(|| MetricError::NotFound(id.to_string()))?;
        Ok(definition.evaluate()?)
    }

    /// Publish every defined metric; returns how many succeeded.
    pub fn publish_all(&self) -> usize {
        self.definitions
            .iter()
            .map(MetricDefinition::id)
            .filter(|id| match self.publish(id) {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(app = %self.name, metric_id = %id, error = %err, "Publish failed");
                    false
                }
            })
            .count()
    }
}

impl Application for MetricApplication {
    fn name(&self) -> &str {
        &self.name
    }

    fn metric_ids(&self, roles: &[String]) -> Vec<String> {
        self.definitions
            .iter()
            .filter(|d| d.matches_roles(roles))
            .map(MetricDefinition::id)
            .collect()
    }

    fn publish(&self, id: &str) -> Result<()> {
        let metric = self.evaluate(id)?;
        let mut first_error: Option<Error> = None;
        for publisher in &self.publishers {
            if let Err(err) = publisher.publish(&metric) {
                tracing::warn!(app = %self.name, metric_id = %id, error = %err, "Publisher rejected metric");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
