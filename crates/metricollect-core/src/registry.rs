//! Application registry.
//!
//! Owned by whoever builds it (normally [`crate::config::Config::build_registry`])
//! and passed explicitly to the runner.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::application::Application;
use crate::error::{Error, Result};
use crate::publisher::PublisherRegistry;

#[derive(Clone, Default)]
pub struct Registry {
    applications: BTreeMap<String, Arc<dyn Application>>,
    publishers: PublisherRegistry,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("applications", &self.names())
            .field("publishers", &self.publishers)
            .finish()
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_publishers(publishers: PublisherRegistry) -> Self {
        Self {
            applications: BTreeMap::new(),
            publishers,
        }
    }

    /// Register an application under its own name, replacing any previous one.
    pub fn register(&mut self, application: Arc<dyn Application>) {
        self.applications
            .insert(application.name().to_string(), application);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Application>> {
        self.applications
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownApplication(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.applications.keys().cloned().collect()
    }

    pub fn publishers(&self) -> &PublisherRegistry {
        &self.publishers
    }

    pub fn publishers_mut(&mut self) -> &mut PublisherRegistry {
        &mut self.publishers
    }
}
