//! Name-keyed adapter registry
//!
//! Transport modules add themselves to a [`RegistryBuilder`] at process start;
//! the finished [`Registry`] is immutable and shared without locking.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::adapter::Adapter;
use crate::config::Config;
use crate::error::{AdapterError, AdapterResult};
use crate::info::AdapterInfo;

/// Builds an adapter instance from a configuration
pub type Constructor = Arc<dyn Fn(Config) -> AdapterResult<Box<dyn Adapter>> + Send + Sync>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Adapter already registered: {0}")]
    Duplicate(String),

    #[error("Adapter not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

struct Entry {
    info: AdapterInfo,
    constructor: Constructor,
}

/// Collects registrations during startup
#[derive(Default)]
pub struct RegistryBuilder {
    entries: BTreeMap<String, Entry>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an adapter. A name collision is a startup error.
    pub fn register<F>(&mut self, info: AdapterInfo, constructor: F) -> Result<(), RegistryError>
    where
        F: Fn(Config) -> AdapterResult<Box<dyn Adapter>> + Send + Sync + 'static,
    {
        if self.entries.contains_key(&info.name) {
            return Err(RegistryError::Duplicate(info.name));
        }
        debug!(adapter = %info.name, "Registering adapter");
        self.entries.insert(
            info.name.clone(),
            Entry {
                info,
                constructor: Arc::new(constructor),
            },
        );
        Ok(())
    }

    pub fn build(self) -> Registry {
        Registry {
            entries: self.entries,
        }
    }
}

/// Immutable registry of adapter constructors
pub struct Registry {
    entries: BTreeMap<String, Entry>,
}

impl Registry {
    /// Construct (but do not connect) the adapter registered as `name`
    pub fn new_adapter(&self, name: &str, config: Config) -> Result<Box<dyn Adapter>, RegistryError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        Ok((entry.constructor)(config)?)
    }

    /// All registered adapters, sorted by name
    pub fn list(&self) -> Vec<AdapterInfo> {
        self.entries.values().map(|e| e.info.clone()).collect()
    }

    pub fn describe(&self, name: &str) -> Option<&AdapterInfo> {
        self.entries.get(name).map(|e| &e.info)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}
