//! Named protocol groups.
//!
//! A [`ProtocolGroup`] is a factory producing the client and server halves of
//! one protocol. Groups are registered by name in a [`ProtocolRegistry`];
//! client and server configs refer to groups by that name, and every new
//! endpoint gets fresh instances.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, OnceLock, PoisonError, RwLock},
};

use tracing::{debug, warn};

use crate::{
    error::{Result, TransportError},
    protocol::{Protocol, StubProtocol},
};

/// Factory for the two halves of a protocol.
pub trait ProtocolGroup: Send + Sync + 'static {
    /// Instance bound on the connecting side.
    fn client_side(&self) -> Box<dyn Protocol>;

    /// Instance bound on the accepting side.
    fn server_side(&self) -> Box<dyn Protocol>;
}

/// Group whose halves are both [`StubProtocol`]s.
#[derive(Debug, Clone)]
pub struct StubGroup {
    name: String,
}

impl StubGroup {
    /// Create a stub group reporting `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl ProtocolGroup for StubGroup {
    fn client_side(&self) -> Box<dyn Protocol> {
        Box::new(StubProtocol::new(self.name.clone()))
    }

    fn server_side(&self) -> Box<dyn Protocol> {
        Box::new(StubProtocol::new(self.name.clone()))
    }
}

/// Thread-safe `name -> group` map.
#[derive(Default)]
pub struct ProtocolRegistry {
    groups: RwLock<HashMap<String, Arc<dyn ProtocolGroup>>>,
}

impl ProtocolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<ProtocolRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    /// Register `group` under `name`, replacing any previous entry.
    pub fn register(&self, name: impl Into<String>, group: Arc<dyn ProtocolGroup>) {
        let name = name.into();
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        if groups.insert(name.clone(), group).is_some() {
            warn!(%name, "protocol group replaced");
        } else {
            debug!(%name, "protocol group registered");
        }
    }

    /// Whether a group is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.groups.read().unwrap_or_else(PoisonError::into_inner).contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = groups.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Group registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ProtocolGroup>> {
        self.groups.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    /// Look up every name, failing on the first unknown one.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Arc<dyn ProtocolGroup>>> {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        names
            .iter()
            .map(|name| {
                groups
                    .get(name)
                    .cloned()
                    .ok_or_else(|| TransportError::UnknownProtocolGroup(name.clone()))
            })
            .collect()
    }

    /// Fresh client-side instances for `names`, in order.
    pub fn client_side(&self, names: &[String]) -> Result<Vec<Box<dyn Protocol>>> {
        Ok(self.resolve(names)?.iter().map(|group| group.client_side()).collect())
    }

    /// Fresh server-side instances for `names`, in order.
    pub fn server_side(&self, names: &[String]) -> Result<Vec<Box<dyn Protocol>>> {
        Ok(self.resolve(names)?.iter().map(|group| group.server_side()).collect())
    }
}

impl fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolRegistry").field("groups", &self.names()).finish()
    }
}
