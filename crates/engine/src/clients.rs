//! Adapter table: which [`RemoteClient`] serves which [`NodeKind`].

use std::collections::HashMap;
use std::sync::Arc;

use hub::{HubError, NodeKind, RemoteClient};

/// Maps each node family to the adapter that speaks its protocol.
#[derive(Clone, Default)]
pub struct RemoteClients {
    by_kind: HashMap<NodeKind, Arc<dyn RemoteClient>>,
}

impl RemoteClients {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `client` for `kind`, replacing any previous adapter.
    pub fn with(mut self, kind: NodeKind, client: Arc<dyn RemoteClient>) -> Self {
        self.by_kind.insert(kind, client);
        self
    }

    /// Returns the adapter for `kind`.
    pub fn get(&self, kind: NodeKind) -> Result<Arc<dyn RemoteClient>, HubError> {
        self.by_kind
            .get(&kind)
            .cloned()
            .ok_or_else(|| HubError::invalid(format!("no adapter registered for node kind {kind}")))
    }
}

impl std::fmt::Debug for RemoteClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClients")
            .field("kinds", &self.by_kind.keys().collect::<Vec<_>>())
            .finish()
    }
}
