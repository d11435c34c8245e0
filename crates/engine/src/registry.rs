//! Node registry: the single source of truth for node identities and
//! credentials.
//!
//! Reads go to a sharded map and never wait on writers. Writes are admitted
//! one at a time so that endpoint uniqueness can be checked across nodes, and
//! they reach the durable store before the in-memory map: a failed store write
//! leaves the registry exactly as it was.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::info;

use hub::{
    HubError, NewNode, Node, NodeConnection, NodeFilter, NodeId, NodePatch, NodeStore, NodeSummary,
};

pub(crate) struct NodeRegistry {
    nodes: DashMap<NodeId, Node>,
    store: Arc<dyn NodeStore>,
    admission: Mutex<()>,
}

impl NodeRegistry {
    /// Loads every stored node.
    pub async fn open(store: Arc<dyn NodeStore>) -> Result<Self, HubError> {
        let nodes = DashMap::new();
        for node in store.load_all().await? {
            nodes.insert(node.id, node);
        }
        info!(nodes = nodes.len(), "node registry loaded");
        Ok(Self {
            nodes,
            store,
            admission: Mutex::new(()),
        })
    }

    pub async fn add(&self, new: NewNode) -> Result<NodeSummary, HubError> {
        let node = Node::from_new(NodeId::new_random(), new);
        validate(&node)?;

        let _admitted = self.admission.lock().await;
        self.ensure_unique(&node)?;
        self.store.put(&node).await?;
        let summary = node.summary();
        self.nodes.insert(node.id, node);
        Ok(summary)
    }

    /// Returns matching nodes ordered by host, port, then id.
    pub fn list(&self, filter: &NodeFilter) -> Vec<NodeSummary> {
        let mut out: Vec<NodeSummary> = self
            .nodes
            .iter()
            .filter(|n| filter.matches(n.value()))
            .map(|n| n.summary())
            .collect();
        out.sort_by_cached_key(|n| (n.host.to_ascii_lowercase(), n.port, n.id));
        out
    }

    /// Applies `patch` and returns the node before and after the change.
    pub async fn update(&self, id: NodeId, patch: NodePatch) -> Result<(Node, Node), HubError> {
        let _admitted = self.admission.lock().await;
        let before = self.get(id)?;
        let mut after = before.clone();
        after.apply(patch);
        validate(&after)?;
        self.ensure_unique(&after)?;

        self.store.put(&after).await?;
        self.nodes.insert(id, after.clone());
        Ok((before, after))
    }

    pub async fn remove(&self, id: NodeId) -> Result<Node, HubError> {
        let _admitted = self.admission.lock().await;
        self.get(id)?;
        self.store.remove(id).await?;
        self.nodes
            .remove(&id)
            .map(|(_, node)| node)
            .ok_or(HubError::NodeNotFound { id })
    }

    pub fn get(&self, id: NodeId) -> Result<Node, HubError> {
        self.nodes
            .get(&id)
            .map(|n| n.value().clone())
            .ok_or(HubError::NodeNotFound { id })
    }

    pub fn connection(&self, id: NodeId) -> Result<NodeConnection, HubError> {
        self.nodes
            .get(&id)
            .map(|n| n.connection())
            .ok_or(HubError::NodeNotFound { id })
    }

    /// Returns the registered node for an endpoint, if there is one.
    pub fn find_endpoint(&self, host: &str, port: u16, account: &str) -> Option<NodeConnection> {
        self.nodes
            .iter()
            .find(|n| n.serves(host, port, account))
            .map(|n| n.connection())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    fn ensure_unique(&self, node: &Node) -> Result<(), HubError> {
        let clash = self
            .nodes
            .iter()
            .any(|n| n.id != node.id && n.serves(&node.host, node.port, &node.account));
        if clash {
            return Err(HubError::Duplicate {
                host: node.host.clone(),
                port: node.port,
                account: node.account.clone(),
            });
        }
        Ok(())
    }
}

fn validate(node: &Node) -> Result<(), HubError> {
    if node.host.is_empty() {
        return Err(HubError::invalid("host must not be empty"));
    }
    if node.port == 0 {
        return Err(HubError::invalid("port must not be 0"));
    }
    if node.account.trim().is_empty() {
        return Err(HubError::invalid("account must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use hub::{NodeKind, Secret, StoreError};

    use crate::store::MemoryNodeStore;

    struct BrokenStore;

    #[async_trait]
    impl NodeStore for BrokenStore {
        async fn load_all(&self) -> Result<Vec<Node>, StoreError> {
            Ok(Vec::new())
        }
        async fn put(&self, _node: &Node) -> Result<(), StoreError> {
            Err(StoreError::Io {
                message: "disk full".into(),
            })
        }
        async fn remove(&self, _id: NodeId) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn new_node(host: &str, port: u16) -> NewNode {
        NewNode {
            kind: NodeKind::Jenkins,
            host: host.into(),
            port,
            account: "svc".into(),
            credential: Secret::new("pw"),
            tls: false,
        }
    }

    async fn registry() -> NodeRegistry {
        NodeRegistry::open(Arc::new(MemoryNodeStore::new())).await.unwrap()
    }

    #[tokio::test]
    async fn add_then_list_returns_one_summary() {
        let reg = registry().await;
        let added = reg.add(new_node("ci.example.com", 8080)).await.unwrap();

        let listed = reg.list(&NodeFilter::default());
        assert_eq!(listed, vec![added.clone()]);
        assert_eq!(listed[0].host, "ci.example.com");
        assert_eq!(listed[0].port, 8080);
        assert_eq!(listed[0].account, "svc");
    }

    #[tokio::test]
    async fn same_endpoint_is_rejected_case_insensitively() {
        let reg = registry().await;
        reg.add(new_node("ci.example.com", 8080)).await.unwrap();

        let err = reg.add(new_node("CI.example.com", 8080)).await.unwrap_err();
        assert!(matches!(err, HubError::Duplicate { .. }));
        reg.add(new_node("ci.example.com", 9090)).await.unwrap();
        assert_eq!(reg.len(), 2);
    }

    #[tokio::test]
    async fn update_cannot_collide_with_another_node() {
        let reg = registry().await;
        reg.add(new_node("a", 8080)).await.unwrap();
        let b = reg.add(new_node("b", 8080)).await.unwrap();

        let patch = NodePatch {
            host: Some("a".into()),
            ..NodePatch::default()
        };
        let err = reg.update(b.id, patch).await.unwrap_err();
        assert!(matches!(err, HubError::Duplicate { .. }));

        let patch = NodePatch {
            port: Some(8443),
            tls: Some(true),
            ..NodePatch::default()
        };
        let (before, after) = reg.update(b.id, patch).await.unwrap();
        assert_eq!(before.port, 8080);
        assert_eq!(after.connection().base_url(), "https://b:8443");
    }

    #[tokio::test]
    async fn list_filters_and_sorts() {
        let reg = registry().await;
        reg.add(new_node("zeta.ci", 1)).await.unwrap();
        reg.add(new_node("alpha.ci", 2)).await.unwrap();
        reg.add(new_node("build.other", 3)).await.unwrap();

        let hosts: Vec<_> = reg
            .list(&NodeFilter {
                host: Some(".CI".into()),
                kind: None,
            })
            .into_iter()
            .map(|n| n.host)
            .collect();
        assert_eq!(hosts, vec!["alpha.ci", "zeta.ci"]);
    }

    #[tokio::test]
    async fn missing_nodes_are_not_found() {
        let reg = registry().await;
        let id = NodeId::new_random();
        assert!(matches!(reg.remove(id).await, Err(HubError::NodeNotFound { .. })));
        assert!(matches!(
            reg.update(id, NodePatch::default()).await,
            Err(HubError::NodeNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_registration_is_rejected() {
        let reg = registry().await;
        let err = reg.add(new_node("  ", 8080)).await.unwrap_err();
        assert!(matches!(err, HubError::InvalidRequest { .. }));
        let err = reg.add(new_node("ci", 0)).await.unwrap_err();
        assert!(matches!(err, HubError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn failed_store_write_leaves_registry_unchanged() {
        let reg = NodeRegistry::open(Arc::new(BrokenStore)).await.unwrap();
        let err = reg.add(new_node("ci", 8080)).await.unwrap_err();
        assert!(matches!(err, HubError::Storage(_)));
        assert_eq!(reg.len(), 0);
    }

    #[tokio::test]
    async fn endpoint_lookup_resolves_registered_credentials() {
        let reg = registry().await;
        let added = reg.add(new_node("ci.example.com", 8080)).await.unwrap();

        let conn = reg.find_endpoint("CI.EXAMPLE.COM", 8080, "svc").unwrap();
        assert_eq!(conn.node, Some(added.id));
        assert_eq!(conn.secret.expose(), "pw");
        assert!(reg.find_endpoint("ci.example.com", 8080, "other").is_none());
    }
}
