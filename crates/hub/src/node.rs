//! Registered nodes, their public projection, and resolved connections.
//!
//! A [`Node`] holds the credential and is only ever handed to the registry and
//! the store. Everything that leaves the control plane uses [`NodeSummary`],
//! which has no credential field at all, so confidentiality does not depend on
//! remembering a `#[serde(skip)]`.

use serde::{Deserialize, Serialize};

use crate::{NodeId, Secret};

// ---------------------------------------------------------------------------
// Kind
// ---------------------------------------------------------------------------

/// Remote-system family of a node; selects the adapter used to talk to it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Jenkins master (JSON API + Pipeline REST API).
    #[default]
    Jenkins,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Jenkins => f.write_str("jenkins"),
        }
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A registered remote build server, including its credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Registry-generated identity.
    pub id: NodeId,
    /// Adapter family.
    #[serde(default)]
    pub kind: NodeKind,
    /// Host name or address of the node.
    pub host: String,
    /// TCP port of the node's API.
    pub port: u16,
    /// Account used to authenticate against the node.
    pub account: String,
    /// Password or API token for `account`.
    pub credential: Secret,
    /// Whether the node is reached over HTTPS.
    #[serde(default)]
    pub tls: bool,
}

impl Node {
    /// Builds a node from a registration request and a fresh id.
    pub fn from_new(id: NodeId, new: NewNode) -> Self {
        Self {
            id,
            kind: new.kind,
            host: new.host.trim().to_string(),
            port: new.port,
            account: new.account,
            credential: new.credential,
            tls: new.tls,
        }
    }

    /// Returns the credential-free projection of this node.
    pub fn summary(&self) -> NodeSummary {
        NodeSummary {
            id: self.id,
            kind: self.kind,
            host: self.host.clone(),
            port: self.port,
            account: self.account.clone(),
            tls: self.tls,
        }
    }

    /// Returns the connection record adapters use to reach this node.
    pub fn connection(&self) -> NodeConnection {
        NodeConnection {
            node: Some(self.id),
            kind: self.kind,
            host: self.host.clone(),
            port: self.port,
            account: self.account.clone(),
            secret: self.credential.clone(),
            tls: self.tls,
        }
    }

    /// Returns `true` if this node is registered for the given endpoint.
    ///
    /// Host comparison is case-insensitive.
    pub fn serves(&self, host: &str, port: u16, account: &str) -> bool {
        self.host.eq_ignore_ascii_case(host.trim()) && self.port == port && self.account == account
    }

    /// Applies a partial update in place.
    pub fn apply(&mut self, patch: NodePatch) {
        if let Some(kind) = patch.kind {
            self.kind = kind;
        }
        if let Some(host) = patch.host {
            self.host = host.trim().to_string();
        }
        if let Some(port) = patch.port {
            self.port = port;
        }
        if let Some(account) = patch.account {
            self.account = account;
        }
        if let Some(credential) = patch.credential {
            self.credential = credential;
        }
        if let Some(tls) = patch.tls {
            self.tls = tls;
        }
    }
}

/// Public projection of a [`Node`]. Has no credential field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    /// Registry-generated identity.
    pub id: NodeId,
    /// Adapter family.
    pub kind: NodeKind,
    /// Host name or address of the node.
    pub host: String,
    /// TCP port of the node's API.
    pub port: u16,
    /// Account used to authenticate against the node.
    pub account: String,
    /// Whether the node is reached over HTTPS.
    pub tls: bool,
}

// ---------------------------------------------------------------------------
// Registry requests
// ---------------------------------------------------------------------------

/// Registration request for a new node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNode {
    /// Adapter family; defaults to Jenkins.
    #[serde(default)]
    pub kind: NodeKind,
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Account name.
    pub account: String,
    /// Password or API token. Accepted as `password` on the wire as well.
    #[serde(alias = "password")]
    pub credential: Secret,
    /// Whether to use HTTPS.
    #[serde(default)]
    pub tls: bool,
}

/// Partial update of a registered node. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePatch {
    /// New adapter family.
    #[serde(default)]
    pub kind: Option<NodeKind>,
    /// New host.
    #[serde(default)]
    pub host: Option<String>,
    /// New port.
    #[serde(default)]
    pub port: Option<u16>,
    /// New account.
    #[serde(default)]
    pub account: Option<String>,
    /// New credential. Accepted as `password` on the wire as well.
    #[serde(default, alias = "password")]
    pub credential: Option<Secret>,
    /// New TLS flag.
    #[serde(default)]
    pub tls: Option<bool>,
}

impl NodePatch {
    /// Returns `true` if the patch changes where or how the node is reached,
    /// which makes every cached answer for the node suspect.
    pub fn changes_connection(&self) -> bool {
        self.kind.is_some()
            || self.host.is_some()
            || self.port.is_some()
            || self.account.is_some()
            || self.credential.is_some()
            || self.tls.is_some()
    }
}

/// Filter for listing nodes. Empty filter matches every node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeFilter {
    /// Case-insensitive substring the host must contain.
    #[serde(default)]
    pub host: Option<String>,
    /// Adapter family the node must have.
    #[serde(default)]
    pub kind: Option<NodeKind>,
}

impl NodeFilter {
    /// Returns `true` if `node` passes the filter.
    pub fn matches(&self, node: &Node) -> bool {
        let host_ok = self.host.as_deref().map_or(true, |needle| {
            node.host
                .to_ascii_lowercase()
                .contains(&needle.trim().to_ascii_lowercase())
        });
        let kind_ok = self.kind.map_or(true, |k| node.kind == k);
        host_ok && kind_ok
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Everything an adapter needs to reach one node, resolved once per request.
///
/// `node` is `None` for ad-hoc targets that are not registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConnection {
    /// Registry id, if the target is registered.
    pub node: Option<NodeId>,
    /// Adapter family.
    pub kind: NodeKind,
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Account name.
    pub account: String,
    /// Password or API token.
    pub secret: Secret,
    /// Whether to use HTTPS.
    pub tls: bool,
}

impl NodeConnection {
    /// Returns the base URL of the node's API, without a trailing slash.
    pub fn base_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    /// Returns a log-safe label for the target (`account@host:port`).
    pub fn label(&self) -> String {
        format!("{}@{}:{}", self.account, self.host, self.port)
    }
}
