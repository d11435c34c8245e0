//! [`NodeStore`] implementations: in-memory and a single JSON file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use hub::{Node, NodeId, NodeStore, StoreError};

// ---------------------------------------------------------------------------
// MemoryNodeStore
// ---------------------------------------------------------------------------

/// Volatile store; entries live as long as the process.
#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    nodes: RwLock<BTreeMap<NodeId, Node>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn load_all(&self) -> Result<Vec<Node>, StoreError> {
        Ok(self.nodes.read().await.values().cloned().collect())
    }

    async fn put(&self, node: &Node) -> Result<(), StoreError> {
        self.nodes.write().await.insert(node.id, node.clone());
        Ok(())
    }

    async fn remove(&self, id: NodeId) -> Result<(), StoreError> {
        self.nodes.write().await.remove(&id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JsonFileNodeStore
// ---------------------------------------------------------------------------

/// Stores every node in one JSON array on disk.
///
/// Each mutation rewrites the whole file through a sibling temporary file and
/// a rename, so a crash leaves either the old or the new content. The file
/// holds credentials and is created owner-readable only on Unix.
#[derive(Debug)]
pub struct JsonFileNodeStore {
    path: PathBuf,
    /// Serialises read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl JsonFileNodeStore {
    /// Opens a store at `path`. The file need not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<BTreeMap<NodeId, Node>, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(io_error(&self.path, e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(BTreeMap::new());
        }
        let nodes: Vec<Node> = serde_json::from_slice(&bytes).map_err(|e| StoreError::Malformed {
            message: format!("{}: {e}", self.path.display()),
        })?;
        Ok(nodes.into_iter().map(|n| (n.id, n)).collect())
    }

    async fn write(&self, nodes: &BTreeMap<NodeId, Node>) -> Result<(), StoreError> {
        let list: Vec<&Node> = nodes.values().collect();
        let text = serde_json::to_vec_pretty(&list).map_err(|e| StoreError::Malformed {
            message: e.to_string(),
        })?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| io_error(dir, e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, text)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        restrict_permissions(&tmp).await?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| io_error(&self.path, e))?;

        debug!(path = %self.path.display(), nodes = nodes.len(), "node store written");
        Ok(())
    }
}

#[async_trait]
impl NodeStore for JsonFileNodeStore {
    async fn load_all(&self) -> Result<Vec<Node>, StoreError> {
        Ok(self.read().await?.into_values().collect())
    }

    async fn put(&self, node: &Node) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut nodes = self.read().await?;
        nodes.insert(node.id, node.clone());
        self.write(&nodes).await
    }

    async fn remove(&self, id: NodeId) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut nodes = self.read().await?;
        if nodes.remove(&id).is_none() {
            return Ok(());
        }
        self.write(&nodes).await
    }
}

fn io_error(path: &Path, err: std::io::Error) -> StoreError {
    StoreError::Io {
        message: format!("{}: {err}", path.display()),
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|e| io_error(path, e))
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}
