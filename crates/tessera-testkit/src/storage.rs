//! Storage layouts for test clusters.
//!
//! Shared layouts (in-memory, file) give every node the same backend.
//! The replicated layout gives each node its own replica: writes reach only
//! the replicas of nodes that are online, and a node that was offline keeps
//! its old view until it catches up from the leader.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tempfile::TempDir;
use tessera_core::{SealError, SealResult};
use tessera_seal::{FileBackend, InMemoryBackend, StorageBackend};
use tracing::{debug, info};

/// Which storage a test cluster runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    /// One in-memory store shared by all nodes
    Inmem,
    /// One directory shared by all nodes
    File,
    /// One replica per node, kept in sync while nodes are online
    Replicated,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inmem => write!(f, "inmem"),
            Self::File => write!(f, "file"),
            Self::Replicated => write!(f, "replicated"),
        }
    }
}

#[derive(Debug, Default)]
struct LogState {
    online: BTreeSet<usize>,
    open: BTreeSet<usize>,
    voters: BTreeSet<usize>,
}

/// Per-node replicas plus replication membership
#[derive(Debug)]
pub struct ReplicatedLog {
    replicas: Vec<InMemoryBackend>,
    state: Mutex<LogState>,
}

impl ReplicatedLog {
    /// Empty replicas for `num_nodes` nodes
    pub fn new(num_nodes: usize) -> Arc<Self> {
        Arc::new(Self {
            replicas: (0..num_nodes).map(|_| InMemoryBackend::new()).collect(),
            state: Mutex::new(LogState::default()),
        })
    }

    /// Number of replicas
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    /// Whether there are no replicas
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Node `index`'s replica, read directly
    pub fn replica(&self, index: usize) -> SealResult<&InMemoryBackend> {
        self.replicas
            .get(index)
            .ok_or_else(|| SealError::invalid_request(format!("no replica for node {index}")))
    }

    /// Open node `index`'s handle; fails while a previous handle is still open
    pub fn open(self: &Arc<Self>, index: usize) -> SealResult<ReplicaHandle> {
        self.replica(index)?;
        if !self.state.lock().open.insert(index) {
            return Err(SealError::invalid_request(format!(
                "storage of node {index} is still open; close it before restarting"
            )));
        }
        Ok(ReplicaHandle {
            log: Arc::clone(self),
            index,
        })
    }

    /// Release node `index`'s handle
    pub fn close(&self, index: usize) {
        let mut state = self.state.lock();
        state.open.remove(&index);
        state.online.remove(&index);
    }

    /// Whether node `index` receives replicated writes
    pub fn set_online(&self, index: usize, online: bool) {
        let mut state = self.state.lock();
        if online {
            state.online.insert(index);
        } else {
            state.online.remove(&index);
        }
    }

    /// Replace node `index`'s replica with a copy of `from`'s
    pub fn catch_up(&self, index: usize, from: usize) -> SealResult<()> {
        let snapshot = self.replica(from)?.snapshot();
        let entries = snapshot.len();
        self.replica(index)?.restore(snapshot);
        debug!(node = index, from, entries, "replica caught up");
        Ok(())
    }

    /// Create the voter set with `index` as its only member
    pub fn bootstrap(&self, index: usize) -> SealResult<()> {
        self.replica(index)?;
        let mut state = self.state.lock();
        if !state.voters.is_empty() {
            return Err(SealError::invalid_request(
                "replicated storage is already bootstrapped",
            ));
        }
        state.voters.insert(index);
        info!(node = index, "replicated storage bootstrapped");
        Ok(())
    }

    /// Add a voter
    pub fn add_voter(&self, index: usize) -> SealResult<()> {
        self.replica(index)?;
        let mut state = self.state.lock();
        if state.voters.is_empty() {
            return Err(SealError::invalid_request(
                "replicated storage has not been bootstrapped",
            ));
        }
        state.voters.insert(index);
        Ok(())
    }

    /// Current voters
    pub fn voters(&self) -> BTreeSet<usize> {
        self.state.lock().voters.clone()
    }

    fn online_peers(&self, index: usize) -> Vec<usize> {
        self.state
            .lock()
            .online
            .iter()
            .copied()
            .filter(|peer| *peer != index)
            .collect()
    }
}

/// Storage view of one node over a [`ReplicatedLog`]
#[derive(Debug)]
pub struct ReplicaHandle {
    log: Arc<ReplicatedLog>,
    index: usize,
}

impl ReplicaHandle {
    fn local(&self) -> &InMemoryBackend {
        &self.log.replicas[self.index]
    }
}

#[async_trait]
impl StorageBackend for ReplicaHandle {
    async fn get(&self, key: &str) -> SealResult<Option<Vec<u8>>> {
        self.local().get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> SealResult<()> {
        for peer in self.log.online_peers(self.index) {
            self.log.replicas[peer].put(key, value.clone()).await?;
        }
        self.local().put(key, value).await
    }

    async fn delete(&self, key: &str) -> SealResult<bool> {
        for peer in self.log.online_peers(self.index) {
            self.log.replicas[peer].delete(key).await?;
        }
        self.local().delete(key).await
    }

    async fn list(&self, prefix: &str) -> SealResult<Vec<String>> {
        self.local().list(prefix).await
    }
}

enum Layout {
    Shared(Arc<dyn StorageBackend>),
    Replicated(Arc<ReplicatedLog>),
}

/// Storage that outlives a test cluster, so a later cluster can reuse it
pub struct ReusableStorage {
    kind: StorageKind,
    layout: Layout,
    _dir: Option<TempDir>,
}

impl ReusableStorage {
    /// Storage of `kind` for `num_nodes` nodes
    pub fn new(kind: StorageKind, num_nodes: usize) -> SealResult<Arc<Self>> {
        let (layout, dir) = match kind {
            StorageKind::Inmem => (Layout::Shared(Arc::new(InMemoryBackend::new())), None),
            StorageKind::File => {
                let dir = TempDir::new()?;
                let backend: Arc<dyn StorageBackend> = Arc::new(FileBackend::new(dir.path()));
                (Layout::Shared(backend), Some(dir))
            }
            StorageKind::Replicated => (Layout::Replicated(ReplicatedLog::new(num_nodes)), None),
        };
        Ok(Arc::new(Self {
            kind,
            layout,
            _dir: dir,
        }))
    }

    /// Layout kind
    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    /// Whether each node has its own replica
    pub fn is_replicated(&self) -> bool {
        matches!(self.layout, Layout::Replicated(_))
    }

    /// The replicated log, for replicated layouts
    pub fn log(&self) -> Option<&Arc<ReplicatedLog>> {
        match &self.layout {
            Layout::Replicated(log) => Some(log),
            Layout::Shared(_) => None,
        }
    }

    /// Open the storage node `index` runs on
    pub fn open(&self, index: usize) -> SealResult<Arc<dyn StorageBackend>> {
        match &self.layout {
            Layout::Shared(backend) => Ok(Arc::clone(backend)),
            Layout::Replicated(log) => Ok(Arc::new(log.open(index)?)),
        }
    }

    /// Node `index`'s view of storage without opening a handle
    pub fn view(&self, index: usize) -> SealResult<Arc<dyn StorageBackend>> {
        match &self.layout {
            Layout::Shared(backend) => Ok(Arc::clone(backend)),
            Layout::Replicated(log) => Ok(Arc::new(log.replica(index)?.clone())),
        }
    }

    /// Release node `index`'s handle
    pub fn close(&self, index: usize) {
        if let Layout::Replicated(log) = &self.layout {
            log.close(index);
        }
    }
}
