//! Topology service client seam.
//!
//! The topology store is a strongly-consistent key-value service holding the
//! keyspace, shard and serving-directory records. Implementations provide
//! versioned compare-and-swap writes; the retrying read-modify-write helpers
//! here are the only mutation path the orchestrator uses.

use async_trait::async_trait;
use thiserror::Error;

use super::{Keyspace, KeyspaceInfo, Shard, ShardInfo, SrvKeyspace, Tablet, TabletAlias, TabletType};

/// Topology store error kinds.
#[derive(Debug, Error)]
pub enum TopoError {
    #[error("node doesn't exist: {0}")]
    NoNode(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    /// CAS write lost a race; retried internally by the record updaters.
    #[error("bad node version: {0}")]
    BadVersion(String),

    #[error("lock for keyspace {keyspace} already held (action: {action})")]
    LockHeld { keyspace: String, action: String },

    /// A record mutator refused the update; nothing was written.
    #[error("invalid update for {path}: {reason}")]
    InvalidUpdate { path: String, reason: String },

    #[error("topology unavailable: {0}")]
    Unavailable(String),
}

pub type TopoResult<T> = Result<T, TopoError>;

/// Held keyspace lock. Dropping the guard releases the lock.
pub struct KeyspaceLock {
    pub keyspace: String,
    pub action: String,
    _guard: Box<dyn Send>,
}

impl KeyspaceLock {
    pub fn new(keyspace: impl Into<String>, action: impl Into<String>, guard: Box<dyn Send>) -> Self {
        Self {
            keyspace: keyspace.into(),
            action: action.into(),
            _guard: guard,
        }
    }
}

impl std::fmt::Debug for KeyspaceLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyspaceLock")
            .field("keyspace", &self.keyspace)
            .field("action", &self.action)
            .finish()
    }
}

/// Client interface to the topology service.
#[async_trait]
pub trait TopoServer: Send + Sync {
    async fn get_keyspace(&self, keyspace: &str) -> TopoResult<KeyspaceInfo>;

    /// CAS write of a keyspace record at `ki.version`.
    async fn update_keyspace(&self, ki: &KeyspaceInfo) -> TopoResult<KeyspaceInfo>;

    async fn get_shard(&self, keyspace: &str, shard: &str) -> TopoResult<ShardInfo>;

    /// CAS write of a shard record at `si.version`.
    async fn update_shard(&self, si: &ShardInfo) -> TopoResult<ShardInfo>;

    /// All shards of a keyspace, sorted by shard name.
    async fn find_all_shards_in_keyspace(&self, keyspace: &str) -> TopoResult<Vec<ShardInfo>>;

    async fn get_tablet(&self, alias: &TabletAlias) -> TopoResult<Tablet>;

    /// Aliases of every tablet currently registered in a shard.
    async fn get_tablet_aliases_in_shard(
        &self,
        keyspace: &str,
        shard: &str,
    ) -> TopoResult<Vec<TabletAlias>>;

    /// Names of every cell known to the topology.
    async fn get_cell_names(&self) -> TopoResult<Vec<String>>;

    async fn get_srv_keyspace(&self, cell: &str, keyspace: &str) -> TopoResult<SrvKeyspace>;

    async fn update_srv_keyspace(
        &self,
        cell: &str,
        keyspace: &str,
        srv_keyspace: &SrvKeyspace,
    ) -> TopoResult<()>;

    /// Commit the serving-directory swap for one tablet type: `from_shards`
    /// stop serving it and `to_shards` start, in every selected cell (or all
    /// cells when `cells` is `None`). Single atomic operation on the store.
    async fn migrate_served_type(
        &self,
        keyspace: &str,
        to_shards: &[ShardInfo],
        from_shards: &[ShardInfo],
        served_type: TabletType,
        cells: Option<&[String]>,
    ) -> TopoResult<()>;

    /// Advisory keyspace lock. Fails immediately with [`TopoError::LockHeld`]
    /// when another orchestrator invocation holds it.
    async fn lock_keyspace(&self, keyspace: &str, action: &str) -> TopoResult<KeyspaceLock>;

    /// Serving directories of a keyspace in every cell that has one.
    async fn get_srv_keyspace_all_cells(
        &self,
        keyspace: &str,
    ) -> TopoResult<Vec<(String, SrvKeyspace)>> {
        let mut out = Vec::new();
        for cell in self.get_cell_names().await? {
            match self.get_srv_keyspace(&cell, keyspace).await {
                Ok(sk) => out.push((cell, sk)),
                Err(TopoError::NoNode(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    /// The single shard of an unsharded keyspace.
    async fn get_only_shard(&self, keyspace: &str) -> TopoResult<ShardInfo> {
        let shards = self.find_all_shards_in_keyspace(keyspace).await?;
        match shards.len() {
            1 => Ok(shards.into_iter().next().unwrap()),
            n => Err(TopoError::InvalidUpdate {
                path: keyspace.to_string(),
                reason: format!("expected exactly one shard, found {n}"),
            }),
        }
    }
}

/// Shard record updater: read, apply `update` in memory, CAS back. A lost
/// CAS race re-reads and re-applies; a mutator error aborts without writing.
pub async fn update_shard_fields<F>(
    ts: &dyn TopoServer,
    keyspace: &str,
    shard: &str,
    mut update: F,
) -> TopoResult<ShardInfo>
where
    F: FnMut(&mut Shard) -> TopoResult<()> + Send,
{
    loop {
        let mut si = ts.get_shard(keyspace, shard).await?;
        update(&mut si.shard)?;
        match ts.update_shard(&si).await {
            Ok(updated) => return Ok(updated),
            Err(TopoError::BadVersion(path)) => {
                tracing::debug!(%path, "shard update lost CAS race, retrying");
                continue;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Keyspace-record analog of [`update_shard_fields`].
pub async fn update_keyspace_fields<F>(
    ts: &dyn TopoServer,
    keyspace: &str,
    mut update: F,
) -> TopoResult<KeyspaceInfo>
where
    F: FnMut(&mut Keyspace) -> TopoResult<()> + Send,
{
    loop {
        let mut ki = ts.get_keyspace(keyspace).await?;
        update(&mut ki.keyspace)?;
        match ts.update_keyspace(&ki).await {
            Ok(updated) => return Ok(updated),
            Err(TopoError::BadVersion(path)) => {
                tracing::debug!(%path, "keyspace update lost CAS race, retrying");
                continue;
            }
            Err(err) => return Err(err),
        }
    }
}
