//! Tablet-management RPC client seam.
//!
//! Everything the orchestrator does to a live tablet goes through this trait:
//! state refresh pings, replication position reads, and the VReplication
//! control statements from [`crate::vreplication`]. Transports are external;
//! implementations decide timeouts and retries per RPC.

use async_trait::async_trait;

use crate::topo::Tablet;

/// Result of a VReplication control statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    /// Id assigned by an insert; the stream uid for stream creation.
    pub insert_id: u64,
    pub rows_affected: u64,
    pub rows: Vec<Vec<String>>,
}

#[async_trait]
pub trait TabletManagerClient: Send + Sync {
    /// Make the tablet reload its shard record and apply serving changes.
    async fn refresh_state(&self, tablet: &Tablet) -> anyhow::Result<()>;

    /// Current replication position of a primary.
    async fn primary_position(&self, tablet: &Tablet) -> anyhow::Result<String>;

    /// Run one VReplication control statement on the tablet's database.
    async fn vreplication_exec(&self, tablet: &Tablet, query: &str) -> anyhow::Result<QueryResult>;

    /// Block until stream `uid` has applied up to `position`.
    ///
    /// Implementations return an error containing `"not found"` when the
    /// stream does not exist; callers treat that as already caught up.
    async fn vreplication_wait_for_pos(
        &self,
        tablet: &Tablet,
        uid: u32,
        position: &str,
    ) -> anyhow::Result<()>;
}
