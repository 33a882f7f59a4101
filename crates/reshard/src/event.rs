//! Migration progress events.
//!
//! Operations publish coarse progress strings (`start`, per-phase labels,
//! `finished`, `failed: <error>`) to an [`EventSink`]. The default sink logs
//! through `tracing`; deployments wire their own dispatcher.

use serde::Serialize;

use crate::topo::TabletType;

/// Horizontal served-type migration event payload.
#[derive(Debug, Clone, Serialize)]
pub struct MigrateServedTypesEvent {
    pub keyspace: String,
    pub source_shards: Vec<String>,
    pub destination_shards: Vec<String>,
    pub served_type: TabletType,
    pub reverse: bool,
}

/// Vertical served-from migration event payload.
#[derive(Debug, Clone, Serialize)]
pub struct MigrateServedFromEvent {
    pub keyspace: String,
    pub source_shard: String,
    pub destination_shard: String,
    pub served_type: TabletType,
    pub reverse: bool,
}

#[derive(Debug, Clone, Serialize)]
pub enum MigrationEvent {
    ServedTypes(MigrateServedTypesEvent),
    ServedFrom(MigrateServedFromEvent),
}

/// External event dispatcher seam.
pub trait EventSink: Send + Sync {
    fn update(&self, event: &MigrationEvent, status: &str);
}

/// Default sink: structured log lines.
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn update(&self, event: &MigrationEvent, status: &str) {
        match event {
            MigrationEvent::ServedTypes(ev) => tracing::info!(
                keyspace = %ev.keyspace,
                served_type = %ev.served_type,
                reverse = ev.reverse,
                status,
                "migrate served types"
            ),
            MigrationEvent::ServedFrom(ev) => tracing::info!(
                keyspace = %ev.keyspace,
                served_type = %ev.served_type,
                reverse = ev.reverse,
                status,
                "migrate served from"
            ),
        }
    }
}
