//! Resharding control plane.
//!
//! Orchestrates moving serving responsibility for a key range from one set of
//! shards to another: horizontal splits/merges within a keyspace and vertical
//! table moves across keyspaces. The orchestrator owns no data path; it
//! drives externally-stored topology records ([`topo::TopoServer`]), fans out
//! RPCs to shard primaries ([`tmclient::TabletManagerClient`]) and configures
//! CDC streams through opaque VReplication statements ([`vreplication`]).
//!
//! Every public operation takes a [`CancellationToken`] observed at each
//! suspension point; cancellation surfaces as [`Error::Cancelled`] so that
//! compensation still runs where the migration state machine allows it.
//! Dropping the returned future instead aborts outstanding RPCs without
//! compensation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod drain;
pub mod error;
pub mod event;
pub mod tmclient;
pub mod topo;
pub mod vreplication;

mod clone;
mod inspect;
mod migrate;
mod vertical;

pub use config::Config;
pub use drain::{
    DrainParams, HealthCheckOptions, ShardHealthFactory, ShardHealthWatcher, TabletHealth,
};
pub use error::{Error, ErrorRecorder, Result};
pub use event::{EventSink, LogSink, MigrationEvent};
pub use inspect::{ReshardingReport, ShardReport};

use event::MigrationEvent as Event;
use tmclient::TabletManagerClient;
use topo::store::update_keyspace_fields;
use topo::{KeyspaceIdType, ShardInfo, Tablet, TopoError, TopoServer};

/// Race a suspension point against cancellation.
pub(crate) async fn cancellable<T>(
    ctx: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = ctx.cancelled() => Err(Error::Cancelled),
        out = fut => out,
    }
}

/// Resharding orchestrator handle.
///
/// Cheap to construct; holds no state beyond its collaborator handles. Mutual
/// exclusion between concurrent invocations comes from topology keyspace
/// locks, not from this struct.
pub struct Coordinator {
    ts: Arc<dyn TopoServer>,
    tmc: Arc<dyn TabletManagerClient>,
    events: Arc<dyn EventSink>,
    config: Config,
}

impl Coordinator {
    pub fn new(ts: Arc<dyn TopoServer>, tmc: Arc<dyn TabletManagerClient>) -> Self {
        Self {
            ts,
            tmc,
            events: Arc::new(LogSink),
            config: Config::from_env(),
        }
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn topo_server(&self) -> &Arc<dyn TopoServer> {
        &self.ts
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Lock a keyspace and set its sharding column name and type. Changing an
    /// already-set value requires `force`.
    pub async fn set_keyspace_sharding_info(
        &self,
        ctx: &CancellationToken,
        keyspace: &str,
        column_name: &str,
        column_type: KeyspaceIdType,
        force: bool,
    ) -> Result<()> {
        let _lock = self
            .ts
            .lock_keyspace(keyspace, "SetKeyspaceShardingInfo")
            .await?;
        cancellable(ctx, async {
            update_keyspace_fields(self.ts.as_ref(), keyspace, |ks| {
                if !ks.sharding_column_name.is_empty()
                    && ks.sharding_column_name != column_name
                    && !force
                {
                    return Err(TopoError::InvalidUpdate {
                        path: keyspace.to_string(),
                        reason: format!(
                            "sharding column name is already set to {}, use force to change it",
                            ks.sharding_column_name
                        ),
                    });
                }
                if ks.sharding_column_type != KeyspaceIdType::Unset
                    && ks.sharding_column_type != column_type
                    && !force
                {
                    return Err(TopoError::InvalidUpdate {
                        path: keyspace.to_string(),
                        reason: format!(
                            "sharding column type is already set to {:?}, use force to change it",
                            ks.sharding_column_type
                        ),
                    });
                }
                ks.sharding_column_name = column_name.to_string();
                ks.sharding_column_type = column_type;
                Ok(())
            })
            .await?;
            Ok(())
        })
        .await
    }

    pub(crate) fn dispatch(&self, event: &Event, status: &str) {
        self.events.update(event, status);
    }

    pub(crate) fn dispatch_result<T>(&self, event: &Event, result: &Result<T>) {
        if let Err(err) = result {
            self.events.update(event, &format!("failed: {err}"));
        }
    }

    /// Resolve a shard's primary tablet record.
    pub(crate) async fn primary_tablet(&self, si: &ShardInfo) -> Result<Tablet> {
        let alias = si
            .shard
            .primary_alias
            .clone()
            .ok_or_else(|| Error::precondition(format!("shard {} has no primary", si.path())))?;
        Ok(self.ts.get_tablet(&alias).await?)
    }

    /// Ping-refresh every shard's primary in parallel.
    pub(crate) async fn refresh_primary_tablets(
        &self,
        ctx: &CancellationToken,
        shards: &[ShardInfo],
    ) -> Result<()> {
        cancellable(ctx, async {
            let rec = ErrorRecorder::new();
            let mut tasks = FuturesUnordered::new();
            for si in shards {
                tasks.push(async move {
                    let tablet = self.primary_tablet(si).await?;
                    tracing::info!(tablet = %tablet.alias, "refreshing primary state");
                    self.tmc
                        .refresh_state(&tablet)
                        .await
                        .map_err(|err| Error::tablet(&tablet.alias, err))
                });
            }
            while let Some(result) = tasks.next().await {
                rec.record_result(result);
            }
            rec.into_result()
        })
        .await
    }

    /// Gather current replication positions from every shard's primary in
    /// parallel. Returns the full map only when every shard succeeded.
    pub(crate) async fn get_primary_positions(
        &self,
        ctx: &CancellationToken,
        shards: &[ShardInfo],
    ) -> Result<HashMap<(String, String), String>> {
        cancellable(ctx, async {
            let rec = ErrorRecorder::new();
            let positions = Mutex::new(HashMap::new());
            let mut tasks = FuturesUnordered::new();
            for si in shards {
                let positions = &positions;
                tasks.push(async move {
                    let tablet = self.primary_tablet(si).await?;
                    tracing::info!(tablet = %tablet.alias, "gathering primary position");
                    let pos = self
                        .tmc
                        .primary_position(&tablet)
                        .await
                        .map_err(|err| Error::tablet(&tablet.alias, err))?;
                    positions
                        .lock()
                        .unwrap()
                        .insert((si.keyspace.clone(), si.shard_name.clone()), pos);
                    Ok(())
                });
            }
            while let Some(result) = tasks.next().await {
                rec.record_result(result);
            }
            drop(tasks);
            rec.into_result()?;
            Ok(positions.into_inner().unwrap())
        })
        .await
    }

    /// Block until every destination's inbound streams have applied up to the
    /// matching source position, each wait under its own `wait` budget. A
    /// stream with no gathered source position, or one the tablet no longer
    /// knows ("not found"), is skipped as already caught up.
    pub(crate) async fn wait_for_filtered_replication(
        &self,
        ctx: &CancellationToken,
        source_positions: &HashMap<(String, String), String>,
        destinations: &[ShardInfo],
        wait: Duration,
    ) -> Result<()> {
        cancellable(ctx, async {
            let rec = ErrorRecorder::new();
            let mut tasks = FuturesUnordered::new();
            for si in destinations {
                tasks.push(async move {
                    let tablet = self.primary_tablet(si).await?;
                    for ss in &si.shard.source_shards {
                        let Some(pos) = source_positions
                            .iter()
                            .find(|((ks, sh), _)| *ks == ss.keyspace && *sh == ss.shard)
                            .map(|(_, pos)| pos.as_str())
                        else {
                            tracing::info!(
                                tablet = %tablet.alias,
                                uid = ss.uid,
                                source_keyspace = %ss.keyspace,
                                source_shard = %ss.shard,
                                "no source position for stream, skipping wait"
                            );
                            continue;
                        };
                        tracing::info!(tablet = %tablet.alias, uid = ss.uid, "waiting for catch-up");
                        let waited = tokio::time::timeout(
                            wait,
                            self.tmc.vreplication_wait_for_pos(&tablet, ss.uid, pos),
                        )
                        .await;
                        match waited {
                            Err(_) => {
                                return Err(Error::CatchupTimeout {
                                    what: format!("{} stream {}", tablet.alias, ss.uid),
                                    wait,
                                })
                            }
                            Ok(Err(err)) if err.to_string().contains("not found") => {
                                tracing::info!(
                                    tablet = %tablet.alias,
                                    uid = ss.uid,
                                    "stream not found, skipping wait"
                                );
                            }
                            Ok(Err(err)) => return Err(Error::tablet(&tablet.alias, err)),
                            Ok(Ok(())) => {
                                tracing::info!(tablet = %tablet.alias, uid = ss.uid, "caught up");
                            }
                        }
                    }
                    Ok(())
                });
            }
            while let Some(result) = tasks.next().await {
                rec.record_result(result);
            }
            rec.into_result()
        })
        .await
    }

    /// Refresh every tablet of a shard, optionally restricted to cells.
    pub(crate) async fn refresh_tablets_by_shard(
        &self,
        ctx: &CancellationToken,
        si: &ShardInfo,
        cells: Option<&[String]>,
    ) -> Result<()> {
        let aliases = self
            .ts
            .get_tablet_aliases_in_shard(&si.keyspace, &si.shard_name)
            .await?;
        cancellable(ctx, async {
            let rec = ErrorRecorder::new();
            let mut tasks = FuturesUnordered::new();
            for alias in aliases
                .iter()
                .filter(|a| cells.is_none_or(|cells| cells.iter().any(|c| *c == a.cell)))
            {
                tasks.push(async move {
                    let tablet = self.ts.get_tablet(alias).await?;
                    self.tmc
                        .refresh_state(&tablet)
                        .await
                        .map_err(|err| Error::tablet(alias, err))
                });
            }
            while let Some(result) = tasks.next().await {
                rec.record_result(result);
            }
            rec.into_result()
        })
        .await
    }
}
