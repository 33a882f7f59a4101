//! Horizontal served-type migration.
//!
//! The non-primary path is a serving-directory swap with query-service
//! bookkeeping. The primary path is the cutover state machine: quiesce
//! sources, wait for destinations to catch up, freeze (point of no return),
//! wire reverse replication, then activate destinations. Failures before the
//! freeze run a compensating cancel that re-enables the sources; failures
//! after it leave the topology for operator repair.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::event::{MigrateServedTypesEvent, MigrationEvent};
use crate::topo::overlap::{find_overlapping_shards, find_source_dest, overlapping_shards_for_shard};
use crate::topo::serving::{
    update_deny_query_service_on_shards, update_frozen_flag, update_shard_records,
};
use crate::topo::store::update_shard_fields;
use crate::topo::{key_range_equal, KeyRange, ShardInfo, SourceShard, TabletType};
use crate::vreplication::{
    create_vreplication, delete_vreplication, start_vreplication, BinlogSource, StreamState,
};
use crate::{cancellable, Coordinator};

impl Coordinator {
    /// Migrate one served type of a keyspace from the overlapping group's
    /// sources to its destinations (or back, for non-primary types with
    /// `reverse`).
    ///
    /// `PRIMARY` migrations must come last, cover all cells, and cannot be
    /// reversed through this call; `reverse_replication` instead starts the
    /// backward streams wired during cutover.
    #[allow(clippy::too_many_arguments)]
    pub async fn migrate_served_types(
        &self,
        ctx: &CancellationToken,
        keyspace: &str,
        shard: &str,
        cells: Option<&[String]>,
        served_type: TabletType,
        reverse: bool,
        skip_refresh_state: bool,
        filtered_replication_wait: Duration,
        reverse_replication: bool,
    ) -> Result<()> {
        if served_type == TabletType::Primary {
            // Once the primary migration completes the source shards are
            // dead; none of the partial modes make sense.
            if reverse {
                return Err(Error::precondition(format!(
                    "cannot migrate primary back to {keyspace}/{shard}"
                )));
            }
            if skip_refresh_state {
                return Err(Error::precondition(format!(
                    "cannot skip refresh state for primary migration on {keyspace}/{shard}"
                )));
            }
            if cells.is_some() {
                return Err(Error::precondition(format!(
                    "cannot specify cells for primary migration on {keyspace}/{shard}"
                )));
            }
        }

        let _lock = self
            .ts
            .lock_keyspace(keyspace, &format!("MigrateServedTypes({served_type})"))
            .await?;

        tracing::info!(keyspace, "finding overlapping shards");
        let groups = find_overlapping_shards(self.ts.as_ref(), keyspace).await?;
        let os = overlapping_shards_for_shard(groups, shard).ok_or_else(|| {
            Error::precondition(format!(
                "shard {shard} is not involved in any overlapping shards"
            ))
        })?;
        let (sources, destinations) = find_source_dest(os).map_err(Error::Precondition)?;

        if served_type == TabletType::Primary {
            self.primary_migrate_served_type(
                ctx,
                keyspace,
                sources,
                destinations,
                filtered_replication_wait,
                reverse_replication,
            )
            .await?;
            // Primary migrate performs its own refreshes.
            return Ok(());
        }

        self.replica_migrate_served_type(ctx, keyspace, &sources, &destinations, cells, served_type, reverse)
            .await?;
        if skip_refresh_state {
            return Ok(());
        }

        // Give in-flight queries on the old tablets time to drain before the
        // refresh shuts their query service.
        let drain_sleep = match served_type {
            TabletType::Replica => self.config.drain_sleep_replica,
            _ => self.config.drain_sleep_rdonly,
        };
        tracing::info!(
            ?drain_sleep,
            "sleeping before shutting down query service on old tablets"
        );
        cancellable(ctx, async {
            tokio::time::sleep(drain_sleep).await;
            Ok(())
        })
        .await?;

        let refresh_shards = if reverse { &destinations } else { &sources };
        let rec = crate::ErrorRecorder::new();
        for si in refresh_shards {
            rec.record_result(self.refresh_tablets_by_shard(ctx, si, cells).await);
        }
        rec.into_result()
    }

    /// REPLICA/RDONLY serving swap; callable in either direction.
    async fn replica_migrate_served_type(
        &self,
        ctx: &CancellationToken,
        keyspace: &str,
        sources: &[ShardInfo],
        destinations: &[ShardInfo],
        cells: Option<&[String]>,
        served_type: TabletType,
        reverse: bool,
    ) -> Result<()> {
        let event = MigrationEvent::ServedTypes(MigrateServedTypesEvent {
            keyspace: keyspace.to_string(),
            source_shards: sources.iter().map(|si| si.shard_name.clone()).collect(),
            destination_shards: destinations.iter().map(|si| si.shard_name.clone()).collect(),
            served_type,
            reverse,
        });
        self.dispatch(&event, "start");

        let result = async {
            let (from_shards, to_shards) = if reverse {
                (destinations, sources)
            } else {
                (sources, destinations)
            };

            self.dispatch(&event, "updating shards to migrate from");
            cancellable(ctx, async {
                update_shard_records(self.ts.as_ref(), from_shards, cells, served_type, true, false)
                    .await?;
                Ok(())
            })
            .await?;

            self.dispatch(&event, "updating shards to migrate to");
            cancellable(ctx, async {
                update_shard_records(self.ts.as_ref(), to_shards, cells, served_type, false, false)
                    .await?;
                Ok(())
            })
            .await?;

            cancellable(ctx, async {
                self.ts
                    .migrate_served_type(keyspace, to_shards, from_shards, served_type, cells)
                    .await?;
                Ok(())
            })
            .await?;

            self.dispatch(&event, "finished");
            Ok(())
        }
        .await;
        self.dispatch_result(&event, &result);
        result
    }

    /// PRIMARY cutover state machine.
    async fn primary_migrate_served_type(
        &self,
        ctx: &CancellationToken,
        keyspace: &str,
        sources: Vec<ShardInfo>,
        destinations: Vec<ShardInfo>,
        filtered_replication_wait: Duration,
        reverse_replication: bool,
    ) -> Result<()> {
        // Every other served type must already point away from the sources.
        let si = &sources[0];
        for (cell, sk) in self.ts.get_srv_keyspace_all_cells(keyspace).await? {
            let mut still_served = BTreeSet::new();
            for partition in &sk.partitions {
                if partition.served_type == TabletType::Primary {
                    continue;
                }
                for shard_ref in &partition.shard_references {
                    if key_range_equal(shard_ref.key_range.as_ref(), si.shard.key_range.as_ref()) {
                        still_served.insert(partition.served_type.to_string());
                    }
                }
            }
            if !still_served.is_empty() {
                let types: Vec<String> = still_served.into_iter().collect();
                return Err(Error::precondition(format!(
                    "cannot migrate PRIMARY away from {} until everything else is migrated; \
                     make sure the following types are migrated first in cell {cell}: {}",
                    si.path(),
                    types.join(", ")
                )));
            }
        }

        let event = MigrationEvent::ServedTypes(MigrateServedTypesEvent {
            keyspace: keyspace.to_string(),
            source_shards: sources.iter().map(|si| si.shard_name.clone()).collect(),
            destination_shards: destinations.iter().map(|si| si.shard_name.clone()).collect(),
            served_type: TabletType::Primary,
            reverse: false,
        });
        self.dispatch(&event, "start");
        let result = self
            .primary_migrate_phases(
                ctx,
                &event,
                keyspace,
                sources,
                destinations,
                filtered_replication_wait,
                reverse_replication,
            )
            .await;
        self.dispatch_result(&event, &result);
        result
    }

    async fn primary_migrate_phases(
        &self,
        ctx: &CancellationToken,
        event: &MigrationEvent,
        keyspace: &str,
        sources: Vec<ShardInfo>,
        destinations: Vec<ShardInfo>,
        filtered_replication_wait: Duration,
        reverse_replication: bool,
    ) -> Result<()> {
        // Phase 1: quiesce the sources.
        // Prove both sides' primaries are reachable before touching serving.
        self.dispatch(event, "disabling query service on all source primary tablets");
        if let Err(err) = self.refresh_primary_tablets(ctx, &sources).await {
            self.cancel_primary_migrate(&sources).await;
            return Err(err);
        }
        if let Err(err) = self.refresh_primary_tablets(ctx, &destinations).await {
            self.cancel_primary_migrate(&sources).await;
            return Err(err);
        }

        if let Err(err) = cancellable(ctx, async {
            update_shard_records(
                self.ts.as_ref(),
                &sources,
                None,
                TabletType::Primary,
                true,
                false,
            )
            .await?;
            Ok(())
        })
        .await
        {
            self.cancel_primary_migrate(&sources).await;
            return Err(err);
        }
        if let Err(err) = self.refresh_primary_tablets(ctx, &sources).await {
            self.cancel_primary_migrate(&sources).await;
            return Err(err);
        }

        self.dispatch(event, "getting positions of source primary tablets");
        let positions = match self.get_primary_positions(ctx, &sources).await {
            Ok(positions) => positions,
            Err(err) => {
                self.cancel_primary_migrate(&sources).await;
                return Err(err);
            }
        };

        self.dispatch(event, "waiting for destination primary tablets to catch up");
        if let Err(err) = self
            .wait_for_filtered_replication(ctx, &positions, &destinations, filtered_replication_wait)
            .await
        {
            self.cancel_primary_migrate(&sources).await;
            return Err(err);
        }

        // Point of no return: freeze the source primary tablet controls.
        let sources = match cancellable(ctx, async {
            Ok(update_frozen_flag(self.ts.as_ref(), &sources, true).await?)
        })
        .await
        {
            Ok(sources) => sources,
            Err(err) => {
                self.cancel_primary_migrate(&sources).await;
                return Err(err);
            }
        };

        // Phase 2: activate the destinations.
        // Reverse streams are always wired so the migration stays reversible;
        // they only start if the caller asked for reverse replication.
        let sources = match self.setup_reverse_replication(ctx, &sources, &destinations).await {
            Ok(sources) => sources,
            Err(err) => {
                // Nothing irreversible happened yet: unfreeze and compensate.
                self.cancel_primary_migrate(&sources).await;
                if let Err(unfreeze_err) =
                    update_frozen_flag(self.ts.as_ref(), &sources, false).await
                {
                    tracing::error!(
                        error = %unfreeze_err,
                        "problem recovering from failed reverse replication setup"
                    );
                }
                return Err(err);
            }
        };

        self.dispatch(event, "updating destination shards");
        cancellable(ctx, async {
            update_deny_query_service_on_shards(
                self.ts.as_ref(),
                &destinations,
                TabletType::Primary,
                None,
                false,
            )
            .await?;
            Ok(())
        })
        .await?;

        let mut activated = Vec::with_capacity(destinations.len());
        for si in &destinations {
            let tablet = self.primary_tablet(si).await?;
            for ss in &si.shard.source_shards {
                cancellable(ctx, async {
                    self.tmc
                        .vreplication_exec(&tablet, &delete_vreplication(ss.uid))
                        .await
                        .map_err(|err| Error::tablet(&tablet.alias, err))?;
                    Ok(())
                })
                .await?;
            }
            let updated = update_shard_fields(self.ts.as_ref(), &si.keyspace, &si.shard_name, |shard| {
                shard.source_shards.clear();
                shard.is_primary_serving = true;
                Ok(())
            })
            .await?;
            activated.push(updated);
        }
        let destinations = activated;

        self.dispatch(event, "setting destination primary tablets read-write");
        self.refresh_primary_tablets(ctx, &destinations).await?;

        cancellable(ctx, async {
            self.ts
                .migrate_served_type(keyspace, &destinations, &sources, TabletType::Primary, None)
                .await?;
            Ok(())
        })
        .await?;

        for si in &sources {
            update_shard_fields(self.ts.as_ref(), &si.keyspace, &si.shard_name, |shard| {
                shard.is_primary_serving = false;
                Ok(())
            })
            .await?;
        }

        if reverse_replication {
            self.start_reverse_replication(ctx, &sources).await?;
            // The frozen flag only comes off once the backward streams run.
            update_frozen_flag(self.ts.as_ref(), &sources, false).await?;
        }

        for si in &destinations {
            self.refresh_tablets_by_shard(ctx, si, None).await?;
        }

        self.dispatch(event, "finished");
        Ok(())
    }

    /// Compensating cancel for pre-freeze failures: re-enable query service
    /// on the sources and refresh them. Errors are logged, never returned,
    /// and the original failure stays the reported one. Runs under a fresh
    /// cancellation scope so a cancelled migration still compensates.
    async fn cancel_primary_migrate(&self, sources: &[ShardInfo]) {
        tracing::info!(
            shards = ?sources.iter().map(ShardInfo::path).collect::<Vec<_>>(),
            "cancelling primary migration, re-enabling source query service"
        );
        if let Err(err) = update_shard_records(
            self.ts.as_ref(),
            sources,
            None,
            TabletType::Primary,
            false,
            true,
        )
        .await
        {
            tracing::error!(error = %err, "failed to re-enable source primary tablets");
            return;
        }
        let ctx = CancellationToken::new();
        if let Err(err) = self.refresh_primary_tablets(&ctx, sources).await {
            tracing::error!(error = %err, "failed to refresh source primary tablets");
        }
    }

    /// Create (but do not start) the destination→source streams that make the
    /// cutover reversible, each starting at the position its destination
    /// primary held. The new stream uids are appended to the source shard
    /// records in one atomic update per source.
    async fn setup_reverse_replication(
        &self,
        ctx: &CancellationToken,
        sources: &[ShardInfo],
        destinations: &[ShardInfo],
    ) -> Result<Vec<ShardInfo>> {
        let mut positions = Vec::with_capacity(destinations.len());
        for dest in destinations {
            let tablet = self.primary_tablet(dest).await?;
            tracing::info!(tablet = %tablet.alias, "gathering destination primary position");
            let pos = cancellable(ctx, async {
                self.tmc
                    .primary_position(&tablet)
                    .await
                    .map_err(|err| Error::tablet(&tablet.alias, err))
            })
            .await?;
            positions.push(pos);
        }

        let mut updated_sources = Vec::with_capacity(sources.len());
        for source in sources {
            if !source.shard.source_shards.is_empty() {
                // Already wired by an earlier attempt.
                updated_sources.push(source.clone());
                continue;
            }
            let tablet = self.primary_tablet(source).await?;
            let db_name = tablet.db_name();
            // An unsharded source replicates the destinations' full range.
            let key_range = Some(source.shard.key_range.clone().unwrap_or_else(KeyRange::default));

            let mut uids = Vec::with_capacity(destinations.len());
            for (dest, pos) in destinations.iter().zip(&positions) {
                let bls = BinlogSource {
                    keyspace: dest.keyspace.clone(),
                    shard: dest.shard_name.clone(),
                    key_range: key_range.clone(),
                    filter: None,
                };
                let cmd =
                    create_vreplication("ReversedResharding", &bls, pos, StreamState::Stopped, &db_name);
                let qr = cancellable(ctx, async {
                    self.tmc
                        .vreplication_exec(&tablet, &cmd)
                        .await
                        .map_err(|err| Error::tablet(&tablet.alias, err))
                })
                .await?;
                let uid = qr.insert_id as u32;
                tracing::info!(
                    source = %source.path(),
                    destination = %dest.path(),
                    uid,
                    position = %pos,
                    "created reverse replication stream"
                );
                uids.push(uid);
            }

            // The source-shard entries must land in one write so a re-run can
            // detect them. On failure the unstarted streams are orphaned.
            let update = update_shard_fields(self.ts.as_ref(), &source.keyspace, &source.shard_name, |shard| {
                for ((dest, _), uid) in destinations.iter().zip(&positions).zip(&uids) {
                    shard.source_shards.push(SourceShard {
                        uid: *uid,
                        keyspace: dest.keyspace.clone(),
                        shard: dest.shard_name.clone(),
                        key_range: dest.shard.key_range.clone(),
                        tables: Vec::new(),
                    });
                }
                Ok(())
            })
            .await;
            match update {
                Ok(updated) => updated_sources.push(updated),
                Err(err) => {
                    return Err(Error::precondition(format!(
                        "failed to set up reverse replication: {err}; unstarted replication \
                         streams for {} need to be deleted: {uids:?}",
                        source.path()
                    )));
                }
            }
        }
        Ok(updated_sources)
    }

    /// Start the reverse streams recorded on the (ex-)source shards.
    async fn start_reverse_replication(
        &self,
        ctx: &CancellationToken,
        sources: &[ShardInfo],
    ) -> Result<()> {
        for source in sources {
            let tablet = self.primary_tablet(source).await?;
            for ss in &source.shard.source_shards {
                tracing::info!(source = %source.path(), uid = ss.uid, "starting reverse replication");
                cancellable(ctx, async {
                    self.tmc
                        .vreplication_exec(&tablet, &start_vreplication(ss.uid))
                        .await
                        .map_err(|err| Error::tablet(&tablet.alias, err))?;
                    Ok(())
                })
                .await?;
            }
        }
        Ok(())
    }
}
