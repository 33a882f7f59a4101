//! Vertical served-from migration: moving a set of tables' serving from a
//! source keyspace to a destination keyspace that clones them.
//!
//! Unlike the horizontal path there is no shard-range swap; the cutover is a
//! denied-tables handover. The destination keyspace's `served_froms`
//! redirections shrink as types migrate, PRIMARY last.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::event::{MigrateServedFromEvent, MigrationEvent};
use crate::topo::serving::{
    check_served_from_migration, get_shard_serving_cells, rebuild_keyspace,
    update_served_from_map, update_source_denied_tables,
};
use crate::topo::store::update_shard_fields;
use crate::topo::{KeyspaceInfo, ShardInfo, TabletType, TopoError};
use crate::vreplication::delete_vreplication;
use crate::{cancellable, Coordinator};

impl Coordinator {
    /// Migrate one served type of a vertical split from the source keyspace
    /// to the destination keyspace owning `keyspace/shard`.
    pub async fn migrate_served_from(
        &self,
        ctx: &CancellationToken,
        keyspace: &str,
        shard: &str,
        served_type: TabletType,
        cells: Option<&[String]>,
        reverse: bool,
        filtered_replication_wait: Duration,
    ) -> Result<()> {
        let ki = self.ts.get_keyspace(keyspace).await?;
        if ki.keyspace.served_froms.is_empty() {
            return Err(Error::precondition(format!(
                "destination keyspace {keyspace} is not a vertical split target"
            )));
        }

        let si = self.ts.get_shard(keyspace, shard).await?;
        if si.shard.source_shards.len() != 1 || si.shard.source_shards[0].tables.is_empty() {
            return Err(Error::precondition(format!(
                "destination shard {keyspace}/{shard} is not a vertical split target"
            )));
        }
        let source_keyspace = si.shard.source_shards[0].keyspace.clone();

        // Validate before locking; re-checked under the lock by the record
        // update itself.
        check_served_from_migration(
            keyspace,
            &ki.keyspace,
            served_type,
            cells,
            &source_keyspace,
            !reverse,
        )
        .map_err(Error::Precondition)?;

        // Source keyspace first, always, so two concurrent opposite-direction
        // migrations cannot deadlock.
        let _source_lock = self
            .ts
            .lock_keyspace(&source_keyspace, &format!("MigrateServedFrom({served_type})"))
            .await?;
        let _dest_lock = self
            .ts
            .lock_keyspace(keyspace, &format!("MigrateServedFrom({served_type})"))
            .await?;

        self.migrate_served_from_locked(ctx, &ki, &si, served_type, cells, reverse, filtered_replication_wait)
            .await?;

        rebuild_keyspace(self.ts.as_ref(), keyspace, cells).await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn migrate_served_from_locked(
        &self,
        ctx: &CancellationToken,
        ki: &KeyspaceInfo,
        destination_shard: &ShardInfo,
        served_type: TabletType,
        cells: Option<&[String]>,
        reverse: bool,
        filtered_replication_wait: Duration,
    ) -> Result<()> {
        // Re-read and update the keyspace record in memory; it is written
        // back mid-sequence by the type-specific migrator.
        let mut ki = self.ts.get_keyspace(&ki.name).await?;
        let name = ki.name.clone();
        let source_keyspace = destination_shard.shard.source_shards[0].keyspace.clone();
        if reverse {
            update_served_from_map(
                &name,
                &mut ki.keyspace,
                served_type,
                cells,
                &source_keyspace,
                false,
                &[],
            )
            .map_err(Error::Precondition)?;
        } else {
            let serving_cells = get_shard_serving_cells(self.ts.as_ref(), destination_shard).await?;
            update_served_from_map(
                &name,
                &mut ki.keyspace,
                served_type,
                cells,
                &source_keyspace,
                true,
                &serving_cells,
            )
            .map_err(Error::Precondition)?;
        }

        // Re-read and re-check the destination shard under the lock.
        let destination_shard = self
            .ts
            .get_shard(&destination_shard.keyspace, &destination_shard.shard_name)
            .await?;
        if destination_shard.shard.source_shards.len() != 1 {
            return Err(Error::precondition(format!(
                "destination shard {} is not a vertical split target",
                destination_shard.path()
            )));
        }
        let tables = destination_shard.shard.source_shards[0].tables.clone();

        let source_shard = self
            .ts
            .get_shard(
                &destination_shard.shard.source_shards[0].keyspace,
                &destination_shard.shard.source_shards[0].shard,
            )
            .await?;

        let event = MigrationEvent::ServedFrom(MigrateServedFromEvent {
            keyspace: ki.name.clone(),
            source_shard: source_shard.path(),
            destination_shard: destination_shard.path(),
            served_type,
            reverse,
        });
        self.dispatch(&event, "start");

        let result = if served_type == TabletType::Primary {
            self.primary_migrate_served_from(
                ctx,
                &event,
                &ki,
                &source_shard,
                &destination_shard,
                &tables,
                filtered_replication_wait,
            )
            .await
        } else {
            self.replica_migrate_served_from(
                ctx,
                &event,
                &ki,
                &source_shard,
                served_type,
                cells,
                reverse,
                &tables,
            )
            .await
        };
        if result.is_ok() {
            self.dispatch(&event, "finished");
        }
        self.dispatch_result(&event, &result);
        result
    }

    /// REPLICA/RDONLY handover: keyspace redirection plus source denied
    /// tables, reversible and cell-scopable. No freeze, no catch-up.
    #[allow(clippy::too_many_arguments)]
    async fn replica_migrate_served_from(
        &self,
        ctx: &CancellationToken,
        event: &MigrationEvent,
        ki: &KeyspaceInfo,
        source_shard: &ShardInfo,
        served_type: TabletType,
        cells: Option<&[String]>,
        reverse: bool,
        tables: &[String],
    ) -> Result<()> {
        self.dispatch(event, "updating keyspace");
        cancellable(ctx, async {
            self.ts.update_keyspace(ki).await?;
            Ok(())
        })
        .await?;

        self.dispatch(event, "updating source shard");
        let path = source_shard.path();
        cancellable(ctx, async {
            update_shard_fields(
                self.ts.as_ref(),
                &source_shard.keyspace,
                &source_shard.shard_name,
                |shard| {
                    update_source_denied_tables(shard, served_type, cells, reverse, tables)
                        .map_err(|reason| TopoError::InvalidUpdate {
                            path: path.clone(),
                            reason,
                        })
                },
            )
            .await?;
            Ok(())
        })
        .await?;

        self.dispatch(event, "refreshing source tablets so they update their denied tables");
        self.refresh_tablets_by_shard(ctx, source_shard, cells).await
    }

    /// PRIMARY handover, under one deadline: deny writes on the source, wait
    /// for the destination to catch up, tear the stream down and activate the
    /// destination.
    #[allow(clippy::too_many_arguments)]
    async fn primary_migrate_served_from(
        &self,
        ctx: &CancellationToken,
        event: &MigrationEvent,
        ki: &KeyspaceInfo,
        source_shard: &ShardInfo,
        destination_shard: &ShardInfo,
        tables: &[String],
        filtered_replication_wait: Duration,
    ) -> Result<()> {
        let inner = self.primary_migrate_served_from_steps(
            ctx,
            event,
            ki,
            source_shard,
            destination_shard,
            tables,
        );
        match tokio::time::timeout(filtered_replication_wait, inner).await {
            Ok(result) => result,
            Err(_) => Err(Error::CatchupTimeout {
                what: format!(
                    "primary migration of {} from {}",
                    destination_shard.path(),
                    source_shard.path()
                ),
                wait: filtered_replication_wait,
            }),
        }
    }

    async fn primary_migrate_served_from_steps(
        &self,
        ctx: &CancellationToken,
        event: &MigrationEvent,
        ki: &KeyspaceInfo,
        source_shard: &ShardInfo,
        destination_shard: &ShardInfo,
        tables: &[String],
    ) -> Result<()> {
        let source_tablet = self.primary_tablet(source_shard).await?;
        let destination_tablet = self.primary_tablet(destination_shard).await?;

        self.dispatch(event, "updating source shard");
        let path = source_shard.path();
        cancellable(ctx, async {
            update_shard_fields(
                self.ts.as_ref(),
                &source_shard.keyspace,
                &source_shard.shard_name,
                |shard| {
                    update_source_denied_tables(shard, TabletType::Primary, None, false, tables)
                        .map_err(|reason| TopoError::InvalidUpdate {
                            path: path.clone(),
                            reason,
                        })
                },
            )
            .await?;
            Ok(())
        })
        .await?;

        self.dispatch(event, "refreshing source primary so it updates its denied tables");
        cancellable(ctx, async {
            self.tmc
                .refresh_state(&source_tablet)
                .await
                .map_err(|err| Error::tablet(&source_tablet.alias, err))
        })
        .await?;

        self.dispatch(event, "getting primary position");
        let position = cancellable(ctx, async {
            self.tmc
                .primary_position(&source_tablet)
                .await
                .map_err(|err| Error::tablet(&source_tablet.alias, err))
        })
        .await?;

        self.dispatch(event, "waiting for destination primary to catch up to source primary");
        let uid = destination_shard.shard.source_shards[0].uid;
        cancellable(ctx, async {
            self.tmc
                .vreplication_wait_for_pos(&destination_tablet, uid, &position)
                .await
                .map_err(|err| Error::tablet(&destination_tablet.alias, err))
        })
        .await?;

        self.dispatch(event, "stopping vreplication");
        cancellable(ctx, async {
            self.tmc
                .vreplication_exec(&destination_tablet, &delete_vreplication(uid))
                .await
                .map_err(|err| Error::tablet(&destination_tablet.alias, err))?;
            Ok(())
        })
        .await?;

        self.dispatch(event, "updating keyspace");
        cancellable(ctx, async {
            self.ts.update_keyspace(ki).await?;
            Ok(())
        })
        .await?;

        self.dispatch(event, "updating destination shard");
        let dest_path = destination_shard.path();
        let updated = update_shard_fields(
            self.ts.as_ref(),
            &destination_shard.keyspace,
            &destination_shard.shard_name,
            |shard| {
                if shard.source_shards.len() != 1 {
                    return Err(TopoError::InvalidUpdate {
                        path: dest_path.clone(),
                        reason: "unexpected concurrent access to SourceShards".to_string(),
                    });
                }
                shard.source_shards.clear();
                Ok(())
            },
        )
        .await
        .map_err(|err| match err {
            TopoError::InvalidUpdate { path, reason }
                if reason.contains("unexpected concurrent access") =>
            {
                Error::ConcurrentModification(format!("{path}: {reason}"))
            }
            err => err.into(),
        })?;

        // The refresh makes the destination primary read-write and stops its
        // filtered replication.
        self.dispatch(event, "setting destination shard primary tablets read-write");
        self.refresh_primary_tablets(ctx, std::slice::from_ref(&updated)).await
    }
}
