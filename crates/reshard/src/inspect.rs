//! Resharding inspection and cancellation.

use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::topo::overlap::{find_overlapping_shards, find_source_dest, overlapping_shards_for_shard};
use crate::topo::serving::shard_is_serving;
use crate::topo::store::update_shard_fields;
use crate::topo::{ServedFrom, ShardInfo, SourceShard, TabletControl};
use crate::vreplication::{delete_vreplication, list_vreplication};
use crate::{cancellable, Coordinator};

/// One shard's resharding-relevant state, including its live stream rows.
#[derive(Debug, Clone)]
pub struct ShardReport {
    pub path: String,
    pub source_shards: Vec<SourceShard>,
    pub vreplication_rows: Vec<Vec<String>>,
    pub is_primary_serving: bool,
    pub tablet_controls: Vec<TabletControl>,
}

impl fmt::Display for ShardReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "    Shard: {}", self.path)?;
        if !self.source_shards.is_empty() {
            writeln!(f, "      Source Shards:")?;
            for ss in &self.source_shards {
                writeln!(f, "        {ss}")?;
            }
        }
        if !self.vreplication_rows.is_empty() {
            writeln!(f, "      VReplication:")?;
            for row in &self.vreplication_rows {
                writeln!(f, "        {}", row.join(" | "))?;
            }
        }
        writeln!(f, "      Is Primary Serving: {}", self.is_primary_serving)?;
        if !self.tablet_controls.is_empty() {
            writeln!(f, "      Tablet Controls: {:?}", self.tablet_controls)?;
        }
        Ok(())
    }
}

/// Snapshot of an in-progress resharding, renderable for operators.
#[derive(Debug, Clone)]
pub enum ReshardingReport {
    NotInProgress,
    Horizontal {
        keyspace: String,
        sources: Vec<ShardReport>,
        destinations: Vec<ShardReport>,
    },
    Vertical {
        keyspace: String,
        served_froms: Vec<ServedFrom>,
        source: Box<ShardReport>,
        destination: Box<ShardReport>,
    },
}

impl fmt::Display for ReshardingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReshardingReport::NotInProgress => writeln!(f, "No resharding in progress"),
            ReshardingReport::Horizontal {
                keyspace,
                sources,
                destinations,
            } => {
                writeln!(f, "Horizontal Resharding for {keyspace}:")?;
                writeln!(f, "  Sources:")?;
                for report in sources {
                    write!(f, "{report}")?;
                }
                writeln!(f, "  Destinations:")?;
                for report in destinations {
                    write!(f, "{report}")?;
                }
                Ok(())
            }
            ReshardingReport::Vertical {
                keyspace,
                served_froms,
                source,
                destination,
            } => {
                writeln!(f, "Vertical Resharding for {keyspace}:")?;
                writeln!(f, "  Served From: {served_froms:?}")?;
                writeln!(f, "  Source:")?;
                write!(f, "{source}")?;
                writeln!(f, "  Destination:")?;
                write!(f, "{destination}")
            }
        }
    }
}

impl Coordinator {
    /// Report all resharding-related metadata for the keyspace/shard,
    /// horizontal or vertical depending on the keyspace record.
    pub async fn show_resharding(
        &self,
        ctx: &CancellationToken,
        keyspace: &str,
        shard: &str,
    ) -> Result<ReshardingReport> {
        let ki = self.ts.get_keyspace(keyspace).await?;
        if ki.keyspace.served_froms.is_empty() {
            return self.show_horizontal_resharding(ctx, keyspace, shard).await;
        }
        self.show_vertical_resharding(ctx, keyspace, shard).await
    }

    async fn show_horizontal_resharding(
        &self,
        ctx: &CancellationToken,
        keyspace: &str,
        shard: &str,
    ) -> Result<ReshardingReport> {
        let groups = find_overlapping_shards(self.ts.as_ref(), keyspace).await?;
        let Some(os) = overlapping_shards_for_shard(groups, shard) else {
            return Ok(ReshardingReport::NotInProgress);
        };
        let (sources, destinations) = find_source_dest(os).map_err(Error::Precondition)?;

        let mut source_reports = Vec::with_capacity(sources.len());
        for si in &sources {
            source_reports.push(self.shard_report(ctx, si).await?);
        }
        let mut destination_reports = Vec::with_capacity(destinations.len());
        for si in &destinations {
            destination_reports.push(self.shard_report(ctx, si).await?);
        }
        Ok(ReshardingReport::Horizontal {
            keyspace: keyspace.to_string(),
            sources: source_reports,
            destinations: destination_reports,
        })
    }

    async fn show_vertical_resharding(
        &self,
        ctx: &CancellationToken,
        keyspace: &str,
        shard: &str,
    ) -> Result<ReshardingReport> {
        let ki = self.ts.get_keyspace(keyspace).await?;
        let destination = self.ts.get_shard(keyspace, shard).await?;
        if destination.shard.source_shards.len() != 1
            || destination.shard.source_shards[0].tables.is_empty()
        {
            return Ok(ReshardingReport::NotInProgress);
        }
        let source = self
            .ts
            .get_shard(
                &destination.shard.source_shards[0].keyspace,
                &destination.shard.source_shards[0].shard,
            )
            .await?;
        Ok(ReshardingReport::Vertical {
            keyspace: keyspace.to_string(),
            served_froms: ki.keyspace.served_froms.clone(),
            source: Box::new(self.shard_report(ctx, &source).await?),
            destination: Box::new(self.shard_report(ctx, &destination).await?),
        })
    }

    async fn shard_report(&self, ctx: &CancellationToken, si: &ShardInfo) -> Result<ShardReport> {
        let tablet = self.primary_tablet(si).await?;
        let qr = cancellable(ctx, async {
            self.tmc
                .vreplication_exec(&tablet, &list_vreplication(&tablet.db_name()))
                .await
                .map_err(|err| Error::tablet(&tablet.alias, err))
        })
        .await?;
        Ok(ShardReport {
            path: si.path(),
            source_shards: si.shard.source_shards.clone(),
            vreplication_rows: qr.rows,
            is_primary_serving: si.shard.is_primary_serving,
            tablet_controls: si.shard.tablet_controls.clone(),
        })
    }

    /// Tear down an in-progress resharding, horizontal or vertical. Refused
    /// once any served type has already migrated.
    pub async fn cancel_resharding(
        &self,
        ctx: &CancellationToken,
        keyspace: &str,
        shard: &str,
    ) -> Result<()> {
        let _lock = self.ts.lock_keyspace(keyspace, "CancelResharding").await?;

        let ki = self.ts.get_keyspace(keyspace).await?;
        if ki.keyspace.served_froms.is_empty() {
            return self.cancel_horizontal_resharding(ctx, keyspace, shard).await;
        }
        self.cancel_vertical_resharding(ctx, keyspace, shard).await
    }

    async fn cancel_horizontal_resharding(
        &self,
        ctx: &CancellationToken,
        keyspace: &str,
        shard: &str,
    ) -> Result<()> {
        tracing::info!(keyspace, "finding overlapping shards to cancel resharding");
        let groups = find_overlapping_shards(self.ts.as_ref(), keyspace).await?;
        let os = overlapping_shards_for_shard(groups, shard).ok_or_else(|| {
            Error::precondition(format!(
                "shard {shard} is not involved in any overlapping shards"
            ))
        })?;
        let (_, destinations) = find_source_dest(os).map_err(Error::Precondition)?;

        // Refuse once any destination is already serving somewhere.
        let srv_keyspaces = self.ts.get_srv_keyspace_all_cells(keyspace).await?;
        for si in &destinations {
            for (_, sk) in &srv_keyspaces {
                if shard_is_serving(sk, si) {
                    return Err(Error::precondition(format!(
                        "some served types have migrated for {keyspace}/{shard}, \
                         please undo them before canceling"
                    )));
                }
            }
        }

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
            let updated = update_shard_fields(self.ts.as_ref(), &si.keyspace, &si.shard_name, |s| {
                s.tablet_controls.clear();
                s.source_shards.clear();
                Ok(())
            })
            .await?;
            self.refresh_tablets_by_shard(ctx, &updated, None).await?;
        }
        Ok(())
    }

    async fn cancel_vertical_resharding(
        &self,
        ctx: &CancellationToken,
        keyspace: &str,
        shard: &str,
    ) -> Result<()> {
        tracing::info!(keyspace, "cancelling vertical resharding");
        let destination = self.ts.get_shard(keyspace, shard).await?;
        if destination.shard.source_shards.len() != 1
            || destination.shard.source_shards[0].tables.is_empty()
        {
            return Err(Error::precondition(format!(
                "destination shard {keyspace}/{shard} is not a vertical split target"
            )));
        }
        let source = self
            .ts
            .get_shard(
                &destination.shard.source_shards[0].keyspace,
                &destination.shard.source_shards[0].shard,
            )
            .await?;
        if !source.shard.tablet_controls.is_empty() {
            return Err(Error::precondition(format!(
                "some served types have migrated for {keyspace}/{shard}, \
                 please undo them before canceling"
            )));
        }

        let tablet = self.primary_tablet(&destination).await?;
        let uid = destination.shard.source_shards[0].uid;
        cancellable(ctx, async {
            self.tmc
                .vreplication_exec(&tablet, &delete_vreplication(uid))
                .await
                .map_err(|err| Error::tablet(&tablet.alias, err))?;
            Ok(())
        })
        .await?;

        let updated = update_shard_fields(self.ts.as_ref(), keyspace, shard, |s| {
            s.source_shards.clear();
            Ok(())
        })
        .await?;

        // The destination primary goes back to normal serving.
        self.refresh_primary_tablets(ctx, std::slice::from_ref(&updated)).await
    }
}
