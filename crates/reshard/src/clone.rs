//! Clone initiators: create the initial VReplication streams that turn a
//! shard set into resharding destinations.
//!
//! Streams are created `Stopped` and flipped to `Init` only after every
//! matching `SourceShard` entry landed on the destination shard record, so a
//! half-created clone never replicates.

use tokio_util::sync::CancellationToken;

use crate::error::{Error, ErrorRecorder, Result};
use crate::topo::store::update_shard_fields;
use crate::topo::{key_range_string, KeyRange, SourceShard, TopoError};
use crate::vreplication::{
    create_vreplication, select_frozen, select_workflow, update_vreplication_state, BinlogSource,
    Filter, Rule, StreamState,
};
use crate::{cancellable, Coordinator};

use futures_util::stream::{FuturesUnordered, StreamExt};

const CLONE_WORKFLOW: &str = "VSplitClone";

impl Coordinator {
    /// Start a horizontal clone: one stream per (destination, source) pair,
    /// filtered to the destination's key range.
    pub async fn split_clone(
        &self,
        ctx: &CancellationToken,
        keyspace: &str,
        from: &[String],
        to: &[String],
    ) -> Result<()> {
        let mut from_shards = Vec::with_capacity(from.len());
        for shard in from {
            from_shards.push(self.ts.get_shard(keyspace, shard).await?);
        }
        let mut to_shards = Vec::with_capacity(to.len());
        for shard in to {
            to_shards.push(self.ts.get_shard(keyspace, shard).await?);
        }

        self.validate_new_workflow(ctx, keyspace, CLONE_WORKFLOW).await?;

        for dest in &to_shards {
            let tablet = self.primary_tablet(dest).await?;
            let db_name = tablet.db_name();
            let mut uids = Vec::with_capacity(from_shards.len());
            for source in &from_shards {
                let bls = BinlogSource {
                    keyspace: keyspace.to_string(),
                    shard: source.shard_name.clone(),
                    key_range: None,
                    filter: Some(Filter {
                        rules: vec![Rule {
                            match_expr: "/.*".to_string(),
                            filter: key_range_string(dest.shard.key_range.as_ref()),
                        }],
                    }),
                };
                let cmd =
                    create_vreplication(CLONE_WORKFLOW, &bls, "", StreamState::Stopped, &db_name);
                let qr = cancellable(ctx, async {
                    self.tmc
                        .vreplication_exec(&tablet, &cmd)
                        .await
                        .map_err(|err| Error::tablet(&tablet.alias, err))
                })
                .await?;
                let uid = qr.insert_id as u32;
                self.source_shard_add(
                    keyspace,
                    &dest.shard_name,
                    uid,
                    keyspace,
                    &source.shard_name,
                    dest.shard.key_range.clone(),
                    &[],
                )
                .await?;
                uids.push(uid);
            }
            // Only start replication once all metadata exists.
            for uid in uids {
                let cmd = update_vreplication_state(uid, StreamState::Init);
                cancellable(ctx, async {
                    self.tmc
                        .vreplication_exec(&tablet, &cmd)
                        .await
                        .map_err(|err| Error::tablet(&tablet.alias, err))?;
                    Ok(())
                })
                .await?;
            }
        }
        self.refresh_primary_tablets(ctx, &to_shards).await
    }

    /// Start a vertical clone: a single table-filtered stream from the source
    /// keyspace's only shard into the destination keyspace's only shard.
    pub async fn vertical_split_clone(
        &self,
        ctx: &CancellationToken,
        from_keyspace: &str,
        to_keyspace: &str,
        tables: &[String],
    ) -> Result<()> {
        if tables.is_empty() {
            return Err(Error::precondition(
                "vertical clone requires a non-empty tables list",
            ));
        }
        let source = self.ts.get_only_shard(from_keyspace).await?;
        let dest = self.ts.get_only_shard(to_keyspace).await?;

        self.validate_new_workflow(ctx, to_keyspace, CLONE_WORKFLOW).await?;

        let tablet = self.primary_tablet(&dest).await?;
        let bls = BinlogSource {
            keyspace: from_keyspace.to_string(),
            shard: source.shard_name.clone(),
            key_range: None,
            filter: Some(Filter {
                rules: tables
                    .iter()
                    .map(|table| Rule {
                        match_expr: table.clone(),
                        filter: String::new(),
                    })
                    .collect(),
            }),
        };
        let cmd =
            create_vreplication(CLONE_WORKFLOW, &bls, "", StreamState::Stopped, &tablet.db_name());
        let qr = cancellable(ctx, async {
            self.tmc
                .vreplication_exec(&tablet, &cmd)
                .await
                .map_err(|err| Error::tablet(&tablet.alias, err))
        })
        .await?;
        let uid = qr.insert_id as u32;
        self.source_shard_add(
            to_keyspace,
            &dest.shard_name,
            uid,
            from_keyspace,
            &source.shard_name,
            None,
            tables,
        )
        .await?;

        let cmd = update_vreplication_state(uid, StreamState::Init);
        cancellable(ctx, async {
            self.tmc
                .vreplication_exec(&tablet, &cmd)
                .await
                .map_err(|err| Error::tablet(&tablet.alias, err))?;
            Ok(())
        })
        .await?;

        self.refresh_primary_tablets(ctx, std::slice::from_ref(&dest)).await
    }

    /// Record an inbound stream on a destination shard record. A uid can
    /// only be bound once.
    #[allow(clippy::too_many_arguments)]
    pub async fn source_shard_add(
        &self,
        keyspace: &str,
        shard: &str,
        uid: u32,
        source_keyspace: &str,
        source_shard: &str,
        key_range: Option<KeyRange>,
        tables: &[String],
    ) -> Result<()> {
        update_shard_fields(self.ts.as_ref(), keyspace, shard, |s| {
            if s.source_shards.iter().any(|ss| ss.uid == uid) {
                return Err(TopoError::InvalidUpdate {
                    path: format!("{keyspace}/{shard}"),
                    reason: format!("source shard uid {uid} is already in use"),
                });
            }
            s.source_shards.push(SourceShard {
                uid,
                keyspace: source_keyspace.to_string(),
                shard: source_shard.to_string(),
                key_range: key_range.clone(),
                tables: tables.to_vec(),
            });
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Refuse a clone when the workflow already exists on any shard primary
    /// of the keyspace, or when a leftover frozen stream is still present.
    async fn validate_new_workflow(
        &self,
        ctx: &CancellationToken,
        keyspace: &str,
        workflow: &str,
    ) -> Result<()> {
        let shards = self.ts.find_all_shards_in_keyspace(keyspace).await?;
        cancellable(ctx, async {
            let rec = ErrorRecorder::new();
            let mut tasks = FuturesUnordered::new();
            for si in &shards {
                if si.shard.primary_alias.is_none() {
                    rec.record(Error::precondition(format!(
                        "shard has no primary: {}",
                        si.shard_name
                    )));
                    continue;
                }
                tasks.push(async move {
                    let tablet = self.primary_tablet(si).await?;
                    let db_name = tablet.db_name();

                    let qr = self
                        .tmc
                        .vreplication_exec(&tablet, &select_workflow(&db_name, workflow))
                        .await
                        .map_err(|err| Error::tablet(&tablet.alias, err))?;
                    if !qr.rows.is_empty() {
                        return Err(Error::precondition(format!(
                            "workflow {workflow} already exists in keyspace {keyspace} on tablet {}",
                            tablet.alias
                        )));
                    }

                    let qr = self
                        .tmc
                        .vreplication_exec(&tablet, &select_frozen(&db_name))
                        .await
                        .map_err(|err| Error::tablet(&tablet.alias, err))?;
                    if !qr.rows.is_empty() {
                        return Err(Error::precondition(format!(
                            "found previous frozen workflow on tablet {}, please review and \
                             delete it first before creating a new workflow",
                            tablet.alias
                        )));
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
}
