//! Drain waiter: block until a shard's tablets of one type report zero QPS.
//!
//! Drain detection is advisory. A zero QPS reading is a single observation
//! and traffic may resume right after; callers still have to sequence the
//! hard quiesce (deny query service plus refresh) after this returns.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, ErrorRecorder, Result};
use crate::topo::{Tablet, TabletType};
use crate::Coordinator;

/// Health snapshot for one tablet.
#[derive(Debug, Clone)]
pub struct TabletHealth {
    pub tablet: Tablet,
    /// Queries per second the tablet currently reports.
    pub qps: f64,
}

/// Healthcheck module knobs forwarded to the discovery implementation.
#[derive(Debug, Clone, Copy)]
pub struct HealthCheckOptions {
    pub topology_refresh: Duration,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

/// Discovery seam: builds one shard watcher per cell.
#[async_trait]
pub trait ShardHealthFactory: Send + Sync {
    async fn watch_shard(
        &self,
        cell: &str,
        keyspace: &str,
        shard: &str,
        options: &HealthCheckOptions,
    ) -> anyhow::Result<Box<dyn ShardHealthWatcher>>;
}

/// Live health view over one cell's tablets for a shard. Dropping the watcher
/// stops the underlying watch.
#[async_trait]
pub trait ShardHealthWatcher: Send + Sync {
    /// Block until at least one healthy tablet of the type is visible.
    async fn wait_for_tablets(&self, tablet_type: TabletType) -> anyhow::Result<()>;

    /// Snapshot of the currently healthy tablets of the type.
    async fn healthy_stats(&self, tablet_type: TabletType) -> Vec<TabletHealth>;
}

/// Per-operation drain timing parameters.
#[derive(Debug, Clone, Copy)]
pub struct DrainParams {
    /// Sleep between QPS polls.
    pub retry_delay: Duration,
    pub health_check_topology_refresh: Duration,
    pub health_check_retry_delay: Duration,
    pub health_check_timeout: Duration,
    /// Warm-up before the first poll so the watcher has seen every tablet.
    pub initial_wait: Duration,
}

impl Coordinator {
    /// Block until every healthy tablet of `served_type` in the selected
    /// cells (all cells when `None`) reports a QPS of zero, or `ctx` is
    /// cancelled. Cancellation returns a diagnostic listing the tablets that
    /// had not drained.
    pub async fn wait_for_drain(
        &self,
        ctx: &CancellationToken,
        health: &dyn ShardHealthFactory,
        cells: Option<&[String]>,
        keyspace: &str,
        shard: &str,
        served_type: TabletType,
        params: DrainParams,
    ) -> Result<()> {
        let cells: Vec<String> = match cells {
            Some(cells) => cells.to_vec(),
            None => self.ts.get_cell_names().await.map_err(|err| {
                Error::DrainFailed(format!("failed to retrieve list of all cells: {err}"))
            })?,
        };

        let rec = ErrorRecorder::new();
        let mut tasks = FuturesUnordered::new();
        for cell in &cells {
            tasks.push(wait_for_drain_in_cell(
                ctx, health, cell, keyspace, shard, served_type, params,
            ));
        }
        while let Some(result) = tasks.next().await {
            rec.record_result(result);
        }
        rec.into_result()
    }
}

async fn wait_for_drain_in_cell(
    ctx: &CancellationToken,
    health: &dyn ShardHealthFactory,
    cell: &str,
    keyspace: &str,
    shard: &str,
    served_type: TabletType,
    params: DrainParams,
) -> Result<()> {
    let options = HealthCheckOptions {
        topology_refresh: params.health_check_topology_refresh,
        retry_delay: params.health_check_retry_delay,
        timeout: params.health_check_timeout,
    };
    let watcher = health
        .watch_shard(cell, keyspace, shard, &options)
        .await
        .map_err(|err| {
            Error::DrainFailed(format!("{cell}: failed to watch {keyspace}/{shard}: {err}"))
        })?;

    watcher.wait_for_tablets(served_type).await.map_err(|err| {
        Error::DrainFailed(format!(
            "{cell}: error waiting for initial {served_type} tablets for {keyspace}/{shard}: {err}"
        ))
    })?;

    tracing::info!(
        cell,
        initial_wait = ?params.initial_wait,
        "waiting so the discovery module sees health from all tablets"
    );
    tokio::select! {
        _ = ctx.cancelled() => {}
        _ = tokio::time::sleep(params.initial_wait) => {}
    }

    let start = std::time::Instant::now();
    loop {
        let healthy = watcher.healthy_stats(served_type).await;
        let (drained, not_drained): (Vec<_>, Vec<_>) =
            healthy.iter().partition(|th| th.qps == 0.0);

        if not_drained.is_empty() {
            tracing::info!(
                cell,
                tablets = healthy.len(),
                elapsed = ?start.elapsed(),
                "all healthy tablets drained"
            );
            return Ok(());
        }

        tracing::info!(
            cell,
            drained = drained.len(),
            total = healthy.len(),
            "waiting for healthy tablets to drain"
        );

        tokio::select! {
            _ = ctx.cancelled() => {
                let listing: Vec<String> = not_drained
                    .iter()
                    .map(|&th| format_tablet_health(th))
                    .collect();
                return Err(Error::DrainFailed(format!(
                    "{cell}: drain of {served_type} tablets in {keyspace}/{shard} cancelled; \
                     only {}/{} tablets were drained; not drained: {}",
                    drained.len(),
                    healthy.len(),
                    listing.join("; ")
                )));
            }
            _ = tokio::time::sleep(params.retry_delay) => {}
        }
    }
}

fn format_tablet_health(th: &TabletHealth) -> String {
    let web_url = match th.tablet.port_map.get("vt") {
        Some(port) => format!("http://{}:{port}/", th.tablet.hostname),
        None => "unknown http port".to_string(),
    };
    format!("{}: {} qps: {}", th.tablet.alias, web_url, th.qps)
}
