//! End-to-end horizontal resharding: clone, cancel, served-type migration
//! and primary cutover against the in-memory topology.

mod common;

use std::time::Duration;

use common::split_fixture;
use reshard::error::Error;
use reshard::topo::{KeyspaceIdType, TabletAlias, TabletType, TopoError, TopoServer};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn split_clone_creates_streams_and_source_shards() {
    let fx = split_fixture().await;
    let ctx = CancellationToken::new();

    fx.coordinator
        .split_clone(&ctx, "ks", &["0".to_string()], &["-80".to_string(), "80-".to_string()])
        .await
        .unwrap();

    for (shard, uid) in [("-80", 200u32), ("80-", 300u32)] {
        let si = fx.ts.get_shard("ks", shard).await.unwrap();
        assert_eq!(si.shard.source_shards.len(), 1, "one stream per source");
        let ss = &si.shard.source_shards[0];
        assert_eq!(ss.keyspace, "ks");
        assert_eq!(ss.shard, "0");
        assert_eq!(ss.key_range, si.shard.key_range, "filter range is the destination's own");
        assert!(ss.tables.is_empty());

        let streams = fx.tmc.streams(&TabletAlias::new("zone1", uid));
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].workflow, "VSplitClone");
        assert_eq!(streams[0].state, "Init", "streams start only after metadata is recorded");
        assert_eq!(streams[0].db_name, "vt_ks");
    }

    // The source record is untouched by the clone.
    let source = fx.ts.get_shard("ks", "0").await.unwrap();
    assert!(source.shard.source_shards.is_empty());
    assert!(source.shard.tablet_controls.is_empty());
    assert!(source.shard.is_primary_serving);

    // A second clone against the same destinations is refused.
    let err = fx
        .coordinator
        .split_clone(&ctx, "ks", &["0".to_string()], &["-80".to_string(), "80-".to_string()])
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("already exists"),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn show_resharding_reports_both_sides() {
    let fx = split_fixture().await;
    let ctx = CancellationToken::new();
    fx.coordinator
        .split_clone(&ctx, "ks", &["0".to_string()], &["-80".to_string(), "80-".to_string()])
        .await
        .unwrap();

    let report = fx
        .coordinator
        .show_resharding(&ctx, "ks", "-80")
        .await
        .unwrap();
    let rendered = report.to_string();
    assert!(rendered.contains("Horizontal Resharding for ks"));
    assert!(rendered.contains("ks/0"));
    assert!(rendered.contains("ks/-80"));
    assert!(rendered.contains("ks/80-"));
    assert!(rendered.contains("VSplitClone"), "stream rows are included:\n{rendered}");
}

#[tokio::test]
async fn cancel_after_clone_restores_topology() {
    let fx = split_fixture().await;
    let ctx = CancellationToken::new();

    let before: Vec<_> = fx
        .ts
        .find_all_shards_in_keyspace("ks")
        .await
        .unwrap()
        .into_iter()
        .map(|si| (si.shard_name.clone(), si.shard))
        .collect();

    fx.coordinator
        .split_clone(&ctx, "ks", &["0".to_string()], &["-80".to_string(), "80-".to_string()])
        .await
        .unwrap();
    fx.coordinator
        .cancel_resharding(&ctx, "ks", "-80")
        .await
        .unwrap();

    let after: Vec<_> = fx
        .ts
        .find_all_shards_in_keyspace("ks")
        .await
        .unwrap()
        .into_iter()
        .map(|si| (si.shard_name.clone(), si.shard))
        .collect();
    assert_eq!(before, after, "cancel leaves shard records as before the clone");

    for uid in [200u32, 300] {
        assert!(
            fx.tmc.streams(&TabletAlias::new("zone1", uid)).is_empty(),
            "clone streams are deleted"
        );
    }
}

#[tokio::test]
async fn migrate_rdonly_then_replica_moves_the_serving_directory() {
    let fx = split_fixture().await;
    let ctx = CancellationToken::new();
    fx.coordinator
        .split_clone(&ctx, "ks", &["0".to_string()], &["-80".to_string(), "80-".to_string()])
        .await
        .unwrap();

    for served_type in [TabletType::Rdonly, TabletType::Replica] {
        fx.coordinator
            .migrate_served_types(&ctx, "ks", "-80", None, served_type, false, false, WAIT, false)
            .await
            .unwrap();
    }

    let sk = fx.ts.get_srv_keyspace("zone1", "ks").await.unwrap();
    for served_type in [TabletType::Rdonly, TabletType::Replica] {
        let names: Vec<&str> = sk
            .partition(served_type)
            .unwrap()
            .shard_references
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(names, ["-80", "80-"], "{served_type} serves from the new shards");
    }
    let primary: Vec<&str> = sk
        .partition(TabletType::Primary)
        .unwrap()
        .shard_references
        .iter()
        .map(|r| r.name.as_str())
        .collect();
    assert_eq!(primary, ["0"], "primary is still on the source");

    // The source shard denies the migrated types.
    let source = fx.ts.get_shard("ks", "0").await.unwrap();
    for served_type in [TabletType::Rdonly, TabletType::Replica] {
        let tc = source.shard.get_tablet_control(served_type).unwrap();
        assert!(tc.deny_query_service);
    }
    assert!(fx.events.statuses().iter().any(|s| s == "finished"));
}

#[tokio::test]
async fn migrate_replica_forward_then_reverse_round_trips() {
    let fx = split_fixture().await;
    let ctx = CancellationToken::new();
    let initial = fx.ts.get_srv_keyspace("zone1", "ks").await.unwrap();

    fx.coordinator
        .split_clone(&ctx, "ks", &["0".to_string()], &["-80".to_string(), "80-".to_string()])
        .await
        .unwrap();
    fx.coordinator
        .migrate_served_types(&ctx, "ks", "-80", None, TabletType::Replica, false, false, WAIT, false)
        .await
        .unwrap();
    fx.coordinator
        .migrate_served_types(&ctx, "ks", "-80", None, TabletType::Replica, true, false, WAIT, false)
        .await
        .unwrap();

    let after = fx.ts.get_srv_keyspace("zone1", "ks").await.unwrap();
    assert_eq!(initial, after, "forward then reverse restores the directory");
}

#[tokio::test]
async fn migrate_primary_with_reverse_replication() {
    let fx = split_fixture().await;
    let ctx = CancellationToken::new();
    fx.coordinator
        .split_clone(&ctx, "ks", &["0".to_string()], &["-80".to_string(), "80-".to_string()])
        .await
        .unwrap();
    for served_type in [TabletType::Rdonly, TabletType::Replica] {
        fx.coordinator
            .migrate_served_types(&ctx, "ks", "-80", None, served_type, false, false, WAIT, false)
            .await
            .unwrap();
    }

    fx.coordinator
        .migrate_served_types(&ctx, "ks", "-80", None, TabletType::Primary, false, false, WAIT, true)
        .await
        .unwrap();

    // Ex-source: writes off, reverse streams recorded and running, unfrozen.
    let source = fx.ts.get_shard("ks", "0").await.unwrap();
    assert!(!source.shard.is_primary_serving);
    let reverse_targets: Vec<&str> = source
        .shard
        .source_shards
        .iter()
        .map(|ss| ss.shard.as_str())
        .collect();
    assert_eq!(reverse_targets, ["-80", "80-"]);
    let tc = source.shard.get_tablet_control(TabletType::Primary).unwrap();
    assert!(!tc.frozen, "frozen clears once reverse replication runs");

    let source_streams = fx.tmc.streams(&TabletAlias::new("zone1", 100));
    assert_eq!(source_streams.len(), 2);
    for stream in &source_streams {
        assert_eq!(stream.workflow, "ReversedResharding");
        assert_eq!(stream.state, "Running");
        assert!(stream.pos.starts_with("pos-"), "starts at the destination's cutover position");
    }

    // Destinations: serving writes, clone streams gone.
    for (shard, uid) in [("-80", 200u32), ("80-", 300u32)] {
        let si = fx.ts.get_shard("ks", shard).await.unwrap();
        assert!(si.shard.is_primary_serving);
        assert!(si.shard.source_shards.is_empty());
        assert!(fx.tmc.streams(&TabletAlias::new("zone1", uid)).is_empty());
    }

    let sk = fx.ts.get_srv_keyspace("zone1", "ks").await.unwrap();
    let primary: Vec<&str> = sk
        .partition(TabletType::Primary)
        .unwrap()
        .shard_references
        .iter()
        .map(|r| r.name.as_str())
        .collect();
    assert_eq!(primary, ["-80", "80-"]);
    assert!(fx.events.statuses().iter().any(|s| s == "finished"));
}

#[tokio::test]
async fn primary_migration_requires_other_types_first() {
    let fx = split_fixture().await;
    let ctx = CancellationToken::new();
    fx.coordinator
        .split_clone(&ctx, "ks", &["0".to_string()], &["-80".to_string(), "80-".to_string()])
        .await
        .unwrap();
    // Only RDONLY migrated; REPLICA still points at the source.
    fx.coordinator
        .migrate_served_types(&ctx, "ks", "-80", None, TabletType::Rdonly, false, false, WAIT, false)
        .await
        .unwrap();

    let err = fx
        .coordinator
        .migrate_served_types(&ctx, "ks", "-80", None, TabletType::Primary, false, false, WAIT, false)
        .await
        .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("migrated first"), "unexpected error: {msg}");
    assert!(msg.contains("REPLICA"), "names the missing type: {msg}");
}

#[tokio::test]
async fn primary_migration_input_constraints() {
    let fx = split_fixture().await;
    let ctx = CancellationToken::new();
    let cells = vec!["zone1".to_string()];

    for (cells, reverse, skip) in [
        (None, true, false),
        (None, false, true),
        (Some(cells.as_slice()), false, false),
    ] {
        let err = fx
            .coordinator
            .migrate_served_types(&ctx, "ks", "-80", cells, TabletType::Primary, reverse, skip, WAIT, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)), "unexpected: {err}");
    }
}

#[tokio::test]
async fn set_keyspace_sharding_info_requires_force_to_change() {
    let fx = split_fixture().await;
    let ctx = CancellationToken::new();

    fx.coordinator
        .set_keyspace_sharding_info(&ctx, "ks", "keyspace_id", KeyspaceIdType::Uint64, false)
        .await
        .unwrap();

    let err = fx
        .coordinator
        .set_keyspace_sharding_info(&ctx, "ks", "other_column", KeyspaceIdType::Uint64, false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("use force"), "unexpected: {err}");

    fx.coordinator
        .set_keyspace_sharding_info(&ctx, "ks", "other_column", KeyspaceIdType::Bytes, true)
        .await
        .unwrap();
    let ki = fx.ts.get_keyspace("ks").await.unwrap();
    assert_eq!(ki.keyspace.sharding_column_name, "other_column");
    assert_eq!(ki.keyspace.sharding_column_type, KeyspaceIdType::Bytes);
}

#[tokio::test]
async fn concurrent_migration_fails_at_lock_acquisition() {
    let fx = split_fixture().await;
    let ctx = CancellationToken::new();
    let _held = fx.ts.lock_keyspace("ks", "other migration").await.unwrap();

    let err = fx
        .coordinator
        .migrate_served_types(&ctx, "ks", "-80", None, TabletType::Replica, false, false, WAIT, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Topo(TopoError::LockHeld { .. })), "unexpected: {err}");
}

#[tokio::test]
async fn catchup_timeout_compensates_before_the_freeze() {
    let fx = split_fixture().await;
    let ctx = CancellationToken::new();
    fx.coordinator
        .split_clone(&ctx, "ks", &["0".to_string()], &["-80".to_string(), "80-".to_string()])
        .await
        .unwrap();
    for served_type in [TabletType::Rdonly, TabletType::Replica] {
        fx.coordinator
            .migrate_served_types(&ctx, "ks", "-80", None, served_type, false, false, WAIT, false)
            .await
            .unwrap();
    }

    fx.tmc
        .hang_wait_for_pos
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let err = fx
        .coordinator
        .migrate_served_types(
            &ctx,
            "ks",
            "-80",
            None,
            TabletType::Primary,
            false,
            false,
            Duration::from_millis(50),
            false,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CatchupTimeout { .. }), "unexpected: {err}");

    // Compensation re-enabled the source: no primary control left, still
    // primary-serving, and the destinations keep their streams.
    let source = fx.ts.get_shard("ks", "0").await.unwrap();
    assert!(source.shard.get_tablet_control(TabletType::Primary).is_none());
    assert!(source.shard.is_primary_serving);
    let dest = fx.ts.get_shard("ks", "-80").await.unwrap();
    assert_eq!(dest.shard.source_shards.len(), 1);
    assert!(fx
        .events
        .statuses()
        .iter()
        .any(|s| s.starts_with("failed: ")));
}
