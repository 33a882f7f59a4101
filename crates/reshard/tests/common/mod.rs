//! Shared fixtures for orchestration tests: an in-memory topology, a
//! scripted tablet-manager fake with a per-tablet `_vt.vreplication` table,
//! and a recording event sink.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use reshard::drain::{HealthCheckOptions, ShardHealthFactory, ShardHealthWatcher, TabletHealth};
use reshard::event::{EventSink, MigrationEvent};
use reshard::tmclient::{QueryResult, TabletManagerClient};
use reshard::topo::memory::MemoryTopoServer;
use reshard::topo::TopoServer;
use reshard::topo::store::update_shard_fields;
use reshard::topo::{
    Keyspace, KeyspacePartition, ServedFrom, ShardReference, SrvKeyspace, Tablet, TabletAlias,
    TabletType,
};
use reshard::{Config, Coordinator};

static TRACING: Once = Once::new();

/// Route orchestrator logs through `RUST_LOG` when a test needs them.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// One `_vt.vreplication` row held by the fake tablet manager.
#[derive(Debug, Clone)]
pub struct StreamRow {
    pub id: u32,
    pub workflow: String,
    pub source: String,
    pub pos: String,
    pub state: String,
    pub message: String,
    pub db_name: String,
}

#[derive(Default)]
struct TmState {
    next_id: u32,
    streams: HashMap<String, Vec<StreamRow>>,
    refresh_counts: HashMap<String, usize>,
}

/// Fake tablet manager: keeps a stream table per tablet and interprets the
/// orchestrator's SQL-shaped control statements.
#[derive(Default)]
pub struct FakeTabletManager {
    inner: Mutex<TmState>,
    /// When set, wait-for-pos never completes (tests the catch-up budget).
    pub hang_wait_for_pos: AtomicBool,
}

impl FakeTabletManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn streams(&self, alias: &TabletAlias) -> Vec<StreamRow> {
        self.inner
            .lock()
            .unwrap()
            .streams
            .get(&alias.to_string())
            .cloned()
            .unwrap_or_default()
    }

    pub fn refresh_count(&self, alias: &TabletAlias) -> usize {
        self.inner
            .lock()
            .unwrap()
            .refresh_counts
            .get(&alias.to_string())
            .copied()
            .unwrap_or(0)
    }

    fn exec(&self, alias: &str, query: &str) -> anyhow::Result<QueryResult> {
        let mut inner = self.inner.lock().unwrap();
        if query.starts_with("insert into _vt.vreplication ") {
            let values = parse_values(query)?;
            anyhow::ensure!(values.len() == 9, "unexpected insert arity in {query:?}");
            inner.next_id += 1;
            let id = inner.next_id;
            inner.streams.entry(alias.to_string()).or_default().push(StreamRow {
                id,
                workflow: values[0].clone(),
                source: values[1].clone(),
                pos: values[2].clone(),
                state: values[7].clone(),
                message: String::new(),
                db_name: values[8].clone(),
            });
            return Ok(QueryResult {
                insert_id: id as u64,
                rows_affected: 1,
                rows: Vec::new(),
            });
        }
        if query.starts_with("update _vt.vreplication set state=") {
            let state = between(query, "state='", "'")?;
            let id = trailing_id(query)?;
            let rows = inner.streams.entry(alias.to_string()).or_default();
            let mut affected = 0;
            for row in rows.iter_mut().filter(|r| r.id == id) {
                row.state = state.clone();
                affected += 1;
            }
            return Ok(QueryResult {
                insert_id: 0,
                rows_affected: affected,
                rows: Vec::new(),
            });
        }
        if query.starts_with("delete from _vt.vreplication where id=") {
            let id = trailing_id(query)?;
            let rows = inner.streams.entry(alias.to_string()).or_default();
            let before = rows.len();
            rows.retain(|r| r.id != id);
            return Ok(QueryResult {
                insert_id: 0,
                rows_affected: (before - rows.len()) as u64,
                rows: Vec::new(),
            });
        }
        if query.starts_with("select 1 from _vt.vreplication where db_name=") {
            let rows = inner.streams.get(alias).cloned().unwrap_or_default();
            let matches: Vec<Vec<String>> = if query.contains(" and workflow=") {
                let workflow = between(query, "workflow='", "'")?;
                rows.iter()
                    .filter(|r| r.workflow == workflow)
                    .map(|_| vec!["1".to_string()])
                    .collect()
            } else if query.contains("message='FROZEN'") {
                rows.iter()
                    .filter(|r| r.message == "FROZEN")
                    .map(|_| vec!["1".to_string()])
                    .collect()
            } else {
                anyhow::bail!("unsupported probe query: {query}");
            };
            return Ok(QueryResult {
                insert_id: 0,
                rows_affected: 0,
                rows: matches,
            });
        }
        if query.starts_with("select * from _vt.vreplication where db_name=") {
            let rows = inner
                .streams
                .get(alias)
                .cloned()
                .unwrap_or_default()
                .iter()
                .map(|r| {
                    vec![
                        r.id.to_string(),
                        r.workflow.clone(),
                        r.source.clone(),
                        r.pos.clone(),
                        r.state.clone(),
                        r.message.clone(),
                    ]
                })
                .collect();
            return Ok(QueryResult {
                insert_id: 0,
                rows_affected: 0,
                rows,
            });
        }
        anyhow::bail!("fake tablet manager cannot interpret: {query}")
    }
}

#[async_trait]
impl TabletManagerClient for FakeTabletManager {
    async fn refresh_state(&self, tablet: &Tablet) -> anyhow::Result<()> {
        *self
            .inner
            .lock()
            .unwrap()
            .refresh_counts
            .entry(tablet.alias.to_string())
            .or_default() += 1;
        Ok(())
    }

    async fn primary_position(&self, tablet: &Tablet) -> anyhow::Result<String> {
        Ok(format!("pos-{}", tablet.alias))
    }

    async fn vreplication_exec(&self, tablet: &Tablet, query: &str) -> anyhow::Result<QueryResult> {
        self.exec(&tablet.alias.to_string(), query)
    }

    async fn vreplication_wait_for_pos(
        &self,
        tablet: &Tablet,
        uid: u32,
        _position: &str,
    ) -> anyhow::Result<()> {
        if self.hang_wait_for_pos.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let known = self
            .inner
            .lock()
            .unwrap()
            .streams
            .get(&tablet.alias.to_string())
            .is_some_and(|rows| rows.iter().any(|r| r.id == uid));
        if known {
            Ok(())
        } else {
            anyhow::bail!("vreplication stream {uid} not found")
        }
    }
}

/// Extract the values list of a vreplication insert as unescaped tokens.
fn parse_values(query: &str) -> anyhow::Result<Vec<String>> {
    let start = query
        .find("values (")
        .ok_or_else(|| anyhow::anyhow!("no values clause in {query:?}"))?
        + "values (".len();
    let mut tokens = Vec::new();
    let mut chars = query[start..].chars().peekable();
    loop {
        while matches!(chars.peek(), Some(' ') | Some(',')) {
            chars.next();
        }
        match chars.peek() {
            None | Some(')') => break,
            Some('\'') => {
                chars.next();
                let mut token = String::new();
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                token.push(escaped);
                            }
                        }
                        '\'' => break,
                        other => token.push(other),
                    }
                }
                tokens.push(token);
            }
            Some(_) => {
                let mut token = String::new();
                while let Some(&c) = chars.peek() {
                    if c == ',' || c == ')' {
                        break;
                    }
                    token.push(c);
                    chars.next();
                }
                tokens.push(token.trim().to_string());
            }
        }
    }
    Ok(tokens)
}

fn between(query: &str, prefix: &str, terminator: &str) -> anyhow::Result<String> {
    let start = query
        .find(prefix)
        .ok_or_else(|| anyhow::anyhow!("missing {prefix:?} in {query:?}"))?
        + prefix.len();
    let end = query[start..]
        .find(terminator)
        .ok_or_else(|| anyhow::anyhow!("unterminated token in {query:?}"))?;
    Ok(query[start..start + end].to_string())
}

fn trailing_id(query: &str) -> anyhow::Result<u32> {
    let start = query
        .find("where id=")
        .ok_or_else(|| anyhow::anyhow!("missing id predicate in {query:?}"))?
        + "where id=".len();
    Ok(query[start..].trim().parse()?)
}

/// Event sink recording every dispatched status string.
#[derive(Default)]
pub struct RecordingEventSink {
    statuses: Mutex<Vec<String>>,
}

impl RecordingEventSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn statuses(&self) -> Vec<String> {
        self.statuses.lock().unwrap().clone()
    }
}

impl EventSink for RecordingEventSink {
    fn update(&self, _event: &MigrationEvent, status: &str) {
        self.statuses.lock().unwrap().push(status.to_string());
    }
}

/// Health factory replaying a script of QPS snapshots; the last snapshot
/// repeats forever.
pub struct ScriptedHealthFactory {
    script: Arc<Mutex<VecDeque<Vec<TabletHealth>>>>,
}

impl ScriptedHealthFactory {
    pub fn new(polls: Vec<Vec<TabletHealth>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(polls.into())),
        }
    }
}

#[async_trait]
impl ShardHealthFactory for ScriptedHealthFactory {
    async fn watch_shard(
        &self,
        _cell: &str,
        _keyspace: &str,
        _shard: &str,
        _options: &HealthCheckOptions,
    ) -> anyhow::Result<Box<dyn ShardHealthWatcher>> {
        Ok(Box::new(ScriptedWatcher {
            script: self.script.clone(),
        }))
    }
}

struct ScriptedWatcher {
    script: Arc<Mutex<VecDeque<Vec<TabletHealth>>>>,
}

#[async_trait]
impl ShardHealthWatcher for ScriptedWatcher {
    async fn wait_for_tablets(&self, _tablet_type: TabletType) -> anyhow::Result<()> {
        Ok(())
    }

    async fn healthy_stats(&self, _tablet_type: TabletType) -> Vec<TabletHealth> {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap_or_default()
        }
    }
}

pub fn make_tablet(cell: &str, uid: u32, keyspace: &str, shard: &str, tablet_type: TabletType) -> Tablet {
    Tablet {
        alias: TabletAlias::new(cell, uid),
        keyspace: keyspace.to_string(),
        shard: shard.to_string(),
        tablet_type,
        hostname: format!("host-{uid}"),
        port_map: [("vt".to_string(), 8080u16)].into_iter().collect(),
    }
}

/// Config with short waits so tests run fast.
pub fn test_config() -> Config {
    Config {
        filtered_replication_wait: Duration::from_secs(5),
        drain_sleep_rdonly: Duration::from_millis(1),
        drain_sleep_replica: Duration::from_millis(1),
    }
}

pub struct Fixture {
    pub ts: Arc<MemoryTopoServer>,
    pub tmc: Arc<FakeTabletManager>,
    pub events: Arc<RecordingEventSink>,
    pub coordinator: Coordinator,
}

async fn register_primary(ts: &MemoryTopoServer, keyspace: &str, shard: &str, cell: &str, uid: u32) {
    let tablet = make_tablet(cell, uid, keyspace, shard, TabletType::Primary);
    let alias = tablet.alias.clone();
    ts.put_tablet(tablet);
    update_shard_fields(ts, keyspace, shard, |s| {
        s.primary_alias = Some(alias.clone());
        Ok(())
    })
    .await
    .unwrap();
}

fn srv_keyspace_serving(shards: &[&str]) -> SrvKeyspace {
    let refs: Vec<ShardReference> = shards
        .iter()
        .map(|name| ShardReference {
            name: name.to_string(),
            key_range: reshard::topo::key_range_from_shard_name(name).unwrap(),
        })
        .collect();
    SrvKeyspace {
        partitions: TabletType::ALL
            .iter()
            .map(|&served_type| KeyspacePartition {
                served_type,
                shard_references: refs.clone(),
            })
            .collect(),
        served_from: Vec::new(),
    }
}

/// Keyspace `ks` with serving shard `0` and two empty destination shards
/// `-80` / `80-`, one cell, one primary tablet per shard.
pub async fn split_fixture() -> Fixture {
    init_tracing();
    let ts = Arc::new(MemoryTopoServer::new());
    ts.add_cell("zone1");
    ts.create_keyspace("ks", Keyspace::default()).unwrap();
    ts.create_shard("ks", "0").unwrap();
    ts.create_shard("ks", "-80").unwrap();
    ts.create_shard("ks", "80-").unwrap();
    register_primary(&ts, "ks", "0", "zone1", 100).await;
    register_primary(&ts, "ks", "-80", "zone1", 200).await;
    register_primary(&ts, "ks", "80-", "zone1", 300).await;
    ts.update_srv_keyspace("zone1", "ks", &srv_keyspace_serving(&["0"]))
        .await
        .unwrap();

    let tmc = FakeTabletManager::new();
    let events = RecordingEventSink::new();
    let coordinator = Coordinator::new(ts.clone(), tmc.clone())
        .with_config(test_config())
        .with_event_sink(events.clone());
    Fixture {
        ts,
        tmc,
        events,
        coordinator,
    }
}

/// Source keyspace `ks1` and vertical-split destination keyspace `ks2`, one
/// unsharded shard each, `ks2` served from `ks1` for every type.
pub async fn vertical_fixture() -> Fixture {
    init_tracing();
    let ts = Arc::new(MemoryTopoServer::new());
    ts.add_cell("zone1");
    ts.create_keyspace("ks1", Keyspace::default()).unwrap();
    let served_froms = TabletType::ALL
        .iter()
        .map(|&tablet_type| ServedFrom {
            tablet_type,
            cells: None,
            keyspace: "ks1".to_string(),
        })
        .collect();
    ts.create_keyspace(
        "ks2",
        Keyspace {
            served_froms,
            ..Keyspace::default()
        },
    )
    .unwrap();
    ts.create_shard("ks1", "0").unwrap();
    ts.create_shard("ks2", "0").unwrap();
    register_primary(&ts, "ks1", "0", "zone1", 100).await;
    register_primary(&ts, "ks2", "0", "zone1", 200).await;
    ts.update_srv_keyspace("zone1", "ks1", &srv_keyspace_serving(&["0"]))
        .await
        .unwrap();
    ts.update_srv_keyspace("zone1", "ks2", &srv_keyspace_serving(&["0"]))
        .await
        .unwrap();

    let tmc = FakeTabletManager::new();
    let events = RecordingEventSink::new();
    let coordinator = Coordinator::new(ts.clone(), tmc.clone())
        .with_config(test_config())
        .with_event_sink(events.clone());
    Fixture {
        ts,
        tmc,
        events,
        coordinator,
    }
}
