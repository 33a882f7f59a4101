//! In-process topology server.
//!
//! Complete [`TopoServer`] implementation backed by versioned in-memory maps.
//! Useful as the store for single-process deployments and as the fixture for
//! every orchestration test in this crate. All writes are serialized behind
//! one lock, which also makes the serving-directory swap atomic across cells.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::serving::apply_served_type_swap;
use super::store::{KeyspaceLock, TopoError, TopoResult, TopoServer};
use super::{
    key_range_from_shard_name, Keyspace, KeyspaceInfo, Shard, ShardInfo, SrvKeyspace, Tablet,
    TabletAlias, TabletType,
};

#[derive(Default)]
struct State {
    cells: Vec<String>,
    keyspaces: BTreeMap<String, (Keyspace, u64)>,
    shards: BTreeMap<(String, String), (Shard, u64)>,
    tablets: HashMap<TabletAlias, Tablet>,
    srv_keyspaces: BTreeMap<(String, String), SrvKeyspace>,
    next_version: u64,
}

impl State {
    fn bump_version(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }
}

/// In-memory topology server.
#[derive(Default)]
pub struct MemoryTopoServer {
    state: RwLock<State>,
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<String>>>>,
}

impl MemoryTopoServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_cell(&self, cell: impl Into<String>) {
        let mut state = self.state.write().unwrap();
        let cell = cell.into();
        if !state.cells.contains(&cell) {
            state.cells.push(cell);
        }
    }

    pub fn create_keyspace(&self, name: &str, keyspace: Keyspace) -> TopoResult<()> {
        let mut state = self.state.write().unwrap();
        if state.keyspaces.contains_key(name) {
            return Err(TopoError::NodeExists(name.to_string()));
        }
        let version = state.bump_version();
        state.keyspaces.insert(name.to_string(), (keyspace, version));
        Ok(())
    }

    /// Create a shard record, deriving its key range from the shard name.
    pub fn create_shard(&self, keyspace: &str, shard_name: &str) -> TopoResult<ShardInfo> {
        let key_range = key_range_from_shard_name(shard_name)
            .map_err(|reason| TopoError::InvalidUpdate {
                path: format!("{keyspace}/{shard_name}"),
                reason,
            })?;
        let mut state = self.state.write().unwrap();
        let key = (keyspace.to_string(), shard_name.to_string());
        if state.shards.contains_key(&key) {
            return Err(TopoError::NodeExists(format!("{keyspace}/{shard_name}")));
        }
        // A shard created on top of existing shards (a future resharding
        // destination) must not start out primary-serving.
        let overlaps_existing = state
            .shards
            .range((keyspace.to_string(), String::new())..)
            .take_while(|((ks, _), _)| ks == keyspace)
            .any(|(_, (existing, _))| {
                super::key_ranges_intersect(key_range.as_ref(), existing.key_range.as_ref())
            });
        let shard = Shard {
            key_range,
            is_primary_serving: !overlaps_existing,
            ..Shard::default()
        };
        let version = state.bump_version();
        state.shards.insert(key, (shard.clone(), version));
        Ok(ShardInfo {
            keyspace: keyspace.to_string(),
            shard_name: shard_name.to_string(),
            shard,
            version,
        })
    }

    pub fn put_tablet(&self, tablet: Tablet) {
        let mut state = self.state.write().unwrap();
        state.tablets.insert(tablet.alias.clone(), tablet);
    }

    fn keyspace_lock_handle(&self, keyspace: &str) -> Arc<Mutex<String>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(keyspace.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(String::new())))
            .clone()
    }
}

#[async_trait]
impl TopoServer for MemoryTopoServer {
    async fn get_keyspace(&self, keyspace: &str) -> TopoResult<KeyspaceInfo> {
        let state = self.state.read().unwrap();
        let (ks, version) = state
            .keyspaces
            .get(keyspace)
            .ok_or_else(|| TopoError::NoNode(keyspace.to_string()))?;
        Ok(KeyspaceInfo {
            name: keyspace.to_string(),
            keyspace: ks.clone(),
            version: *version,
        })
    }

    async fn update_keyspace(&self, ki: &KeyspaceInfo) -> TopoResult<KeyspaceInfo> {
        let mut state = self.state.write().unwrap();
        let current = state
            .keyspaces
            .get(&ki.name)
            .ok_or_else(|| TopoError::NoNode(ki.name.clone()))?;
        if current.1 != ki.version {
            return Err(TopoError::BadVersion(ki.name.clone()));
        }
        let version = state.bump_version();
        state
            .keyspaces
            .insert(ki.name.clone(), (ki.keyspace.clone(), version));
        Ok(KeyspaceInfo {
            version,
            ..ki.clone()
        })
    }

    async fn get_shard(&self, keyspace: &str, shard: &str) -> TopoResult<ShardInfo> {
        let state = self.state.read().unwrap();
        let (sh, version) = state
            .shards
            .get(&(keyspace.to_string(), shard.to_string()))
            .ok_or_else(|| TopoError::NoNode(format!("{keyspace}/{shard}")))?;
        Ok(ShardInfo {
            keyspace: keyspace.to_string(),
            shard_name: shard.to_string(),
            shard: sh.clone(),
            version: *version,
        })
    }

    async fn update_shard(&self, si: &ShardInfo) -> TopoResult<ShardInfo> {
        let mut state = self.state.write().unwrap();
        let key = (si.keyspace.clone(), si.shard_name.clone());
        let current = state
            .shards
            .get(&key)
            .ok_or_else(|| TopoError::NoNode(si.path()))?;
        if current.1 != si.version {
            return Err(TopoError::BadVersion(si.path()));
        }
        let version = state.bump_version();
        state.shards.insert(key, (si.shard.clone(), version));
        Ok(ShardInfo {
            version,
            ..si.clone()
        })
    }

    async fn find_all_shards_in_keyspace(&self, keyspace: &str) -> TopoResult<Vec<ShardInfo>> {
        let state = self.state.read().unwrap();
        if !state.keyspaces.contains_key(keyspace) {
            return Err(TopoError::NoNode(keyspace.to_string()));
        }
        Ok(state
            .shards
            .range((keyspace.to_string(), String::new())..)
            .take_while(|((ks, _), _)| ks == keyspace)
            .map(|((_, name), (sh, version))| ShardInfo {
                keyspace: keyspace.to_string(),
                shard_name: name.clone(),
                shard: sh.clone(),
                version: *version,
            })
            .collect())
    }

    async fn get_tablet(&self, alias: &TabletAlias) -> TopoResult<Tablet> {
        let state = self.state.read().unwrap();
        state
            .tablets
            .get(alias)
            .cloned()
            .ok_or_else(|| TopoError::NoNode(alias.to_string()))
    }

    async fn get_tablet_aliases_in_shard(
        &self,
        keyspace: &str,
        shard: &str,
    ) -> TopoResult<Vec<TabletAlias>> {
        let state = self.state.read().unwrap();
        let mut aliases: Vec<TabletAlias> = state
            .tablets
            .values()
            .filter(|t| t.keyspace == keyspace && t.shard == shard)
            .map(|t| t.alias.clone())
            .collect();
        aliases.sort();
        Ok(aliases)
    }

    async fn get_cell_names(&self) -> TopoResult<Vec<String>> {
        Ok(self.state.read().unwrap().cells.clone())
    }

    async fn get_srv_keyspace(&self, cell: &str, keyspace: &str) -> TopoResult<SrvKeyspace> {
        let state = self.state.read().unwrap();
        state
            .srv_keyspaces
            .get(&(cell.to_string(), keyspace.to_string()))
            .cloned()
            .ok_or_else(|| TopoError::NoNode(format!("{cell}/{keyspace}")))
    }

    async fn update_srv_keyspace(
        &self,
        cell: &str,
        keyspace: &str,
        srv_keyspace: &SrvKeyspace,
    ) -> TopoResult<()> {
        let mut state = self.state.write().unwrap();
        if !state.cells.iter().any(|c| c == cell) {
            return Err(TopoError::NoNode(cell.to_string()));
        }
        state.srv_keyspaces.insert(
            (cell.to_string(), keyspace.to_string()),
            srv_keyspace.clone(),
        );
        Ok(())
    }

    async fn migrate_served_type(
        &self,
        keyspace: &str,
        to_shards: &[ShardInfo],
        from_shards: &[ShardInfo],
        served_type: TabletType,
        cells: Option<&[String]>,
    ) -> TopoResult<()> {
        let mut state = self.state.write().unwrap();
        let target_cells: Vec<String> = match cells {
            Some(cells) => cells.to_vec(),
            None => state.cells.clone(),
        };

        // Stage every cell's new directory first so the swap applies all
        // cells or none.
        let mut staged = Vec::new();
        for cell in &target_cells {
            let key = (cell.clone(), keyspace.to_string());
            let Some(sk) = state.srv_keyspaces.get(&key) else {
                continue;
            };
            let mut sk = sk.clone();
            apply_served_type_swap(&mut sk, to_shards, from_shards, served_type).map_err(
                |reason| TopoError::InvalidUpdate {
                    path: format!("{cell}/{keyspace}"),
                    reason,
                },
            )?;
            staged.push((key, sk));
        }
        if staged.is_empty() {
            return Err(TopoError::NoNode(format!(
                "no serving directory for keyspace {keyspace} in cells {target_cells:?}"
            )));
        }
        for (key, sk) in staged {
            state.srv_keyspaces.insert(key, sk);
        }
        Ok(())
    }

    async fn lock_keyspace(&self, keyspace: &str, action: &str) -> TopoResult<KeyspaceLock> {
        let handle = self.keyspace_lock_handle(keyspace);
        match handle.try_lock_owned() {
            Ok(mut guard) => {
                *guard = action.to_string();
                Ok(KeyspaceLock::new(keyspace, action, Box::new(guard)))
            }
            Err(_) => Err(TopoError::LockHeld {
                keyspace: keyspace.to_string(),
                action: action.to_string(),
            }),
        }
    }
}
