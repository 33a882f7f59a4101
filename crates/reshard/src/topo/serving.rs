//! Serving-directory and shard-record mutation logic.
//!
//! Pure mutators over [`Shard`], [`Keyspace`] and [`SrvKeyspace`] records plus
//! the store-backed wrappers the migrators call. Cell scoping uses
//! `Option<Vec<String>>` with `None` meaning every cell.

use super::store::{update_shard_fields, TopoError, TopoResult, TopoServer};
use super::{
    key_range_equal, Keyspace, ServedFrom, Shard, ShardInfo, ShardReference, SrvKeyspace,
    TabletControl, TabletType,
};

/// Whether any partition of the serving directory lists this shard.
pub fn shard_is_serving(sk: &SrvKeyspace, shard: &ShardInfo) -> bool {
    sk.partitions.iter().any(|p| {
        p.shard_references
            .iter()
            .any(|r| key_range_equal(r.key_range.as_ref(), shard.shard.key_range.as_ref()))
    })
}

/// Swap one tablet type's serving from `from_shards` to `to_shards` in a
/// single directory. Refuses a swap that does not match the current state.
pub fn apply_served_type_swap(
    sk: &mut SrvKeyspace,
    to_shards: &[ShardInfo],
    from_shards: &[ShardInfo],
    served_type: TabletType,
) -> Result<(), String> {
    let partition = sk.partition_mut(served_type);
    for from in from_shards {
        let Some(pos) = partition
            .shard_references
            .iter()
            .position(|r| r.name == from.shard_name)
        else {
            return Err(format!(
                "shard {} is not serving {served_type}, cannot migrate away",
                from.path()
            ));
        };
        partition.shard_references.remove(pos);
    }
    for to in to_shards {
        if partition.shard_references.iter().any(|r| r.name == to.shard_name) {
            return Err(format!(
                "shard {} is already serving {served_type}",
                to.path()
            ));
        }
        partition.shard_references.push(ShardReference {
            name: to.shard_name.clone(),
            key_range: to.shard.key_range.clone(),
        });
    }
    partition.shard_references.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(())
}

fn add_cells(existing: Option<Vec<String>>, added: Option<&[String]>) -> Option<Vec<String>> {
    match (existing, added) {
        // Either side covering all cells covers all cells.
        (None, _) | (_, None) => None,
        (Some(mut cells), Some(added)) => {
            for cell in added {
                if !cells.contains(cell) {
                    cells.push(cell.clone());
                }
            }
            Some(cells)
        }
    }
}

enum CellsAfterRemoval {
    Empty,
    Scoped(Vec<String>),
}

fn remove_cells(
    existing: &Option<Vec<String>>,
    removed: Option<&[String]>,
) -> Result<CellsAfterRemoval, String> {
    match (existing, removed) {
        (_, None) => Ok(CellsAfterRemoval::Empty),
        (None, Some(_)) => Err(
            "cannot remove specific cells from an all-cells record; retry without cells"
                .to_string(),
        ),
        (Some(cells), Some(removed)) => {
            let left: Vec<String> = cells
                .iter()
                .filter(|c| !removed.contains(*c))
                .cloned()
                .collect();
            if left.is_empty() {
                Ok(CellsAfterRemoval::Empty)
            } else {
                Ok(CellsAfterRemoval::Scoped(left))
            }
        }
    }
}

/// Flip query-service denial for one tablet type on a shard record.
///
/// Creates the tablet control on first denial and removes it once the last
/// cell is re-enabled. Refuses to re-enable a frozen control.
pub fn update_deny_query_service(
    shard: &mut Shard,
    tablet_type: TabletType,
    cells: Option<&[String]>,
    deny: bool,
) -> Result<(), String> {
    let Some(idx) = shard
        .tablet_controls
        .iter()
        .position(|tc| tc.tablet_type == tablet_type)
    else {
        if deny {
            shard.tablet_controls.push(TabletControl {
                tablet_type,
                cells: cells.map(<[String]>::to_vec),
                deny_query_service: true,
                frozen: false,
                denied_tables: Vec::new(),
            });
        }
        return Ok(());
    };

    let tc = &mut shard.tablet_controls[idx];
    if deny {
        tc.deny_query_service = true;
        tc.cells = add_cells(tc.cells.take(), cells);
        return Ok(());
    }
    if tc.frozen {
        return Err(
            "migration has gone past the point of no return, cannot re-enable query service"
                .to_string(),
        );
    }
    let removal = remove_cells(&tc.cells, cells)?;
    match removal {
        CellsAfterRemoval::Empty => {
            shard.tablet_controls.remove(idx);
        }
        CellsAfterRemoval::Scoped(left) => shard.tablet_controls[idx].cells = Some(left),
    }
    Ok(())
}

/// Add or remove entries from the per-type denied-tables control.
pub fn update_source_denied_tables(
    shard: &mut Shard,
    tablet_type: TabletType,
    cells: Option<&[String]>,
    remove: bool,
    tables: &[String],
) -> Result<(), String> {
    let Some(idx) = shard
        .tablet_controls
        .iter()
        .position(|tc| tc.tablet_type == tablet_type)
    else {
        if !remove {
            shard.tablet_controls.push(TabletControl {
                tablet_type,
                cells: cells.map(<[String]>::to_vec),
                deny_query_service: false,
                frozen: false,
                denied_tables: tables.to_vec(),
            });
        }
        return Ok(());
    };

    let tc = &mut shard.tablet_controls[idx];
    if remove {
        let removal = remove_cells(&tc.cells, cells)?;
        match removal {
            CellsAfterRemoval::Empty => {
                shard.tablet_controls.remove(idx);
            }
            CellsAfterRemoval::Scoped(left) => shard.tablet_controls[idx].cells = Some(left),
        }
        return Ok(());
    }
    if tc.denied_tables != tables {
        return Err(format!(
            "trying to use two different sets of denied tables for shard: {:?} != {:?}",
            tc.denied_tables, tables
        ));
    }
    tc.cells = add_cells(tc.cells.take(), cells);
    Ok(())
}

/// Store-backed wrapper: flip query-service denial on a set of shards.
pub async fn update_deny_query_service_on_shards(
    ts: &dyn TopoServer,
    shards: &[ShardInfo],
    tablet_type: TabletType,
    cells: Option<&[String]>,
    deny: bool,
) -> TopoResult<Vec<ShardInfo>> {
    let mut updated = Vec::with_capacity(shards.len());
    for si in shards {
        let path = si.path();
        updated.push(
            update_shard_fields(ts, &si.keyspace, &si.shard_name, |shard| {
                update_deny_query_service(shard, tablet_type, cells, deny).map_err(|reason| {
                    TopoError::InvalidUpdate {
                        path: path.clone(),
                        reason,
                    }
                })
            })
            .await?,
        );
    }
    Ok(updated)
}

/// Update shard records for one side of a served-type migration: the `from`
/// side gets query service denied, the `to` side re-enabled. Optionally
/// clears `source_shards` (compensating cancel path).
pub async fn update_shard_records(
    ts: &dyn TopoServer,
    shards: &[ShardInfo],
    cells: Option<&[String]>,
    served_type: TabletType,
    is_from: bool,
    clear_source_shards: bool,
) -> TopoResult<Vec<ShardInfo>> {
    let mut updated = Vec::with_capacity(shards.len());
    for si in shards {
        let path = si.path();
        updated.push(
            update_shard_fields(ts, &si.keyspace, &si.shard_name, |shard| {
                update_deny_query_service(shard, served_type, cells, is_from).map_err(
                    |reason| TopoError::InvalidUpdate {
                        path: path.clone(),
                        reason,
                    },
                )?;
                if clear_source_shards {
                    shard.source_shards.clear();
                }
                Ok(())
            })
            .await?,
        );
    }
    Ok(updated)
}

/// Set or clear the frozen flag on every shard's primary tablet control.
///
/// Freezing a shard that has no primary control yet creates one with query
/// service denied, keeping the frozen ⇒ denied invariant.
pub async fn update_frozen_flag(
    ts: &dyn TopoServer,
    shards: &[ShardInfo],
    value: bool,
) -> TopoResult<Vec<ShardInfo>> {
    let mut updated = Vec::with_capacity(shards.len());
    for si in shards {
        updated.push(
            update_shard_fields(ts, &si.keyspace, &si.shard_name, |shard| {
                if let Some(tc) = shard.get_tablet_control_mut(TabletType::Primary) {
                    tc.frozen = value;
                } else {
                    shard.tablet_controls.push(TabletControl {
                        tablet_type: TabletType::Primary,
                        cells: None,
                        deny_query_service: value,
                        frozen: value,
                        denied_tables: Vec::new(),
                    });
                }
                Ok(())
            })
            .await?,
        );
    }
    Ok(updated)
}

fn control_denies_in_cell(shard: &Shard, tablet_type: TabletType, cell: &str) -> bool {
    shard.get_tablet_control(tablet_type).is_some_and(|tc| {
        tc.deny_query_service
            && tc
                .cells
                .as_ref()
                .is_none_or(|cells| cells.iter().any(|c| c == cell))
    })
}

fn is_horizontal_destination(shard: &Shard) -> bool {
    shard.source_shards.iter().any(|ss| ss.tables.is_empty())
}

/// Recompute a keyspace's serving directory in the given cells (all cells
/// when `None`) from its shard and keyspace records.
///
/// Shards receiving a horizontal clone are excluded from non-primary
/// partitions; vertical-split targets stay listed because routing to them is
/// redirected through the keyspace `served_froms` instead.
pub async fn rebuild_keyspace(
    ts: &dyn TopoServer,
    keyspace: &str,
    cells: Option<&[String]>,
) -> TopoResult<()> {
    let ki = ts.get_keyspace(keyspace).await?;
    let shards = ts.find_all_shards_in_keyspace(keyspace).await?;
    let target_cells = match cells {
        Some(cells) => cells.to_vec(),
        None => ts.get_cell_names().await?,
    };

    for cell in &target_cells {
        let mut sk = SrvKeyspace {
            partitions: Vec::new(),
            served_from: served_froms_for_cell(&ki.keyspace, cell),
        };
        for tablet_type in TabletType::ALL {
            let partition = sk.partition_mut(tablet_type);
            for si in &shards {
                let serving = match tablet_type {
                    TabletType::Primary => si.shard.is_primary_serving,
                    _ => {
                        !is_horizontal_destination(&si.shard)
                            && si.shard.is_primary_serving
                            && !control_denies_in_cell(&si.shard, tablet_type, cell)
                    }
                };
                if serving {
                    partition.shard_references.push(ShardReference {
                        name: si.shard_name.clone(),
                        key_range: si.shard.key_range.clone(),
                    });
                }
            }
        }
        ts.update_srv_keyspace(cell, keyspace, &sk).await?;
    }
    Ok(())
}

fn served_froms_for_cell(keyspace: &Keyspace, cell: &str) -> Vec<ServedFrom> {
    keyspace
        .served_froms
        .iter()
        .filter(|sf| {
            sf.cells
                .as_ref()
                .is_none_or(|cells| cells.iter().any(|c| c == cell))
        })
        .cloned()
        .collect()
}

/// Cells in which any serving-directory partition lists the shard.
pub async fn get_shard_serving_cells(
    ts: &dyn TopoServer,
    shard: &ShardInfo,
) -> TopoResult<Vec<String>> {
    let mut cells = Vec::new();
    for (cell, sk) in ts.get_srv_keyspace_all_cells(&shard.keyspace).await? {
        if shard_is_serving(&sk, shard) {
            cells.push(cell);
        }
    }
    Ok(cells)
}

/// Validate a vertical served-from migration before mutating anything.
pub fn check_served_from_migration(
    keyspace_name: &str,
    keyspace: &Keyspace,
    tablet_type: TabletType,
    cells: Option<&[String]>,
    source_keyspace: &str,
    remove: bool,
) -> Result<(), String> {
    if tablet_type == TabletType::Primary {
        if !remove {
            return Err(format!(
                "cannot migrate PRIMARY back into {keyspace_name}"
            ));
        }
        if cells.is_some() {
            return Err(format!(
                "cannot migrate only some cells for PRIMARY in keyspace {keyspace_name}"
            ));
        }
        if keyspace.served_froms.len() > 1 {
            return Err(format!(
                "cannot migrate PRIMARY into {keyspace_name} until everything else is migrated"
            ));
        }
    }
    if remove
        && !keyspace
            .served_froms
            .iter()
            .any(|sf| sf.tablet_type == tablet_type)
    {
        return Err(format!(
            "supplied type {tablet_type} cannot be migrated: not served from another keyspace"
        ));
    }
    for sf in &keyspace.served_froms {
        if sf.keyspace != source_keyspace {
            return Err(format!(
                "inconsistent keyspace specified in migration: {source_keyspace} != {} for type {}",
                sf.keyspace, sf.tablet_type
            ));
        }
    }
    Ok(())
}

/// Apply a vertical served-from migration to the keyspace record.
///
/// Forward (`remove = true`) drops the redirection for the migrated cells,
/// clearing the entry once no cell is left; `all_serving_cells` resolves a
/// cell-scoped removal against an all-cells entry. Reverse re-adds it.
pub fn update_served_from_map(
    keyspace_name: &str,
    keyspace: &mut Keyspace,
    tablet_type: TabletType,
    cells: Option<&[String]>,
    source_keyspace: &str,
    remove: bool,
    all_serving_cells: &[String],
) -> Result<(), String> {
    check_served_from_migration(
        keyspace_name,
        keyspace,
        tablet_type,
        cells,
        source_keyspace,
        remove,
    )?;

    let Some(idx) = keyspace
        .served_froms
        .iter()
        .position(|sf| sf.tablet_type == tablet_type)
    else {
        if remove {
            tracing::warn!(
                keyspace = keyspace_name,
                %tablet_type,
                "no served-from entry to remove"
            );
        } else {
            keyspace.served_froms.push(ServedFrom {
                tablet_type,
                cells: cells.map(<[String]>::to_vec),
                keyspace: source_keyspace.to_string(),
            });
        }
        return Ok(());
    };

    if remove {
        // Resolve an all-cells entry against the cells actually serving so a
        // scoped removal leaves the remainder in place.
        let current = keyspace.served_froms[idx]
            .cells
            .clone()
            .unwrap_or_else(|| all_serving_cells.to_vec());
        match remove_cells(&Some(current), cells)? {
            CellsAfterRemoval::Empty => {
                keyspace.served_froms.remove(idx);
            }
            CellsAfterRemoval::Scoped(left) => keyspace.served_froms[idx].cells = Some(left),
        }
    } else {
        let sf = &mut keyspace.served_froms[idx];
        if sf.keyspace != source_keyspace {
            return Err(format!(
                "cannot update served-from record: different keyspace {} != {source_keyspace}",
                sf.keyspace
            ));
        }
        sf.cells = add_cells(sf.cells.take(), cells);
    }
    Ok(())
}
