//! Overlapping-shards discovery and source/destination labeling.
//!
//! Two shard sets overlap when they cover the same span of the keyspace-id
//! space under different partitionings, which is exactly the state a
//! horizontal resharding creates. Shards on one side never overlap each
//! other.

use super::store::{TopoResult, TopoServer};
use super::{
    key_range_end_equal, key_range_start_equal, key_ranges_intersect, ShardInfo, TabletType,
};

/// A pair of shard lists covering the same key range two different ways.
#[derive(Debug, Clone)]
pub struct OverlappingShards {
    pub left: Vec<ShardInfo>,
    pub right: Vec<ShardInfo>,
}

impl OverlappingShards {
    pub fn contains_shard(&self, shard_name: &str) -> bool {
        self.left
            .iter()
            .chain(self.right.iter())
            .any(|si| si.shard_name == shard_name)
    }
}

/// Find all overlapping-shards groups in a keyspace.
pub async fn find_overlapping_shards(
    ts: &dyn TopoServer,
    keyspace: &str,
) -> TopoResult<Vec<OverlappingShards>> {
    let shards = ts.find_all_shards_in_keyspace(keyspace).await?;
    Ok(group_overlapping_shards(shards))
}

/// The group a given shard belongs to, if any.
pub fn overlapping_shards_for_shard(
    groups: Vec<OverlappingShards>,
    shard_name: &str,
) -> Option<OverlappingShards> {
    groups.into_iter().find(|os| os.contains_shard(shard_name))
}

fn group_overlapping_shards(mut pool: Vec<ShardInfo>) -> Vec<OverlappingShards> {
    let mut result = Vec::new();

    while let Some(seed) = pool.pop() {
        let mut left = vec![seed];
        let mut right: Vec<ShardInfo> = Vec::new();
        let mut three_way = false;

        loop {
            let mut found_one = false;
            if let Some(si) = take_intersecting(&mut pool, &left) {
                if intersects_any(&si, &right) {
                    // A shard overlapping both sides is not a split/merge
                    // layout; the group cannot be labeled.
                    tracing::warn!(shard = %si.shard_name, "shard intersects both overlap sides");
                    pool.push(si);
                    three_way = true;
                    break;
                }
                right.push(si);
                found_one = true;
            }
            if let Some(si) = take_intersecting(&mut pool, &right) {
                if intersects_any(&si, &left) {
                    tracing::warn!(shard = %si.shard_name, "shard intersects both overlap sides");
                    pool.push(si);
                    three_way = true;
                    break;
                }
                left.push(si);
                found_one = true;
            }
            if !found_one {
                break;
            }
        }

        if three_way || right.is_empty() {
            continue;
        }
        sort_by_range_start(&mut left);
        sort_by_range_start(&mut right);
        if has_holes(&left) || has_holes(&right) {
            continue;
        }
        let (lf, ll) = (&left[0], &left[left.len() - 1]);
        let (rf, rl) = (&right[0], &right[right.len() - 1]);
        if !key_range_start_equal(lf.shard.key_range.as_ref(), rf.shard.key_range.as_ref())
            || !key_range_end_equal(ll.shard.key_range.as_ref(), rl.shard.key_range.as_ref())
        {
            continue;
        }
        result.push(OverlappingShards { left, right });
    }
    result
}

fn take_intersecting(pool: &mut Vec<ShardInfo>, side: &[ShardInfo]) -> Option<ShardInfo> {
    let idx = pool.iter().position(|si| intersects_any(si, side))?;
    Some(pool.remove(idx))
}

fn intersects_any(si: &ShardInfo, side: &[ShardInfo]) -> bool {
    side.iter().any(|other| {
        key_ranges_intersect(si.shard.key_range.as_ref(), other.shard.key_range.as_ref())
    })
}

fn sort_by_range_start(side: &mut [ShardInfo]) {
    side.sort_by(|a, b| {
        let ka = a.shard.key_range.as_ref().map(|k| k.start.as_slice());
        let kb = b.shard.key_range.as_ref().map(|k| k.start.as_slice());
        ka.unwrap_or(&[]).cmp(kb.unwrap_or(&[]))
    });
}

fn has_holes(side: &[ShardInfo]) -> bool {
    side.windows(2).any(|w| {
        let end = w[0].shard.key_range.as_ref().map(|k| k.end.as_slice());
        let start = w[1].shard.key_range.as_ref().map(|k| k.start.as_slice());
        end.unwrap_or(&[]) != start.unwrap_or(&[])
    })
}

/// Label the two sides of an overlapping group as `(sources, destinations)`.
///
/// After primary cutover both sides can carry `source_shards` (reverse
/// replication), so the frozen bit on a primary tablet control wins over
/// `source_shards` presence.
pub fn find_source_dest(
    os: OverlappingShards,
) -> Result<(Vec<ShardInfo>, Vec<ShardInfo>), String> {
    let frozen = |si: &ShardInfo| {
        si.shard
            .get_tablet_control(TabletType::Primary)
            .is_some_and(|tc| tc.frozen)
    };
    if os.left.iter().any(frozen) {
        return Ok((os.left, os.right));
    }
    if os.right.iter().any(frozen) {
        return Ok((os.right, os.left));
    }
    if os.left.iter().any(|si| !si.shard.source_shards.is_empty()) {
        return Ok((os.right, os.left));
    }
    if os.right.iter().any(|si| !si.shard.source_shards.is_empty()) {
        return Ok((os.left, os.right));
    }
    Err(format!(
        "neither shard {} nor shard {} has a SourceShards entry; was a clone ever run, \
         or was PRIMARY already migrated?",
        os.left[0].shard_name, os.right[0].shard_name
    ))
}
