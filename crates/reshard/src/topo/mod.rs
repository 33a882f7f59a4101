//! Topology data model: keyspaces, shards, tablets, serving directories.
//!
//! Records in this module are what the topology service stores. They carry no
//! behavior beyond local mutation helpers; all persistence goes through the
//! [`store::TopoServer`] trait. Key ranges are half-open byte intervals with
//! an empty side meaning unbounded, printed as lowercase hex (`"40-80"`).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod memory;
pub mod overlap;
pub mod serving;
pub mod store;

pub use store::{KeyspaceLock, TopoError, TopoResult, TopoServer};

/// Tablet roles that can serve queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TabletType {
    Primary,
    Replica,
    Rdonly,
}

impl fmt::Display for TabletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TabletType::Primary => write!(f, "PRIMARY"),
            TabletType::Replica => write!(f, "REPLICA"),
            TabletType::Rdonly => write!(f, "RDONLY"),
        }
    }
}

impl TabletType {
    /// All types the serving directory partitions over.
    pub const ALL: [TabletType; 3] = [TabletType::Primary, TabletType::Replica, TabletType::Rdonly];
}

/// Column type used to compute keyspace ids for a sharded keyspace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyspaceIdType {
    #[default]
    Unset,
    Uint64,
    Bytes,
}

/// Half-open interval of the logical keyspace-id space.
///
/// An empty `start` means unbounded below, an empty `end` unbounded above.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Whether the two ranges share at least one key.
    pub fn intersects(&self, other: &KeyRange) -> bool {
        (self.end.is_empty() || other.start < self.end)
            && (other.end.is_empty() || self.start < other.end)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", hex_encode(&self.start), hex_encode(&self.end))
    }
}

/// Equality over optional ranges, `None` meaning the full range.
pub fn key_range_equal(a: Option<&KeyRange>, b: Option<&KeyRange>) -> bool {
    range_bound(a, Bound::Start) == range_bound(b, Bound::Start)
        && range_bound(a, Bound::End) == range_bound(b, Bound::End)
}

/// Start bounds match, `None` meaning unbounded.
pub fn key_range_start_equal(a: Option<&KeyRange>, b: Option<&KeyRange>) -> bool {
    range_bound(a, Bound::Start) == range_bound(b, Bound::Start)
}

/// End bounds match, `None` meaning unbounded.
pub fn key_range_end_equal(a: Option<&KeyRange>, b: Option<&KeyRange>) -> bool {
    range_bound(a, Bound::End) == range_bound(b, Bound::End)
}

/// Intersection over optional ranges, `None` meaning the full range.
pub fn key_ranges_intersect(a: Option<&KeyRange>, b: Option<&KeyRange>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.intersects(b),
        // A full range intersects everything.
        _ => true,
    }
}

/// Printable form of an optional range; the full range prints as `"-"`.
pub fn key_range_string(kr: Option<&KeyRange>) -> String {
    match kr {
        Some(kr) => kr.to_string(),
        None => "-".to_string(),
    }
}

enum Bound {
    Start,
    End,
}

fn range_bound<'a>(kr: Option<&'a KeyRange>, bound: Bound) -> &'a [u8] {
    match kr {
        Some(kr) => match bound {
            Bound::Start => &kr.start,
            Bound::End => &kr.end,
        },
        None => &[],
    }
}

/// Parse a shard name into its key range.
///
/// Range-named shards look like `"-80"`, `"40-80"`, `"c0-"`. Names without a
/// dash (for example `"0"` in an unsharded keyspace) have no range and return
/// `Ok(None)`. A malformed hex bound is an error.
pub fn key_range_from_shard_name(name: &str) -> Result<Option<KeyRange>, String> {
    let Some((start, end)) = name.split_once('-') else {
        return Ok(None);
    };
    let start = hex_decode(start).map_err(|e| format!("invalid shard name {name:?}: {e}"))?;
    let end = hex_decode(end).map_err(|e| format!("invalid shard name {name:?}: {e}"))?;
    Ok(Some(KeyRange { start, end }))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err(format!("odd-length hex bound {s:?}"));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect()
}

/// Globally unique tablet identity, printed as `cell-uid`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TabletAlias {
    pub cell: String,
    pub uid: u32,
}

impl TabletAlias {
    pub fn new(cell: impl Into<String>, uid: u32) -> Self {
        Self {
            cell: cell.into(),
            uid,
        }
    }
}

impl fmt::Display for TabletAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.cell, self.uid)
    }
}

/// A running database server instance with an assigned role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tablet {
    pub alias: TabletAlias,
    pub keyspace: String,
    pub shard: String,
    pub tablet_type: TabletType,
    pub hostname: String,
    /// Named ports, e.g. `"vt"` for the web status port.
    pub port_map: BTreeMap<String, u16>,
}

impl Tablet {
    /// Database name serving this tablet's keyspace.
    pub fn db_name(&self) -> String {
        format!("vt_{}", self.keyspace)
    }
}

/// Per-tablet-type serving restrictions stored on a shard record.
///
/// `cells: None` scopes the control to every cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletControl {
    pub tablet_type: TabletType,
    pub cells: Option<Vec<String>>,
    pub deny_query_service: bool,
    /// Point-of-no-return marker for primary cutover; see the migrators.
    pub frozen: bool,
    pub denied_tables: Vec<String>,
}

/// One inbound replication binding on a destination shard record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceShard {
    /// Stream id on the destination primary's `_vt.vreplication` table.
    pub uid: u32,
    pub keyspace: String,
    pub shard: String,
    pub key_range: Option<KeyRange>,
    pub tables: Vec<String>,
}

impl fmt::Display for SourceShard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.keyspace, self.shard, self.uid)?;
        if !self.tables.is_empty() {
            write!(f, " tables: {}", self.tables.join(","))?;
        }
        Ok(())
    }
}

/// One key-range partition of a keyspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub primary_alias: Option<TabletAlias>,
    pub key_range: Option<KeyRange>,
    /// Non-empty iff this shard receives replicated data; makes it a destination.
    pub source_shards: Vec<SourceShard>,
    pub tablet_controls: Vec<TabletControl>,
    pub is_primary_serving: bool,
}

impl Shard {
    pub fn get_tablet_control(&self, tablet_type: TabletType) -> Option<&TabletControl> {
        self.tablet_controls
            .iter()
            .find(|tc| tc.tablet_type == tablet_type)
    }

    pub fn get_tablet_control_mut(&mut self, tablet_type: TabletType) -> Option<&mut TabletControl> {
        self.tablet_controls
            .iter_mut()
            .find(|tc| tc.tablet_type == tablet_type)
    }
}

/// Shard record plus its identity and store version for compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub keyspace: String,
    pub shard_name: String,
    pub shard: Shard,
    pub version: u64,
}

impl ShardInfo {
    /// `keyspace/shard` display form.
    pub fn path(&self) -> String {
        format!("{}/{}", self.keyspace, self.shard_name)
    }
}

/// Marker that a tablet type of this keyspace is served by another keyspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServedFrom {
    pub tablet_type: TabletType,
    /// `None` means every cell.
    pub cells: Option<Vec<String>>,
    pub keyspace: String,
}

/// Keyspace record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyspace {
    pub sharding_column_name: String,
    pub sharding_column_type: KeyspaceIdType,
    /// Non-empty iff this keyspace is a vertical-split target.
    pub served_froms: Vec<ServedFrom>,
}

/// Keyspace record plus identity and store version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyspaceInfo {
    pub name: String,
    pub keyspace: Keyspace,
    pub version: u64,
}

impl KeyspaceInfo {
    pub fn get_served_from(&self, tablet_type: TabletType) -> Option<&ServedFrom> {
        self.keyspace
            .served_froms
            .iter()
            .find(|sf| sf.tablet_type == tablet_type)
    }
}

/// Reference to a serving shard inside a serving-directory partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardReference {
    pub name: String,
    pub key_range: Option<KeyRange>,
}

/// One tablet type's list of serving shards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyspacePartition {
    pub served_type: TabletType,
    pub shard_references: Vec<ShardReference>,
}

/// Per-cell serving directory for one keyspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrvKeyspace {
    pub partitions: Vec<KeyspacePartition>,
    pub served_from: Vec<ServedFrom>,
}

impl SrvKeyspace {
    pub fn partition(&self, served_type: TabletType) -> Option<&KeyspacePartition> {
        self.partitions
            .iter()
            .find(|p| p.served_type == served_type)
    }

    pub fn partition_mut(&mut self, served_type: TabletType) -> &mut KeyspacePartition {
        if let Some(idx) = self
            .partitions
            .iter()
            .position(|p| p.served_type == served_type)
        {
            return &mut self.partitions[idx];
        }
        self.partitions.push(KeyspacePartition {
            served_type,
            shard_references: Vec::new(),
        });
        self.partitions.last_mut().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kr(start: &[u8], end: &[u8]) -> KeyRange {
        KeyRange::new(start.to_vec(), end.to_vec())
    }

    #[test]
    fn shard_names_parse_to_ranges() {
        assert_eq!(key_range_from_shard_name("0").unwrap(), None);
        assert_eq!(
            key_range_from_shard_name("-80").unwrap(),
            Some(kr(b"", &[0x80]))
        );
        assert_eq!(
            key_range_from_shard_name("40-80").unwrap(),
            Some(kr(&[0x40], &[0x80]))
        );
        assert_eq!(
            key_range_from_shard_name("c0-").unwrap(),
            Some(kr(&[0xc0], b""))
        );
        assert!(key_range_from_shard_name("4-80").is_err());
        assert!(key_range_from_shard_name("zz-").is_err());
    }

    #[test]
    fn range_display_round_trips_shard_names() {
        for name in ["-80", "40-80", "c0-", "-"] {
            let parsed = key_range_from_shard_name(name).unwrap().unwrap();
            assert_eq!(parsed.to_string(), name);
        }
    }

    #[test]
    fn intersection_honors_open_bounds() {
        let left = kr(b"", &[0x80]);
        let right = kr(&[0x80], b"");
        let full = kr(b"", b"");
        assert!(!left.intersects(&right));
        assert!(left.intersects(&full));
        assert!(full.intersects(&right));
        assert!(kr(&[0x40], &[0x80]).intersects(&kr(&[0x60], &[0xc0])));
        assert!(!kr(&[0x40], &[0x60]).intersects(&kr(&[0x60], &[0xc0])));
    }

    #[test]
    fn optional_range_equality_treats_none_as_full() {
        assert!(key_range_equal(None, None));
        assert!(key_range_equal(Some(&kr(b"", b"")), None));
        assert!(!key_range_equal(Some(&kr(b"", &[0x80])), None));
        assert!(key_ranges_intersect(None, Some(&kr(&[0x80], b""))));
    }
}
