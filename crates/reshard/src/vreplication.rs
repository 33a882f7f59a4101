//! VReplication control-plane statements.
//!
//! The orchestrator never talks to the CDC engine directly: it sends
//! SQL-shaped statements against the per-primary `_vt.vreplication` table
//! through [`crate::tmclient::TabletManagerClient::vreplication_exec`]. This
//! module builds those statements and the stream-source payload they embed.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::topo::KeyRange;

/// VReplication stream states as stored in the `state` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    /// Created and ready to be picked up by the engine.
    Init,
    Running,
    Stopped,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Init => "Init",
            StreamState::Running => "Running",
            StreamState::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One replication filter rule: a table match (or `/.*` regexp) plus an
/// optional key-range predicate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(rename = "match")]
    pub match_expr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filter: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub rules: Vec<Rule>,
}

/// Where a stream reads from: a keyspace/shard plus either a rule filter
/// (clones) or a key range (reverse resharding streams).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogSource {
    pub keyspace: String,
    pub shard: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_range: Option<KeyRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
}

/// Statement creating a stream row in the given state.
pub fn create_vreplication(
    workflow: &str,
    source: &BinlogSource,
    position: &str,
    state: StreamState,
    db_name: &str,
) -> String {
    // The source payload is opaque to the tablet; JSON keeps it readable in
    // the table.
    let payload = serde_json::to_string(source).expect("binlog source serializes");
    format!(
        "insert into _vt.vreplication \
         (workflow, source, pos, max_tps, max_replication_lag, time_updated, transaction_timestamp, state, db_name) \
         values ({}, {}, {}, 9223372036854775807, 9223372036854775807, 0, 0, '{}', {})",
        encode_string(workflow),
        encode_string(&payload),
        encode_string(position),
        state.as_str(),
        encode_string(db_name),
    )
}

/// Statement flipping a stream row to the given state.
pub fn update_vreplication_state(uid: u32, state: StreamState) -> String {
    format!("update _vt.vreplication set state='{}' where id={uid}", state.as_str())
}

/// Statement starting a stopped stream.
pub fn start_vreplication(uid: u32) -> String {
    format!("update _vt.vreplication set state='Running', stop_pos=NULL where id={uid}")
}

/// Statement deleting a stream row.
pub fn delete_vreplication(uid: u32) -> String {
    format!("delete from _vt.vreplication where id={uid}")
}

/// Statement listing a database's stream rows.
pub fn list_vreplication(db_name: &str) -> String {
    format!("select * from _vt.vreplication where db_name={}", encode_string(db_name))
}

/// Statement probing for an existing workflow by name.
pub fn select_workflow(db_name: &str, workflow: &str) -> String {
    format!(
        "select 1 from _vt.vreplication where db_name={} and workflow={}",
        encode_string(db_name),
        encode_string(workflow),
    )
}

/// Statement probing for a leftover frozen stream.
pub fn select_frozen(db_name: &str) -> String {
    format!(
        "select 1 from _vt.vreplication where db_name={} and message='FROZEN'",
        encode_string(db_name),
    )
}

/// SQL single-quoted string literal.
fn encode_string(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}
