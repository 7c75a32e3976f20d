//! Presence payloads and snapshot normalization.
//!
//! Brokers report presence as a mapping from transport-level client id to a
//! user descriptor, but older backends send a plain list of usernames or a
//! list of user objects. [`normalize_snapshot`] accepts every one of those
//! shapes and always yields a flat set of identity strings.
//! [`snapshot_connections`] keeps the client ids where the shape has them.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A connected client as reported in join/leave and presence frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Transport-level client identifier (one per connection).
    pub client: String,
    /// Identity of the user behind the connection.
    #[serde(alias = "username")]
    pub user: String,
}

/// Flattens a presence snapshot into the set of online identities.
///
/// Accepted shapes:
/// - `{"<client>": {"user": "alice"}, ...}` (or `"username"`)
/// - `{"<client>": "alice", ...}`
/// - `["alice", "bob"]`
/// - `[{"username": "alice"}, {"user": "bob"}]`
///
/// Entries without a recognisable identity are skipped; `null` yields an
/// empty set.
#[must_use]
pub fn normalize_snapshot(snapshot: &Value) -> BTreeSet<String> {
    match snapshot {
        Value::Object(map) => map.values().filter_map(identity_of).collect(),
        Value::Array(items) => items.iter().filter_map(identity_of).collect(),
        _ => BTreeSet::new(),
    }
}

/// Maps each client id in a snapshot to its identity.
///
/// Only map-shaped snapshots and list entries carrying a `client` field
/// name their connections; plain lists yield nothing.
#[must_use]
pub fn snapshot_connections(snapshot: &Value) -> BTreeMap<String, String> {
    match snapshot {
        Value::Object(map) => map
            .iter()
            .filter_map(|(client, entry)| Some((client.clone(), identity_of(entry)?)))
            .collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|entry| {
                let client = entry.get("client")?.as_str()?;
                Some((client.to_string(), identity_of(entry)?))
            })
            .collect(),
        _ => BTreeMap::new(),
    }
}

/// Extracts the identity from one presence entry.
#[must_use]
pub fn identity_of(entry: &Value) -> Option<String> {
    let identity = match entry {
        Value::String(name) => Some(name.as_str()),
        Value::Object(fields) => fields
            .get("user")
            .or_else(|| fields.get("username"))
            .and_then(Value::as_str),
        _ => None,
    }?;
    let identity = identity.trim();
    (!identity.is_empty()).then(|| identity.to_string())
}
