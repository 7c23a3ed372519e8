// Local peer-discovery records.
//
// A small keyed JSON file per machine, best effort on every write: nodes
// announce `{node_id, endpoint, port, plugins}` when their server starts and
// remove themselves on shutdown. This is peripheral state for a discovery
// collaborator, not part of the wire protocol.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    #[serde(rename = "ID")]
    pub node_id: String,
    pub endpoint: String,
    pub port: u16,
    pub plugins: Vec<String>,
    /// Stale entries are the reader's problem; announcing only refreshes.
    pub updated_at: DateTime<Utc>,
}

fn read_registry(path: &Path) -> HashMap<String, DiscoveryRecord> {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => HashMap::new(),
    }
}

fn write_registry(path: &Path, registry: &HashMap<String, DiscoveryRecord>) {
    match serde_json::to_string(registry) {
        Ok(raw) => {
            if let Err(err) = std::fs::write(path, raw) {
                debug!("could not write discovery registry: {}", err);
            }
        }
        Err(err) => debug!("could not serialize discovery registry: {}", err),
    }
}

/// Announce (or refresh) this node's entry.
pub fn make_discoverable(
    path: &Path,
    node_id: &str,
    endpoint: &str,
    port: u16,
    plugins: Vec<String>,
) {
    let mut registry = read_registry(path);
    registry.insert(
        node_id.to_string(),
        DiscoveryRecord {
            node_id: node_id.to_string(),
            endpoint: endpoint.to_string(),
            port,
            plugins,
            updated_at: Utc::now(),
        },
    );
    write_registry(path, &registry);
}

/// All currently announced nodes.
pub fn discover_nodes(path: &Path) -> Vec<DiscoveryRecord> {
    if !path.exists() {
        return Vec::new();
    }
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<HashMap<String, DiscoveryRecord>>(&raw) {
            Ok(registry) => registry.into_values().collect(),
            Err(_) => {
                error!("error while reading plugin discovery registry");
                Vec::new()
            }
        },
        Err(_) => Vec::new(),
    }
}

/// Remove this node's own entry.
pub fn remove_node(path: &Path, node_id: &str) {
    if !path.exists() {
        return;
    }
    let mut registry = read_registry(path);
    if registry.remove(node_id).is_some() {
        write_registry(path, &registry);
    }
}
