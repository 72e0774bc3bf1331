//! Transport application table.
//!
//! The transport assigns each application a client id through its
//! configuration file. The Execution Manager inverts that table into a
//! `client_id -> app_id` map so incoming PHM messages can be routed to the
//! per-application supervisor.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use tracing::debug;
use vecu_core::com::ClientId;

use crate::manifest::de_u16;

#[derive(Debug, Deserialize)]
struct AppTable {
    #[serde(default)]
    applications: Vec<AppTableEntry>,
}

#[derive(Debug, Deserialize)]
struct AppTableEntry {
    name: String,
    #[serde(deserialize_with = "de_u16")]
    id: ClientId,
}

/// Build the `client_id -> app_id` map from the application table at
/// `path`, restricted to apps that appear in the loaded manifests.
///
/// # Errors
///
/// Returns an error if the table cannot be read or parsed.
pub fn load_client_map(
    path: &Path,
    known_apps: &HashSet<String>,
) -> anyhow::Result<HashMap<ClientId, String>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read application table {}", path.display()))?;
    let table: AppTable = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse application table {}", path.display()))?;

    let mut map = HashMap::new();
    for entry in table.applications {
        if known_apps.contains(&entry.name) {
            debug!(app = %entry.name, client_id = entry.id, "mapped transport client");
            map.insert(entry.id, entry.name);
        }
    }
    Ok(map)
}
