//! Pause/resume persistence across restarts.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Serialize, Deserialize)]
struct RefreshStateFile {
    enabled: bool,
}

/// Defaults to enabled when the file is missing or unreadable.
pub fn load_enabled(path: &Path) -> bool {
    match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<RefreshStateFile>(&raw)
            .map(|state| state.enabled)
            .unwrap_or(true),
        Err(_) => true,
    }
}

/// Best-effort write; a failed persist only logs.
pub fn store_enabled(path: &Path, enabled: bool) {
    if let Some(parent) = path.parent() {
        if let Err(err) = fs::create_dir_all(parent) {
            warn!(target: "live_refresh", ?err, "failed to create refresh state dir");
            return;
        }
    }
    let raw = match serde_json::to_string_pretty(&RefreshStateFile { enabled }) {
        Ok(raw) => raw,
        Err(_) => return,
    };
    if let Err(err) = fs::write(path, raw) {
        warn!(target: "live_refresh", ?err, "failed to persist refresh state");
    }
}

pub fn default_state_path(storage_path: Option<&Path>) -> PathBuf {
    if let Some(root) = storage_path {
        root.join("refresh_state.json")
    } else {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pagepulse")
            .join("refresh_state.json")
    }
}
