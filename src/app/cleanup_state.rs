//! Crash-cleanup cache (`cleanup_state.json`)
//!
//! After a successful connect the applied side effects (routes and
//! kill-switch rule names) are cached next to the executable. A clean
//! disconnect deletes the file; if the process dies first, the next launch
//! finds the cache and sweeps the leftovers opportunistically.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::state::RouteRecord;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupState {
    #[serde(default)]
    pub routes: Vec<RouteRecord>,
    #[serde(default)]
    pub kill_switch_rules: Vec<String>,
}

impl CleanupState {
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty() && self.kill_switch_rules.is_empty()
    }
}

/// Writes the cache; failures are reported but never fatal.
pub fn save(path: &Path, state: &CleanupState) -> std::io::Result<()> {
    let data = serde_json::to_vec_pretty(state)
        .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidData, error))?;
    std::fs::write(path, data)
}

/// Reads the cache if present and parseable.
pub fn load(path: &Path) -> Option<CleanupState> {
    let data = std::fs::read(path).ok()?;
    match serde_json::from_slice::<CleanupState>(&data) {
        Ok(state) => Some(state),
        Err(error) => {
            log::warn!(
                "cleanup state {} is unreadable, ignoring: {}",
                path.display(),
                error
            );
            None
        }
    }
}

/// Removes the cache; a missing file is fine.
pub fn delete(path: &Path) {
    if let Err(error) = std::fs::remove_file(path) {
        if error.kind() != std::io::ErrorKind::NotFound {
            log::warn!("delete cleanup state {} failed: {}", path.display(), error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RouteKind;

    fn temp_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "customvpn-cleanup-{}-{}.json",
            tag,
            std::process::id()
        ))
    }

    #[test]
    fn save_load_delete_round_trip() {
        let path = temp_path("roundtrip");
        let state = CleanupState {
            routes: vec![RouteRecord {
                id: "Direct-10.0.0.0/8-1".to_string(),
                destination: "10.0.0.0/8".to_string(),
                gateway: "192.168.1.1".to_string(),
                interface_index: 12,
                metric: 1,
                kind: RouteKind::Direct,
                created_at: None,
                active: true,
            }],
            kill_switch_rules: vec!["CustomVPN DNS Block (Ethernet) UDP".to_string()],
        };
        save(&path, &state).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.routes.len(), 1);
        assert_eq!(loaded.routes[0].destination, "10.0.0.0/8");
        assert_eq!(loaded.kill_switch_rules.len(), 1);

        delete(&path);
        assert!(load(&path).is_none());
        // Deleting twice stays quiet.
        delete(&path);
    }

    #[test]
    fn unreadable_cache_is_ignored() {
        let path = temp_path("garbage");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(load(&path).is_none());
        delete(&path);
    }
}
