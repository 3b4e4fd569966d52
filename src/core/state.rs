use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::config::FreezerState;
use crate::core::error::{Error, Result};
use crate::platform::linux::network::NetworkState;
use crate::util;

/// Name of the per-container runtime state file inside the container root.
pub const STATE_FILE: &str = "state.json";

/// Mutable runtime state of a container, persisted after every committed
/// transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeState {
    /// Pid of the container init on the host (0 when no init runs).
    pub init_pid: i32,
    /// Init start time in clock ticks since boot, captured right after
    /// clone. Guards status probes against pid reuse.
    pub init_start_time: u64,
    /// Opaque per-network records, in the same order as the configured
    /// networks.
    pub network_state: Vec<NetworkState>,
    /// Cgroup path per controller.
    pub cgroup_paths: BTreeMap<String, PathBuf>,
    /// Target state of the cgroup freezer. Persisted so a paused container
    /// is still reported paused after the engine restarts.
    #[serde(default)]
    pub freezer_target: FreezerState,
    /// When the init was last started.
    pub created: DateTime<Utc>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            init_pid: 0,
            init_start_time: 0,
            network_state: Vec::new(),
            cgroup_paths: BTreeMap::new(),
            freezer_target: FreezerState::Thawed,
            created: Utc::now(),
        }
    }
}

/// Path of the state file inside a container root.
pub fn state_path(root: &Path) -> PathBuf {
    root.join(STATE_FILE)
}

/// Persist the runtime state atomically inside the container root.
pub fn save(root: &Path, state: &RuntimeState) -> Result<()> {
    let json = serde_json::to_vec_pretty(state)
        .map_err(|e| Error::system("serialize runtime state", e))?;
    util::fs::atomic_replace(&state_path(root), &json)
}

/// Load the runtime state from the container root, if one was ever
/// committed.
pub fn load(root: &Path) -> Result<Option<RuntimeState>> {
    let path = state_path(root);
    let data = match fs::read_to_string(&path) {
        Ok(v) => v,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::system(format!("read {}", path.display()), e)),
    };
    let state = serde_json::from_str(&data)
        .map_err(|e| Error::system(format!("parse {}", path.display()), e))?;
    Ok(Some(state))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> RuntimeState {
        RuntimeState {
            init_pid: 4711,
            init_start_time: 88_123_456,
            network_state: vec![NetworkState {
                kind: "loopback".into(),
                interface: Some("lo".into()),
                ..Default::default()
            }],
            cgroup_paths: BTreeMap::from([(
                "unified".to_string(),
                PathBuf::from("/sys/fs/cgroup/vessel/c1"),
            )]),
            freezer_target: FreezerState::Frozen,
            created: Utc::now(),
        }
    }

    #[test]
    fn state_round_trip() {
        let state = sample_state();
        let json = serde_json::to_string(&state).unwrap();
        let back: RuntimeState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let state = sample_state();

        save(dir.path(), &state).unwrap();
        let loaded = load(dir.path()).unwrap().expect("state file present");
        assert_eq!(loaded, state);

        // No temporary left behind.
        assert!(!dir.path().join("state.json.new").exists());
    }

    #[test]
    fn load_absent_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn state_without_freezer_field_defaults_to_thawed() {
        // State files written before the freezer target was recorded.
        let json = r#"{
            "init_pid": 7,
            "init_start_time": 99,
            "network_state": [],
            "cgroup_paths": {},
            "created": "2025-01-01T00:00:00Z"
        }"#;
        let state: RuntimeState = serde_json::from_str(json).unwrap();
        assert_eq!(state.freezer_target, FreezerState::Thawed);
    }

    #[test]
    fn save_overwrites_previous_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = sample_state();

        save(dir.path(), &state).unwrap();
        state.init_pid = 0;
        state.init_start_time = 0;
        save(dir.path(), &state).unwrap();

        let loaded = load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.init_pid, 0);
    }
}
