use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::core::config::{CgroupSpec, FreezerState};
use crate::core::error::{Error, Result};
use crate::util;

/// Capability set the engine requires from a cgroup back-end.
///
/// The container owns exactly one manager, handed in at construction; the
/// core never names a concrete driver type.
pub trait CgroupManager: Send + Sync {
    /// Place a pid into the cgroup.
    fn apply(&self, pid: Pid) -> Result<()>;
    /// Current member pids.
    fn pids(&self) -> Result<Vec<Pid>>;
    /// Resource usage counters.
    fn stats(&self) -> Result<CgroupStats>;
    /// Filesystem path per controller.
    fn paths(&self) -> BTreeMap<String, PathBuf>;
    /// Set the freezer target. Back-ends without freezer support treat
    /// this as a no-op.
    fn freeze(&self, state: FreezerState) -> Result<()>;
    /// Release the cgroup.
    fn destroy(&self) -> Result<()>;
    /// One-shot channel firing when the kernel reports an OOM kill in the
    /// cgroup.
    fn oom_notify(&self) -> Result<mpsc::Receiver<()>> {
        Err(Error::NotImplemented {
            operation: "oom notification",
        })
    }
}

/// Resource usage counters collected from a cgroup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupStats {
    /// Bytes of memory currently charged.
    pub memory_current: u64,
    /// Number of member pids.
    pub pids_current: u64,
    /// Total CPU time consumed, microseconds.
    pub cpu_usage_usec: u64,
}

/// Cgroup v2 unified-hierarchy manager backed by a single directory.
pub struct FsManager {
    path: PathBuf,
}

impl FsManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the cgroup directory and apply the configured limits.
    /// Called by the factory that allocates the container's hierarchy.
    pub fn create(&self, spec: &CgroupSpec) -> Result<()> {
        util::fs::ensure_dir(&self.path)?;
        if let Some(parent) = self.path.parent() {
            enable_controllers(parent);
        }

        if let Some(memory) = spec.memory {
            self.write_control("memory.max", &memory.to_string())?;
        }
        if let Some(cpu) = &spec.cpu {
            self.write_control("cpu.max", cpu)?;
        }
        if let Some(pids) = spec.pids {
            self.write_control("pids.max", &pids.to_string())?;
        }
        if let Some(freezer) = spec.freezer {
            self.freeze(freezer)?;
        }
        Ok(())
    }

    fn write_control(&self, name: &str, value: &str) -> Result<()> {
        let file = self.path.join(name);
        fs::write(&file, value)
            .map_err(|e| Error::system(format!("write {value:?} to {}", file.display()), e))
    }

    /// Read a single-value control file; an absent controller reads as 0.
    fn read_counter(&self, name: &str) -> Result<u64> {
        let file = self.path.join(name);
        let data = match fs::read_to_string(&file) {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::system(format!("read {}", file.display()), e)),
        };
        data.trim()
            .parse()
            .map_err(|_| Error::system(format!("parse {}", file.display()), invalid_data()))
    }
}

fn invalid_data() -> std::io::Error {
    std::io::Error::new(ErrorKind::InvalidData, "malformed cgroup value")
}

impl CgroupManager for FsManager {
    fn apply(&self, pid: Pid) -> Result<()> {
        self.write_control("cgroup.procs", &pid.to_string())
    }

    fn pids(&self) -> Result<Vec<Pid>> {
        let file = self.path.join("cgroup.procs");
        let data = fs::read_to_string(&file)
            .map_err(|e| Error::system(format!("read {}", file.display()), e))?;
        let mut pids = Vec::new();
        for line in data.lines().filter(|l| !l.trim().is_empty()) {
            let raw: i32 = line
                .trim()
                .parse()
                .map_err(|_| Error::system(format!("parse {}", file.display()), invalid_data()))?;
            pids.push(Pid::from_raw(raw));
        }
        Ok(pids)
    }

    fn stats(&self) -> Result<CgroupStats> {
        let cpu_stat = match fs::read_to_string(self.path.join("cpu.stat")) {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(Error::system("read cpu.stat", e)),
        };
        Ok(CgroupStats {
            memory_current: self.read_counter("memory.current")?,
            pids_current: self.read_counter("pids.current")?,
            cpu_usage_usec: parse_flat_keyed(&cpu_stat, "usage_usec"),
        })
    }

    fn paths(&self) -> BTreeMap<String, PathBuf> {
        BTreeMap::from([("unified".to_string(), self.path.clone())])
    }

    fn freeze(&self, state: FreezerState) -> Result<()> {
        let value = match state {
            FreezerState::Frozen => "1",
            FreezerState::Thawed => "0",
        };
        let file = self.path.join("cgroup.freeze");
        match fs::write(&file, value) {
            Ok(()) => Ok(()),
            // No freezer support in this hierarchy; callers tolerate the
            // no-op.
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("freezer absent at {}", file.display());
                Ok(())
            }
            Err(e) => Err(Error::system(format!("write {}", file.display()), e)),
        }
    }

    fn destroy(&self) -> Result<()> {
        // Dying members may briefly hold the directory busy after a
        // kill; retry a few times before reporting.
        let mut last = None;
        for _ in 0..10 {
            match fs::remove_dir(&self.path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
                Err(e) => last = Some(e),
            }
            thread::sleep(Duration::from_millis(10));
        }
        Err(Error::system(
            format!("remove cgroup {}", self.path.display()),
            last.unwrap_or_else(invalid_data),
        ))
    }

    fn oom_notify(&self) -> Result<mpsc::Receiver<()>> {
        let events = self.path.join("memory.events");
        let baseline = match fs::read_to_string(&events) {
            Ok(v) => parse_flat_keyed(&v, "oom_kill"),
            Err(e) => return Err(Error::system(format!("read {}", events.display()), e)),
        };

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || loop {
            thread::sleep(Duration::from_millis(100));
            let current = match fs::read_to_string(&events) {
                Ok(v) => parse_flat_keyed(&v, "oom_kill"),
                // Cgroup went away; the container is gone.
                Err(_) => break,
            };
            if current > baseline {
                if tx.send(()).is_err() {
                    warn!("oom event dropped: receiver gone");
                }
                break;
            }
        });
        Ok(rx)
    }
}

/// Best-effort: enable every available controller in the parent so the
/// child's limit files exist. Populated hierarchies refuse the write; the
/// limit writes surface the real error in that case.
fn enable_controllers(parent: &Path) {
    let Ok(available) = fs::read_to_string(parent.join("cgroup.controllers")) else {
        return;
    };
    let enable: Vec<String> = available
        .split_whitespace()
        .map(|c| format!("+{c}"))
        .collect();
    if !enable.is_empty() {
        let _ = fs::write(parent.join("cgroup.subtree_control"), enable.join(" "));
    }
}

/// Extract one counter from a flat-keyed cgroup file (`key value` lines).
fn parse_flat_keyed(data: &str, key: &str) -> u64 {
    for line in data.lines() {
        if let Some((k, v)) = line.split_once(' ') {
            if k == key {
                return v.trim().parse().unwrap_or(0);
            }
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_keyed_parsing() {
        let data = "usage_usec 12345\nuser_usec 9000\nsystem_usec 3345\n";
        assert_eq!(parse_flat_keyed(data, "usage_usec"), 12345);
        assert_eq!(parse_flat_keyed(data, "system_usec"), 3345);
        assert_eq!(parse_flat_keyed(data, "missing"), 0);
        assert_eq!(parse_flat_keyed("", "usage_usec"), 0);
    }

    #[test]
    fn memory_events_oom_kill() {
        let data = "low 0\nhigh 2\nmax 4\noom 1\noom_kill 1\n";
        assert_eq!(parse_flat_keyed(data, "oom_kill"), 1);
    }

    #[test]
    fn apply_and_enumerate_pids() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FsManager::new(dir.path());

        manager.apply(Pid::from_raw(4711)).unwrap();
        // A plain directory stands in for cgroupfs: the write creates the
        // file, so one member is visible.
        assert_eq!(manager.pids().unwrap(), vec![Pid::from_raw(4711)]);
    }

    #[test]
    fn stats_tolerate_absent_controllers() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FsManager::new(dir.path());

        let stats = manager.stats().unwrap();
        assert_eq!(stats, CgroupStats::default());

        fs::write(dir.path().join("memory.current"), "1048576\n").unwrap();
        fs::write(dir.path().join("cpu.stat"), "usage_usec 777\n").unwrap();
        let stats = manager.stats().unwrap();
        assert_eq!(stats.memory_current, 1048576);
        assert_eq!(stats.cpu_usage_usec, 777);
    }

    #[test]
    fn freeze_without_freezer_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        // A hierarchy with no cgroup.freeze behaves like one: the write
        // fails with NotFound and freeze reports success.
        let manager = FsManager::new(dir.path().join("gone"));
        manager.freeze(FreezerState::Frozen).unwrap();
        manager.freeze(FreezerState::Thawed).unwrap();
    }

    #[test]
    fn destroy_removes_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("child");
        let manager = FsManager::new(&path);
        manager.create(&CgroupSpec::default()).unwrap();
        assert!(path.exists());

        manager.destroy().unwrap();
        assert!(!path.exists());
        manager.destroy().unwrap();
    }

    #[test]
    fn paths_expose_unified_hierarchy() {
        let manager = FsManager::new("/sys/fs/cgroup/vessel/c1");
        let paths = manager.paths();
        assert_eq!(
            paths.get("unified"),
            Some(&PathBuf::from("/sys/fs/cgroup/vessel/c1"))
        );
    }
}
