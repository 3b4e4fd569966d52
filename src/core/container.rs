use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use chrono::Utc;
use log::warn;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::core::config::{Config, FreezerState, Namespace, Process};
use crate::core::error::{Error, Result};
use crate::core::{id, state};
use crate::core::state::RuntimeState;
use crate::platform::linux::bootstrap;
use crate::platform::linux::cgroups::{CgroupManager, CgroupStats};
use crate::platform::linux::network::{NetworkRegistry, NetworkStats};
use crate::platform::linux::process as proc;

/// Observable container status. Exactly one holds at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// No live init: never started, exited, or torn down.
    Destroyed,
    /// The init is alive and not frozen.
    Running,
    /// The init is alive and the freezer target is frozen.
    Paused,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Destroyed => write!(f, "destroyed"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

/// Composite statistics snapshot: cgroup counters plus per-network
/// counters in configured-network order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub cgroup: CgroupStats,
    pub networks: Vec<NetworkStats>,
}

/// A failed statistics probe, carrying everything collected before the
/// first failure.
#[derive(Debug)]
pub struct StatsError {
    pub partial: Stats,
    pub source: Error,
}

impl fmt::Display for StatsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stats collection failed: {}", self.source)
    }
}

impl std::error::Error for StatsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl From<StatsError> for Error {
    fn from(err: StatsError) -> Self {
        err.source
    }
}

/// A single container: identity, immutable configuration, mutable runtime
/// state, and its cgroup manager.
///
/// Lifecycle operations are not concurrent-safe; the caller serializes
/// them. Status and stats probes may interleave with each other only.
pub struct Container {
    id: String,
    root: PathBuf,
    config: Config,
    state: RuntimeState,
    cgroup: Box<dyn CgroupManager>,
    networks: NetworkRegistry,
    init_argv: Vec<String>,
}

impl Container {
    /// Wire up a container over a root directory and cgroup hierarchy that
    /// the factory has already allocated. Previously committed runtime
    /// state is picked up from the root directory.
    pub fn new(
        id: impl Into<String>,
        root: impl Into<PathBuf>,
        config: Config,
        cgroup: Box<dyn CgroupManager>,
        networks: NetworkRegistry,
    ) -> Result<Self> {
        let id = id.into();
        if !id::validate_id(&id) {
            return Err(Error::mismatch(format!("invalid container id {id:?}")));
        }
        let root = root.into();
        // A previously committed state wins over the configured freezer
        // default; a pause survives the engine restarting.
        let state = match state::load(&root)? {
            Some(state) => state,
            None => RuntimeState {
                freezer_target: config.cgroup.freezer.unwrap_or_default(),
                ..Default::default()
            },
        };
        Ok(Self {
            id,
            root,
            config,
            state,
            cgroup,
            networks,
            init_argv: default_init_argv()?,
        })
    }

    /// Override the argv used to re-invoke this binary as the init helper.
    pub fn with_init_argv(mut self, argv: Vec<String>) -> Self {
        self.init_argv = argv;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The immutable configuration snapshot.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The most recently committed runtime state.
    pub fn state(&self) -> &RuntimeState {
        &self.state
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Probe liveness of the init and fold in the freezer target.
    pub fn status(&self) -> Result<Status> {
        if !self.init_alive()? {
            return Ok(Status::Destroyed);
        }
        if self.state.freezer_target == FreezerState::Frozen {
            Ok(Status::Paused)
        } else {
            Ok(Status::Running)
        }
    }

    /// Current member pids of the container's cgroup.
    pub fn processes(&self) -> Result<Vec<Pid>> {
        self.cgroup.pids()
    }

    /// Collect cgroup and per-network statistics. The first failing probe
    /// aborts collection; whatever was gathered rides along in the error.
    pub fn stats(&self) -> Result<Stats, StatsError> {
        let mut collected = Stats::default();

        match self.cgroup.stats() {
            Ok(stats) => collected.cgroup = stats,
            Err(source) => {
                return Err(StatsError {
                    partial: collected,
                    source,
                })
            }
        }
        for entry in &self.state.network_state {
            let probe = self
                .networks
                .resolve(&entry.kind)
                .and_then(|strategy| strategy.stats(entry));
            match probe {
                Ok(stats) => collected.networks.push(stats),
                Err(source) => {
                    return Err(StatsError {
                        partial: collected,
                        source,
                    })
                }
            }
        }
        Ok(collected)
    }

    /// Start the container, or inject a process into it when it is already
    /// running. Returns the pid of the new process.
    pub fn start(&mut self, process: Process) -> Result<Pid> {
        match self.status()? {
            Status::Destroyed => {
                let outcome = bootstrap::start_init(
                    &self.config,
                    process,
                    &self.init_argv,
                    self.cgroup.as_ref(),
                    &self.networks,
                )?;
                self.state.init_pid = outcome.init_pid.as_raw();
                self.state.init_start_time = outcome.init_start_time;
                self.state.network_state = outcome.network_state;
                self.state.cgroup_paths = self.cgroup.paths();
                self.state.freezer_target = self.config.cgroup.freezer.unwrap_or_default();
                self.state.created = Utc::now();
                state::save(&self.root, &self.state)?;
                Ok(outcome.init_pid)
            }
            _ => bootstrap::exec_in(
                &self.config,
                process,
                &self.init_argv,
                self.state.init_pid,
                &self.state.network_state,
                self.cgroup.as_ref(),
            ),
        }
    }

    /// Set the freezer target to frozen. Idempotent; the committed target
    /// is persisted with the runtime state.
    pub fn pause(&mut self) -> Result<()> {
        self.cgroup.freeze(FreezerState::Frozen)?;
        self.state.freezer_target = FreezerState::Frozen;
        state::save(&self.root, &self.state)
    }

    /// Set the freezer target to thawed. Idempotent; the committed target
    /// is persisted with the runtime state.
    pub fn resume(&mut self) -> Result<()> {
        self.cgroup.freeze(FreezerState::Thawed)?;
        self.state.freezer_target = FreezerState::Thawed;
        state::save(&self.root, &self.state)
    }

    /// Send a signal to the init pid. The recorded start time guards
    /// against signalling a recycled pid.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        if !self.init_alive()? {
            return Err(Error::system(
                "signal container init",
                std::io::Error::from_raw_os_error(libc::ESRCH),
            ));
        }
        kill(Pid::from_raw(self.state.init_pid), signal)
            .map_err(|e| Error::system("signal container init", e))
    }

    /// Tear down a stopped container: release the cgroup and remove the
    /// container root. Refuses while an init is alive; stopping is the
    /// caller's job.
    pub fn destroy(&mut self) -> Result<()> {
        if self.status()? != Status::Destroyed {
            return Err(Error::NotStopped);
        }
        // Without a PID namespace, descendants may have outlived the init.
        if !self.config.has_namespace(Namespace::Pid) {
            self.kill_all_pids()?;
        }
        self.cgroup.destroy()?;
        if self.root.exists() {
            fs::remove_dir_all(&self.root).map_err(|e| {
                Error::system(format!("remove container root {}", self.root.display()), e)
            })?;
        }
        self.state = RuntimeState::default();
        Ok(())
    }

    /// Reap the init, returning its exit code (`128 + signal` for a
    /// signalled exit), sweep leftover descendants when no PID namespace
    /// confines them, and commit the cleared runtime state.
    pub fn wait(&mut self) -> Result<i32> {
        if self.state.init_pid <= 0 {
            return Err(Error::system(
                "wait for container init",
                std::io::Error::from_raw_os_error(libc::ESRCH),
            ));
        }
        let code = proc::wait_exit_code(Pid::from_raw(self.state.init_pid))?;
        if !self.config.has_namespace(Namespace::Pid) {
            let _ = self.kill_all_pids();
        }
        self.state.init_pid = 0;
        self.state.init_start_time = 0;
        state::save(&self.root, &self.state)?;
        Ok(code)
    }

    /// One-shot channel that fires when the kernel reports an OOM kill in
    /// the container's cgroup.
    pub fn oom(&self) -> Result<mpsc::Receiver<()>> {
        self.cgroup.oom_notify()
    }

    /// Kill every pid in the cgroup: freeze (a no-op without freezer
    /// support), SIGKILL each member while recording failures, thaw, then
    /// reap. Needed when an init dies without a PID namespace to take its
    /// descendants with it.
    pub fn kill_all_pids(&self) -> Result<()> {
        self.cgroup.freeze(FreezerState::Frozen)?;
        let pids = match self.cgroup.pids() {
            Ok(v) => v,
            Err(e) => {
                let _ = self.cgroup.freeze(FreezerState::Thawed);
                return Err(e);
            }
        };
        for pid in &pids {
            match kill(*pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!("kill pid {pid}: {e}"),
            }
        }
        self.cgroup.freeze(FreezerState::Thawed)?;
        for pid in &pids {
            loop {
                match waitpid(*pid, None) {
                    Ok(_) => break,
                    Err(Errno::EINTR) => continue,
                    // Not our child, or already gone.
                    Err(Errno::ECHILD) | Err(Errno::ESRCH) => break,
                    Err(e) => return Err(Error::system(format!("wait pid {pid}"), e)),
                }
            }
        }
        Ok(())
    }

    /// An init is alive when its pid responds to signal 0 and its recorded
    /// start time still matches, ruling out pid reuse.
    fn init_alive(&self) -> Result<bool> {
        if self.state.init_pid <= 0 {
            return Ok(false);
        }
        let pid = Pid::from_raw(self.state.init_pid);
        match kill(pid, None) {
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(Error::system("probe container init", e)),
            Ok(()) => Ok(match proc::proc_start_time(pid) {
                Ok(start_time) => start_time == self.state.init_start_time,
                // Raced with process exit.
                Err(_) => false,
            }),
        }
    }
}

fn default_init_argv() -> Result<Vec<String>> {
    let exe = std::env::current_exe().map_err(|e| Error::system("resolve own binary", e))?;
    Ok(vec![exe.to_string_lossy().into_owned(), "init".into()])
}
