use std::fmt;
use std::os::fd::OwnedFd;
use std::path::PathBuf;

use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};

/// A kernel namespace kind requested for the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Mount,
    Uts,
    Ipc,
    User,
    Pid,
    Net,
    Cgroup,
}

impl Namespace {
    /// The clone flag selecting this namespace.
    pub fn clone_flag(self) -> CloneFlags {
        match self {
            Self::Mount => CloneFlags::CLONE_NEWNS,
            Self::Uts => CloneFlags::CLONE_NEWUTS,
            Self::Ipc => CloneFlags::CLONE_NEWIPC,
            Self::User => CloneFlags::CLONE_NEWUSER,
            Self::Pid => CloneFlags::CLONE_NEWPID,
            Self::Net => CloneFlags::CLONE_NEWNET,
            Self::Cgroup => CloneFlags::CLONE_NEWCGROUP,
        }
    }

    /// The entry name under `/proc/<pid>/ns/` for this namespace.
    pub fn proc_file(self) -> &'static str {
        match self {
            Self::Mount => "mnt",
            Self::Uts => "uts",
            Self::Ipc => "ipc",
            Self::User => "user",
            Self::Pid => "pid",
            Self::Net => "net",
            Self::Cgroup => "cgroup",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.proc_file())
    }
}

/// One uid/gid mapping entry for a user namespace: `size` consecutive IDs
/// starting at `container_id` inside map to IDs starting at `host_id` on
/// the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMap {
    /// Map a single host ID to root inside the namespace.
    pub fn root(host_id: u32) -> Self {
        Self {
            container_id: 0,
            host_id,
            size: 1,
        }
    }
}

/// Target state of the cgroup freezer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FreezerState {
    Thawed,
    Frozen,
}

impl Default for FreezerState {
    fn default() -> Self {
        Self::Thawed
    }
}

/// Resource limits and freezer target applied to the container's cgroup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CgroupSpec {
    /// Memory limit in bytes, written to `memory.max`.
    #[serde(default)]
    pub memory: Option<u64>,
    /// CPU bandwidth in the `quota period` form of `cpu.max`.
    #[serde(default)]
    pub cpu: Option<String>,
    /// Maximum number of pids, written to `pids.max`.
    #[serde(default)]
    pub pids: Option<u64>,
    /// Initial freezer target, if any.
    #[serde(default)]
    pub freezer: Option<FreezerState>,
}

/// A bind mount attached inside the container's rootfs before the pivot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Host path of the source.
    pub source: PathBuf,
    /// Absolute target path inside the container.
    pub target: PathBuf,
    /// Remount the binding read-only after attaching it.
    #[serde(default)]
    pub read_only: bool,
}

/// One configured container network: a strategy tag plus opaque parameters
/// interpreted by that strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Strategy tag resolved through the network registry (e.g. "loopback",
    /// "veth").
    pub kind: String,
    #[serde(default)]
    pub params: std::collections::BTreeMap<String, String>,
}

/// A route installed inside the container's network namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Destination in `a.b.c.d/len` form, or "default".
    pub destination: String,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub interface: Option<String>,
}

/// A resource limit applied to the init process before exec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rlimit {
    /// Limit name without the RLIMIT_ prefix, lowercase (e.g. "nofile").
    pub kind: String,
    pub soft: u64,
    pub hard: u64,
}

impl Rlimit {
    /// Resolve the limit name to the kernel resource constant.
    #[cfg(target_os = "linux")]
    pub fn resource(&self) -> Option<libc::__rlimit_resource_t> {
        Some(match self.kind.as_str() {
            "cpu" => libc::RLIMIT_CPU,
            "fsize" => libc::RLIMIT_FSIZE,
            "data" => libc::RLIMIT_DATA,
            "stack" => libc::RLIMIT_STACK,
            "core" => libc::RLIMIT_CORE,
            "nproc" => libc::RLIMIT_NPROC,
            "nofile" => libc::RLIMIT_NOFILE,
            "memlock" => libc::RLIMIT_MEMLOCK,
            "as" => libc::RLIMIT_AS,
            _ => return None,
        })
    }
}

/// Immutable configuration snapshot for a container.
///
/// Constructed by the external factory, validated before it reaches the
/// engine, and never mutated after construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Absolute path to the container's root filesystem.
    pub rootfs: PathBuf,
    /// Bind mounts attached inside the rootfs before pivoting into it.
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// Seal the container root read-only once mount setup completes.
    #[serde(default)]
    pub readonly_rootfs: bool,
    /// Hostname set inside the UTS namespace.
    #[serde(default)]
    pub hostname: String,
    /// Environment vector for the init process.
    #[serde(default)]
    pub env: Vec<String>,
    /// Requested kernel namespaces.
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
    /// Uid mappings for the user namespace.
    #[serde(default)]
    pub uid_mappings: Vec<IdMap>,
    /// Gid mappings for the user namespace.
    #[serde(default)]
    pub gid_mappings: Vec<IdMap>,
    /// Cgroup resource limits and freezer target.
    #[serde(default)]
    pub cgroup: CgroupSpec,
    /// Configured networks, in creation order.
    #[serde(default)]
    pub networks: Vec<NetworkSpec>,
    /// Routes installed inside the network namespace, in order.
    #[serde(default)]
    pub routes: Vec<Route>,
    /// Process label handed to the labeling collaborator.
    #[serde(default)]
    pub process_label: Option<String>,
    /// AppArmor profile applied before exec.
    #[serde(default)]
    pub apparmor_profile: Option<String>,
    /// Resource limits applied before exec.
    #[serde(default)]
    pub rlimits: Vec<Rlimit>,
    /// Capability names retained by the init, if restricted.
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
}

impl Config {
    /// Whether the namespace set contains `ns`.
    pub fn has_namespace(&self, ns: Namespace) -> bool {
        self.namespaces.contains(&ns)
    }

    /// The clone-flag bitmask derived from the namespace set.
    pub fn clone_flags(&self) -> CloneFlags {
        self.namespaces
            .iter()
            .fold(CloneFlags::empty(), |acc, ns| acc | ns.clone_flag())
    }
}

/// The initial program invocation handed to `Container::start`.
///
/// Stdio descriptors are consumed by the launcher; streams left unset are
/// inherited from the supervisor.
#[derive(Debug, Default)]
pub struct Process {
    pub args: Vec<String>,
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

impl Process {
    pub fn new(args: Vec<String>) -> Self {
        Self {
            args,
            ..Default::default()
        }
    }
}
