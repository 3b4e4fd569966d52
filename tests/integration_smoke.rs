//! Root-gated integration scenarios exercising real namespaces and a real
//! cgroup v2 hierarchy.
//!
//! These tests require:
//! 1. Running on Linux as root (namespaces + cgroup writes).
//! 2. A writable cgroup v2 mount at /sys/fs/cgroup.
//!
//! The mount-namespace scenario additionally needs an extracted rootfs
//! (e.g. an Alpine minirootfs) at `tests/rootfs/` or the path named by
//! `VESSEL_TEST_ROOTFS`:
//!
//! ```bash
//! mkdir -p tests/rootfs
//! curl -L https://dl-cdn.alpinelinux.org/alpine/v3.20/releases/x86_64/alpine-minirootfs-3.20.3-x86_64.tar.gz \
//!     | tar -xz -C tests/rootfs
//! ```
//!
//! Every test skips itself when its prerequisites are missing.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use tempfile::TempDir;

use vessel::{
    Config, Container, FreezerState, FsManager, Namespace, NetworkRegistry, Process, Status,
};

fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

fn can_run() -> bool {
    if !is_root() {
        eprintln!("SKIP: not running as root (euid != 0)");
        return false;
    }
    if !Path::new("/sys/fs/cgroup/cgroup.procs").exists() {
        eprintln!("SKIP: no cgroup v2 unified hierarchy at /sys/fs/cgroup");
        return false;
    }
    true
}

fn rootfs_path() -> String {
    std::env::var("VESSEL_TEST_ROOTFS").unwrap_or_else(|_| "tests/rootfs".to_string())
}

fn have_rootfs() -> bool {
    if !Path::new(&rootfs_path()).join("bin").exists() {
        eprintln!("SKIP: rootfs not found at {}/bin", rootfs_path());
        return false;
    }
    true
}

fn init_argv() -> Vec<String> {
    vec![env!("CARGO_BIN_EXE_vessel").to_string(), "init".to_string()]
}

/// Allocate a container the way an external factory would: root dir plus
/// a fresh cgroup under a test hierarchy.
fn make_container(tmp: &TempDir, id: &str, config: Config) -> Container {
    let root = tmp.path().join(id);
    fs::create_dir_all(&root).unwrap();

    let cgroup_path = PathBuf::from("/sys/fs/cgroup/vessel-test").join(id);
    let manager = FsManager::new(&cgroup_path);
    manager.create(&config.cgroup).expect("create test cgroup");

    Container::new(
        id,
        &root,
        config,
        Box::new(manager),
        NetworkRegistry::with_defaults(),
    )
    .unwrap()
    .with_init_argv(init_argv())
}

#[test]
fn smoke_namespaced_start_and_observe() {
    if !can_run() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        rootfs: tmp.path().to_path_buf(),
        namespaces: vec![Namespace::Pid, Namespace::Ipc, Namespace::Uts],
        hostname: "vessel-test".into(),
        ..Default::default()
    };
    let mut container = make_container(&tmp, "smoke-observe", config);

    let pid = container
        .start(Process::new(vec!["/bin/sleep".into(), "30".into()]))
        .unwrap();
    assert_eq!(container.status().unwrap(), Status::Running);

    // The init is a member of the cgroup.
    let members = container.processes().unwrap();
    assert!(members.contains(&pid), "init not in cgroup: {members:?}");

    // Stats come back with the pid accounted.
    let stats = container.stats().unwrap();
    assert!(stats.cgroup.pids_current >= 1);

    container.signal(Signal::SIGKILL).unwrap();
    assert_eq!(container.wait().unwrap(), 137);
    assert_eq!(container.status().unwrap(), Status::Destroyed);
    container.destroy().unwrap();
}

#[test]
fn smoke_pause_resume_freezer() {
    if !can_run() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        rootfs: tmp.path().to_path_buf(),
        namespaces: vec![Namespace::Pid],
        ..Default::default()
    };
    let mut container = make_container(&tmp, "smoke-freezer", config);

    let pid = container
        .start(Process::new(vec!["/bin/sleep".into(), "30".into()]))
        .unwrap();

    container.pause().unwrap();
    assert_eq!(container.status().unwrap(), Status::Paused);
    // A frozen init still answers signal 0.
    nix::sys::signal::kill(pid, None).unwrap();

    // Idempotent in both directions.
    container.pause().unwrap();
    container.resume().unwrap();
    container.resume().unwrap();
    assert_eq!(container.status().unwrap(), Status::Running);

    container.signal(Signal::SIGKILL).unwrap();
    container.wait().unwrap();
    container.destroy().unwrap();
}

#[test]
fn smoke_kill_all_without_pid_namespace() {
    if !can_run() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        rootfs: tmp.path().to_path_buf(),
        // No PID namespace: descendants outlive the init.
        namespaces: vec![Namespace::Ipc],
        ..Default::default()
    };
    let mut container = make_container(&tmp, "smoke-killall", config);

    container
        .start(Process::new(vec![
            "/bin/sh".into(),
            "-c".into(),
            "sleep 30 & sleep 30 & exit 0".into(),
        ]))
        .unwrap();

    // Reaping the init sweeps the descendants the missing PID namespace
    // would otherwise have confined.
    assert_eq!(container.wait().unwrap(), 0);
    assert_eq!(container.status().unwrap(), Status::Destroyed);

    let deadline = Instant::now() + Duration::from_secs(2);
    while !container.processes().unwrap().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(container.processes().unwrap().is_empty());

    container.destroy().unwrap();
    assert!(!tmp.path().join("smoke-killall").exists());
}

#[test]
fn smoke_exec_in_shares_namespaces() {
    if !can_run() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        rootfs: tmp.path().to_path_buf(),
        namespaces: vec![Namespace::Pid, Namespace::Ipc, Namespace::Uts],
        hostname: "exec-in-test".into(),
        ..Default::default()
    };
    let mut container = make_container(&tmp, "smoke-execin", config);

    let init_pid = container
        .start(Process::new(vec!["/bin/sleep".into(), "30".into()]))
        .unwrap();

    let out_path = tmp.path().join("hostname.out");
    let out = fs::File::create(&out_path).unwrap();
    let exec_pid = container
        .start(Process {
            args: vec!["/bin/hostname".into()],
            stdout: Some(out.into()),
            ..Default::default()
        })
        .unwrap();
    assert_ne!(exec_pid, init_pid);

    // The injected process joined the UTS namespace and the cgroup.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let data = fs::read_to_string(&out_path).unwrap_or_default();
        if data.trim() == "exec-in-test" {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "exec-in output never arrived: {data:?}"
        );
        std::thread::sleep(Duration::from_millis(20));
    }

    container.signal(Signal::SIGKILL).unwrap();
    container.wait().unwrap();
    container.destroy().unwrap();
}

#[test]
fn smoke_full_rootfs_container() {
    if !can_run() || !have_rootfs() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let rootfs = fs::canonicalize(rootfs_path()).unwrap();

    // Host data surfaced into the container through a read-only bind.
    let data_dir = tmp.path().join("data");
    fs::create_dir_all(&data_dir).unwrap();
    fs::write(data_dir.join("hello"), "hi from the host\n").unwrap();

    let config = Config {
        rootfs,
        mounts: vec![vessel::Mount {
            source: data_dir,
            target: "/data".into(),
            read_only: true,
        }],
        namespaces: vec![
            Namespace::Mount,
            Namespace::Pid,
            Namespace::Ipc,
            Namespace::Uts,
            Namespace::Net,
        ],
        hostname: "vessel".into(),
        env: vec!["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".into()],
        networks: vec![vessel::NetworkSpec {
            kind: "loopback".into(),
            ..Default::default()
        }],
        cgroup: vessel::CgroupSpec {
            memory: Some(64 * 1024 * 1024),
            freezer: Some(FreezerState::Thawed),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut container = make_container(&tmp, "smoke-rootfs", config);

    let out_path = tmp.path().join("cat.out");
    let out = fs::File::create(&out_path).unwrap();
    let pid = container
        .start(Process {
            args: vec!["/bin/cat".into(), "/data/hello".into()],
            stdout: Some(out.into()),
            ..Default::default()
        })
        .unwrap();
    // Network state mirrors the configured networks, in order.
    assert_eq!(container.state().network_state.len(), 1);
    assert_eq!(container.state().network_state[0].kind, "loopback");

    waitpid(pid, None).unwrap();
    assert_eq!(container.status().unwrap(), Status::Destroyed);
    assert_eq!(
        fs::read_to_string(&out_path).unwrap(),
        "hi from the host\n"
    );
    container.destroy().unwrap();
}
