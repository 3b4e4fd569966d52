use std::io;
use std::os::fd::IntoRawFd;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use log::debug;
use nix::unistd::Pid;
use scopeguard::ScopeGuard;

use crate::core::config::{Config, Namespace, Process};
use crate::core::error::{Error, Result};
use crate::platform::linux::cgroups::CgroupManager;
use crate::platform::linux::network::{NetworkRegistry, NetworkState};
use crate::platform::linux::pipe::{
    self, ControlPipe, ProcessArgsRecord, INIT_PID_ENV, INIT_PIPE_ENV, INIT_PIPE_FD, USERNS_ENV,
};
use crate::platform::linux::process::{self, Launcher};

/// Everything a successful init start commits into the runtime state.
pub struct StartOutcome {
    pub init_pid: Pid,
    pub init_start_time: u64,
    pub network_state: Vec<NetworkState>,
}

/// Drive the init-start handshake.
///
/// Ordering is load-bearing: the cgroup is applied before the child can
/// fork anything (it stays blocked on the pipe until the `ProcessArgs`
/// record arrives), network interfaces are migrated once the pid is known
/// but before any interior bring-up, and the setup helper runs after the
/// user namespace exists but before the handoff. The half-close lets the
/// child distinguish "configuration complete" from a dead supervisor.
pub fn start_init(
    config: &Config,
    process: Process,
    init_argv: &[String],
    cgroup: &dyn CgroupManager,
    networks: &NetworkRegistry,
) -> Result<StartOutcome> {
    let (mut pipe, child_fd) = ControlPipe::pair()?;
    let args = process.args.clone();

    let launcher = Launcher {
        argv: init_argv.to_vec(),
        workdir: config.rootfs.clone(),
        clone_flags: config.clone_flags(),
        uid_mappings: config.uid_mappings.clone(),
        gid_mappings: config.gid_mappings.clone(),
        pipe_fd: child_fd,
        stdin: process.stdin,
        stdout: process.stdout,
        stderr: process.stderr,
    };
    let pid = launcher.spawn()?;
    debug!("cloned container init pid {pid}");

    // Captured immediately so later status probes can detect pid reuse.
    let init_start_time = match process::proc_start_time(pid) {
        Ok(v) => v,
        Err(e) => {
            let _ = process::kill_wait(pid);
            return Err(e);
        }
    };

    // The cgroup must hold the init before it gets a chance to fork.
    if let Err(e) = cgroup.apply(pid) {
        let _ = process::kill_wait(pid);
        return Err(e);
    }

    // From here on a failed start also releases the cgroup. The guard
    // drops at the error return, after the child has been reaped.
    let cgroup_guard = scopeguard::guard((), |()| {
        let _ = cgroup.destroy();
    });

    let network_state = match configure_and_sync(config, &args, pid, &mut pipe, init_argv, networks)
    {
        Ok(v) => v,
        Err(e) => {
            let _ = process::kill_wait(pid);
            return Err(e);
        }
    };
    ScopeGuard::into_inner(cgroup_guard);

    Ok(StartOutcome {
        init_pid: pid,
        init_start_time,
        network_state,
    })
}

/// The back half of the start sequence: networks, setup helper, handoff,
/// terminal ack.
fn configure_and_sync(
    config: &Config,
    args: &[String],
    pid: Pid,
    pipe: &mut ControlPipe,
    init_argv: &[String],
    networks: &NetworkRegistry,
) -> Result<Vec<NetworkState>> {
    let mut network_state = Vec::new();
    if !config.networks.is_empty() {
        if !config.has_namespace(Namespace::Net) {
            return Err(Error::mismatch(
                "networks configured without a network namespace",
            ));
        }
        for spec in &config.networks {
            networks.resolve(&spec.kind)?.create(spec, pid, &mut network_state)?;
        }
    }

    let record = ProcessArgsRecord {
        args: args.to_vec(),
        config: config.clone(),
        network_state: network_state.clone(),
    };

    if config.has_namespace(Namespace::User) {
        run_setup_helper(pid, &record, init_argv)?;
    }

    if let Err(send_err) = pipe.send(&record).and_then(|()| pipe.shutdown_write()) {
        // A child that died before the handoff may have left a structured
        // failure in the pipe; prefer that over the broken write.
        pipe.wait_ack()?;
        return Err(send_err);
    }
    pipe.wait_ack()?;
    Ok(network_state)
}

/// Run the user-namespace setup helper and require its clean exit. The
/// helper re-enters the init's namespaces except the user namespace and
/// performs the mount and interior network setup that root-in-namespace
/// cannot.
fn run_setup_helper(pid: Pid, record: &ProcessArgsRecord, init_argv: &[String]) -> Result<()> {
    let (mut pipe, child_fd) = ControlPipe::pair()?;

    let mut cmd = Command::new(&init_argv[0]);
    cmd.args(&init_argv[1..])
        .env(INIT_PIPE_ENV, INIT_PIPE_FD.to_string())
        .env(INIT_PID_ENV, pid.to_string())
        .env(USERNS_ENV, "1")
        .stdin(Stdio::null());
    let raw = child_fd.into_raw_fd();
    unsafe {
        cmd.pre_exec(move || pipe::install_pipe_fd(raw));
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::system("spawn setup helper", e))?;
    unsafe { libc::close(raw) };

    let handshake = (|| {
        pipe.send(record)?;
        pipe.shutdown_write()?;
        pipe.wait_ack()
    })();
    if let Err(e) = handshake {
        let _ = child.kill();
        let _ = child.wait();
        return Err(e);
    }

    let status = child
        .wait()
        .map_err(|e| Error::system("wait setup helper", e))?;
    if !status.success() {
        return Err(Error::system(
            "setup helper",
            io::Error::other(format!("exited with {status}")),
        ));
    }
    debug!("setup helper finished for pid {pid}");
    Ok(())
}

/// Inject a process into a live container.
///
/// The freshly spawned helper joins the init's namespaces and forks; the
/// grandchild's pid comes back as a `Pid` record. That pid enters the
/// container's cgroup before its configuration is sent, so nothing it
/// forks can escape. Any failure kills the injected pid.
pub fn exec_in(
    config: &Config,
    process: Process,
    init_argv: &[String],
    init_pid: i32,
    network_state: &[NetworkState],
    cgroup: &dyn CgroupManager,
) -> Result<Pid> {
    let (mut pipe, child_fd) = ControlPipe::pair()?;
    let args = process.args.clone();

    let mut cmd = Command::new(&init_argv[0]);
    cmd.args(&init_argv[1..])
        .env(INIT_PIPE_ENV, INIT_PIPE_FD.to_string())
        .env(INIT_PID_ENV, init_pid.to_string());
    cmd.stdin(process.stdin.map_or_else(Stdio::inherit, Stdio::from));
    cmd.stdout(process.stdout.map_or_else(Stdio::inherit, Stdio::from));
    cmd.stderr(process.stderr.map_or_else(Stdio::inherit, Stdio::from));
    let raw = child_fd.into_raw_fd();
    unsafe {
        cmd.pre_exec(move || pipe::install_pipe_fd(raw));
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::system("spawn exec-in helper", e))?;
    unsafe { libc::close(raw) };

    let new_pid = match recv_pid(&mut pipe) {
        Ok(v) => v,
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }
    };
    debug!("exec-in pid {new_pid} joined container of init {init_pid}");

    let result = (|| {
        cgroup.apply(new_pid)?;
        pipe.send(config)?;
        let record = ProcessArgsRecord {
            args,
            config: config.clone(),
            network_state: network_state.to_vec(),
        };
        pipe.send(&record)?;
        pipe.shutdown_write()?;
        pipe.wait_ack()?;

        let status = child
            .wait()
            .map_err(|e| Error::system("wait exec-in helper", e))?;
        if !status.success() {
            return Err(Error::system(
                "exec-in helper",
                io::Error::other(format!("exited with {status}")),
            ));
        }
        Ok(())
    })();

    match result {
        Ok(()) => Ok(new_pid),
        Err(e) => {
            let _ = process::kill_wait(new_pid);
            let _ = child.kill();
            let _ = child.wait();
            Err(e)
        }
    }
}

/// First record of the exec-in handshake: the new pid, or a structured
/// failure from the helper.
fn recv_pid(pipe: &mut ControlPipe) -> Result<Pid> {
    let value: serde_json::Value = pipe.recv()?.ok_or_else(|| {
        Error::init_failed("exec-in helper closed the pipe before reporting a pid")
    })?;
    if let Some(pid) = value.get("Pid").and_then(|p| p.as_i64()) {
        return Ok(Pid::from_raw(pid as i32));
    }
    if let Some(message) = value.get("message").and_then(|m| m.as_str()) {
        return Err(Error::init_failed(message));
    }
    Err(Error::system(
        "decode exec-in pid record",
        io::Error::new(io::ErrorKind::InvalidData, value.to_string()),
    ))
}
