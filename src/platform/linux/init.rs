use std::env;
use std::ffi::CString;
use std::fs::{self, File};
use std::io::{self, ErrorKind};
use std::os::fd::AsFd;

use nix::errno::Errno;
use nix::sched::setns;
use nix::unistd::{chdir, fork, sethostname, setgid, setgroups, setuid, ForkResult, Gid, Pid, Uid};

use crate::core::config::{Config, Namespace};
use crate::core::error::{Error, Result};
use crate::platform::linux::{mounts, network};
use crate::platform::linux::pipe::{
    ControlPipe, InitErrorRecord, PidRecord, ProcessArgsRecord, INIT_PID_ENV, USERNS_ENV,
};

/// Namespace join order: user first so the others are owned by it, mount
/// last so `/proc/<pid>/ns` stays reachable while descriptors are opened.
const JOIN_ORDER: [Namespace; 7] = [
    Namespace::User,
    Namespace::Ipc,
    Namespace::Uts,
    Namespace::Net,
    Namespace::Pid,
    Namespace::Cgroup,
    Namespace::Mount,
];

/// Entry point of the re-invoked binary. Recovers the control pipe from
/// the environment, picks the mode from the env contract, and reports any
/// pre-exec failure as an `InitError` record before exiting nonzero.
pub fn run() -> i32 {
    let mut pipe = match ControlPipe::from_env() {
        Ok(pipe) => pipe,
        Err(e) => {
            eprintln!("vessel-init: {e}");
            return 1;
        }
    };

    let outcome = if env::var_os(USERNS_ENV).is_some() {
        helper_main(&mut pipe)
    } else if env::var_os(INIT_PID_ENV).is_some() {
        join_main(&mut pipe)
    } else {
        init_main(&mut pipe)
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            let _ = pipe.send(&InitErrorRecord {
                message: e.to_string(),
            });
            1
        }
    }
}

/// Container init: wait for the configuration record, finish the
/// in-namespace setup the coordinator cannot do, and exec the workload.
fn init_main(pipe: &mut ControlPipe) -> Result<i32> {
    let record: ProcessArgsRecord = pipe
        .recv()?
        .ok_or_else(|| Error::init_failed("control pipe closed before configuration arrived"))?;
    let config = &record.config;
    let userns = config.has_namespace(Namespace::User);

    if config.has_namespace(Namespace::Uts) && !config.hostname.is_empty() {
        sethostname(&config.hostname).map_err(|e| Error::system("set hostname", e))?;
    }
    if config.has_namespace(Namespace::Mount) {
        if userns {
            // The setup helper already pivoted this mount namespace; the
            // working directory inherited from the launcher is stale.
            chdir("/").map_err(|e| Error::system("chdir into pivoted root", e))?;
        } else {
            mounts::setup_rootfs(config)?;
        }
    }
    if config.has_namespace(Namespace::Net) && !userns {
        network::setup_interior(&record.network_state, &config.routes)?;
    }

    finalize(config, &record.args)
}

/// Setup helper: host-root sidecar that joins every namespace of the init
/// except the user namespace and performs the privileged interior setup.
fn helper_main(pipe: &mut ControlPipe) -> Result<i32> {
    let init_pid = pid_from_env()?;
    let record: ProcessArgsRecord = pipe
        .recv()?
        .ok_or_else(|| Error::init_failed("control pipe closed before configuration arrived"))?;
    let config = &record.config;

    join_namespaces(init_pid, |ns| {
        ns != Namespace::User && config.has_namespace(ns)
    })?;

    if config.has_namespace(Namespace::Mount) {
        mounts::setup_rootfs(config)?;
    }
    if config.has_namespace(Namespace::Net) {
        network::setup_interior(&record.network_state, &config.routes)?;
    }
    Ok(0)
}

/// Exec-in intermediate: join the namespaces of a live init, fork so the
/// child lands in its PID namespace, and report that pid back. The forked
/// child carries on with the injected process.
fn join_main(pipe: &mut ControlPipe) -> Result<i32> {
    let init_pid = pid_from_env()?;

    join_namespaces(init_pid, |_| true)?;

    match unsafe { fork() }.map_err(|e| Error::system("fork into joined namespaces", e))? {
        ForkResult::Parent { child } => {
            pipe.send(&PidRecord {
                pid: child.as_raw(),
            })?;
            Ok(0)
        }
        ForkResult::Child => exec_in_child(pipe),
    }
}

/// The injected process: receives its configuration after the supervisor
/// has entered it into the cgroup, then finalizes and execs.
fn exec_in_child(pipe: &mut ControlPipe) -> Result<i32> {
    let config: Config = pipe
        .recv()?
        .ok_or_else(|| Error::init_failed("control pipe closed before configuration arrived"))?;
    let record: ProcessArgsRecord = pipe
        .recv()?
        .ok_or_else(|| Error::init_failed("control pipe closed before process args arrived"))?;

    // The joined mount namespace already has the container root as /.
    chdir("/").map_err(|e| Error::system("chdir into container root", e))?;
    finalize(&config, &record.args)
}

/// Apply rlimits, labels, and credentials, then exec the workload. Only
/// returns on failure; success replaces the process image, closing the
/// close-on-exec control pipe so the supervisor observes EOF.
fn finalize(config: &Config, args: &[String]) -> Result<i32> {
    for limit in &config.rlimits {
        let resource = limit
            .resource()
            .ok_or_else(|| Error::mismatch(format!("unknown rlimit kind {:?}", limit.kind)))?;
        let rl = libc::rlimit {
            rlim_cur: limit.soft,
            rlim_max: limit.hard,
        };
        if unsafe { libc::setrlimit(resource, &rl) } == -1 {
            return Err(Error::system(
                format!("setrlimit {}", limit.kind),
                io::Error::last_os_error(),
            ));
        }
    }

    apply_process_label(config.process_label.as_deref())?;
    apply_apparmor_profile(config.apparmor_profile.as_deref())?;

    if config.has_namespace(Namespace::User) {
        // Root-in-namespace default credential. setgroups may already be
        // denied by the mapping handshake.
        match setgroups(&[]) {
            Ok(()) | Err(Errno::EPERM) => {}
            Err(e) => return Err(Error::system("clear supplementary groups", e)),
        }
        setgid(Gid::from_raw(0)).map_err(|e| Error::system("setgid 0", e))?;
        setuid(Uid::from_raw(0)).map_err(|e| Error::system("setuid 0", e))?;
    }

    if args.is_empty() {
        return Err(Error::init_failed("no command specified"));
    }
    let program = cstring(&args[0])?;
    let argv: Vec<CString> = args.iter().map(|a| cstring(a)).collect::<Result<_>>()?;
    let envp: Vec<CString> = config.env.iter().map(|e| cstring(e)).collect::<Result<_>>()?;

    nix::unistd::execve(&program, &argv, &envp)
        .map_err(|e| Error::system(format!("execve {:?}", args[0]), e))?;
    unreachable!()
}

/// Idempotent label collaborator: writes the process label for the next
/// exec when an LSM is present, and is a no-op otherwise.
fn apply_process_label(label: Option<&str>) -> Result<()> {
    let Some(label) = label else { return Ok(()) };
    match fs::write("/proc/self/attr/exec", label) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::system("write process label", e)),
    }
}

fn apply_apparmor_profile(profile: Option<&str>) -> Result<()> {
    let Some(profile) = profile else { return Ok(()) };
    let value = format!("exec {profile}");
    for path in ["/proc/self/attr/apparmor/exec", "/proc/self/attr/exec"] {
        match fs::write(path, &value) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(Error::system(format!("write {path}"), e)),
        }
    }
    Ok(())
}

fn pid_from_env() -> Result<Pid> {
    let value = env::var(INIT_PID_ENV)
        .map_err(|_| Error::init_failed(format!("{INIT_PID_ENV} is not set")))?;
    let pid: i32 = value
        .parse()
        .map_err(|_| Error::init_failed(format!("{INIT_PID_ENV}={value} is not a pid")))?;
    Ok(Pid::from_raw(pid))
}

/// Join the selected namespaces of a target process. All descriptors are
/// opened before the first `setns` so the mount-namespace switch cannot
/// hide `/proc/<pid>/ns`; namespaces the target shares with us are
/// skipped.
fn join_namespaces(pid: Pid, wanted: impl Fn(Namespace) -> bool) -> Result<()> {
    let mut joins = Vec::new();
    for ns in JOIN_ORDER {
        if !wanted(ns) {
            continue;
        }
        let path = format!("/proc/{pid}/ns/{}", ns.proc_file());
        let target = match File::open(&path) {
            Ok(file) => file,
            // Namespace type not supported by this kernel.
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(Error::system(format!("open {path}"), e)),
        };
        if same_namespace(&target, ns)? {
            continue;
        }
        joins.push((ns, target));
    }
    for (ns, target) in joins {
        setns(target.as_fd(), ns.clone_flag())
            .map_err(|e| Error::system(format!("setns into {ns} namespace of pid {pid}"), e))?;
    }
    Ok(())
}

fn same_namespace(target: &File, ns: Namespace) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let ours_path = format!("/proc/self/ns/{}", ns.proc_file());
    let ours = match fs::metadata(&ours_path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(Error::system(format!("stat {ours_path}"), e)),
    };
    let theirs = target
        .metadata()
        .map_err(|e| Error::system("stat target namespace", e))?;
    Ok(ours.dev() == theirs.dev() && ours.ino() == theirs.ino())
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s.as_bytes()).map_err(|_| Error::mismatch(format!("embedded NUL in {s:?}")))
}
