use std::ffi::{CStr, CString};
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::core::config::IdMap;
use crate::core::error::{Error, Result};
use crate::platform::linux::pipe::{InitErrorRecord, INIT_PIPE_ENV, INIT_PIPE_FD};

/// Arguments for the `clone3` system call.
#[repr(C, align(8))]
#[derive(Debug, Default)]
struct CloneArgs {
    flags: u64,
    pidfd: u64,
    child_tid: u64,
    parent_tid: u64,
    exit_signal: u64,
    stack: u64,
    stack_size: u64,
    tls: u64,
    set_tid: u64,
    set_tid_size: u64,
    cgroup: u64,
}

enum CloneResult {
    Child,
    Parent { child: Pid },
}

/// Fork-style `clone3`: no stack means copy-on-write like `fork(2)`, with
/// the namespace flags applied atomically at child creation.
unsafe fn clone3(args: &CloneArgs) -> std::result::Result<CloneResult, Errno> {
    let res = libc::syscall(
        libc::SYS_clone3,
        args as *const CloneArgs,
        std::mem::size_of::<CloneArgs>(),
    );
    Errno::result(res).map(|v| match v {
        0 => CloneResult::Child,
        v => CloneResult::Parent {
            child: Pid::from_raw(v as libc::pid_t),
        },
    })
}

/// Spawns the engine's own binary as a container init inside freshly
/// created namespaces.
///
/// The child is left blocked on the control pipe: its first action after
/// `execve` into the init subcommand is a read that only completes once the
/// coordinator has finished cgroup, network, and mapping setup.
pub struct Launcher {
    /// Argv re-invoking this binary as its init helper.
    pub argv: Vec<String>,
    /// Working directory for the child (the container rootfs).
    pub workdir: PathBuf,
    /// Namespace mask for `clone3`.
    pub clone_flags: CloneFlags,
    pub uid_mappings: Vec<IdMap>,
    pub gid_mappings: Vec<IdMap>,
    /// Child half of the control pipe; the only extra descriptor the child
    /// inherits.
    pub pipe_fd: OwnedFd,
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

impl Launcher {
    pub fn spawn(self) -> Result<Pid> {
        let has_userns = self.clone_flags.contains(CloneFlags::CLONE_NEWUSER);
        if (!self.uid_mappings.is_empty() || !self.gid_mappings.is_empty()) && !has_userns {
            return Err(Error::mismatch(
                "id mappings configured without a user namespace",
            ));
        }
        if self.argv.is_empty() {
            return Err(Error::mismatch("empty init argv"));
        }

        // Everything the child touches is prepared before the clone; the
        // child branch only renumbers descriptors and execs.
        let exe = cstring(&self.argv[0])?;
        let argv: Vec<CString> = self
            .argv
            .iter()
            .map(|a| cstring(a))
            .collect::<Result<_>>()?;
        let env = vec![cstring(&format!("{INIT_PIPE_ENV}={INIT_PIPE_FD}"))?];
        let workdir = cstring(&self.workdir.to_string_lossy())?;

        let mut args = CloneArgs::default();
        args.flags = self.clone_flags.bits() as u64;
        args.exit_signal = libc::SIGCHLD as u64;

        match unsafe { clone3(&args) }.map_err(|e| Error::system("clone3", e))? {
            CloneResult::Child => self.exec_child(&exe, &argv, &env, &workdir),
            CloneResult::Parent { child } => {
                if has_userns {
                    if let Err(e) = write_id_maps(child, &self.uid_mappings, &self.gid_mappings) {
                        let _ = kill_wait(child);
                        return Err(e);
                    }
                }
                Ok(child)
            }
        }
    }

    fn exec_child(&self, exe: &CStr, argv: &[CString], env: &[CString], workdir: &CStr) -> ! {
        let mut pipe_fd = self.pipe_fd.as_raw_fd();
        let err = (|| -> Result<()> {
            self.setup_fds()?;
            pipe_fd = INIT_PIPE_FD;
            if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) } == -1 {
                return Err(Error::system(
                    "set parent-death signal",
                    io::Error::last_os_error(),
                ));
            }
            if unsafe { libc::chdir(workdir.as_ptr()) } == -1 {
                return Err(Error::system(
                    format!("chdir {:?}", self.workdir),
                    io::Error::last_os_error(),
                ));
            }
            nix::unistd::execve(exe, argv, env)
                .map_err(|e| Error::system(format!("execve {:?}", self.argv[0]), e))?;
            unreachable!()
        })()
        .unwrap_err();

        report_child_error(pipe_fd, &err);
        unsafe { libc::_exit(1) }
    }

    /// Renumber stdio and the pipe onto fixed descriptors. Sources are
    /// first duplicated above the target range so a later dup2 cannot
    /// clobber an earlier source; the duplicates stay close-on-exec.
    fn setup_fds(&self) -> Result<()> {
        let wanted = [
            (self.stdin.as_ref().map(|f| f.as_raw_fd()), 0),
            (self.stdout.as_ref().map(|f| f.as_raw_fd()), 1),
            (self.stderr.as_ref().map(|f| f.as_raw_fd()), 2),
            (Some(self.pipe_fd.as_raw_fd()), INIT_PIPE_FD),
        ];

        let mut staged = [None; 4];
        for (slot, (src, target)) in staged.iter_mut().zip(wanted) {
            let Some(src) = src else { continue };
            let tmp = unsafe { libc::fcntl(src, libc::F_DUPFD_CLOEXEC, 10) };
            if tmp == -1 {
                return Err(Error::system(
                    "stage descriptor for renumbering",
                    io::Error::last_os_error(),
                ));
            }
            *slot = Some((tmp, target));
        }
        for (tmp, target) in staged.into_iter().flatten() {
            if unsafe { libc::dup2(tmp, target) } == -1 {
                return Err(Error::system(
                    format!("install descriptor {target}"),
                    io::Error::last_os_error(),
                ));
            }
        }
        Ok(())
    }
}

/// Best-effort structured error report back to the supervisor, written
/// directly on the raw pipe descriptor.
fn report_child_error(pipe_fd: RawFd, err: &Error) {
    let record = InitErrorRecord {
        message: err.to_string(),
    };
    if let Ok(mut buf) = serde_json::to_vec(&record) {
        buf.push(b'\n');
        unsafe { libc::write(pipe_fd, buf.as_ptr().cast(), buf.len()) };
    }
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s.as_bytes()).map_err(|_| Error::mismatch(format!("embedded NUL in {s:?}")))
}

/// Render mapping triples in the `/proc/<pid>/{u,g}id_map` line format.
fn format_id_map(maps: &[IdMap]) -> String {
    let mut out = String::new();
    for map in maps {
        out.push_str(&format!(
            "{} {} {}\n",
            map.container_id, map.host_id, map.size
        ));
    }
    out
}

/// Attach the uid/gid mapping tables to a freshly cloned child. With no
/// tables configured, the engine's own ids become root in the namespace.
fn write_id_maps(pid: Pid, uid_maps: &[IdMap], gid_maps: &[IdMap]) -> Result<()> {
    let uid_maps = if uid_maps.is_empty() {
        vec![IdMap::root(nix::unistd::geteuid().as_raw())]
    } else {
        uid_maps.to_vec()
    };
    let gid_maps = if gid_maps.is_empty() {
        vec![IdMap::root(nix::unistd::getegid().as_raw())]
    } else {
        gid_maps.to_vec()
    };

    let uid_path = format!("/proc/{pid}/uid_map");
    fs::write(&uid_path, format_id_map(&uid_maps))
        .map_err(|e| Error::system(format!("write {uid_path}"), e))?;

    // Writing the gid map requires setgroups to be denied first; kernels
    // without the file predate that requirement.
    let setgroups_path = format!("/proc/{pid}/setgroups");
    match fs::write(&setgroups_path, "deny") {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::system(format!("write {setgroups_path}"), e)),
    }

    let gid_path = format!("/proc/{pid}/gid_map");
    fs::write(&gid_path, format_id_map(&gid_maps))
        .map_err(|e| Error::system(format!("write {gid_path}"), e))?;
    Ok(())
}

/// Terminate a child: SIGKILL followed by a reap. A child that is already
/// gone is not an error.
pub fn kill_wait(pid: Pid) -> Result<()> {
    match kill(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => return Err(Error::system(format!("kill pid {pid}"), e)),
    }
    loop {
        match waitpid(pid, None) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return Ok(()),
            Err(e) => return Err(Error::system(format!("wait pid {pid}"), e)),
        }
    }
}

/// Wait for a child and map its termination to an exit code.
pub fn wait_exit_code(pid: Pid) -> Result<i32> {
    loop {
        match waitpid(pid, None) {
            Ok(status) => {
                if let Some(code) = exit_status_code(status) {
                    return Ok(code);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(Error::system(format!("wait pid {pid}"), e)),
        }
    }
}

/// Conventional exit-code mapping: signalled children report `128 + signal`.
pub fn exit_status_code(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, sig, _) => Some(128 + sig as i32),
        _ => None,
    }
}

/// Process start time in clock ticks since boot, from `/proc/<pid>/stat`.
pub fn proc_start_time(pid: Pid) -> Result<u64> {
    let path = format!("/proc/{pid}/stat");
    let data = fs::read_to_string(&path).map_err(|e| Error::system(format!("read {path}"), e))?;
    parse_start_time(&data).ok_or_else(|| {
        Error::system(
            format!("parse {path}"),
            io::Error::new(io::ErrorKind::InvalidData, "malformed stat line"),
        )
    })
}

/// The comm field may contain spaces and parentheses; the numeric fields
/// resume after the last `)`. Start time is overall field 22.
fn parse_start_time(stat: &str) -> Option<u64> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(19)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_map_line_format() {
        let maps = [
            IdMap::root(1000),
            IdMap {
                container_id: 1,
                host_id: 100000,
                size: 65536,
            },
        ];
        assert_eq!(format_id_map(&maps), "0 1000 1\n1 100000 65536\n");
    }

    #[test]
    fn start_time_parses_plain_comm() {
        let stat = "1234 (true) R 1 1234 1234 0 -1 4194304 80 0 0 0 0 0 0 0 20 0 1 0 5172076 1000 1 184467";
        assert_eq!(parse_start_time(stat), Some(5172076));
    }

    #[test]
    fn start_time_parses_hostile_comm() {
        // comm containing spaces and a closing paren
        let stat = "99 (a b) c) S 1 99 99 0 -1 4194304 80 0 0 0 0 0 0 0 20 0 1 0 42 1000 1 184467";
        assert_eq!(parse_start_time(stat), Some(42));
    }

    #[test]
    fn start_time_of_current_process() {
        let me = Pid::from_raw(std::process::id() as i32);
        assert!(proc_start_time(me).unwrap() > 0);
    }

    #[test]
    fn signal_exit_maps_to_128_plus() {
        let pid = Pid::from_raw(1);
        assert_eq!(
            exit_status_code(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            Some(137)
        );
        assert_eq!(exit_status_code(WaitStatus::Exited(pid, 3)), Some(3));
        assert_eq!(exit_status_code(WaitStatus::StillAlive), None);
    }

    #[test]
    fn mappings_without_userns_are_rejected() {
        let (_, theirs) = crate::platform::linux::pipe::ControlPipe::pair().unwrap();
        let launcher = Launcher {
            argv: vec!["/proc/self/exe".into(), "init".into()],
            workdir: "/".into(),
            clone_flags: CloneFlags::empty(),
            uid_mappings: vec![IdMap::root(0)],
            gid_mappings: vec![],
            pipe_fd: theirs,
            stdin: None,
            stdout: None,
            stderr: None,
        };
        match launcher.spawn() {
            Err(Error::ConfigMismatch { .. }) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
