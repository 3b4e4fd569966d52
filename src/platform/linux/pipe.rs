use std::env;
use std::io::{BufRead, BufReader, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::platform::linux::network::NetworkState;

/// Environment variable naming the control-pipe descriptor in the child.
pub const INIT_PIPE_ENV: &str = "_LIBCONTAINER_INITPIPE";
/// Environment variable carrying the init pid when the child must `setns`
/// into an existing container.
pub const INIT_PID_ENV: &str = "_LIBCONTAINER_INITPID";
/// Environment variable present only for the user-namespace setup helper.
pub const USERNS_ENV: &str = "_LIBCONTAINER_USERNS";
/// Descriptor number at which the child inherits its half of the pipe.
pub const INIT_PIPE_FD: RawFd = 3;

/// The `ProcessArgs` record: everything the in-child init needs to finish
/// the bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessArgsRecord {
    #[serde(rename = "Args")]
    pub args: Vec<String>,
    #[serde(rename = "Config")]
    pub config: Config,
    #[serde(rename = "NetworkState")]
    pub network_state: Vec<NetworkState>,
}

/// The `Pid` record reported by the exec-in helper.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PidRecord {
    #[serde(rename = "Pid")]
    pub pid: i32,
}

/// The `InitError` record: a structured pre-exec failure report from the
/// child.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitErrorRecord {
    pub message: String,
}

/// One half of the bootstrap control pipe.
///
/// The pipe is a close-on-exec socketpair carrying newline-delimited JSON
/// records. The supervisor half-closes its write direction after the last
/// record; the child reads EOF as "no more configuration coming". The
/// child's half keeps close-on-exec armed while init code runs, so a
/// successful final `execve` closes it and the supervisor observes EOF
/// with no record.
pub struct ControlPipe {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl ControlPipe {
    /// Create the pipe, returning the supervisor end and the descriptor to
    /// hand to the child.
    pub fn pair() -> Result<(Self, OwnedFd)> {
        let (ours, theirs) =
            UnixStream::pair().map_err(|e| Error::system("create control pipe", e))?;
        Ok((Self::from_stream(ours)?, OwnedFd::from(theirs)))
    }

    /// Child side: recover the pipe from the inherited descriptor named by
    /// `_LIBCONTAINER_INITPIPE` and re-arm close-on-exec on it.
    pub fn from_env() -> Result<Self> {
        let value = env::var(INIT_PIPE_ENV)
            .map_err(|_| Error::init_failed(format!("{INIT_PIPE_ENV} is not set")))?;
        let fd: RawFd = value
            .parse()
            .map_err(|_| Error::init_failed(format!("{INIT_PIPE_ENV}={value} is not a descriptor")))?;
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
            return Err(Error::system(
                "set close-on-exec on control pipe",
                std::io::Error::last_os_error(),
            ));
        }
        Self::from_fd(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Wrap an owned descriptor holding one end of the pipe.
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        Self::from_stream(UnixStream::from(fd))
    }

    fn from_stream(stream: UnixStream) -> Result<Self> {
        let reader = BufReader::new(
            stream
                .try_clone()
                .map_err(|e| Error::system("clone control pipe descriptor", e))?,
        );
        Ok(Self {
            reader,
            writer: stream,
        })
    }

    /// Send one record.
    pub fn send<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let mut buf =
            serde_json::to_vec(record).map_err(|e| Error::system("encode control record", e))?;
        buf.push(b'\n');
        self.writer
            .write_all(&buf)
            .map_err(|e| Error::system("write control record", e))
    }

    /// Receive one record; `None` on EOF.
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.read_line()? {
            None => Ok(None),
            Some(line) => serde_json::from_str(&line)
                .map(Some)
                .map_err(|e| Error::system("decode control record", e)),
        }
    }

    /// Half-close: no further records will be sent.
    pub fn shutdown_write(&self) -> Result<()> {
        self.writer
            .shutdown(Shutdown::Write)
            .map_err(|e| Error::system("shut down control pipe write side", e))
    }

    /// Await the child's terminal ack. EOF with no record means the child
    /// reached `execve`; an `InitError` record is a pre-exec failure.
    pub fn wait_ack(&mut self) -> Result<()> {
        match self.read_line()? {
            None => Ok(()),
            Some(line) => match serde_json::from_str::<InitErrorRecord>(&line) {
                Ok(err) => Err(Error::init_failed(err.message)),
                Err(e) => Err(Error::system("decode init ack", e)),
            },
        }
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .map_err(|e| Error::system("read control record", e))?;
        if n == 0 {
            Ok(None)
        } else {
            Ok(Some(line))
        }
    }
}

/// Install one end of the pipe at `INIT_PIPE_FD` in a pre-exec context,
/// clearing close-on-exec so it survives into the child image.
pub(crate) fn install_pipe_fd(fd: RawFd) -> std::io::Result<()> {
    if fd == INIT_PIPE_FD {
        if unsafe { libc::fcntl(fd, libc::F_SETFD, 0) } == -1 {
            return Err(std::io::Error::last_os_error());
        }
    } else if unsafe { libc::dup2(fd, INIT_PIPE_FD) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

impl AsRawFd for ControlPipe {
    fn as_raw_fd(&self) -> RawFd {
        self.writer.as_raw_fd()
    }
}
