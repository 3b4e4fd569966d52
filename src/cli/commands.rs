use anyhow::Result;

use crate::cli::{Cli, Command};

/// Dispatch a parsed CLI command to the appropriate handler.
pub fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Init => cmd_init(),
    }
}

// ─── init ───────────────────────────────────────────────────────────────────

/// Run the in-child half of the bootstrap handshake and never return.
///
/// The process was spawned by the engine with the control pipe inherited at
/// the descriptor named by `_LIBCONTAINER_INITPIPE`; which of the three init
/// modes applies is decided by `_LIBCONTAINER_USERNS` / `_LIBCONTAINER_INITPID`.
fn cmd_init() -> Result<()> {
    #[cfg(not(target_os = "linux"))]
    {
        anyhow::bail!("vessel only runs on Linux");
    }

    #[cfg(target_os = "linux")]
    {
        let code = crate::platform::linux::init::run();
        std::process::exit(code);
    }
}
