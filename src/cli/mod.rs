pub mod commands;

use clap::{Parser, Subcommand};

/// Vessel, a Linux container lifecycle engine.
///
/// The binary exists so the engine can re-invoke itself as the container
/// init helper; host-facing commands belong to the embedding runtime.
#[derive(Parser, Debug)]
#[command(name = "vessel", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Container init entry point. Spawned by the engine with an inherited
    /// control-pipe descriptor; never invoked by hand.
    #[command(hide = true)]
    Init,
}

/// Parse CLI arguments. Called from `main`.
pub fn parse() -> Cli {
    Cli::parse()
}
