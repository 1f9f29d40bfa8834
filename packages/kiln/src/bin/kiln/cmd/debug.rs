use clap::Subcommand;

pub mod status;

/// Supported debug subcommands.
#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Report whether a kiln daemon is currently running.
    Status(status::Options),
}
