use clap::Subcommand;

pub mod start;
pub mod stop;

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Start the kiln daemon.
    Start(start::Options),

    /// Stop a running kiln daemon.
    Stop(stop::Options),
}
