use clap::Subcommand;

pub mod reset;
pub mod show;

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Reset the asset cache: the store, every platform's catalog, and all
    /// retained job logs.
    Reset(reset::Options),

    /// Print the location of the configured cache root.
    Show(show::Options),
}
