use clap::Args;
use color_eyre::{Result, eyre::Context as _};
use colored::Colorize as _;
use inquire::Confirm;
use kiln::{config::Config, fs, path::AbsFilePath};
use tracing::instrument;

#[derive(Clone, Args, Debug)]
pub struct Options {
    /// Path to the daemon's configuration file.
    #[arg(long = "config", env = "KILN_CONFIG")]
    config: AbsFilePath,

    /// Skip the confirmation prompt.
    #[arg(short, long)]
    yes: bool,
}

#[instrument]
pub async fn exec(options: Options) -> Result<()> {
    let config = Config::load(&options.config).await.context("load config")?;

    if !options.yes {
        println!(
            "{}",
            format!("WARNING: This will delete the entire asset cache at {}", config.cache_root).on_red()
        );
        let confirmed = Confirm::new("Are you sure you want to proceed?").with_default(false).prompt()?;
        if !confirmed {
            return Ok(());
        }
    }

    println!("Resetting cache at {}...", config.cache_root);
    fs::remove_dir_all(&config.cache_root).await.context("remove cache root")?;
    fs::create_dir_all(&config.cache_root).await.context("recreate cache root")?;

    println!("Done!");
    Ok(())
}
