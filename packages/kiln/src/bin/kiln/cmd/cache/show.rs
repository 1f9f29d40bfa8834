use clap::Args;
use color_eyre::{Result, eyre::Context as _};
use kiln::{config::Config, path::AbsFilePath};
use tracing::instrument;

#[derive(Clone, Args, Debug)]
pub struct Options {
    /// Path to the daemon's configuration file.
    #[arg(long = "config", env = "KILN_CONFIG")]
    config: AbsFilePath,
}

#[instrument]
pub async fn exec(options: Options) -> Result<()> {
    let config = Config::load(&options.config).await.context("load config")?;
    println!("{}", config.cache_root);
    Ok(())
}
