mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use rgdl::{Config, RegionDownloader};

use crate::cli::{Args, Command};

fn main() -> Result<()> {
    // RUST_LOG=debug rgdl download europe/malta
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);

    // Resolve the data directory up front so log lines and the state file
    // path are unambiguous
    if config.data_dir.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            config.data_dir = cwd.join(&config.data_dir);
        }
    }
    config.validate()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let downloader = RegionDownloader::new(config).await;

        match args.command {
            Command::Continents => crate::commands::list_continents(&downloader),
            Command::Regions { continent, show } => {
                crate::commands::list_regions(&downloader, &continent, show)
            }
            Command::Download { regions } => {
                crate::commands::run_downloads(&downloader, &regions).await
            }
            Command::Status { region } => crate::commands::show_status(&downloader, region.as_deref()),
            Command::Delete { regions } => {
                crate::commands::delete_regions(&downloader, &regions).await
            }
        }
    })
}
