#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::path::PathBuf;

use clap::Parser;
use tern::config::{self, CONFIG_ENV};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Configuration file to use instead of the default locations
    #[arg(short, long, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Check the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let path = config::find(args.config, &config::default_paths())?;
    let tern = config::load(&path)?;

    if args.check {
        tern.verify()?;
        println!("{}: ok", path.display());
        return Ok(());
    }

    tern.run().await
}
