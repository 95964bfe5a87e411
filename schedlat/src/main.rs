use anyhow::Result;
use aya::include_bytes_aligned;
use clap::Parser;
use schedlat::{SchedLatEngine, settings::Settings};

#[derive(Debug, Parser)]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if opt.verbose {
        "info"
    } else {
        "warn"
    }))
    .init();

    let settings = Settings::new()?;
    let engine = SchedLatEngine::new(
        settings,
        include_bytes_aligned!(concat!(env!("OUT_DIR"), "/schedlat")),
    )?;
    engine.run().await
}
