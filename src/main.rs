use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use gresusage::config::{Cli, OutputFormat};
use gresusage::report;
use gresusage::sampler::SshPowerFeed;
use gresusage::sink;
use gresusage::slurm::SlurmCli;

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = cli.into_config()?;
    colored::control::set_override(config.color);

    let source = SlurmCli {
        preemptible_org: config.preemptible_org.clone(),
        preemptible_accounts: config.preemptible_accounts.clone(),
    };
    let feed = Arc::new(SshPowerFeed {
        ssh: config.ssh.clone(),
        connect_timeout: config.plan.timeout.min(Duration::from_secs(10)),
    });

    let usage = gresusage::run(&config, &source, feed)?;
    let chunks = match config.format {
        OutputFormat::Table => report::render_chunks(&usage, config.chunk_lines),
        OutputFormat::Json => vec![report::render_json(&usage)?],
    };
    sink::build(&config.sink).deliver(&chunks)?;
    info!("Delivered {} blocks", chunks.len());
    Ok(())
}
