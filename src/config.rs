use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use regex::Regex;

use crate::aggregate::{AggregateSettings, PartitionMatch};
use crate::sampler::SamplingPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PartitionMode {
    Prefix,
    Exact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SinkKind {
    Stdout,
    File,
    Discord,
}

/// Report GPU usage, power draw and efficiency per Slurm account and user
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    /// Log at debug level
    #[arg(short, long)]
    pub verbose: bool,

    /// CPUs billed per GPU when a job does not list GPU indices
    #[arg(long, env = "GRESUSAGE_CPUS_PER_GPU", default_value_t = 12)]
    pub cpus_per_gpu: u32,

    /// GPUs per node when the node inventory does not say
    #[arg(long, env = "GRESUSAGE_GPUS_PER_NODE", default_value_t = 8)]
    pub gpus_per_node: u32,

    /// Rated board power in watts, the 100% mark for efficiency
    #[arg(long, env = "GRESUSAGE_RATED_TDP", default_value_t = 405.0)]
    pub rated_tdp: f64,

    /// Partition (or partition prefix) to report on
    #[arg(short, long, env = "GRESUSAGE_PARTITION", default_value = "g")]
    pub partition: String,

    #[arg(long, value_enum, env = "GRESUSAGE_PARTITION_MATCH", default_value_t = PartitionMode::Prefix)]
    pub partition_match: PartitionMode,

    /// Regex selecting GPU nodes by name
    #[arg(long, env = "GRESUSAGE_GPU_NODES", default_value = "gpu")]
    pub gpu_nodes: String,

    /// Power samples taken per host
    #[arg(long, env = "GRESUSAGE_SAMPLES", default_value_t = 5)]
    pub samples: u32,

    #[arg(long, env = "GRESUSAGE_SAMPLE_INTERVAL_MS", default_value_t = 1000)]
    pub sample_interval_ms: u64,

    /// Seconds a host may take beyond the sampling window
    #[arg(long, env = "GRESUSAGE_HOST_TIMEOUT_SECS", default_value_t = 10)]
    pub host_timeout_secs: u64,

    /// Upper bound on simultaneous ssh connections
    #[arg(long, env = "GRESUSAGE_MAX_CONNECTIONS", default_value_t = 500)]
    pub max_connections: usize,

    #[arg(long, env = "GRESUSAGE_SSH", default_value = "ssh")]
    pub ssh: String,

    /// Hostlist to sample instead of the hosts running jobs, e.g. `gpu-[1-464]`
    #[arg(long, env = "GRESUSAGE_HOSTS")]
    pub hosts: Option<String>,

    /// Accounts under this organization are preemptible
    #[arg(long, env = "GRESUSAGE_PREEMPTIBLE_ORG", default_value = "root")]
    pub preemptible_org: String,

    /// Explicit preemptible accounts, skips sacctmgr
    #[arg(long, env = "GRESUSAGE_PREEMPTIBLE", value_delimiter = ',')]
    pub preemptible: Option<Vec<String>>,

    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,

    /// Lines per message block
    #[arg(long, default_value_t = 30)]
    pub chunk_lines: usize,

    #[arg(short, long, value_enum, env = "GRESUSAGE_OUTPUT", default_value_t = SinkKind::Stdout)]
    pub output: SinkKind,

    #[arg(long, env = "GRESUSAGE_OUTPUT_FILE")]
    pub output_file: Option<PathBuf>,

    #[arg(long, env = "GRESUSAGE_DISCORD_CHANNEL")]
    pub discord_channel: Option<String>,

    #[arg(long, env = "GRESUSAGE_DISCORD_TOKEN", hide_env_values = true)]
    pub discord_token: Option<String>,

    #[arg(long)]
    pub no_color: bool,
}

/// A credential that is passed through but never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkConfig {
    Stdout,
    File(PathBuf),
    Discord { channel_id: String, token: Secret },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub aggregate: AggregateSettings,
    pub plan: SamplingPlan,
    pub ssh: String,
    pub hosts: Option<String>,
    pub preemptible_org: String,
    pub preemptible_accounts: Option<Vec<String>>,
    pub format: OutputFormat,
    pub chunk_lines: usize,
    pub sink: SinkConfig,
    pub color: bool,
}

impl Cli {
    pub fn into_config(self) -> Result<Config> {
        if self.cpus_per_gpu == 0 {
            bail!("--cpus-per-gpu must be at least 1");
        }
        if self.chunk_lines == 0 {
            bail!("--chunk-lines must be at least 1");
        }
        let gpu_node_pattern = Regex::new(&self.gpu_nodes)
            .with_context(|| format!("Invalid GPU node pattern `{}`", self.gpu_nodes))?;
        let partition = match self.partition_match {
            PartitionMode::Prefix => PartitionMatch::Prefix(self.partition),
            PartitionMode::Exact => PartitionMatch::Exact(self.partition),
        };
        let sink = match self.output {
            SinkKind::Stdout => SinkConfig::Stdout,
            SinkKind::File => SinkConfig::File(
                self.output_file
                    .context("--output file requires --output-file")?,
            ),
            SinkKind::Discord => SinkConfig::Discord {
                channel_id: self
                    .discord_channel
                    .context("--output discord requires --discord-channel")?,
                token: Secret::new(
                    self.discord_token
                        .context("--output discord requires GRESUSAGE_DISCORD_TOKEN")?,
                ),
            },
        };
        let color = !self.no_color && sink == SinkConfig::Stdout;

        Ok(Config {
            aggregate: AggregateSettings {
                partition,
                gpu_node_pattern,
                cpus_per_gpu: self.cpus_per_gpu,
                gpus_per_node: self.gpus_per_node,
                rated_tdp: self.rated_tdp,
            },
            plan: SamplingPlan {
                samples: self.samples,
                interval: Duration::from_millis(self.sample_interval_ms),
                timeout: Duration::from_secs(self.host_timeout_secs),
                max_connections: self.max_connections,
            },
            ssh: self.ssh,
            hosts: self.hosts,
            preemptible_org: self.preemptible_org,
            preemptible_accounts: self.preemptible,
            format: self.format,
            chunk_lines: self.chunk_lines,
            sink,
            color,
        })
    }
}
