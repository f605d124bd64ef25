pub mod aggregate;
pub mod config;
pub mod error;
pub mod gres;
pub mod hostlist;
pub mod reconcile;
pub mod report;
pub mod sampler;
pub mod sink;
pub mod slurm;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::aggregate::UsageReport;
use crate::config::Config;
use crate::reconcile::Reconciler;
use crate::sampler::{PowerFeed, PowerSampler};
use crate::slurm::{ClusterSource, Job, JobState};

/// Hosts of running jobs that look like GPU nodes, in first-seen order.
/// Jobs with malformed node lists are left for the reconciler to report.
pub fn sampling_targets(jobs: &[Job], config: &Config) -> Vec<String> {
    let mut seen = HashSet::new();
    jobs.iter()
        .filter(|job| job.job_state == JobState::Running)
        .filter_map(|job| hostlist::expand(&job.nodes).ok())
        .flatten()
        .filter(|host| config.aggregate.gpu_node_pattern.is_match(host))
        .filter(|host| seen.insert(host.clone()))
        .collect()
}

/// Runs one snapshot through the whole pipeline.
pub fn run(config: &Config, source: &dyn ClusterSource, feed: Arc<dyn PowerFeed>) -> Result<UsageReport> {
    let nodes = source.nodes()?;
    let jobs = source.jobs()?;
    let preemptible = source.preemptible_accounts()?;
    info!(
        "Loaded {} nodes, {} jobs and {} preemptible accounts",
        nodes.len(),
        jobs.len(),
        preemptible.len()
    );

    let hosts = match &config.hosts {
        Some(expr) => hostlist::expand(expr).context("Invalid --hosts expression")?,
        None => sampling_targets(&jobs, config),
    };
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start sampling runtime")?;
    let sampler = PowerSampler::new(feed, config.plan.clone());
    let (power, sampling) = runtime.block_on(sampler.sample(&hosts));
    if power.is_empty() && !hosts.is_empty() {
        warn!("No power samples collected, every job will read 0 W");
    }

    let reconciler = Reconciler::new(
        config.aggregate.cpus_per_gpu,
        config.aggregate.gpus_per_node,
        &nodes,
    );
    let reconciled = reconciler.attribute_all(&jobs, &power);
    Ok(config
        .aggregate
        .aggregate(&reconciled, &nodes, &preemptible, &sampling))
}
