//! Concurrent per-GPU power sampling across many hosts.

use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::SampleError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuKey {
    pub host: String,
    pub index: u32,
}

impl GpuKey {
    pub fn new(host: impl Into<String>, index: u32) -> Self {
        Self {
            host: host.into(),
            index,
        }
    }
}

/// Mean watts per GPU. Pairs with no valid readings are absent.
pub type PowerMap = HashMap<GpuKey, f64>;

#[derive(Debug, Clone)]
pub struct SamplingPlan {
    pub samples: u32,
    pub interval: Duration,
    /// Allowance on top of the sampling window before a host is abandoned.
    pub timeout: Duration,
    pub max_connections: usize,
}

impl SamplingPlan {
    pub fn window(&self) -> Duration {
        self.interval * self.samples
    }

    pub fn deadline(&self) -> Duration {
        self.window() + self.timeout
    }

    /// Shell snippet run on each host. Every sample is one CSV block
    /// followed by a blank line.
    pub fn script(&self) -> String {
        format!(
            "for i in $(seq 1 {}); do nvidia-smi --query-gpu=index,power.draw --format=csv,nounits; echo; sleep {}; done",
            self.samples,
            self.interval.as_secs_f64()
        )
    }
}

/// Something that can run the sampling plan on a host and return its raw output.
#[async_trait]
pub trait PowerFeed: Send + Sync {
    async fn fetch(&self, host: &str, plan: &SamplingPlan) -> Result<String, SampleError>;
}

/// Runs the sampling script over `ssh`.
pub struct SshPowerFeed {
    pub ssh: String,
    pub connect_timeout: Duration,
}

#[async_trait]
impl PowerFeed for SshPowerFeed {
    async fn fetch(&self, host: &str, plan: &SamplingPlan) -> Result<String, SampleError> {
        let connect_timeout = format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1));
        let output = Command::new(&self.ssh)
            .args(["-o", "BatchMode=yes", "-o", connect_timeout.as_str(), host])
            .arg(plan.script())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| SampleError::Spawn {
                host: host.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(SampleError::Failed {
                host: host.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Raw readings from one host, `None` where a reading could not be parsed.
#[derive(Debug, Default, PartialEq)]
pub struct HostSamples {
    pub readings: BTreeMap<u32, Vec<Option<f64>>>,
}

impl HostSamples {
    /// Parses `nvidia-smi --query-gpu=index,power.draw --format=csv,nounits`
    /// output, possibly several blocks of it. Header lines are skipped.
    pub fn parse(output: &str) -> Self {
        let mut samples = Self::default();
        for line in output.lines() {
            let Some((index, power)) = line.split_once(',') else {
                continue;
            };
            let Ok(index) = index.trim().parse::<u32>() else {
                continue;
            };
            let power = power
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|w| w.is_finite() && *w >= 0.0);
            if power.is_none() {
                debug!("Dropping unparsable power reading: {}", line);
            }
            samples.readings.entry(index).or_default().push(power);
        }
        samples
    }

    pub fn means(&self) -> impl Iterator<Item = (u32, f64)> + '_ {
        self.readings
            .iter()
            .filter_map(|(&index, readings)| mean_of_valid(readings).map(|m| (index, m)))
    }
}

/// Mean of the readings that parsed, divided by how many did.
pub fn mean_of_valid(readings: &[Option<f64>]) -> Option<f64> {
    let valid: Vec<f64> = readings.iter().flatten().copied().collect();
    if valid.is_empty() {
        None
    } else {
        Some(valid.iter().sum::<f64>() / valid.len() as f64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SamplingSummary {
    pub targeted: usize,
    pub responded: usize,
    pub failed: usize,
    pub timed_out: usize,
}

enum HostOutcome {
    Responded(HostSamples),
    Failed,
    TimedOut,
}

pub struct PowerSampler {
    feed: Arc<dyn PowerFeed>,
    plan: SamplingPlan,
}

impl PowerSampler {
    pub fn new(feed: Arc<dyn PowerFeed>, plan: SamplingPlan) -> Self {
        Self { feed, plan }
    }

    /// Samples every host concurrently. Unreachable or slow hosts are logged
    /// and left out of the map; they never fail the batch.
    pub async fn sample(&self, hosts: &[String]) -> (PowerMap, SamplingSummary) {
        let mut summary = SamplingSummary {
            targeted: hosts.len(),
            ..Default::default()
        };
        let mut power = PowerMap::new();
        if hosts.is_empty() {
            return (power, summary);
        }

        let permits = Arc::new(Semaphore::new(
            self.plan.max_connections.clamp(1, hosts.len()),
        ));
        let deadline = self.plan.deadline();
        info!(
            "Sampling {} hosts ({} samples, deadline {:?})",
            hosts.len(),
            self.plan.samples,
            deadline
        );

        let mut tasks = JoinSet::new();
        for host in hosts {
            let host = host.clone();
            let feed = Arc::clone(&self.feed);
            let plan = self.plan.clone();
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (host, HostOutcome::Failed);
                };
                let outcome = match timeout(deadline, feed.fetch(&host, &plan)).await {
                    Ok(Ok(output)) => HostOutcome::Responded(HostSamples::parse(&output)),
                    Ok(Err(e)) => {
                        warn!("{}", e);
                        HostOutcome::Failed
                    }
                    Err(_) => {
                        warn!("Sampling {} timed out after {:?}", host, deadline);
                        HostOutcome::TimedOut
                    }
                };
                (host, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((host, HostOutcome::Responded(samples))) => {
                    summary.responded += 1;
                    for (index, watts) in samples.means() {
                        power.insert(GpuKey::new(host.as_str(), index), watts);
                    }
                }
                Ok((_, HostOutcome::Failed)) => summary.failed += 1,
                Ok((_, HostOutcome::TimedOut)) => summary.timed_out += 1,
                Err(e) => {
                    warn!("Sampling task aborted: {}", e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Sampled {} GPUs from {}/{} hosts",
            power.len(),
            summary.responded,
            summary.targeted
        );
        (power, summary)
    }
}
