//! Attribution of GPUs and power draw to individual jobs.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, warn};

use crate::error::{AlignmentError, ParseError};
use crate::gres;
use crate::hostlist;
use crate::sampler::{GpuKey, PowerMap};
use crate::slurm::{Job, JobState, Node};

/// A job together with the GPUs and watts attributed to it.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUsage {
    pub job_id: u64,
    pub account: String,
    pub user: String,
    pub state: JobState,
    pub partition: String,
    pub node_count: u32,
    pub gpu_count: u32,
    pub power_usage: f64,
    /// Set when the allocation could not be aligned with the host list and
    /// the figures above are an estimate.
    pub degraded: Option<AlignmentError>,
}

#[derive(Debug, Default)]
pub struct Reconciled {
    pub jobs: Vec<JobUsage>,
    pub unparsable: Vec<(u64, ParseError)>,
}

impl Reconciled {
    pub fn degraded(&self) -> usize {
        self.jobs.iter().filter(|j| j.degraded.is_some()).count()
    }
}

pub struct Reconciler {
    cpus_per_gpu: u32,
    default_capacity: u32,
    capacities: HashMap<String, u32>,
}

impl Reconciler {
    pub fn new(cpus_per_gpu: u32, default_capacity: u32, nodes: &[Node]) -> Self {
        Self {
            cpus_per_gpu: cpus_per_gpu.max(1),
            default_capacity,
            capacities: nodes
                .iter()
                .map(|n| (n.name.clone(), n.capacity(default_capacity)))
                .collect(),
        }
    }

    fn capacity_of(&self, host: &str) -> u32 {
        self.capacities
            .get(host)
            .copied()
            .unwrap_or(self.default_capacity)
    }

    /// GPUs a job is billed for by CPU share, never more than the node holds.
    fn gpus_for_cpus(&self, cpus: u32, capacity: u32) -> u32 {
        (cpus / self.cpus_per_gpu).min(capacity)
    }

    pub fn attribute(&self, job: &Job, power: &PowerMap) -> Result<JobUsage, ParseError> {
        let hosts = hostlist::expand(&job.nodes)?;
        let mut usage = JobUsage {
            job_id: job.job_id,
            account: job.account.clone(),
            user: job.user_name.clone(),
            state: job.job_state.clone(),
            partition: job.partition.clone(),
            node_count: job.node_count,
            gpu_count: 0,
            power_usage: 0.0,
            degraded: None,
        };

        if hosts.len() != job.allocated_nodes.len() {
            let err = AlignmentError {
                job_id: job.job_id,
                hosts: hosts.len(),
                records: job.allocated_nodes.len(),
            };
            warn!("{}, estimating GPUs from CPU share", err);
            usage.gpu_count = job
                .allocated_nodes
                .iter()
                .map(|n| self.gpus_for_cpus(n.cpus, self.default_capacity))
                .sum();
            usage.degraded = Some(err);
            return Ok(usage);
        }

        let mut gpus = BTreeSet::new();
        for (i, (host, alloc)) in hosts.iter().zip(&job.allocated_nodes).enumerate() {
            let capacity = self.capacity_of(host);
            let detail = job
                .gres_detail
                .get(i)
                .map(|s| s.trim())
                .filter(|s| !s.is_empty());
            let indices = match detail {
                Some(detail) => gres::parse_within(detail, capacity)?,
                None => (0..self.gpus_for_cpus(alloc.cpus, capacity)).collect(),
            };
            gpus.extend(indices.into_iter().map(|index| GpuKey::new(host.as_str(), index)));
        }

        usage.gpu_count = gpus.len() as u32;
        usage.power_usage = gpus
            .iter()
            .map(|key| power.get(key).copied().unwrap_or(0.0))
            .sum();
        Ok(usage)
    }

    /// Attributes every job. Jobs with malformed expressions are set aside
    /// rather than failing the whole snapshot.
    pub fn attribute_all(&self, jobs: &[Job], power: &PowerMap) -> Reconciled {
        let mut reconciled = Reconciled::default();
        for job in jobs {
            match self.attribute(job, power) {
                Ok(usage) => reconciled.jobs.push(usage),
                Err(e) => {
                    warn!("Skipping job {}: {}", job.job_id, e);
                    reconciled.unparsable.push((job.job_id, e));
                }
            }
        }
        debug!(
            "Attributed {} jobs, {} degraded, {} unparsable",
            reconciled.jobs.len(),
            reconciled.degraded(),
            reconciled.unparsable.len()
        );
        reconciled
    }
}
