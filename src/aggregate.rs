//! Per-account/user usage tables and cluster-wide GPU counters.

use std::collections::{BTreeMap, HashSet};

use regex::Regex;
use serde::Serialize;
use tracing::warn;

use crate::gres;
use crate::reconcile::{JobUsage, Reconciled};
use crate::sampler::SamplingSummary;
use crate::slurm::{JobState, Node};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionMatch {
    Prefix(String),
    Exact(String),
}

impl PartitionMatch {
    pub fn matches(&self, partition: &str) -> bool {
        match self {
            Self::Prefix(prefix) => partition.starts_with(prefix.as_str()),
            Self::Exact(name) => partition == name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregateSettings {
    pub partition: PartitionMatch,
    pub gpu_node_pattern: Regex,
    pub cpus_per_gpu: u32,
    pub gpus_per_node: u32,
    pub rated_tdp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageRow {
    pub account: String,
    pub user: String,
    pub gpu_count: u32,
    pub power_usage: f64,
    pub average_power: f64,
    pub efficiency: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterCounters {
    pub idle: u32,
    pub broken: u32,
    pub pending: u32,
    pub preemptible: u32,
    pub non_preemptible: u32,
    pub total_available: u32,
}

/// How much of the snapshot had to be skipped or estimated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DataQuality {
    pub unparsable_jobs: usize,
    pub degraded_jobs: usize,
    pub unparsable_nodes: usize,
    pub sampling: SamplingSummary,
}

impl DataQuality {
    pub fn is_approximate(&self) -> bool {
        self.unparsable_jobs > 0
            || self.degraded_jobs > 0
            || self.unparsable_nodes > 0
            || self.sampling.responded < self.sampling.targeted
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageReport {
    pub pending: Vec<UsageRow>,
    pub preemptible: Vec<UsageRow>,
    pub non_preemptible: Vec<UsageRow>,
    pub counters: ClusterCounters,
    pub quality: DataQuality,
}

#[derive(Default)]
struct Accumulator {
    gpu_count: u32,
    power_usage: f64,
}

impl AggregateSettings {
    fn efficiency(&self, average_power: f64) -> u32 {
        if self.rated_tdp <= 0.0 {
            return 0;
        }
        (average_power / self.rated_tdp * 100.0).round() as u32
    }

    /// Groups by (account, user), smallest GPU holders first.
    fn group<'a>(&self, rows: impl Iterator<Item = (&'a JobUsage, u32)>) -> Vec<UsageRow> {
        let mut groups: BTreeMap<(String, String), Accumulator> = BTreeMap::new();
        for (job, gpu_count) in rows {
            let acc = groups
                .entry((job.account.clone(), job.user.clone()))
                .or_default();
            acc.gpu_count = acc.gpu_count.saturating_add(gpu_count);
            acc.power_usage += job.power_usage;
        }
        let mut table: Vec<UsageRow> = groups
            .into_iter()
            .map(|((account, user), acc)| {
                let average_power = if acc.gpu_count == 0 {
                    0.0
                } else {
                    acc.power_usage / acc.gpu_count as f64
                };
                UsageRow {
                    account,
                    user,
                    gpu_count: acc.gpu_count,
                    power_usage: acc.power_usage,
                    average_power,
                    efficiency: self.efficiency(average_power),
                }
            })
            .collect();
        table.sort_by_key(|row| row.gpu_count);
        table
    }

    fn is_gpu_node(&self, node: &Node) -> bool {
        self.gpu_node_pattern.is_match(&node.name)
    }

    /// Idle, broken and available GPUs from the node inventory, plus the
    /// number of nodes whose in-use GRES could not be read.
    fn node_counters(&self, nodes: &[Node]) -> (ClusterCounters, usize) {
        let mut counters = ClusterCounters::default();
        let mut unparsable = 0;
        for node in nodes.iter().filter(|n| self.is_gpu_node(n)) {
            let capacity = node.capacity(self.gpus_per_node);
            if !node.fault_flags().is_empty() {
                counters.broken += capacity;
                continue;
            }
            if !node.is_healthy() {
                continue;
            }
            counters.total_available += capacity;
            match gres::parse_within(&node.gres_used, capacity) {
                Ok(in_use) => {
                    let free = capacity.saturating_sub(in_use.len() as u32);
                    let cpu_budget = node.idle_cpus() / self.cpus_per_gpu.max(1);
                    counters.idle += free.min(cpu_budget);
                }
                Err(e) => {
                    warn!("Skipping idle count for {}: {}", node.name, e);
                    unparsable += 1;
                }
            }
        }
        (counters, unparsable)
    }

    /// Builds the report. Pure: the same inputs always give the same output.
    pub fn aggregate(
        &self,
        reconciled: &Reconciled,
        nodes: &[Node],
        preemptible_accounts: &[String],
        sampling: &SamplingSummary,
    ) -> UsageReport {
        let preemptible_accounts: HashSet<&str> =
            preemptible_accounts.iter().map(String::as_str).collect();
        let monitored: Vec<&JobUsage> = reconciled
            .jobs
            .iter()
            .filter(|j| self.partition.matches(&j.partition))
            .collect();

        let requested = |job: &JobUsage| job.node_count.saturating_mul(self.gpus_per_node);
        let pending: Vec<&JobUsage> = monitored
            .iter()
            .copied()
            .filter(|j| j.state == JobState::Pending)
            .collect();
        let (preemptible, non_preemptible): (Vec<&JobUsage>, Vec<&JobUsage>) = monitored
            .iter()
            .copied()
            .filter(|j| j.state == JobState::Running)
            .partition(|j| preemptible_accounts.contains(j.account.as_str()));

        let (mut counters, unparsable_nodes) = self.node_counters(nodes);
        counters.pending = pending
            .iter()
            .map(|&j| requested(j))
            .fold(0, u32::saturating_add);
        counters.preemptible = preemptible.iter().map(|j| j.gpu_count).sum();
        counters.non_preemptible = non_preemptible.iter().map(|j| j.gpu_count).sum();

        UsageReport {
            pending: self.group(pending.iter().map(|&j| (j, requested(j)))),
            preemptible: self.group(preemptible.iter().map(|j| (*j, j.gpu_count))),
            non_preemptible: self.group(non_preemptible.iter().map(|j| (*j, j.gpu_count))),
            counters,
            quality: DataQuality {
                unparsable_jobs: reconciled.unparsable.len(),
                degraded_jobs: reconciled.degraded(),
                unparsable_nodes,
                sampling: sampling.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AlignmentError, ParseError};

    fn settings() -> AggregateSettings {
        AggregateSettings {
            partition: PartitionMatch::Prefix("g".to_string()),
            gpu_node_pattern: Regex::new("gpu").unwrap(),
            cpus_per_gpu: 12,
            gpus_per_node: 8,
            rated_tdp: 400.0,
        }
    }

    fn usage(account: &str, user: &str, state: JobState, gpus: u32, power: f64) -> JobUsage {
        JobUsage {
            job_id: 0,
            account: account.to_string(),
            user: user.to_string(),
            state,
            partition: "gpu".to_string(),
            node_count: 1,
            gpu_count: gpus,
            power_usage: power,
            degraded: None,
        }
    }

    #[test]
    fn test_node_counters_idle_and_broken() {
        let nodes = vec![
            Node::for_test("gpu-a", "gpu:a100:0(IDX:N/A)", 24, &["IDLE"]),
            Node::for_test("gpu-b", "gpu:a100:0(IDX:N/A)", 96, &["IDLE", "DRAIN"]),
        ];
        let report = settings().aggregate(&Reconciled::default(), &nodes, &[], &SamplingSummary::default());
        assert_eq!(report.counters.idle, 2);
        assert_eq!(report.counters.broken, 8);
        assert_eq!(report.counters.total_available, 8);
    }

    #[test]
    fn test_idle_limited_by_gpus_in_use() {
        let nodes = vec![Node::for_test("gpu-a", "gpu:a100:7(IDX:0-6)", 96, &["MIXED"])];
        let report = settings().aggregate(&Reconciled::default(), &nodes, &[], &SamplingSummary::default());
        assert_eq!(report.counters.idle, 1);
    }

    #[test]
    fn test_powered_down_and_cpu_nodes_ignored() {
        let nodes = vec![
            Node::for_test("gpu-a", "", 96, &["IDLE", "POWERED_DOWN"]),
            Node::for_test("cpu-a", "", 96, &["IDLE"]),
        ];
        let report = settings().aggregate(&Reconciled::default(), &nodes, &[], &SamplingSummary::default());
        assert_eq!(report.counters, ClusterCounters::default());
    }

    #[test]
    fn test_unparsable_node_gres_counted() {
        let nodes = vec![Node::for_test("gpu-a", "garbage", 96, &["IDLE"])];
        let report = settings().aggregate(&Reconciled::default(), &nodes, &[], &SamplingSummary::default());
        assert_eq!(report.counters.idle, 0);
        assert_eq!(report.quality.unparsable_nodes, 1);
        assert!(report.quality.is_approximate());
    }

    #[test]
    fn test_groups_split_and_sorted() {
        let reconciled = Reconciled {
            jobs: vec![
                usage("vision", "alice", JobState::Running, 8, 1600.0),
                usage("vision", "alice", JobState::Running, 8, 1600.0),
                usage("nlp", "bob", JobState::Running, 2, 0.0),
                usage("scavenge", "carol", JobState::Running, 4, 800.0),
                usage("nlp", "dave", JobState::Pending, 0, 0.0),
            ],
            unparsable: vec![(9, ParseError::Gres("x".to_string()))],
        };
        let report = settings().aggregate(
            &reconciled,
            &[],
            &["scavenge".to_string()],
            &SamplingSummary::default(),
        );

        assert_eq!(report.non_preemptible.len(), 2);
        assert_eq!(report.non_preemptible[0].user, "bob");
        assert_eq!(report.non_preemptible[0].efficiency, 0);
        let alice = &report.non_preemptible[1];
        assert_eq!(alice.gpu_count, 16);
        assert_eq!(alice.average_power, 200.0);
        assert_eq!(alice.efficiency, 50);

        assert_eq!(report.preemptible.len(), 1);
        assert_eq!(report.preemptible[0].efficiency, 50);
        assert_eq!(report.pending[0].gpu_count, 8);

        assert_eq!(report.counters.pending, 8);
        assert_eq!(report.counters.preemptible, 4);
        assert_eq!(report.counters.non_preemptible, 18);
        assert_eq!(report.quality.unparsable_jobs, 1);
    }

    #[test]
    fn test_huge_pending_request_saturates() {
        let mut job = usage("nlp", "dave", JobState::Pending, 0, 0.0);
        job.node_count = u32::MAX;
        let reconciled = Reconciled {
            jobs: vec![job],
            unparsable: vec![],
        };
        let report = settings().aggregate(&reconciled, &[], &[], &SamplingSummary::default());
        assert_eq!(report.counters.pending, u32::MAX);
        assert_eq!(report.pending[0].gpu_count, u32::MAX);
    }

    #[test]
    fn test_blank_node_gres_is_unparsable() {
        let nodes = vec![Node::for_test("gpu-a", "", 96, &["IDLE"])];
        let report = settings().aggregate(&Reconciled::default(), &nodes, &[], &SamplingSummary::default());
        assert_eq!(report.counters.idle, 0);
        assert_eq!(report.counters.total_available, 8);
        assert_eq!(report.quality.unparsable_nodes, 1);
    }

    #[test]
    fn test_zero_gpu_group_has_zero_efficiency() {
        let reconciled = Reconciled {
            jobs: vec![usage("a", "u", JobState::Running, 0, 0.0)],
            unparsable: vec![],
        };
        let report = settings().aggregate(&reconciled, &[], &[], &SamplingSummary::default());
        assert_eq!(report.non_preemptible[0].average_power, 0.0);
        assert_eq!(report.non_preemptible[0].efficiency, 0);
    }

    #[test]
    fn test_partition_filter() {
        let mut other = usage("a", "u", JobState::Running, 8, 0.0);
        other.partition = "cpu".to_string();
        let reconciled = Reconciled {
            jobs: vec![other, usage("a", "u", JobState::Running, 2, 0.0)],
            unparsable: vec![],
        };
        let report = settings().aggregate(&reconciled, &[], &[], &SamplingSummary::default());
        assert_eq!(report.counters.non_preemptible, 2);

        assert!(PartitionMatch::Exact("gpu".to_string()).matches("gpu"));
        assert!(!PartitionMatch::Exact("gpu".to_string()).matches("gpu-long"));
        assert!(PartitionMatch::Prefix("g".to_string()).matches("gpu-long"));
    }

    #[test]
    fn test_degraded_jobs_reported() {
        let mut job = usage("a", "u", JobState::Running, 2, 0.0);
        job.degraded = Some(AlignmentError {
            job_id: 0,
            hosts: 2,
            records: 1,
        });
        let reconciled = Reconciled {
            jobs: vec![job],
            unparsable: vec![],
        };
        let report = settings().aggregate(&reconciled, &[], &[], &SamplingSummary::default());
        assert_eq!(report.quality.degraded_jobs, 1);
        assert!(report.quality.is_approximate());
    }

    #[test]
    fn test_aggregate_is_idempotent() {
        let reconciled = Reconciled {
            jobs: vec![
                usage("vision", "alice", JobState::Running, 8, 2000.0),
                usage("nlp", "bob", JobState::Pending, 0, 0.0),
            ],
            unparsable: vec![],
        };
        let nodes = vec![Node::for_test("gpu-a", "gpu:a100:2(IDX:0-1)", 48, &["MIXED"])];
        let accounts = vec!["nlp".to_string()];
        let summary = SamplingSummary::default();
        let s = settings();
        assert_eq!(
            s.aggregate(&reconciled, &nodes, &accounts, &summary),
            s.aggregate(&reconciled, &nodes, &accounts, &summary)
        );
    }
}
