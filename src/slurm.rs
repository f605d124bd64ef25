//! Snapshots of scheduler state and the commands that produce them.

use std::collections::BTreeMap;
use std::process::Command;

#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Deserializer};
use tracing::debug;

use crate::error::SourceUnavailable;
use crate::gres::GresCapacity;

const FAULT_FLAGS: &[&str] = &[
    "DOWN",
    "DRAIN",
    "DRAINED",
    "DRAINING",
    "FAIL",
    "FAILING",
    "NOT_RESPONDING",
    "ERROR",
    "MAINTENANCE",
    "INVALID",
    "INVALID_REG",
];

const POWERED_DOWN_FLAGS: &[&str] = &["POWERED_DOWN", "POWERING_DOWN", "POWER_DOWN"];

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum JobState {
    Running,
    Pending,
    #[default]
    Unknown,
    Other(String),
}

impl JobState {
    fn from_slurm(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "RUNNING" => Self::Running,
            "PENDING" => Self::Pending,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocatedNode {
    #[serde(default)]
    pub cpus: u32,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Job {
    #[serde(default)]
    pub job_id: u64,
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default, deserialize_with = "de_job_state")]
    pub job_state: JobState,
    #[serde(default)]
    pub partition: String,
    #[serde(default, deserialize_with = "de_slurm_number")]
    pub node_count: u32,
    #[serde(default)]
    pub nodes: String,
    #[serde(default)]
    pub gres_detail: Vec<String>,
    /// Per-node allocation records, in the same order as the expanded `nodes`.
    #[serde(default, rename = "job_resources", deserialize_with = "de_allocated_nodes")]
    pub allocated_nodes: Vec<AllocatedNode>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Node {
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "de_string_list")]
    pub state: Vec<String>,
    #[serde(default)]
    pub state_flags: Vec<String>,
    #[serde(default)]
    pub cpus: u32,
    #[serde(default)]
    idle_cpus: Option<u32>,
    #[serde(default)]
    alloc_idle_cpus: Option<u32>,
    #[serde(default)]
    pub gres: String,
    #[serde(default)]
    pub gres_used: String,
}

impl Node {
    pub fn idle_cpus(&self) -> u32 {
        self.idle_cpus.or(self.alloc_idle_cpus).unwrap_or(0)
    }

    /// GPU count from the node's configured GRES, or `default` when absent.
    pub fn capacity(&self, default: u32) -> u32 {
        self.gres
            .parse::<GresCapacity>()
            .map(|cap| cap.count)
            .unwrap_or(default)
    }

    fn flags(&self) -> impl Iterator<Item = String> + '_ {
        self.state
            .iter()
            .chain(self.state_flags.iter())
            .flat_map(|s| s.split('+'))
            .map(|s| s.trim().to_ascii_uppercase())
    }

    pub fn fault_flags(&self) -> Vec<String> {
        self.flags()
            .filter(|f| FAULT_FLAGS.contains(&f.as_str()))
            .collect()
    }

    pub fn is_powered_down(&self) -> bool {
        self.flags().any(|f| POWERED_DOWN_FLAGS.contains(&f.as_str()))
    }

    pub fn is_healthy(&self) -> bool {
        !self.is_powered_down() && self.fault_flags().is_empty()
    }
}

#[cfg(test)]
impl Node {
    pub fn for_test(name: &str, gres_used: &str, idle_cpus: u32, state: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            state: state.iter().map(|s| s.to_string()).collect(),
            cpus: 96,
            idle_cpus: Some(idle_cpus),
            gres: "gpu:a100:8".to_string(),
            gres_used: gres_used.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SlurmNumber {
    Plain(u32),
    Wrapped { number: u32 },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AllocatedNodes {
    Indexed(BTreeMap<String, AllocatedNode>),
    Listed(Vec<AllocatedNode>),
}

#[derive(Deserialize)]
struct JobResources {
    #[serde(default)]
    allocated_nodes: Option<AllocatedNodes>,
}

fn de_string_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    Ok(match Option::<StringOrList>::deserialize(d)? {
        Some(StringOrList::One(s)) => vec![s],
        Some(StringOrList::Many(v)) => v,
        None => Vec::new(),
    })
}

fn de_job_state<'de, D: Deserializer<'de>>(d: D) -> Result<JobState, D::Error> {
    Ok(de_string_list(d)?
        .first()
        .map(|s| JobState::from_slurm(s))
        .unwrap_or_default())
}

fn de_slurm_number<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    Ok(match Option::<SlurmNumber>::deserialize(d)? {
        Some(SlurmNumber::Plain(n)) | Some(SlurmNumber::Wrapped { number: n }) => n,
        None => 0,
    })
}

fn de_allocated_nodes<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<AllocatedNode>, D::Error> {
    let resources = Option::<JobResources>::deserialize(d)?;
    Ok(match resources.and_then(|r| r.allocated_nodes) {
        Some(AllocatedNodes::Listed(v)) => v,
        Some(AllocatedNodes::Indexed(map)) => {
            // keys are positions, "10" must sort after "9"
            let mut entries: Vec<(u64, AllocatedNode)> = map
                .into_iter()
                .map(|(k, v)| (k.parse().unwrap_or(u64::MAX), v))
                .collect();
            entries.sort_by_key(|(k, _)| *k);
            entries.into_iter().map(|(_, v)| v).collect()
        }
        None => Vec::new(),
    })
}

#[derive(Deserialize, Debug)]
struct SlurmJobs {
    jobs: Vec<Job>,
}

#[derive(Deserialize, Debug)]
struct SlurmNodes {
    nodes: Vec<Node>,
}

pub fn parse_jobs(json: &str) -> Result<Vec<Job>, serde_json::Error> {
    serde_json::from_str::<SlurmJobs>(json).map(|j| j.jobs)
}

pub fn parse_nodes(json: &str) -> Result<Vec<Node>, serde_json::Error> {
    serde_json::from_str::<SlurmNodes>(json).map(|n| n.nodes)
}

/// Accounts from `sacctmgr list --parsable Account` whose organization is `org`.
pub fn parse_preemptible_accounts(text: &str, org: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.split('|').collect::<Vec<_>>())
        .filter(|fields| fields.len() >= 3 && fields[0] != "Account" && fields[2] == org)
        .map(|fields| fields[0].to_string())
        .collect()
}

/// The three snapshots every run needs.
#[cfg_attr(test, automock)]
pub trait ClusterSource {
    fn jobs(&self) -> Result<Vec<Job>, SourceUnavailable>;
    fn nodes(&self) -> Result<Vec<Node>, SourceUnavailable>;
    fn preemptible_accounts(&self) -> Result<Vec<String>, SourceUnavailable>;
}

/// Reads snapshots through the Slurm command line tools.
pub struct SlurmCli {
    pub preemptible_org: String,
    pub preemptible_accounts: Option<Vec<String>>,
}

impl SlurmCli {
    fn query(what: &'static str, program: &str, args: &[&str]) -> Result<String, SourceUnavailable> {
        debug!("Running {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| SourceUnavailable::new(what, format!("{program}: {e}")))?;
        if output.status.success() {
            String::from_utf8(output.stdout)
                .map_err(|e| SourceUnavailable::new(what, e.to_string()))
        } else {
            let error_msg = String::from_utf8_lossy(&output.stderr);
            Err(SourceUnavailable::new(
                what,
                format!("{program} failed: {}", error_msg.trim()),
            ))
        }
    }
}

impl ClusterSource for SlurmCli {
    fn jobs(&self) -> Result<Vec<Job>, SourceUnavailable> {
        let output = Self::query("job snapshot", "squeue", &["--json"])?;
        parse_jobs(&output).map_err(|e| SourceUnavailable::new("job snapshot", e.to_string()))
    }

    fn nodes(&self) -> Result<Vec<Node>, SourceUnavailable> {
        let output = Self::query("node snapshot", "scontrol", &["show", "nodes", "--json"])?;
        parse_nodes(&output).map_err(|e| SourceUnavailable::new("node snapshot", e.to_string()))
    }

    fn preemptible_accounts(&self) -> Result<Vec<String>, SourceUnavailable> {
        if let Some(accounts) = &self.preemptible_accounts {
            return Ok(accounts.clone());
        }
        let output = Self::query(
            "account list",
            "sacctmgr",
            &["list", "--parsable", "Account"],
        )?;
        Ok(parse_preemptible_accounts(&output, &self.preemptible_org))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_jobs_legacy_shape() {
        let json = r#"{"jobs": [{
            "job_id": 42,
            "account": "vision",
            "user_name": "alice",
            "job_state": "RUNNING",
            "partition": "gpu",
            "node_count": 2,
            "nodes": "gpu-[1-2]",
            "gres_detail": ["gpu:a100:8(IDX:0-7)"],
            "job_resources": {"allocated_nodes": {
                "1": {"nodename": "gpu-2", "cpus": 24},
                "0": {"nodename": "gpu-1", "cpus": 96}
            }}
        }]}"#;
        let jobs = parse_jobs(json).unwrap();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.job_state, JobState::Running);
        assert_eq!(job.node_count, 2);
        assert_eq!(job.allocated_nodes.len(), 2);
        assert_eq!(job.allocated_nodes[0].cpus, 96);
        assert_eq!(job.allocated_nodes[1].cpus, 24);
    }

    #[test]
    fn test_parse_jobs_newer_shape() {
        let json = r#"{"jobs": [{
            "job_id": 7,
            "account": "nlp",
            "user_name": "bob",
            "job_state": ["PENDING"],
            "partition": "gpu",
            "node_count": {"set": true, "infinite": false, "number": 4},
            "nodes": "",
            "job_resources": {}
        }]}"#;
        let job = &parse_jobs(json).unwrap()[0];
        assert_eq!(job.job_state, JobState::Pending);
        assert_eq!(job.node_count, 4);
        assert!(job.allocated_nodes.is_empty());
        assert!(job.gres_detail.is_empty());
    }

    #[test]
    fn test_parse_jobs_index_order_is_numeric() {
        let json = r#"{"jobs": [{"job_resources": {"allocated_nodes": {
            "10": {"cpus": 10}, "9": {"cpus": 9}, "2": {"cpus": 2}
        }}}]}"#;
        let cpus: Vec<u32> = parse_jobs(json).unwrap()[0]
            .allocated_nodes
            .iter()
            .map(|n| n.cpus)
            .collect();
        assert_eq!(cpus, vec![2, 9, 10]);
    }

    #[test]
    fn test_parse_nodes_and_flags() {
        let json = r#"{"nodes": [
            {"name": "gpu-1", "state": ["IDLE", "DRAIN"], "cpus": 96,
             "alloc_idle_cpus": 96, "gres": "gpu:a100:8(S:0-1)", "gres_used": "gpu:a100:0(IDX:N/A)"},
            {"name": "gpu-2", "state": "idle", "state_flags": ["POWERED_DOWN"], "cpus": 96,
             "idle_cpus": 48, "gres": "", "gres_used": ""}
        ]}"#;
        let nodes = parse_nodes(json).unwrap();
        assert_eq!(nodes[0].fault_flags(), vec!["DRAIN"]);
        assert!(!nodes[0].is_healthy());
        assert_eq!(nodes[0].idle_cpus(), 96);
        assert_eq!(nodes[0].capacity(4), 8);
        assert!(nodes[1].is_powered_down());
        assert!(nodes[1].fault_flags().is_empty());
        assert_eq!(nodes[1].idle_cpus(), 48);
        assert_eq!(nodes[1].capacity(4), 4);
    }

    #[test]
    fn test_parse_preemptible_accounts() {
        let text = "Account|Descr|Org|\nscavenge|scavenge|root|\nvision|vision lab|vision|\nshort|x|\n";
        assert_eq!(parse_preemptible_accounts(text, "root"), vec!["scavenge"]);
    }

    #[test]
    fn test_explicit_preemptible_accounts_skip_sacctmgr() {
        let cli = SlurmCli {
            preemptible_org: "root".to_string(),
            preemptible_accounts: Some(vec!["scavenge".to_string()]),
        };
        assert_eq!(cli.preemptible_accounts().unwrap(), vec!["scavenge"]);
    }
}
