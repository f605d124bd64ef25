use thiserror::Error;

/// A hostlist or GRES expression that could not be understood.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed hostlist token `{token}` in `{expr}`")]
    Hostlist { expr: String, token: String },
    #[error("malformed GRES expression `{0}`")]
    Gres(String),
    #[error("GPU index {index} outside capacity {capacity} in `{expr}`")]
    IndexOutOfRange {
        expr: String,
        index: u32,
        capacity: u32,
    },
}

/// A job whose expanded host list does not line up with its allocation records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("job {job_id}: {hosts} hosts but {records} allocation records")]
pub struct AlignmentError {
    pub job_id: u64,
    pub hosts: usize,
    pub records: usize,
}

/// One of the required snapshots could not be fetched at all.
#[derive(Error, Debug)]
#[error("{what} unavailable: {reason}")]
pub struct SourceUnavailable {
    pub what: &'static str,
    pub reason: String,
}

impl SourceUnavailable {
    pub fn new(what: &'static str, reason: impl Into<String>) -> Self {
        Self {
            what,
            reason: reason.into(),
        }
    }
}

/// Failure to obtain samples from a single host.
#[derive(Error, Debug)]
pub enum SampleError {
    #[error("failed to spawn sampling command for {host}: {source}")]
    Spawn {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sampling command on {host} exited with {status}: {stderr}")]
    Failed {
        host: String,
        status: String,
        stderr: String,
    },
}
