//! Parsing of Slurm GRES strings.
//!
//! Allocations look like `gpu:a100:8(IDX:0-7)`; configured capacity looks like
//! `gpu:a100:8` or `gpu:a100:8(S:0-1)`.

use std::collections::BTreeSet;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ParseError;
use crate::hostlist::{parse_range_list, RangeToken};

const NOT_AVAILABLE: &str = "N/A";

static USED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<kind>[A-Za-z_][\w.-]*)(?::(?P<model>[\w.-]+))?:(?P<count>\d+)\(IDX:(?P<idx>[^)]*)\)$")
        .unwrap()
});

static CAPACITY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^gpu(?::[\w.-]+)?:(?P<count>\d+)(?:\(.*\))?$").unwrap()
});

/// Exclusive bound on GPU indices when no node capacity is known.
const MAX_GPU_INDEX: u32 = 1024;

/// Returns the GPU indices named by a GRES allocation string.
///
/// `N/A` and `...(IDX:N/A)` both mean no GPU is held. A blank string is
/// malformed.
pub fn parse(descriptor: &str) -> Result<BTreeSet<u32>, ParseError> {
    parse_within(descriptor, MAX_GPU_INDEX)
}

/// Like [`parse`], but rejects indices that do not exist on a node with
/// `capacity` GPUs. Ranges are checked before they are expanded.
pub fn parse_within(descriptor: &str, capacity: u32) -> Result<BTreeSet<u32>, ParseError> {
    let descriptor = descriptor.trim();
    let mut indices = BTreeSet::new();
    if descriptor == NOT_AVAILABLE {
        return Ok(indices);
    }
    let terms = split_terms(descriptor);
    if terms.is_empty() {
        return Err(ParseError::Gres(descriptor.to_string()));
    }
    for term in terms {
        let caps = USED_RE
            .captures(term)
            .ok_or_else(|| ParseError::Gres(descriptor.to_string()))?;
        if &caps["kind"] != "gpu" {
            continue;
        }
        let idx = caps["idx"].trim();
        if idx == NOT_AVAILABLE {
            continue;
        }
        let ranges =
            parse_range_list(idx).map_err(|_| ParseError::Gres(descriptor.to_string()))?;
        if let Some(range) = ranges.iter().find(|r| r.hi >= capacity) {
            return Err(ParseError::IndexOutOfRange {
                expr: descriptor.to_string(),
                index: range.lo.max(capacity),
                capacity,
            });
        }
        indices.extend(ranges.into_iter().flat_map(RangeToken::values));
    }
    Ok(indices)
}

/// Top-level comma split that ignores commas inside `(...)`.
fn split_terms(s: &str) -> Vec<&str> {
    let mut terms = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                terms.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    terms.push(&s[start..]);
    terms.into_iter().map(str::trim).filter(|t| !t.is_empty()).collect()
}

/// GPU count configured on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GresCapacity {
    pub count: u32,
}

impl FromStr for GresCapacity {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        split_terms(s)
            .into_iter()
            .find_map(|term| CAPACITY_RE.captures(term))
            .and_then(|caps| caps["count"].parse().ok())
            .map(|count| Self { count })
            .ok_or_else(|| ParseError::Gres(s.to_string()))
    }
}
