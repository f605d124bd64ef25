//! Expansion of Slurm-style compact host lists such as `gpu-[1-3,7]`.

use std::collections::HashSet;

use crate::error::ParseError;

/// Most hosts one expression may expand to.
pub const MAX_HOSTS: usize = 1 << 16;

/// One `N` or `N-M` item of a bracketed range list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RangeToken {
    pub lo: u32,
    pub hi: u32,
    /// Zero-padding width taken from the lower bound, 0 when unpadded.
    pub width: usize,
}

impl RangeToken {
    pub fn values(self) -> impl Iterator<Item = u32> {
        self.lo..=self.hi
    }

    pub fn count(self) -> usize {
        (self.hi - self.lo) as usize + 1
    }
}

/// Parses `1,3,5-6` into range tokens. The error carries the offending token.
pub(crate) fn parse_range_list(list: &str) -> Result<Vec<RangeToken>, String> {
    list.split(',').map(|tok| parse_range(tok.trim())).collect()
}

fn parse_range(tok: &str) -> Result<RangeToken, String> {
    let number = |s: &str| -> Result<u32, String> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(tok.to_string());
        }
        s.parse::<u32>().map_err(|_| tok.to_string())
    };
    let (lo_str, hi_str) = match tok.split_once('-') {
        Some((lo, hi)) => (lo, hi),
        None => (tok, tok),
    };
    let lo = number(lo_str)?;
    let hi = number(hi_str)?;
    if hi < lo {
        return Err(tok.to_string());
    }
    let width = if lo_str.len() > 1 && lo_str.starts_with('0') {
        lo_str.len()
    } else {
        0
    };
    Ok(RangeToken { lo, hi, width })
}

/// Expands a host list expression into concrete host names.
///
/// Output keeps the order of the input and drops repeated hosts, so that it
/// stays index-aligned with per-node arrays Slurm reports alongside it.
/// Descending ranges such as `h[3-1]` are rejected, as are expressions
/// naming more than [`MAX_HOSTS`] hosts.
pub fn expand(expr: &str) -> Result<Vec<String>, ParseError> {
    let mut hosts = Vec::new();
    let mut seen = HashSet::new();
    let mut budget = MAX_HOSTS;
    for term in split_terms(expr)? {
        for host in expand_term(expr, term, &mut budget)? {
            if seen.insert(host.clone()) {
                hosts.push(host);
            }
        }
    }
    Ok(hosts)
}

fn malformed(expr: &str, token: &str) -> ParseError {
    ParseError::Hostlist {
        expr: expr.to_string(),
        token: token.to_string(),
    }
}

/// Splits on commas that are not inside brackets.
fn split_terms(expr: &str) -> Result<Vec<&str>, ParseError> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in expr.char_indices() {
        match c {
            '[' if depth == 0 => depth = 1,
            ']' if depth == 1 => depth = 0,
            '[' | ']' => return Err(malformed(expr, &expr[start..=i])),
            ',' if depth == 0 => {
                terms.push(&expr[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(malformed(expr, &expr[start..]));
    }
    terms.push(&expr[start..]);
    Ok(terms
        .into_iter()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect())
}

fn expand_term(expr: &str, term: &str, budget: &mut usize) -> Result<Vec<String>, ParseError> {
    let Some(open) = term.find('[') else {
        *budget = budget.checked_sub(1).ok_or_else(|| malformed(expr, term))?;
        return Ok(vec![term.to_string()]);
    };
    let close = term.find(']').ok_or_else(|| malformed(expr, term))?;
    let (prefix, body, suffix) = (&term[..open], &term[open + 1..close], &term[close + 1..]);
    if suffix.contains('[') {
        return Err(malformed(expr, term));
    }
    let ranges = parse_range_list(body).map_err(|tok| malformed(expr, &tok))?;
    for range in &ranges {
        *budget = budget
            .checked_sub(range.count())
            .ok_or_else(|| malformed(expr, term))?;
    }
    let mut hosts = Vec::new();
    for range in ranges {
        for n in range.values() {
            hosts.push(format!("{prefix}{n:0width$}{suffix}", width = range.width));
        }
    }
    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_bracketed_ranges() {
        assert_eq!(expand("h[1-3,5]").unwrap(), vec!["h1", "h2", "h3", "h5"]);
    }

    #[test]
    fn test_expand_empty() {
        assert!(expand("").unwrap().is_empty());
    }

    #[test]
    fn test_expand_keeps_input_order() {
        assert_eq!(
            expand("gpu-st-p4d-24xlarge-[9,2-3]").unwrap(),
            vec![
                "gpu-st-p4d-24xlarge-9",
                "gpu-st-p4d-24xlarge-2",
                "gpu-st-p4d-24xlarge-3"
            ]
        );
    }

    #[test]
    fn test_expand_single_host_without_brackets() {
        assert_eq!(expand("gpu-st-p4d-24xlarge-7").unwrap(), vec!["gpu-st-p4d-24xlarge-7"]);
    }

    #[test]
    fn test_expand_multiple_terms_and_dedup() {
        assert_eq!(
            expand("a[1-2],b3,a2").unwrap(),
            vec!["a1", "a2", "b3"]
        );
    }

    #[test]
    fn test_expand_zero_padded() {
        assert_eq!(expand("node[08-10]").unwrap(), vec!["node08", "node09", "node10"]);
    }

    #[test]
    fn test_descending_range_rejected() {
        let err = expand("h[3-1]").unwrap_err();
        assert_eq!(
            err,
            ParseError::Hostlist {
                expr: "h[3-1]".to_string(),
                token: "3-1".to_string()
            }
        );
    }

    #[test]
    fn test_malformed_tokens_rejected() {
        assert!(expand("h[1-]").is_err());
        assert!(expand("h[x]").is_err());
        assert!(expand("h[]").is_err());
        assert!(expand("h[1-2").is_err());
        assert!(expand("h1-2]").is_err());
        assert!(expand("h[1[2]]").is_err());
    }

    #[test]
    fn test_oversized_expansion_rejected() {
        assert_eq!(
            expand("h[0-4000000000]").unwrap_err(),
            ParseError::Hostlist {
                expr: "h[0-4000000000]".to_string(),
                token: "h[0-4000000000]".to_string()
            }
        );
        assert!(expand("a[1-40000],b[1-40000]").is_err());
        assert_eq!(expand("h[1-65536]").unwrap().len(), MAX_HOSTS);
    }

    #[test]
    fn test_parse_range_list() {
        let values: Vec<u32> = parse_range_list("1,3,5-6")
            .unwrap()
            .into_iter()
            .flat_map(RangeToken::values)
            .collect();
        assert_eq!(values, vec![1, 3, 5, 6]);
        assert_eq!(parse_range_list("1,a").unwrap_err(), "a");
    }
}
