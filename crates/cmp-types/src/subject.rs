//! Dotted subject matching.
//!
//! Subscribe patterns support `*` for exactly one segment and `>` for the
//! remaining tail. Wildcards are only legal in patterns, never in published
//! subjects.

/// Check whether a concrete subject matches a subscribe pattern.
///
/// `*` matches a single segment, `>` matches one or more trailing segments.
/// A `>` anywhere but the final position never matches.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_segs = pattern.split('.').peekable();
    let mut subject_segs = subject.split('.');

    loop {
        match (pattern_segs.next(), subject_segs.next()) {
            (Some(">"), Some(_)) => return pattern_segs.peek().is_none(),
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(subject_matches("vm.aws.cred-1.created", "vm.aws.cred-1.created"));
        assert!(!subject_matches("vm.aws.cred-1.created", "vm.aws.cred-1.deleted"));
    }

    #[test]
    fn test_single_segment_wildcard() {
        assert!(subject_matches("vm.*.cred-1.created", "vm.aws.cred-1.created"));
        assert!(subject_matches("vm.*.*.created", "vm.gcp.cred-2.created"));
        // `*` is exactly one segment, not zero
        assert!(!subject_matches("vm.*.created", "vm.created"));
        assert!(!subject_matches("vm.*.created", "vm.aws.cred-1.created"));
    }

    #[test]
    fn test_tail_wildcard() {
        assert!(subject_matches("kubernetes.>", "kubernetes.aws.cred-1.us-east-1.clusters.created"));
        assert!(subject_matches("network.gcp.>", "network.gcp.cred-2.vpcs.v1.subnets.deleted"));
        // `>` requires at least one remaining segment
        assert!(!subject_matches("kubernetes.>", "kubernetes"));
        // `>` must be terminal
        assert!(!subject_matches("kubernetes.>.created", "kubernetes.aws.created"));
    }

    #[test]
    fn test_length_mismatch() {
        assert!(!subject_matches("vm.aws", "vm.aws.cred-1"));
        assert!(!subject_matches("vm.aws.cred-1", "vm.aws"));
    }
}
