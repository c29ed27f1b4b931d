use crate::error::EnsembleError;
use std::fmt;

/// Fixed-width key of one run, e.g. `001` for the run directory `eco-out-001`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunIdentity(String);

impl RunIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        RunIdentity(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns the identity encoded in `name` when it is `prefix` followed by
/// exactly `width` ASCII digits.
pub fn identity_from_name(name: &str, prefix: &str, width: usize) -> Option<RunIdentity> {
    let suffix = name.strip_prefix(prefix)?;
    if suffix.len() == width && suffix.bytes().all(|b| b.is_ascii_digit()) {
        Some(RunIdentity::new(suffix))
    } else {
        None
    }
}

/// One motif occurrence reported by the motif scanner, tagged with the
/// cluster whose motif produced it and the run it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct HitRecord {
    pub start: i64,
    pub stop: i64,
    pub p_value: f64,
    pub sequence_name: String,
    pub pattern_name: String,
    pub cluster: u32,
    pub run_id: RunIdentity,
}

impl HitRecord {
    /// Inclusive overlap test used by position queries.
    pub fn covers(&self, position: i64) -> bool {
        self.start <= position && position <= self.stop
    }
}

/// Number of member clusters a gene was found in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneCount {
    pub gene: String,
    pub count: usize,
}

/// A run that was dropped from an operation, with the reason.
#[derive(Debug)]
pub struct RunFailure {
    pub run: RunIdentity,
    pub cause: EnsembleError,
}

impl RunFailure {
    /// Builds the failure and logs it, so every coverage gap leaves a trace.
    pub fn record(run: RunIdentity, cause: EnsembleError) -> Self {
        log::warn!("run {}: {}", run, cause);
        RunFailure { run, cause }
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run {}: {}", self.run, self.cause)
    }
}

/// Result of an operation spanning many runs: what was found, and which runs
/// could not contribute.
#[derive(Debug)]
pub struct Coverage<T> {
    pub items: Vec<T>,
    pub failures: Vec<RunFailure>,
}

impl<T> Coverage<T> {
    pub fn new() -> Self {
        Coverage {
            items: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

impl<T> Default for Coverage<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_from_name() {
        assert_eq!(
            identity_from_name("eco-out-001", "eco-out-", 3),
            Some(RunIdentity::new("001"))
        );
        assert_eq!(identity_from_name("eco-out-01", "eco-out-", 3), None);
        assert_eq!(identity_from_name("eco-out-0012", "eco-out-", 3), None);
        assert_eq!(identity_from_name("eco-out-abc", "eco-out-", 3), None);
        assert_eq!(identity_from_name("hal-out-001", "eco-out-", 3), None);
    }

    #[test]
    fn test_covers_is_inclusive() {
        let hit = HitRecord {
            start: 100,
            stop: 200,
            p_value: 1e-6,
            sequence_name: "chr".into(),
            pattern_name: "1".into(),
            cluster: 1,
            run_id: RunIdentity::new("001"),
        };
        assert!(hit.covers(100));
        assert!(hit.covers(200));
        assert!(!hit.covers(99));
        assert!(!hit.covers(201));
    }
}
