//! Outcome of a best-effort bulk operation.

use std::fmt;

/// Per-target results of a "gather, collect, continue" cleanup.
///
/// Every target is attempted; one failure never short-circuits the rest.
#[derive(Debug)]
pub struct CleanupReport<E> {
    pub outcomes: Vec<(String, Result<(), E>)>,
}

impl<E> Default for CleanupReport<E> {
    fn default() -> Self {
        Self {
            outcomes: Vec::new(),
        }
    }
}

impl<E: fmt::Display> CleanupReport<E> {
    pub fn new(outcomes: Vec<(String, Result<(), E>)>) -> Self {
        Self { outcomes }
    }

    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }

    /// Names of targets that were cleaned up.
    pub fn succeeded(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Targets whose cleanup failed, with their errors.
    pub fn failures(&self) -> Vec<(&str, &E)> {
        self.outcomes
            .iter()
            .filter_map(|(name, r)| r.as_ref().err().map(|e| (name.as_str(), e)))
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.outcomes.iter().all(|(_, r)| r.is_ok())
    }

    /// One-line summary of every failure, for logs and aggregated errors.
    pub fn failure_summary(&self) -> String {
        self.failures()
            .iter()
            .map(|(name, e)| format!("{name}: {e}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn merge(&mut self, other: CleanupReport<E>) {
        self.outcomes.extend(other.outcomes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_separates_successes_and_failures() {
        let report: CleanupReport<String> = CleanupReport::new(vec![
            ("a".to_string(), Ok(())),
            ("b".to_string(), Err("daemon gone".to_string())),
            ("c".to_string(), Ok(())),
        ]);

        assert_eq!(report.attempted(), 3);
        assert_eq!(report.succeeded(), vec!["a", "c"]);
        assert!(!report.is_clean());
        assert_eq!(report.failure_summary(), "b: daemon gone");
    }

    #[test]
    fn empty_report_is_clean() {
        let report: CleanupReport<String> = CleanupReport::default();
        assert!(report.is_clean());
        assert_eq!(report.attempted(), 0);
    }
}
