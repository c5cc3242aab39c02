use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counts of records that did not fail during a pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessStats {
    /// Renewed and persisted
    pub all: u64,
    /// Already renewed in the collector
    pub conflicts: u64,
    /// Resource without carry-over measures
    pub notsupported: u64,
    /// Resource not running
    pub skips: u64,
}

/// Outcome counts of one renewal pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewalStats {
    pub success: SuccessStats,
    pub failures: u64,
}

impl RenewalStats {
    pub fn total(&self) -> u64 {
        self.success.all
            + self.success.conflicts
            + self.success.notsupported
            + self.success.skips
            + self.failures
    }
}

/// Which counter a settled record adds to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Renewed,
    Conflict,
    NotSupported,
    Skipped,
}

/// Counters shared by the concurrent record chains of a pass
#[derive(Debug, Default)]
pub struct Statistics {
    all: AtomicU64,
    conflicts: AtomicU64,
    notsupported: AtomicU64,
    skips: AtomicU64,
    failures: AtomicU64,
}

impl Statistics {
    pub fn record(&self, outcome: RecordOutcome) {
        let counter = match outcome {
            RecordOutcome::Renewed => &self.all,
            RecordOutcome::Conflict => &self.conflicts,
            RecordOutcome::NotSupported => &self.notsupported,
            RecordOutcome::Skipped => &self.skips,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> RenewalStats {
        RenewalStats {
            success: SuccessStats {
                all: self.all.load(Ordering::SeqCst),
                conflicts: self.conflicts.load(Ordering::SeqCst),
                notsupported: self.notsupported.load(Ordering::SeqCst),
                skips: self.skips.load(Ordering::SeqCst),
            },
            failures: self.failures.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_counts_each_outcome() {
        let stats = Statistics::default();
        stats.record(RecordOutcome::Renewed);
        stats.record(RecordOutcome::Renewed);
        stats.record(RecordOutcome::Conflict);
        stats.record(RecordOutcome::Skipped);
        stats.record_failure();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.success.all, 2);
        assert_eq!(snapshot.success.conflicts, 1);
        assert_eq!(snapshot.success.notsupported, 0);
        assert_eq!(snapshot.success.skips, 1);
        assert_eq!(snapshot.failures, 1);
        assert_eq!(snapshot.total(), 5);
    }

    #[test]
    fn test_report_format() {
        let snapshot = RenewalStats {
            success: SuccessStats { all: 3, conflicts: 1, notsupported: 0, skips: 2 },
            failures: 1,
        };
        assert_eq!(
            serde_json::to_value(snapshot).unwrap(),
            json!({
                "success": { "all": 3, "conflicts": 1, "notsupported": 0, "skips": 2 },
                "failures": 1
            })
        );
    }
}
