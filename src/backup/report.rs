use crate::catalog::FieldRef;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// Why a field produced no writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The destination watermark is already at or past the job end.
    NoNewData,
    /// Last source write is older than `field_obsolete_threshold`.
    Obsolete,
    /// The source has never written this field.
    NoSourceData,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NoNewData => write!(f, "no new data"),
            SkipReason::Obsolete => write!(f, "obsolete"),
            SkipReason::NoSourceData => write!(f, "no source data"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    /// All windows drained, or a cancellation drained cleanly mid-run
    /// (`partial` set).
    Success { partial: bool },
    Skipped { reason: SkipReason },
    Failed { error: String },
}

/// Terminal record of one field's backup job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub field: FieldRef,
    pub status: JobStatus,
    pub records_read: u64,
    pub records_written: u64,
    pub attempts: u32,
    pub duration: Duration,
}

impl JobOutcome {
    pub fn skipped(field: FieldRef, reason: SkipReason) -> Self {
        JobOutcome {
            field,
            status: JobStatus::Skipped { reason },
            records_read: 0,
            records_written: 0,
            attempts: 0,
            duration: Duration::ZERO,
        }
    }

    pub fn failed(field: FieldRef, error: String) -> Self {
        JobOutcome {
            field,
            status: JobStatus::Failed { error },
            records_read: 0,
            records_written: 0,
            attempts: 0,
            duration: Duration::ZERO,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, JobStatus::Failed { .. })
    }
}

/// Concurrency metrics of one pool run.
#[derive(Debug, Clone, Default)]
pub struct PoolMetrics {
    pub workers: usize,
    pub workers_used: usize,
    pub jobs: usize,
    pub avg_job_wall: Duration,
    pub efficiency_pct: f64,
}

/// `(Σ per-job wall) / (aggregate wall × workers)`, as a percentage.
pub fn parallel_efficiency(job_walls: &[Duration], aggregate_wall: Duration, workers: usize) -> f64 {
    if job_walls.is_empty() || workers == 0 || aggregate_wall.is_zero() {
        return 0.0;
    }
    let total: f64 = job_walls.iter().map(Duration::as_secs_f64).sum();
    total / (aggregate_wall.as_secs_f64() * workers as f64) * 100.0
}

/// Final summary of one configuration run.
#[derive(Debug, Clone)]
pub struct Report {
    pub run_id: Uuid,
    pub config_name: String,
    pub started_at: DateTime<Utc>,
    pub wall_time: Duration,
    pub outcomes: Vec<JobOutcome>,
    pub metrics: PoolMetrics,
}

impl Report {
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, JobStatus::Success { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, JobStatus::Skipped { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failed()).count()
    }

    pub fn records_written(&self) -> u64 {
        self.outcomes.iter().map(|o| o.records_written).sum()
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::FieldType;

    fn field(name: &str) -> FieldRef {
        FieldRef {
            database: "db".to_string(),
            measurement: "weather".to_string(),
            field: name.to_string(),
            field_type: FieldType::Numeric,
        }
    }

    fn success(name: &str, written: u64) -> JobOutcome {
        JobOutcome {
            field: field(name),
            status: JobStatus::Success { partial: false },
            records_read: written,
            records_written: written,
            attempts: 1,
            duration: Duration::from_secs(1),
        }
    }

    fn report(outcomes: Vec<JobOutcome>) -> Report {
        Report {
            run_id: Uuid::new_v4(),
            config_name: "test".to_string(),
            started_at: Utc::now(),
            wall_time: Duration::from_secs(2),
            outcomes,
            metrics: PoolMetrics::default(),
        }
    }

    #[test]
    fn report_counts() {
        let r = report(vec![
            success("a", 100),
            success("b", 50),
            JobOutcome::skipped(field("c"), SkipReason::Obsolete),
            JobOutcome::failed(field("d"), "schema conflict".to_string()),
        ]);
        assert_eq!(r.succeeded(), 2);
        assert_eq!(r.skipped(), 1);
        assert_eq!(r.failed(), 1);
        assert_eq!(r.records_written(), 150);
        assert!(r.has_failures());
    }

    #[test]
    fn efficiency_perfect_parallelism() {
        // Four jobs of 1s on 4 workers finishing in 1s aggregate: 100%.
        let walls = vec![Duration::from_secs(1); 4];
        let pct = parallel_efficiency(&walls, Duration::from_secs(1), 4);
        assert!((pct - 100.0).abs() < 1e-9);
    }

    #[test]
    fn efficiency_serial_execution() {
        // One worker effectively used out of four: 25%.
        let walls = vec![Duration::from_secs(1); 4];
        let pct = parallel_efficiency(&walls, Duration::from_secs(4), 4);
        assert!((pct - 25.0).abs() < 1e-9);
    }

    #[test]
    fn efficiency_degenerate_inputs() {
        assert_eq!(parallel_efficiency(&[], Duration::from_secs(1), 4), 0.0);
        assert_eq!(
            parallel_efficiency(&[Duration::from_secs(1)], Duration::ZERO, 4),
            0.0
        );
    }
}
