//! Per-field resume derivation. The watermark is never stored by this
//! process: it is re-derived from the destination at the start of every job,
//! which is what makes crash recovery and re-runs safe without any local
//! state.

use crate::catalog::FieldRef;
use crate::config::types::BackupMode;
use crate::influx::{with_retry, InfluxClient, InfluxError, RetryPolicy};

/// Where a job starts reading.
///
/// `After` comes from a destination watermark and renders as an exclusive
/// `time >` bound — deliberately not `last + 1ns` arithmetic, which would
/// have an overflow edge at the top of the timestamp range. `From` is an
/// inclusive `time >=` bound used when there is no watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePoint {
    After(i64),
    From(i64),
}

impl ResumePoint {
    /// The window-generation origin. For `After(t)` the first window starts
    /// at `t` but queries it exclusively, so the row at `t` itself is never
    /// re-read.
    pub fn start_ns(&self) -> i64 {
        match self {
            ResumePoint::After(t) | ResumePoint::From(t) => *t,
        }
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self, ResumePoint::After(_))
    }
}

/// Outcome of resume derivation: a starting point, or nothing to do because
/// the source has no data for this field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Resume(ResumePoint),
    NoSourceData,
}

/// Derives the resume point for one field.
///
/// The destination lookup is scoped to the field itself (`IS NOT NULL`), so
/// concurrent writers of sibling fields, even at identical timestamps,
/// cannot advance this field's watermark. Each job derives its own point;
/// there is no shared watermark object anywhere in the process.
pub async fn resolve_resume(
    source: &InfluxClient,
    dest: &InfluxClient,
    dest_db: &str,
    field: &FieldRef,
    mode: BackupMode,
    range_start_ns: Option<i64>,
    policy: RetryPolicy,
    attempts: &mut u32,
) -> Result<Resolution, InfluxError> {
    let last = with_retry(policy, attempts, || {
        dest.last_field_write_time(dest_db, &field.measurement, &field.field)
    })
    .await?;

    if let Some(last) = last {
        return Ok(Resolution::Resume(ResumePoint::After(last)));
    }

    match mode {
        BackupMode::Range => {
            // Validated at load time; a missing range here means the job was
            // constructed inconsistently.
            let start = range_start_ns.ok_or_else(|| {
                InfluxError::Response("range mode without a range start".to_string())
            })?;
            Ok(Resolution::Resume(ResumePoint::From(start)))
        }
        BackupMode::Incremental => {
            let first = with_retry(policy, attempts, || {
                source.first_field_write_time(&field.database, &field.measurement, &field.field)
            })
            .await?;
            match first {
                Some(first) => Ok(Resolution::Resume(ResumePoint::From(first))),
                None => Ok(Resolution::NoSourceData),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn after_is_exclusive_from_is_inclusive() {
        assert!(ResumePoint::After(10).is_exclusive());
        assert!(!ResumePoint::From(10).is_exclusive());
        assert_eq!(ResumePoint::After(10).start_ns(), 10);
        assert_eq!(ResumePoint::From(10).start_ns(), 10);
    }

    #[test]
    fn exclusive_bound_has_no_overflow_edge() {
        // The old `last + 1ns` scheme would wrap here; the exclusive bound
        // simply yields an empty job.
        let resume = ResumePoint::After(i64::MAX);
        assert_eq!(resume.start_ns(), i64::MAX);
        assert!(resume.start_ns() >= i64::MAX); // job_start >= job_end => skipped
    }
}
