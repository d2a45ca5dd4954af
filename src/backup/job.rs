//! The per-field backup job: resolve the resume point, walk time windows,
//! stream the field from the source and write it to the destination in
//! batches.

use super::pool::WorkerTag;
use super::report::{JobOutcome, JobStatus, SkipReason};
use super::watermark::{resolve_resume, Resolution};
use super::windows::{TimeWindow, WindowIter};
use crate::catalog::FieldRef;
use crate::config::types::BackupMode;
use crate::influx::line_protocol::{encode_batch, Point};
use crate::influx::{with_retry, InfluxClient, InfluxError, RetryPolicy};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Everything a job needs besides its field: clients, database pair, window
/// and batch geometry, retry policy. Cheap to clone per field.
#[derive(Clone)]
pub struct JobContext {
    /// Configuration name, carried into every log record for correlation.
    pub config_name: String,
    pub source: Arc<InfluxClient>,
    pub dest: Arc<InfluxClient>,
    pub source_db: String,
    pub dest_db: String,
    pub tags: Vec<String>,
    pub group_by: Option<String>,
    pub mode: BackupMode,
    pub range_start_ns: Option<i64>,
    /// Upper bound of the whole job: `now` in incremental mode, the range end
    /// in range mode.
    pub job_end_ns: i64,
    pub window_days: u32,
    pub batch_size: usize,
    pub policy: RetryPolicy,
}

#[derive(Debug, Default)]
struct WindowStats {
    read: u64,
    written: u64,
    attempts: u32,
    cancelled: bool,
}

/// Runs the backup of one field to completion and folds every error into the
/// returned outcome; other fields are never affected by this one's failure.
pub async fn run_field_backup(
    field: FieldRef,
    ctx: JobContext,
    worker: WorkerTag,
    cancel: watch::Receiver<bool>,
) -> JobOutcome {
    let started = Instant::now();
    let mut attempts = 0u32;

    info!(
        config = %ctx.config_name,
        worker = %worker,
        measurement = %field.measurement,
        field = %field.field,
        field_type = %field.field_type,
        "field backup started"
    );

    let resolution = match resolve_resume(
        &ctx.source,
        &ctx.dest,
        &ctx.dest_db,
        &field,
        ctx.mode,
        ctx.range_start_ns,
        ctx.policy,
        &mut attempts,
    )
    .await
    {
        Ok(resolution) => resolution,
        Err(e) => {
            error!(
                config = %ctx.config_name,
                worker = %worker,
                measurement = %field.measurement,
                field = %field.field,
                error = %e,
                "failed to resolve resume point"
            );
            return outcome(field, JobStatus::Failed { error: e.to_string() }, 0, 0, attempts, started);
        }
    };

    let resume = match resolution {
        Resolution::Resume(resume) => resume,
        Resolution::NoSourceData => {
            info!(
                config = %ctx.config_name,
                worker = %worker,
                measurement = %field.measurement,
                field = %field.field,
                "source has no data for this field, skipping"
            );
            return outcome(
                field,
                JobStatus::Skipped { reason: SkipReason::NoSourceData },
                0,
                0,
                attempts,
                started,
            );
        }
    };

    let job_start = resume.start_ns();
    if job_start >= ctx.job_end_ns {
        info!(
            config = %ctx.config_name,
            worker = %worker,
            measurement = %field.measurement,
            field = %field.field,
            "no new data, skipping"
        );
        return outcome(
            field,
            JobStatus::Skipped { reason: SkipReason::NoNewData },
            0,
            0,
            attempts,
            started,
        );
    }

    debug!(
        config = %ctx.config_name,
        worker = %worker,
        measurement = %field.measurement,
        field = %field.field,
        start_ns = job_start,
        end_ns = ctx.job_end_ns,
        exclusive = resume.is_exclusive(),
        "resume point resolved"
    );

    let mut records_read = 0u64;
    let mut records_written = 0u64;
    let mut partial = false;
    let mut first_window = true;

    for window in WindowIter::days(job_start, ctx.job_end_ns, ctx.window_days) {
        if *cancel.borrow() {
            partial = true;
            break;
        }

        let lower_exclusive = first_window && resume.is_exclusive();
        first_window = false;

        debug!(
            config = %ctx.config_name,
            worker = %worker,
            measurement = %field.measurement,
            field = %field.field,
            window_start = window.start_ns,
            window_end = window.end_ns,
            "processing window"
        );

        let result = with_retry(ctx.policy, &mut attempts, || {
            process_window(&ctx, &field, window, lower_exclusive, cancel.clone())
        })
        .await;

        match result {
            Ok(stats) => {
                records_read += stats.read;
                records_written += stats.written;
                attempts += stats.attempts;
                if stats.cancelled {
                    partial = true;
                    break;
                }
            }
            Err(e) => {
                error!(
                    config = %ctx.config_name,
                    worker = %worker,
                    measurement = %field.measurement,
                    field = %field.field,
                    window_start = window.start_ns,
                    window_end = window.end_ns,
                    error = %e,
                    "window failed, field backup aborted"
                );
                return outcome(
                    field,
                    JobStatus::Failed { error: e.to_string() },
                    records_read,
                    records_written,
                    attempts,
                    started,
                );
            }
        }
    }

    info!(
        config = %ctx.config_name,
        worker = %worker,
        measurement = %field.measurement,
        field = %field.field,
        records_read = records_read,
        records_written = records_written,
        partial = partial,
        duration_s = started.elapsed().as_secs_f64(),
        "field backup complete"
    );

    outcome(
        field,
        JobStatus::Success { partial },
        records_read,
        records_written,
        attempts,
        started,
    )
}

/// Streams one window from the source and writes it to the destination in
/// batches. Re-running this after a mid-window failure is safe: re-written
/// points land on identical `(timestamp, tag set)` keys.
///
/// A cancellation observed mid-window flushes the accumulated batch before
/// returning (drain, not drop), so the next run's derived watermark reflects
/// everything actually written.
async fn process_window(
    ctx: &JobContext,
    field: &FieldRef,
    window: TimeWindow,
    lower_exclusive: bool,
    cancel: watch::Receiver<bool>,
) -> Result<WindowStats, InfluxError> {
    let mut stream = ctx
        .source
        .query_field_window(
            &ctx.source_db,
            &field.measurement,
            &field.field,
            &ctx.tags,
            window.start_ns,
            lower_exclusive,
            window.end_ns,
            ctx.group_by.as_deref(),
        )
        .await?;

    let mut stats = WindowStats::default();
    let mut batch: Vec<Point> = Vec::with_capacity(ctx.batch_size);

    while let Some(points) = stream.next_batch().await? {
        for point in points {
            stats.read += 1;
            batch.push(point);
            if batch.len() >= ctx.batch_size {
                flush(ctx, field, &mut batch, &mut stats).await?;
            }
        }

        if *cancel.borrow() {
            stats.cancelled = true;
            break;
        }
    }

    flush(ctx, field, &mut batch, &mut stats).await?;
    Ok(stats)
}

async fn flush(
    ctx: &JobContext,
    field: &FieldRef,
    batch: &mut Vec<Point>,
    stats: &mut WindowStats,
) -> Result<(), InfluxError> {
    if batch.is_empty() {
        return Ok(());
    }

    let body = encode_batch(&field.measurement, batch);
    with_retry(ctx.policy, &mut stats.attempts, || {
        ctx.dest.write_line_protocol(&ctx.dest_db, body.clone())
    })
    .await?;

    stats.written += batch.len() as u64;
    debug!(
        measurement = %field.measurement,
        field = %field.field,
        count = batch.len(),
        "batch written"
    );
    batch.clear();
    Ok(())
}

fn outcome(
    field: FieldRef,
    status: JobStatus,
    records_read: u64,
    records_written: u64,
    attempts: u32,
    started: Instant,
) -> JobOutcome {
    JobOutcome {
        field,
        status,
        records_read,
        records_written,
        attempts,
        duration: started.elapsed(),
    }
}
