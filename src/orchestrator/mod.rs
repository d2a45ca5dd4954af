//! Per-configuration orchestration: connect, discover, fan out field jobs,
//! report. One orchestrator instance owns everything for its configuration;
//! nothing is shared across configurations.

pub mod runner;
pub mod scheduler;

use crate::backup::{
    run_field_backup, JobContext, JobOutcome, JobStatus, Report, SkipReason, WorkerPool,
};
use crate::catalog::{build_catalog, CatalogError, FieldRef};
use crate::config::types::BackupMode;
use crate::config::{Config, ConfigError};
use crate::influx::{with_retry, Endpoint, InfluxClient, InfluxError, RetryPolicy};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("endpoint unreachable: {0}")]
    Unreachable(InfluxError),

    #[error("influx error: {0}")]
    Influx(#[from] InfluxError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

impl RunError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, RunError::Unreachable(_))
    }
}

fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn parse_rfc3339_ns(key: &str, value: &str) -> Result<i64, RunError> {
    let parsed: DateTime<Utc> = DateTime::parse_from_rfc3339(value)
        .map_err(|e| {
            RunError::Config(ConfigError::Validation(format!(
                "{}: invalid ISO-8601 timestamp '{}': {}",
                key, value, e
            )))
        })?
        .with_timezone(&Utc);
    Ok(parsed.timestamp_nanos_opt().unwrap_or(i64::MAX))
}

fn endpoint_from_source(config: &Config) -> Endpoint {
    Endpoint {
        url: config.source.url.clone(),
        user: config.source.user.clone(),
        password: config.source.password.clone(),
        verify_ssl: config.source.verify_ssl,
        timeout: config.timeout(),
    }
}

fn endpoint_from_destination(config: &Config) -> Endpoint {
    Endpoint {
        url: config.destination.url.clone(),
        user: config.destination.user.clone(),
        password: config.destination.password.clone(),
        verify_ssl: config.destination.verify_ssl,
        timeout: config.timeout(),
    }
}

/// Runs one backup pass for a configuration. With `dry_run` set, stops after
/// connectivity, database preparation and discovery (the `--validate-only`
/// path).
pub async fn run_configuration(
    name: &str,
    config: &Config,
    cancel: watch::Receiver<bool>,
    dry_run: bool,
) -> Result<Report, RunError> {
    let started = Instant::now();
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();
    let policy = RetryPolicy {
        retries: config.options.retries,
        delay: config.retry_delay(),
    };

    info!(config = %name, run_id = %run_id, mode = ?config.options.backup_mode, "backup run starting");

    let source = Arc::new(InfluxClient::new(&endpoint_from_source(config))?);
    let dest = Arc::new(InfluxClient::new(&endpoint_from_destination(config))?);

    let initial_delay = config.initial_connection_retry_delay();
    source
        .wait_until_ready(config.options.retries, initial_delay)
        .await
        .map_err(RunError::Unreachable)?;
    dest.wait_until_ready(config.options.retries, initial_delay)
        .await
        .map_err(RunError::Unreachable)?;
    info!(config = %name, "source and destination endpoints are up");

    // Resolve database pairs: configured list, or everything on the source
    // with prefix/suffix decoration.
    let mut attempts = 0u32;
    let pairs: Vec<(String, String)> = if config.source.databases.is_empty() {
        let all = with_retry(policy, &mut attempts, || source.list_databases()).await?;
        info!(config = %name, count = all.len(), "no databases configured, enumerated source");
        all.into_iter()
            .map(|db| {
                let dest_name = config.final_database_name(&db, "");
                (db, dest_name)
            })
            .collect()
    } else {
        config
            .source
            .databases
            .iter()
            .map(|pair| {
                let dest_name = config.final_database_name(&pair.name, &pair.destination);
                (pair.name.clone(), dest_name)
            })
            .collect()
    };

    for (source_db, dest_db) in &pairs {
        info!(config = %name, source_db = %source_db, dest_db = %dest_db, "preparing destination database");
        with_retry(policy, &mut attempts, || dest.ensure_database(dest_db)).await?;
    }

    // Job bounds: incremental runs copy up to a single "now" captured here;
    // range runs use the configured window.
    let (range_start_ns, job_end_ns) = match config.options.backup_mode {
        BackupMode::Incremental => (None, now_ns()),
        BackupMode::Range => {
            let range = config.options.range.as_ref().ok_or_else(|| {
                RunError::Config(ConfigError::Validation(
                    "range mode requires options.range".to_string(),
                ))
            })?;
            (
                Some(parse_rfc3339_ns("options.range.start_date", &range.start_date)?),
                parse_rfc3339_ns("options.range.end_date", &range.end_date)?,
            )
        }
    };

    let mut outcomes: Vec<JobOutcome> = Vec::new();
    let mut jobs: Vec<(FieldRef, _)> = Vec::new();
    let discovery_now = now_ns();

    for (source_db, dest_db) in &pairs {
        let catalog = build_catalog(&source, config, source_db, discovery_now, policy).await?;

        for field in catalog.obsolete {
            info!(config = %name, field = %field, "field skipped (obsolete)");
            outcomes.push(JobOutcome::skipped(field, SkipReason::Obsolete));
        }

        if dry_run {
            info!(
                config = %name,
                source_db = %source_db,
                fields = catalog.active.len(),
                "validate-only: discovery complete, not submitting jobs"
            );
            continue;
        }

        for field in catalog.active {
            let tags = catalog
                .tag_keys
                .get(&field.measurement)
                .cloned()
                .unwrap_or_default();
            let ctx = JobContext {
                config_name: name.to_string(),
                source: Arc::clone(&source),
                dest: Arc::clone(&dest),
                source_db: source_db.clone(),
                dest_db: dest_db.clone(),
                tags,
                group_by: config.group_by().map(String::from),
                mode: config.options.backup_mode,
                range_start_ns,
                job_end_ns,
                window_days: config.options.days_of_pagination,
                batch_size: config.options.batch_size,
                policy,
            };
            let job_field = field.clone();
            let job_cancel = cancel.clone();
            jobs.push((field, move |tag| {
                run_field_backup(job_field, ctx, tag, job_cancel)
            }));
        }
    }

    let pool = WorkerPool::new(config.options.parallel_workers);
    let config_name = name.to_string();
    let run = pool
        .execute(jobs, |outcome| log_outcome(&config_name, outcome))
        .await;
    outcomes.extend(run.outcomes);

    let report = Report {
        run_id,
        config_name: name.to_string(),
        started_at,
        wall_time: started.elapsed(),
        outcomes,
        metrics: run.metrics,
    };

    log_report(&report);
    Ok(report)
}

fn log_outcome(config: &str, outcome: &JobOutcome) {
    match &outcome.status {
        JobStatus::Success { partial } => info!(
            config = %config,
            field = %outcome.field,
            records = outcome.records_written,
            partial = partial,
            "field completed"
        ),
        JobStatus::Skipped { reason } => info!(
            config = %config,
            field = %outcome.field,
            reason = %reason,
            "field skipped"
        ),
        JobStatus::Failed { error } => error!(
            config = %config,
            field = %outcome.field,
            error = %error,
            "field failed"
        ),
    }
}

fn log_report(report: &Report) {
    info!(
        config = %report.config_name,
        run_id = %report.run_id,
        total = report.outcomes.len(),
        succeeded = report.succeeded(),
        skipped = report.skipped(),
        failed = report.failed(),
        records_written = report.records_written(),
        wall_s = report.wall_time.as_secs_f64(),
        efficiency_pct = format!("{:.1}", report.metrics.efficiency_pct).as_str(),
        "backup run finished"
    );
    if report.has_failures() {
        for outcome in report.outcomes.iter().filter(|o| o.is_failed()) {
            warn!(config = %report.config_name, field = %outcome.field, "failed field");
        }
    }
}

/// Summary of one configuration's whole lifetime in this process, used by the
/// multi-config runner to derive the exit code.
#[derive(Debug, Clone, Default)]
pub struct ConfigSummary {
    pub name: String,
    pub any_failed_fields: bool,
    pub unreachable: bool,
}

/// Entry point for one configuration: a single pass, or the scheduled loop in
/// incremental mode with a cron expression.
pub async fn run_configuration_entry(
    name: String,
    config: Arc<Config>,
    cancel: watch::Receiver<bool>,
    validate_only: bool,
) -> ConfigSummary {
    let mut summary = ConfigSummary {
        name: name.clone(),
        ..ConfigSummary::default()
    };

    if validate_only {
        match run_configuration(&name, &config, cancel, true).await {
            Ok(_) => {}
            Err(e) => {
                error!(config = %name, error = %e, "validation run failed");
                summary.unreachable = e.is_unreachable();
                summary.any_failed_fields = !e.is_unreachable();
            }
        }
        return summary;
    }

    let schedule = match config.options.backup_mode {
        BackupMode::Incremental => config.schedule().map(String::from),
        BackupMode::Range => None,
    };

    match schedule {
        None => {
            match run_configuration(&name, &config, cancel, false).await {
                Ok(report) => summary.any_failed_fields = report.has_failures(),
                Err(e) => {
                    error!(config = %name, error = %e, "backup run failed");
                    summary.unreachable = e.is_unreachable();
                    summary.any_failed_fields = !e.is_unreachable();
                }
            }
            summary
        }
        Some(expr) => {
            // Validated at load time; a parse failure here is a logic error
            // worth failing the configuration over, not panicking.
            let parsed = match scheduler::parse_schedule(&expr) {
                Ok(parsed) => parsed,
                Err(e) => {
                    error!(config = %name, error = %e, "invalid schedule");
                    summary.any_failed_fields = true;
                    return summary;
                }
            };

            info!(config = %name, schedule = %expr, "entering scheduled incremental mode");

            let failed = Arc::new(std::sync::atomic::AtomicBool::new(false));
            let unreachable = Arc::new(std::sync::atomic::AtomicBool::new(false));

            let spawn_run = {
                let name = name.clone();
                let config = Arc::clone(&config);
                let cancel = cancel.clone();
                let failed = Arc::clone(&failed);
                let unreachable = Arc::clone(&unreachable);
                move || {
                    let name = name.clone();
                    let config = Arc::clone(&config);
                    let cancel = cancel.clone();
                    let failed = Arc::clone(&failed);
                    let unreachable = Arc::clone(&unreachable);
                    tokio::spawn(async move {
                        match run_configuration(&name, &config, cancel, false).await {
                            Ok(report) => {
                                if report.has_failures() {
                                    failed.store(true, std::sync::atomic::Ordering::SeqCst);
                                }
                            }
                            Err(e) => {
                                error!(config = %name, error = %e, "scheduled backup run failed");
                                if e.is_unreachable() {
                                    unreachable.store(true, std::sync::atomic::Ordering::SeqCst);
                                } else {
                                    failed.store(true, std::sync::atomic::Ordering::SeqCst);
                                }
                            }
                        }
                    })
                }
            };

            scheduler::run_on_schedule(&parsed, cancel, spawn_run).await;

            summary.any_failed_fields = failed.load(std::sync::atomic::Ordering::SeqCst);
            summary.unreachable = unreachable.load(std::sync::atomic::Ordering::SeqCst);
            summary
        }
    }
}
