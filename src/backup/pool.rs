//! Bounded worker pool for field backup jobs.
//!
//! Jobs are plain futures producing a [`JobOutcome`], so the pool is
//! independent of HTTP and testable with synthetic work. Concurrency is
//! bounded by a semaphore; outcomes are delivered as they complete.

use super::report::{JobOutcome, PoolMetrics};
use crate::backup::report::parallel_efficiency;
use crate::catalog::FieldRef;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Stable short identifier of a pool slot (`T01`..`Tn`), attached to every
/// log record a job emits for correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerTag(pub usize);

impl std::fmt::Display for WorkerTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T{:02}", self.0)
    }
}

pub struct WorkerPool {
    workers: usize,
}

pub struct PoolRun {
    pub outcomes: Vec<JobOutcome>,
    pub metrics: PoolMetrics,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Runs every job, at most `workers` concurrently, invoking `on_outcome`
    /// for each as it finishes. A panicking job is contained and reported as
    /// a failed outcome for its field.
    pub async fn execute<J, Fut>(
        &self,
        jobs: Vec<(FieldRef, J)>,
        mut on_outcome: impl FnMut(&JobOutcome),
    ) -> PoolRun
    where
        J: FnOnce(WorkerTag) -> Fut + Send + 'static,
        Fut: Future<Output = JobOutcome> + Send + 'static,
    {
        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.workers));
        // Free slot tags; a job takes one for its lifetime and returns it.
        let tags: Arc<Mutex<Vec<usize>>> =
            Arc::new(Mutex::new((1..=self.workers).rev().collect()));

        let mut set: JoinSet<(JobOutcome, Duration, usize)> = JoinSet::new();
        let mut fields_by_task: HashMap<tokio::task::Id, FieldRef> = HashMap::new();

        for (field, job) in jobs {
            let semaphore = Arc::clone(&semaphore);
            let tags = Arc::clone(&tags);
            let handle = set.spawn(async move {
                // The semaphore is never closed, so acquire cannot fail in
                // practice; running unthrottled is the safe fallback.
                let _permit = semaphore.acquire_owned().await.ok();
                let tag = tags.lock().ok().and_then(|mut t| t.pop()).unwrap_or(0);
                let start = Instant::now();
                let outcome = job(WorkerTag(tag)).await;
                let wall = start.elapsed();
                if let Ok(mut t) = tags.lock() {
                    t.push(tag);
                }
                (outcome, wall, tag)
            });
            fields_by_task.insert(handle.id(), field);
        }

        let mut outcomes = Vec::new();
        let mut walls = Vec::new();
        let mut used: HashSet<usize> = HashSet::new();

        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((_, (outcome, wall, tag))) => {
                    used.insert(tag);
                    walls.push(wall);
                    on_outcome(&outcome);
                    outcomes.push(outcome);
                }
                Err(join_err) => {
                    let field = fields_by_task
                        .get(&join_err.id())
                        .cloned()
                        .unwrap_or_else(|| FieldRef {
                            database: String::new(),
                            measurement: String::new(),
                            field: String::new(),
                            field_type: crate::config::types::FieldType::Numeric,
                        });
                    error!(field = %field, error = %join_err, "backup job panicked");
                    let outcome = JobOutcome::failed(field, format!("job panicked: {}", join_err));
                    on_outcome(&outcome);
                    outcomes.push(outcome);
                }
            }
        }

        let aggregate = started.elapsed();
        let metrics = PoolMetrics {
            workers: self.workers,
            workers_used: used.len(),
            jobs: outcomes.len(),
            avg_job_wall: if walls.is_empty() {
                Duration::ZERO
            } else {
                walls.iter().sum::<Duration>() / walls.len() as u32
            },
            efficiency_pct: parallel_efficiency(&walls, aggregate, self.workers),
        };

        info!(
            workers_used = metrics.workers_used,
            workers = metrics.workers,
            jobs = metrics.jobs,
            avg_job_wall_s = metrics.avg_job_wall.as_secs_f64(),
            efficiency_pct = format!("{:.1}", metrics.efficiency_pct).as_str(),
            "pool run complete"
        );
        if metrics.jobs > 0 && metrics.efficiency_pct < 50.0 {
            warn!(
                efficiency_pct = format!("{:.1}", metrics.efficiency_pct).as_str(),
                "parallel efficiency below 50%"
            );
        }

        PoolRun { outcomes, metrics }
    }
}
