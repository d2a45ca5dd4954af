//! Cron scheduling for incremental mode, with overlap rejection: this task
//! is the only owner of the "is a run in flight" state, and a tick that fires
//! while the previous run is still going is skipped with a warning. Two
//! concurrent ticks would mean two workers on the same field, which the
//! design forbids.

use chrono::Utc;
use cron::Schedule;
use std::str::FromStr;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Parses a cron expression. Standard five-field expressions are accepted and
/// normalized by prepending a seconds field of `0`, since the `cron` crate
/// expects six or seven fields.
pub fn parse_schedule(expr: &str) -> Result<Schedule, String> {
    let expr = expr.trim();
    let fields = expr.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| e.to_string())
}

/// Runs `spawn_run` on every schedule fire until cancelled. Ticks that find
/// the previous run unfinished are skipped. The in-flight run is awaited
/// before returning so shutdown drains rather than drops.
pub async fn run_on_schedule<F>(
    schedule: &Schedule,
    mut cancel: watch::Receiver<bool>,
    mut spawn_run: F,
) where
    F: FnMut() -> JoinHandle<()>,
{
    let mut current: Option<JoinHandle<()>> = None;

    loop {
        let now = Utc::now();
        let Some(next) = schedule.after(&now).next() else {
            info!("schedule has no future fire times, stopping scheduler");
            break;
        };
        let delay = (next - now).to_std().unwrap_or_default();

        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                let running = current.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
                if running {
                    warn!(tick = %next, "previous backup still running, skipping this tick");
                    continue;
                }
                info!(tick = %next, "schedule fired, starting backup run");
                current = Some(spawn_run());
            }
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
        }
    }

    if let Some(handle) = current {
        if !handle.is_finished() {
            info!("waiting for in-flight backup run to drain");
        }
        let _ = handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn five_field_expression_normalized() {
        let schedule = parse_schedule("* * * * *").unwrap();
        let now = Utc::now();
        let next = schedule.after(&now).next().unwrap();
        assert!(next > now);
        // Fires at most a minute out.
        assert!((next - now).num_seconds() <= 60);
    }

    #[test]
    fn six_field_expression_accepted_as_is() {
        assert!(parse_schedule("*/5 * * * * *").is_ok());
    }

    #[test]
    fn daily_expression_accepted() {
        assert!(parse_schedule("0 3 * * *").is_ok());
        assert!(parse_schedule("30 2 * * *").is_ok());
    }

    #[test]
    fn garbage_expression_rejected() {
        assert!(parse_schedule("not a cron").is_err());
        assert!(parse_schedule("").is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn overlapping_ticks_are_skipped() {
        // Every-second schedule with a run that takes 1.5s: within a 3.4s
        // observation window the middle tick always finds the previous run
        // still active and is skipped.
        let schedule = parse_schedule("* * * * * *").unwrap();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let started = Arc::new(AtomicUsize::new(0));

        let started_clone = Arc::clone(&started);
        let scheduler = tokio::spawn(async move {
            run_on_schedule(&schedule, cancel_rx, move || {
                let started = Arc::clone(&started_clone);
                tokio::spawn(async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1500)).await;
                })
            })
            .await;
        });

        tokio::time::sleep(Duration::from_millis(3400)).await;
        let _ = cancel_tx.send(true);
        scheduler.await.unwrap();

        // Three or four ticks fired; every other one was rejected.
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancel_stops_scheduler_and_drains() {
        let schedule = parse_schedule("* * * * * *").unwrap();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let started_clone = Arc::clone(&started);
        let finished_clone = Arc::clone(&finished);
        let scheduler = tokio::spawn(async move {
            run_on_schedule(&schedule, cancel_rx, move || {
                started_clone.fetch_add(1, Ordering::SeqCst);
                let finished = Arc::clone(&finished_clone);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                })
            })
            .await;
        });

        // Let at least one tick fire, then cancel while a run may be in
        // flight.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let _ = cancel_tx.send(true);
        scheduler.await.unwrap();

        // Every started run was awaited to completion, not dropped.
        assert!(started.load(Ordering::SeqCst) >= 1);
        assert_eq!(started.load(Ordering::SeqCst), finished.load(Ordering::SeqCst));
    }
}
