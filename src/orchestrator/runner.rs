//! Multi-configuration runner: discovers configuration files, validates them
//! all, then runs each configuration as a fully isolated task with its own
//! clients, worker pool and log scope. A crash in one configuration is
//! contained and reported as that configuration's failure.

use super::{run_configuration_entry, ConfigSummary};
use crate::config::{load_config, Config};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Process exit codes.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const CONFIG_INVALID: i32 = 2;
    pub const FIELDS_FAILED: i32 = 3;
    pub const ENDPOINT_UNREACHABLE: i32 = 4;
}

/// Finds configuration files: every `*.yaml`/`*.yml` under a directory
/// (sorted for reproducible ordering), or the single given file.
pub fn discover_config_files(path: &Path) -> std::io::Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let entry_path = entry.path();
        if !entry_path.is_file() {
            continue;
        }
        match entry_path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => files.push(entry_path),
            _ => {}
        }
    }
    files.sort();
    Ok(files)
}

/// Loads and validates every discovered configuration. Invalid files are
/// logged; the result separates the valid ones from the count of failures.
fn load_all(files: &[PathBuf]) -> (Vec<(String, Config)>, usize) {
    let mut valid = Vec::new();
    let mut invalid = 0usize;

    for file in files {
        match load_config(file) {
            Ok((name, config)) => {
                info!(config = %name, path = %file.display(), "configuration valid");
                valid.push((name, config));
            }
            Err(e) => {
                error!(path = %file.display(), error = %e, "configuration invalid");
                invalid += 1;
            }
        }
    }

    (valid, invalid)
}

/// Runs every configuration under `config_path` and returns the process exit
/// code.
pub async fn run(config_path: &Path, validate_only: bool) -> i32 {
    let files = match discover_config_files(config_path) {
        Ok(files) if !files.is_empty() => files,
        Ok(_) => {
            error!(path = %config_path.display(), "no configuration files found");
            return exit_code::CONFIG_INVALID;
        }
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "cannot read configuration path");
            return exit_code::CONFIG_INVALID;
        }
    };

    info!(count = files.len(), path = %config_path.display(), "discovered configuration files");

    let (valid, invalid) = load_all(&files);
    if invalid > 0 {
        error!(invalid = invalid, "aborting: invalid configuration files");
        return exit_code::CONFIG_INVALID;
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);

    // Propagate ctrl-c as a cooperative cancellation; jobs drain their
    // current batch before stopping.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown signal received, draining in-flight work");
            let _ = cancel_tx.send(true);
        }
    });

    let mut set: JoinSet<ConfigSummary> = JoinSet::new();
    for (name, config) in valid {
        let cancel = cancel_rx.clone();
        let config = Arc::new(config);
        info!(config = %name, "starting configuration");
        set.spawn(run_configuration_entry(name, config, cancel, validate_only));
    }

    let mut summaries = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(summary) => {
                info!(
                    config = %summary.name,
                    failed_fields = summary.any_failed_fields,
                    unreachable = summary.unreachable,
                    "configuration finished"
                );
                summaries.push(summary);
            }
            Err(e) => {
                // Isolation boundary: a panicking configuration only fails
                // itself.
                error!(error = %e, "configuration task crashed");
                summaries.push(ConfigSummary {
                    name: "<crashed>".to_string(),
                    any_failed_fields: true,
                    unreachable: false,
                });
            }
        }
    }

    summarize(&summaries)
}

fn summarize(summaries: &[ConfigSummary]) -> i32 {
    let unreachable = summaries.iter().filter(|s| s.unreachable).count();
    let failed = summaries.iter().filter(|s| s.any_failed_fields).count();
    let clean = summaries.len() - summaries
        .iter()
        .filter(|s| s.unreachable || s.any_failed_fields)
        .count();

    info!(
        total = summaries.len(),
        clean = clean,
        failed = failed,
        unreachable = unreachable,
        "all configurations finished"
    );

    if unreachable > 0 {
        exit_code::ENDPOINT_UNREACHABLE
    } else if failed > 0 {
        exit_code::FIELDS_FAILED
    } else {
        exit_code::SUCCESS
    }
}
