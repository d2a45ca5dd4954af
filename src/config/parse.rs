use super::types::*;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

/// Loads and validates a single backup configuration file.
///
/// The returned name is the file stem and identifies the configuration in
/// every log record and report.
pub fn load_config(path: &Path) -> Result<(String, Config), ConfigError> {
    let yaml = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    let config: Config = serde_yaml::from_str(&yaml)?;

    validate_config(&config)?;

    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    Ok((name, config))
}

/// Validates a configuration, collecting every problem before failing so the
/// operator sees the full list at once.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    validate_url("source.url", &config.source.url, &mut errors);
    validate_url("destination.url", &config.destination.url, &mut errors);

    for (i, pair) in config.source.databases.iter().enumerate() {
        let prefix = format!("source.databases[{}]", i);
        if !valid_database_name(&pair.name) {
            errors.push(format!("{}: invalid database name '{}'", prefix, pair.name));
        }
        if !pair.destination.is_empty() && !valid_database_name(&pair.destination) {
            errors.push(format!(
                "{}: invalid destination database name '{}'",
                prefix, pair.destination
            ));
        }
    }

    if !config.measurements.include.is_empty() && !config.measurements.exclude.is_empty() {
        errors.push(
            "measurements: include and exclude lists cannot both be set".to_string(),
        );
    }

    for (name, spec) in &config.measurements.specific {
        if !valid_measurement_name(name) {
            errors.push(format!("measurements.specific: invalid measurement name '{}'", name));
        }
        let include: HashSet<&String> = spec.fields.include.iter().collect();
        let overlap: Vec<&str> = spec
            .fields
            .exclude
            .iter()
            .filter(|f| include.contains(f))
            .map(|f| f.as_str())
            .collect();
        if !overlap.is_empty() {
            errors.push(format!(
                "measurements.specific.{}: fields listed in both include and exclude: {}",
                name,
                overlap.join(", ")
            ));
        }
        if spec.fields.types.is_empty() {
            errors.push(format!(
                "measurements.specific.{}: fields.types must not be empty",
                name
            ));
        }
    }

    validate_options(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_options(config: &Config, errors: &mut Vec<String>) {
    let options = &config.options;

    if options.timeout_client == 0 {
        errors.push("options.timeout_client must be greater than zero".to_string());
    }
    if options.days_of_pagination == 0 {
        errors.push("options.days_of_pagination must be greater than zero".to_string());
    }
    if options.parallel_workers == 0 {
        errors.push("options.parallel_workers must be greater than zero".to_string());
    }
    if options.batch_size == 0 {
        errors.push("options.batch_size must be greater than zero".to_string());
    }
    if options.retry_delay < 0.0 {
        errors.push("options.retry_delay must not be negative".to_string());
    }
    if options.initial_connection_retry_delay < 0.0 {
        errors.push("options.initial_connection_retry_delay must not be negative".to_string());
    }

    match options.backup_mode {
        BackupMode::Range => match &options.range {
            None => {
                errors.push(
                    "options.range is required when backup_mode is 'range'".to_string(),
                );
            }
            Some(range) => {
                let start = parse_iso_date("options.range.start_date", &range.start_date, errors);
                let end = parse_iso_date("options.range.end_date", &range.end_date, errors);
                if let (Some(start), Some(end)) = (start, end) {
                    if start >= end {
                        errors.push(
                            "options.range: start_date must be before end_date".to_string(),
                        );
                    }
                }
            }
        },
        BackupMode::Incremental => {
            if let Some(expr) = config.schedule() {
                if let Err(e) = crate::orchestrator::scheduler::parse_schedule(expr) {
                    errors.push(format!(
                        "options.incremental.schedule: invalid cron expression '{}': {}",
                        expr, e
                    ));
                }
            }
        }
    }

    if let Err(e) = config.obsolete_threshold() {
        errors.push(format!("options.field_obsolete_threshold: {}", e));
    }
}

fn parse_iso_date(key: &str, value: &str, errors: &mut Vec<String>) -> Option<DateTime<Utc>> {
    if value.is_empty() {
        errors.push(format!("{} must be set", key));
        return None;
    }
    match DateTime::parse_from_rfc3339(value) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(e) => {
            errors.push(format!("{}: invalid ISO-8601 timestamp '{}': {}", key, value, e));
            None
        }
    }
}

fn validate_url(key: &str, url: &str, errors: &mut Vec<String>) {
    match reqwest::Url::parse(url) {
        Ok(parsed) => {
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                errors.push(format!("{}: unsupported URL scheme '{}'", key, parsed.scheme()));
            }
            if parsed.host_str().is_none() {
                errors.push(format!("{}: URL has no host: '{}'", key, url));
            }
        }
        Err(e) => {
            errors.push(format!("{}: invalid URL '{}': {}", key, url, e));
        }
    }
}

fn valid_database_name(name: &str) -> bool {
    // _internal and friends are reserved.
    if name.is_empty() || name.starts_with('_') {
        return false;
    }
    ident_regex().is_match(name)
}

fn valid_measurement_name(name: &str) -> bool {
    !name.is_empty() && ident_regex().is_match(name)
}

fn ident_regex() -> Regex {
    // The unwrap is safe for a literal pattern.
    Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_.-]*$").unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<(), ConfigError> {
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        validate_config(&config)
    }

    #[test]
    fn valid_incremental_config_passes() {
        let yaml = r#"
source:
  url: http://source:8086
  databases:
    - name: telemetry
      destination: telemetry_copy
destination:
  url: http://dest:8086
options:
  backup_mode: incremental
  incremental:
    schedule: "0 3 * * *"
"#;
        assert!(parse(yaml).is_ok());
    }

    #[test]
    fn range_mode_requires_coherent_dates() {
        let yaml = r#"
source:
  url: http://source:8086
destination:
  url: http://dest:8086
options:
  backup_mode: range
  range:
    start_date: "2023-12-31T00:00:00Z"
    end_date: "2023-01-01T00:00:00Z"
"#;
        let err = parse(yaml).unwrap_err();
        assert!(err.to_string().contains("start_date must be before end_date"));
    }

    #[test]
    fn range_mode_without_range_fails() {
        let yaml = r#"
source:
  url: http://source:8086
destination:
  url: http://dest:8086
options:
  backup_mode: range
"#;
        assert!(parse(yaml).is_err());
    }

    #[test]
    fn bad_cron_expression_rejected() {
        let yaml = r#"
source:
  url: http://source:8086
destination:
  url: http://dest:8086
options:
  backup_mode: incremental
  incremental:
    schedule: "not a cron"
"#;
        let err = parse(yaml).unwrap_err();
        assert!(err.to_string().contains("invalid cron expression"));
    }

    #[test]
    fn collects_multiple_errors() {
        let yaml = r#"
source:
  url: "not a url"
  databases:
    - name: _internal
destination:
  url: http://dest:8086
options:
  backup_mode: incremental
  timeout_client: 0
  field_obsolete_threshold: "7q"
"#;
        match parse(yaml) {
            Err(ConfigError::ValidationList(errors)) => {
                assert!(errors.len() >= 3, "expected several errors, got: {:?}", errors);
            }
            other => panic!("expected ValidationList, got {:?}", other.err()),
        }
    }

    #[test]
    fn include_exclude_overlap_rejected() {
        let yaml = r#"
source:
  url: http://source:8086
destination:
  url: http://dest:8086
measurements:
  specific:
    weather:
      fields:
        include: [temperature]
        exclude: [temperature, humidity]
options:
  backup_mode: incremental
"#;
        let err = parse(yaml).unwrap_err();
        assert!(err.to_string().contains("both include and exclude"));
    }
}
