use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    #[serde(default)]
    pub measurements: MeasurementsConfig,
    pub options: OptionsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub url: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Database pairs to copy. Empty means "enumerate every database on the
    /// source" with `prefix`/`suffix` applied to derive destination names.
    #[serde(default)]
    pub databases: Vec<DatabasePair>,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    /// Raw grouping clause appended to read queries (e.g. `time(30s)`).
    /// Empty means none.
    #[serde(default)]
    pub group_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub url: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabasePair {
    pub name: String,
    /// Destination database name. Empty means "same as source", still subject
    /// to `prefix`/`suffix` decoration.
    #[serde(default)]
    pub destination: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeasurementsConfig {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub specific: HashMap<String, MeasurementSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementSpec {
    pub fields: FieldFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldFilter {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default = "FieldType::all")]
    pub types: Vec<FieldType>,
}

impl Default for FieldFilter {
    fn default() -> Self {
        FieldFilter {
            include: Vec::new(),
            exclude: Vec::new(),
            types: FieldType::all(),
        }
    }
}

/// Field type as reported by `SHOW FIELD KEYS`, with float and integer
/// collapsed into a single numeric kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Numeric,
    #[serde(rename = "string")]
    Text,
    Boolean,
}

impl FieldType {
    pub fn all() -> Vec<FieldType> {
        vec![FieldType::Numeric, FieldType::Text, FieldType::Boolean]
    }

    /// Maps an InfluxDB field type name onto the collapsed kind. Unknown
    /// names fall back to `Text`.
    pub fn from_influx(name: &str) -> FieldType {
        match name {
            "float" | "integer" => FieldType::Numeric,
            "boolean" => FieldType::Boolean,
            _ => FieldType::Text,
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::Numeric => write!(f, "numeric"),
            FieldType::Text => write!(f, "string"),
            FieldType::Boolean => write!(f, "boolean"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionsConfig {
    pub backup_mode: BackupMode,
    #[serde(default)]
    pub range: Option<RangeConfig>,
    #[serde(default)]
    pub incremental: Option<IncrementalConfig>,
    #[serde(default = "default_timeout_client")]
    pub timeout_client: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
    #[serde(default = "default_initial_delay")]
    pub initial_connection_retry_delay: f64,
    #[serde(default = "default_days_of_pagination")]
    pub days_of_pagination: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_parallel_workers")]
    pub parallel_workers: usize,
    /// Duration string such as "30d" or "6M". Empty disables the
    /// obsolescence filter.
    #[serde(default)]
    pub field_obsolete_threshold: String,
}

fn default_timeout_client() -> u64 {
    30
}

fn default_retries() -> u32 {
    3
}

fn default_retry_delay() -> f64 {
    5.0
}

fn default_initial_delay() -> f64 {
    10.0
}

fn default_days_of_pagination() -> u32 {
    7
}

fn default_batch_size() -> usize {
    5000
}

fn default_parallel_workers() -> usize {
    4
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    Incremental,
    Range,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeConfig {
    pub start_date: String,
    pub end_date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalConfig {
    #[serde(default)]
    pub schedule: String,
}

impl Config {
    /// Final name of a destination database: the configured destination (or
    /// the source name when unset) decorated with the global prefix/suffix.
    pub fn final_database_name(&self, source_name: &str, destination: &str) -> String {
        let base = if destination.is_empty() {
            source_name
        } else {
            destination
        };
        format!("{}{}{}", self.source.prefix, base, self.source.suffix)
    }

    /// Measurement-level filter. An include list wins over the exclude list.
    pub fn measurement_selected(&self, measurement: &str) -> bool {
        if !self.measurements.include.is_empty() {
            return self.measurements.include.iter().any(|m| m == measurement);
        }
        !self.measurements.exclude.iter().any(|m| m == measurement)
    }

    pub fn field_filter(&self, measurement: &str) -> Option<&FieldFilter> {
        self.measurements
            .specific
            .get(measurement)
            .map(|spec| &spec.fields)
    }

    /// Field-level filter for one measurement: the type filter applies first,
    /// then the include list (which wins when present), then the exclude
    /// list.
    pub fn field_selected(&self, measurement: &str, field: &str, field_type: FieldType) -> bool {
        let Some(filter) = self.field_filter(measurement) else {
            return true;
        };
        if !filter.types.contains(&field_type) {
            return false;
        }
        if !filter.include.is_empty() {
            return filter.include.iter().any(|f| f == field);
        }
        !filter.exclude.iter().any(|f| f == field)
    }

    pub fn group_by(&self) -> Option<&str> {
        if self.source.group_by.is_empty() {
            None
        } else {
            Some(&self.source.group_by)
        }
    }

    pub fn schedule(&self) -> Option<&str> {
        match &self.options.incremental {
            Some(inc) if !inc.schedule.trim().is_empty() => Some(inc.schedule.trim()),
            _ => None,
        }
    }

    pub fn obsolete_threshold(&self) -> Result<Option<Duration>, String> {
        let raw = self.options.field_obsolete_threshold.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        parse_duration(raw).map(Some)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.options.timeout_client)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.options.retry_delay)
    }

    pub fn initial_connection_retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.options.initial_connection_retry_delay)
    }
}

/// Parses a human duration string into a `Duration`.
///
/// Units: `s m h d w M y`, with `M` approximated as 30 days and `y` as 365
/// days.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.len() < 2 {
        return Err(format!("invalid duration: '{}'", s));
    }

    let (value_str, unit) = s.split_at(s.len() - 1);
    let value: u64 = value_str
        .parse()
        .map_err(|_| format!("invalid numeric value in duration: {}", s))?;

    const DAY: u64 = 86_400;
    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * DAY,
        "w" => value * 7 * DAY,
        "M" => value * 30 * DAY,
        "y" => value * 365 * DAY,
        other => return Err(format!("unknown duration unit '{}' in: {}", other, s)),
    };

    Ok(Duration::from_secs(seconds))
}
