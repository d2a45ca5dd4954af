use super::line_protocol::{FieldValue, Point};
use serde::Deserialize;
use std::collections::HashMap;

/// Body of a `/query` response. Chunked responses stream one of these per
/// line; unchunked responses contain exactly one.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub results: Vec<StatementResult>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatementResult {
    #[serde(default)]
    pub series: Vec<Series>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub partial: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Series {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub values: Vec<Vec<serde_json::Value>>,
    /// Present when the query groups by tags; merged into every row's tag
    /// set.
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub partial: bool,
}

impl QueryResponse {
    /// Surfaces a top-level or statement-level error embedded in an otherwise
    /// successful HTTP response.
    pub fn error_message(&self) -> Option<&str> {
        if let Some(err) = &self.error {
            return Some(err);
        }
        self.results.iter().find_map(|r| r.error.as_deref())
    }

    fn first_series(&self) -> Option<&Series> {
        self.results.first().and_then(|r| r.series.first())
    }

    /// First column of every row across the first series, as strings. The
    /// shape of `SHOW DATABASES` and `SHOW MEASUREMENTS`.
    pub fn string_column(&self) -> Vec<String> {
        let Some(series) = self.first_series() else {
            return Vec::new();
        };
        series
            .values
            .iter()
            .filter_map(|row| row.first().and_then(|v| v.as_str()).map(String::from))
            .collect()
    }

    /// `(fieldKey, fieldType)` pairs from a `SHOW FIELD KEYS` response.
    pub fn field_key_rows(&self) -> Vec<(String, String)> {
        let Some(series) = self.first_series() else {
            return Vec::new();
        };
        series
            .values
            .iter()
            .filter_map(|row| {
                let key = row.first().and_then(|v| v.as_str())?;
                let kind = row.get(1).and_then(|v| v.as_str())?;
                Some((key.to_string(), kind.to_string()))
            })
            .collect()
    }

    /// The timestamp of the single row returned by a `SELECT LAST(..)` or
    /// `SELECT FIRST(..)` query, in nanoseconds. `None` when the series is
    /// empty (no matching rows on the server).
    pub fn scalar_timestamp_ns(&self) -> Option<i64> {
        let series = self.first_series()?;
        let row = series.values.first()?;
        row.first()?.as_i64()
    }

    /// Folds every series of this response into `Point`s for one named
    /// field. The `time` column becomes the timestamp, the field column the
    /// value, and every remaining column a tag. Rows where the field is null
    /// are dropped.
    pub fn points_for_field(&self, field: &str) -> Result<Vec<Point>, String> {
        let mut points = Vec::new();
        for result in &self.results {
            for series in &result.series {
                fold_series(series, field, &mut points)?;
            }
        }
        Ok(points)
    }
}

fn fold_series(series: &Series, field: &str, out: &mut Vec<Point>) -> Result<(), String> {
    let time_idx = series
        .columns
        .iter()
        .position(|c| c == "time")
        .ok_or_else(|| format!("series '{}' has no time column", series.name))?;
    let field_idx = series
        .columns
        .iter()
        .position(|c| c == field)
        .ok_or_else(|| format!("series '{}' has no column for field '{}'", series.name, field))?;

    for row in &series.values {
        let Some(timestamp_ns) = row.get(time_idx).and_then(|v| v.as_i64()) else {
            continue;
        };
        let Some(value) = row.get(field_idx).and_then(FieldValue::from_json) else {
            // Null field value; excluded server-side in the normal path, but
            // grouped reads can still produce empty buckets.
            continue;
        };

        let mut tags: std::collections::BTreeMap<String, String> = series
            .tags
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (idx, column) in series.columns.iter().enumerate() {
            if idx == time_idx || idx == field_idx {
                continue;
            }
            if let Some(value) = row.get(idx).and_then(|v| v.as_str()) {
                tags.insert(column.clone(), value.to_string());
            }
        }

        out.push(Point {
            timestamp_ns,
            tags,
            field: field.to_string(),
            value,
        });
    }
    Ok(())
}

/// Splits a chunked response body into complete JSON documents. InfluxDB
/// separates chunks with newlines; the tail may arrive without one.
#[derive(Debug, Default)]
pub struct ChunkSplitter {
    buffer: Vec<u8>,
}

impl ChunkSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes and returns every complete line now available.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Returns the unterminated remainder once the stream is exhausted.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}
