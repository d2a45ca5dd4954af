//! Field discovery: turns one source database into the deterministic list of
//! `(measurement, field)` units a backup run will process.

use crate::config::types::{Config, FieldType};
use crate::influx::{with_retry, InfluxClient, InfluxError, RetryPolicy};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("influx error: {0}")]
    Influx(#[from] InfluxError),

    #[error("invalid obsolescence threshold: {0}")]
    Threshold(String),
}

/// The unit of parallelism and of watermarking: one field of one measurement
/// in one source database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRef {
    pub database: String,
    pub measurement: String,
    pub field: String,
    pub field_type: FieldType,
}

impl std::fmt::Display for FieldRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.database, self.measurement, self.field)
    }
}

/// Result of discovery for one database: fields to back up, fields diverted
/// by the obsolescence filter (reported as skipped, never silently dropped),
/// and the tag keys of every retained measurement.
#[derive(Debug, Default)]
pub struct Catalog {
    pub active: Vec<FieldRef>,
    pub obsolete: Vec<FieldRef>,
    pub tag_keys: BTreeMap<String, Vec<String>>,
}

/// Builds the catalog for one source database.
///
/// The obsolescence cutoff is evaluated against the *source*'s last write
/// time: a field that was active once and has gone silent longer than the
/// threshold stops being copied, even if late points were still to arrive.
pub async fn build_catalog(
    source: &InfluxClient,
    config: &Config,
    database: &str,
    now_ns: i64,
    policy: RetryPolicy,
) -> Result<Catalog, CatalogError> {
    let threshold = config
        .obsolete_threshold()
        .map_err(CatalogError::Threshold)?;
    let cutoff_ns = threshold.map(|t| now_ns.saturating_sub(t.as_nanos() as i64));

    let mut attempts = 0u32;
    let measurements = with_retry(policy, &mut attempts, || source.list_measurements(database)).await?;

    let mut catalog = Catalog::default();

    for measurement in measurements {
        if !config.measurement_selected(&measurement) {
            debug!(measurement = %measurement, "measurement filtered out");
            continue;
        }

        let fields = with_retry(policy, &mut attempts, || {
            source.list_field_keys(database, &measurement)
        })
        .await?;

        let mut retained = Vec::new();
        for (field, field_type) in fields {
            if !config.field_selected(&measurement, &field, field_type) {
                debug!(
                    measurement = %measurement,
                    field = %field,
                    "field filtered out"
                );
                continue;
            }
            retained.push(FieldRef {
                database: database.to_string(),
                measurement: measurement.clone(),
                field,
                field_type,
            });
        }

        if retained.is_empty() {
            continue;
        }

        let tags = with_retry(policy, &mut attempts, || {
            source.list_tag_keys(database, &measurement)
        })
        .await?;
        catalog.tag_keys.insert(measurement.clone(), tags);

        for field_ref in retained {
            if let Some(cutoff) = cutoff_ns {
                let last = with_retry(policy, &mut attempts, || {
                    source.last_field_write_time(database, &field_ref.measurement, &field_ref.field)
                })
                .await?;
                if is_obsolete(last, cutoff) {
                    debug!(field = %field_ref, "field is obsolete");
                    catalog.obsolete.push(field_ref);
                    continue;
                }
            }
            catalog.active.push(field_ref);
        }
    }

    sort_fields(&mut catalog.active);
    sort_fields(&mut catalog.obsolete);

    info!(
        database = %database,
        active = catalog.active.len(),
        obsolete = catalog.obsolete.len(),
        "catalog built"
    );

    Ok(catalog)
}

/// A field is obsolete when the source has never written it, or last wrote it
/// before the cutoff.
fn is_obsolete(last_write_ns: Option<i64>, cutoff_ns: i64) -> bool {
    match last_write_ns {
        None => true,
        Some(last) => last < cutoff_ns,
    }
}

fn sort_fields(fields: &mut [FieldRef]) {
    fields.sort_by(|a, b| {
        (&a.measurement, &a.field).cmp(&(&b.measurement, &b.field))
    });
}
