use super::line_protocol::Point;
use super::response::{ChunkSplitter, QueryResponse};
use crate::config::types::FieldType;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Rows requested per chunk on streaming reads. Bounds the memory of a
/// multi-million-row window together with the write batch size.
const CHUNK_SIZE: usize = 10_000;

#[derive(Debug, Error)]
pub enum InfluxError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("endpoint returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("query failed: {0}")]
    Query(String),

    #[error("unexpected response shape: {0}")]
    Response(String),
}

impl InfluxError {
    /// Transient errors worth retrying: transport failures, timeouts,
    /// overload signals. Everything else (other 4xx, malformed queries,
    /// schema conflicts) is permanent.
    pub fn is_retriable(&self) -> bool {
        match self {
            InfluxError::Http(_) => true,
            InfluxError::Status { status, .. } => {
                matches!(status, 408 | 429) || *status >= 500
            }
            InfluxError::Query(_) | InfluxError::Response(_) => false,
        }
    }

    pub fn is_auth_error(&self) -> bool {
        matches!(self, InfluxError::Status { status: 401 | 403, .. })
    }
}

/// Fixed-delay retry settings shared by every HTTP operation of one
/// configuration.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

/// Runs `op` up to `1 + retries` times with a fixed delay between attempts,
/// stopping early on a non-retriable error. Every attempt increments
/// `attempts` so callers can report how much work a unit consumed.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    attempts: &mut u32,
    mut op: F,
) -> Result<T, InfluxError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, InfluxError>>,
{
    let mut tries = 0u32;
    loop {
        *attempts += 1;
        tries += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retriable() && tries <= policy.retries => {
                warn!(
                    attempt = tries,
                    delay_ms = policy.delay.as_millis() as u64,
                    error = %e,
                    "request failed, retrying"
                );
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Connection settings for one InfluxDB 1.x endpoint.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: String,
    pub user: String,
    pub password: String,
    pub verify_ssl: bool,
    pub timeout: Duration,
}

/// HTTP client for one InfluxDB 1.x endpoint. Stateless between calls, so a
/// single instance is shared by all workers of a configuration.
#[derive(Debug)]
pub struct InfluxClient {
    base_url: String,
    client: reqwest::Client,
    user: String,
    password: String,
}

impl InfluxClient {
    pub fn new(endpoint: &Endpoint) -> Result<Self, InfluxError> {
        let client = reqwest::Client::builder()
            .timeout(endpoint.timeout)
            .danger_accept_invalid_certs(!endpoint.verify_ssl)
            .build()?;

        Ok(Self {
            base_url: endpoint.url.trim_end_matches('/').to_string(),
            client,
            user: endpoint.user.clone(),
            password: endpoint.password.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.user.is_empty() {
            builder
        } else {
            builder.basic_auth(&self.user, Some(&self.password))
        }
    }

    /// `GET /ping`; a 204 means the endpoint is up.
    pub async fn ping(&self) -> Result<(), InfluxError> {
        let url = format!("{}/ping", self.base_url);
        let response = self.authed(self.client.get(&url)).send().await?;
        if response.status().as_u16() == 204 {
            Ok(())
        } else {
            Err(status_error(response).await)
        }
    }

    /// Blocks until the endpoint answers a ping, retrying with a fixed delay
    /// up to the attempt budget. Tolerates boot-order races with a sidecar
    /// InfluxDB that is still starting.
    pub async fn wait_until_ready(
        &self,
        attempts_budget: u32,
        delay: Duration,
    ) -> Result<(), InfluxError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.ping().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt <= attempts_budget => {
                    warn!(
                        url = %self.base_url,
                        attempt = attempt,
                        delay_s = delay.as_secs_f64(),
                        error = %e,
                        "endpoint not ready, waiting"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn execute_query(
        &self,
        query: &str,
        database: Option<&str>,
    ) -> Result<QueryResponse, InfluxError> {
        let url = format!("{}/query", self.base_url);
        let mut params: Vec<(&str, &str)> = vec![("q", query), ("epoch", "ns")];
        if let Some(db) = database {
            params.push(("db", db));
        }

        debug!(query = query, "executing query");
        let response = self
            .authed(self.client.get(&url).query(&params))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let body: QueryResponse = response.json().await?;
        if let Some(message) = body.error_message() {
            return Err(InfluxError::Query(message.to_string()));
        }
        Ok(body)
    }

    /// Idempotent `CREATE DATABASE`.
    pub async fn ensure_database(&self, database: &str) -> Result<(), InfluxError> {
        let query = format!("CREATE DATABASE {}", quote_ident(database));
        let url = format!("{}/query", self.base_url);
        let response = self
            .authed(self.client.post(&url).query(&[("q", query.as_str())]))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let body: QueryResponse = response.json().await?;
        if let Some(message) = body.error_message() {
            return Err(InfluxError::Query(message.to_string()));
        }
        Ok(())
    }

    /// Every user database on the endpoint (system databases filtered out).
    pub async fn list_databases(&self) -> Result<Vec<String>, InfluxError> {
        let body = self.execute_query("SHOW DATABASES", None).await?;
        Ok(body
            .string_column()
            .into_iter()
            .filter(|name| !name.starts_with('_'))
            .collect())
    }

    pub async fn list_measurements(&self, database: &str) -> Result<Vec<String>, InfluxError> {
        let body = self.execute_query("SHOW MEASUREMENTS", Some(database)).await?;
        Ok(body.string_column())
    }

    pub async fn list_field_keys(
        &self,
        database: &str,
        measurement: &str,
    ) -> Result<Vec<(String, FieldType)>, InfluxError> {
        let query = format!("SHOW FIELD KEYS FROM {}", quote_ident(measurement));
        let body = self.execute_query(&query, Some(database)).await?;
        Ok(body
            .field_key_rows()
            .into_iter()
            .map(|(field, kind)| (field, FieldType::from_influx(&kind)))
            .collect())
    }

    pub async fn list_tag_keys(
        &self,
        database: &str,
        measurement: &str,
    ) -> Result<Vec<String>, InfluxError> {
        let query = format!("SHOW TAG KEYS FROM {}", quote_ident(measurement));
        let body = self.execute_query(&query, Some(database)).await?;
        Ok(body.string_column())
    }

    /// Timestamp of the most recent row where this field is non-null, in
    /// nanoseconds. The `IS NOT NULL` predicate keeps the answer scoped to
    /// this field alone: rows written for sibling fields of the measurement
    /// never move it.
    pub async fn last_field_write_time(
        &self,
        database: &str,
        measurement: &str,
        field: &str,
    ) -> Result<Option<i64>, InfluxError> {
        let query = format!(
            "SELECT LAST({field}) FROM {measurement} WHERE {field} IS NOT NULL",
            field = quote_ident(field),
            measurement = quote_ident(measurement),
        );
        let body = self.execute_query(&query, Some(database)).await?;
        Ok(body.scalar_timestamp_ns())
    }

    /// Timestamp of the oldest non-null row of this field, in nanoseconds.
    pub async fn first_field_write_time(
        &self,
        database: &str,
        measurement: &str,
        field: &str,
    ) -> Result<Option<i64>, InfluxError> {
        let query = format!(
            "SELECT FIRST({field}) FROM {measurement} WHERE {field} IS NOT NULL",
            field = quote_ident(field),
            measurement = quote_ident(measurement),
        );
        let body = self.execute_query(&query, Some(database)).await?;
        Ok(body.scalar_timestamp_ns())
    }

    /// Streams one field's rows over a half-open time window as a chunked
    /// response, so arbitrarily large windows never buffer in memory.
    ///
    /// The lower bound is exclusive (`time >`) on the first window after a
    /// derived watermark and inclusive (`time >=`) otherwise; the upper bound
    /// is always `time <`.
    pub async fn query_field_window(
        &self,
        database: &str,
        measurement: &str,
        field: &str,
        tags: &[String],
        lower_ns: i64,
        lower_exclusive: bool,
        upper_ns: i64,
        group_by: Option<&str>,
    ) -> Result<PointStream, InfluxError> {
        let query = build_window_query(
            measurement,
            field,
            tags,
            lower_ns,
            lower_exclusive,
            upper_ns,
            group_by,
        );

        let url = format!("{}/query", self.base_url);
        let chunk_size = CHUNK_SIZE.to_string();
        let params: Vec<(&str, &str)> = vec![
            ("q", query.as_str()),
            ("db", database),
            ("epoch", "ns"),
            ("chunked", "true"),
            ("chunk_size", chunk_size.as_str()),
        ];

        debug!(query = %query, "streaming window query");
        let response = self
            .authed(self.client.get(&url).query(&params))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        Ok(PointStream {
            field: field.to_string(),
            splitter: ChunkSplitter::new(),
            inner: Box::pin(response.bytes_stream()),
            done: false,
        })
    }

    /// Writes a pre-encoded line-protocol body with nanosecond precision.
    pub async fn write_line_protocol(
        &self,
        database: &str,
        body: String,
    ) -> Result<(), InfluxError> {
        if body.is_empty() {
            return Ok(());
        }

        let url = format!("{}/write", self.base_url);
        let response = self
            .authed(
                self.client
                    .post(&url)
                    .query(&[("db", database), ("precision", "ns")])
                    .body(body),
            )
            .send()
            .await?;

        if response.status().as_u16() == 204 {
            Ok(())
        } else {
            Err(status_error(response).await)
        }
    }
}

async fn status_error(response: reqwest::Response) -> InfluxError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    InfluxError::Status { status, message }
}

/// Double-quotes an InfluxQL identifier, escaping embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\\\""))
}

fn build_window_query(
    measurement: &str,
    field: &str,
    tags: &[String],
    lower_ns: i64,
    lower_exclusive: bool,
    upper_ns: i64,
    group_by: Option<&str>,
) -> String {
    let mut select = quote_ident(field);
    for tag in tags {
        select.push_str(", ");
        select.push_str(&quote_ident(tag));
    }

    let comparator = if lower_exclusive { ">" } else { ">=" };
    let mut query = format!(
        "SELECT {select} FROM {measurement} WHERE {field} IS NOT NULL \
         AND time {comparator} {lower} AND time < {upper}",
        select = select,
        measurement = quote_ident(measurement),
        field = quote_ident(field),
        comparator = comparator,
        lower = lower_ns,
        upper = upper_ns,
    );

    if let Some(clause) = group_by {
        query.push_str(" GROUP BY ");
        query.push_str(clause);
    }
    query.push_str(" ORDER BY time ASC");
    query
}

/// Incremental decoder over a chunked `/query` response. Each call to
/// [`PointStream::next_batch`] yields the points of the next server chunk.
pub struct PointStream {
    field: String,
    splitter: ChunkSplitter,
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    done: bool,
}

impl PointStream {
    /// Next decoded batch of points, or `None` once the response is
    /// exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Point>>, InfluxError> {
        loop {
            if self.done {
                return match self.splitter.finish() {
                    Some(tail) => {
                        let points = self.decode_line(&tail)?;
                        if points.is_empty() {
                            Ok(None)
                        } else {
                            Ok(Some(points))
                        }
                    }
                    None => Ok(None),
                };
            }

            match self.inner.next().await {
                Some(Ok(data)) => {
                    let mut points = Vec::new();
                    for line in self.splitter.push(&data) {
                        points.extend(self.decode_line(&line)?);
                    }
                    if !points.is_empty() {
                        return Ok(Some(points));
                    }
                }
                Some(Err(e)) => return Err(InfluxError::Http(e)),
                None => self.done = true,
            }
        }
    }

    fn decode_line(&self, line: &[u8]) -> Result<Vec<Point>, InfluxError> {
        let body: QueryResponse = serde_json::from_slice(line)
            .map_err(|e| InfluxError::Response(format!("invalid chunk JSON: {}", e)))?;
        if let Some(message) = body.error_message() {
            return Err(InfluxError::Query(message.to_string()));
        }
        body.points_for_field(&self.field)
            .map_err(InfluxError::Response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("weather"), "\"weather\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\\\"ird\"");
    }

    #[test]
    fn window_query_has_isolation_predicate() {
        let q = build_window_query("weather", "temperature", &[], 100, false, 200, None);
        assert!(q.contains("\"temperature\" IS NOT NULL"));
        assert!(q.contains("time >= 100"));
        assert!(q.contains("time < 200"));
        assert!(q.ends_with("ORDER BY time ASC"));
    }

    #[test]
    fn window_query_exclusive_lower_bound() {
        let q = build_window_query("weather", "temperature", &[], 100, true, 200, None);
        assert!(q.contains("time > 100"));
        assert!(!q.contains("time >= 100"));
    }

    #[test]
    fn window_query_selects_tags_and_group_by() {
        let tags = vec!["station".to_string(), "zone".to_string()];
        let q = build_window_query("weather", "temperature", &tags, 0, false, 10, Some("time(30s)"));
        assert!(q.starts_with("SELECT \"temperature\", \"station\", \"zone\" FROM \"weather\""));
        assert!(q.contains("GROUP BY time(30s) ORDER BY time ASC"));
    }

    #[test]
    fn retriable_classification() {
        let retriable = [408u16, 429, 500, 502, 503];
        for status in retriable {
            let e = InfluxError::Status { status, message: String::new() };
            assert!(e.is_retriable(), "status {} should be retriable", status);
        }
        let fatal = [400u16, 401, 403, 404, 422];
        for status in fatal {
            let e = InfluxError::Status { status, message: String::new() };
            assert!(!e.is_retriable(), "status {} should be fatal", status);
        }
        assert!(!InfluxError::Query("bad".to_string()).is_retriable());
    }

    #[test]
    fn auth_error_detection() {
        assert!(InfluxError::Status { status: 401, message: String::new() }.is_auth_error());
        assert!(InfluxError::Status { status: 403, message: String::new() }.is_auth_error());
        assert!(!InfluxError::Status { status: 500, message: String::new() }.is_auth_error());
    }

    #[tokio::test]
    async fn with_retry_stops_on_fatal() {
        let policy = RetryPolicy { retries: 5, delay: Duration::from_millis(1) };
        let mut attempts = 0;
        let result: Result<(), _> = with_retry(policy, &mut attempts, || async {
            Err(InfluxError::Status { status: 400, message: "bad line".to_string() })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn with_retry_exhausts_budget() {
        let policy = RetryPolicy { retries: 2, delay: Duration::from_millis(1) };
        let mut attempts = 0;
        let result: Result<(), _> = with_retry(policy, &mut attempts, || async {
            Err(InfluxError::Status { status: 503, message: String::new() })
        })
        .await;
        assert!(result.is_err());
        // One initial attempt plus two retries.
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn with_retry_recovers_after_transient_failures() {
        let policy = RetryPolicy { retries: 3, delay: Duration::from_millis(1) };
        let mut attempts = 0;
        let counter = std::sync::atomic::AtomicU32::new(0);
        let result = with_retry(policy, &mut attempts, || {
            let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(InfluxError::Status { status: 503, message: String::new() })
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        // Two 503s, then the third attempt succeeds.
        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts, 3);
    }
}
