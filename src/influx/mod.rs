pub mod client;
pub mod line_protocol;
pub mod response;

pub use client::{with_retry, Endpoint, InfluxClient, InfluxError, PointStream, RetryPolicy};
pub use line_protocol::{FieldValue, Point};
