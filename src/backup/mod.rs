pub mod job;
pub mod pool;
pub mod report;
pub mod watermark;
pub mod windows;

pub use job::{run_field_backup, JobContext};
pub use pool::{PoolRun, WorkerPool, WorkerTag};
pub use report::{JobOutcome, JobStatus, PoolMetrics, Report, SkipReason};
pub use watermark::{Resolution, ResumePoint};
pub use windows::{TimeWindow, WindowIter};
