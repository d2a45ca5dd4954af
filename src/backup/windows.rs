pub const NANOS_PER_DAY: i64 = 86_400_000_000_000;

/// Half-open time window `[start, end)` in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start_ns: i64,
    pub end_ns: i64,
}

/// Lazily yields contiguous, non-overlapping windows of `span_ns` covering
/// `[start, end)`, the last one truncated to `end`.
#[derive(Debug)]
pub struct WindowIter {
    cursor: i64,
    end: i64,
    span: i64,
}

impl WindowIter {
    pub fn new(start_ns: i64, end_ns: i64, span_ns: i64) -> Self {
        Self {
            cursor: start_ns,
            end: end_ns,
            span: span_ns.max(1),
        }
    }

    pub fn days(start_ns: i64, end_ns: i64, days: u32) -> Self {
        Self::new(start_ns, end_ns, days as i64 * NANOS_PER_DAY)
    }
}

impl Iterator for WindowIter {
    type Item = TimeWindow;

    fn next(&mut self) -> Option<TimeWindow> {
        if self.cursor >= self.end {
            return None;
        }
        let start = self.cursor;
        let end = self.cursor.saturating_add(self.span).min(self.end);
        self.cursor = end;
        Some(TimeWindow {
            start_ns: start,
            end_ns: end,
        })
    }
}
