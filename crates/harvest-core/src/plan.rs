//! Splitting date ranges into contiguous segment windows.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::collection::DateRange;

/// Half-open window `[start, end)` covered by one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl TimeWindow {
    #[must_use]
    pub const fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }
}

/// Splits `range` into `ceil(days / width)` contiguous windows.
///
/// The last window is truncated at `range.end`. An empty range or a zero
/// width yields no windows.
#[must_use]
pub fn plan_windows(range: DateRange, width_days: u32) -> Vec<TimeWindow> {
    if range.is_empty() || width_days == 0 {
        return Vec::new();
    }

    let step = Duration::days(i64::from(width_days));
    let mut windows = Vec::new();
    let mut cursor = range.start;
    while cursor < range.end {
        let end = (cursor + step).min(range.end);
        windows.push(TimeWindow::new(cursor, end));
        cursor = end;
    }
    windows
}

/// Full-width windows starting at `from` whose end does not pass `frontier`.
#[must_use]
pub fn rolling_windows(from: NaiveDate, frontier: NaiveDate, width_days: u32) -> Vec<TimeWindow> {
    if width_days == 0 {
        return Vec::new();
    }

    let step = Duration::days(i64::from(width_days));
    let mut windows = Vec::new();
    let mut cursor = from;
    while cursor + step <= frontier {
        windows.push(TimeWindow::new(cursor, cursor + step));
        cursor += step;
    }
    windows
}

/// Latest date for which the external system has complete data.
#[must_use]
pub fn data_frontier(today: NaiveDate, lag_days: u32) -> NaiveDate {
    today - Duration::days(i64::from(lag_days))
}
