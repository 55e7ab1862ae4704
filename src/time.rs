//! Time helpers shared by every stage.
//!
//! Datetime columns are `Datetime(Microseconds, None)` holding wall-clock
//! time in the configured zone. Bins are `[t, t + bin)`.

use chrono::{DateTime, Datelike, Duration, NaiveDateTime};
use polars::prelude::*;

use crate::config::PipelineConfig;
use crate::error::ProximityError;

pub fn datetime_dtype() -> DataType {
    DataType::Datetime(TimeUnit::Microseconds, None)
}

pub fn to_us(ts: NaiveDateTime) -> i64 {
    ts.and_utc().timestamp_micros()
}

pub fn from_us(us: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_micros(us).map(|dt| dt.naive_utc())
}

/// Literal comparable with a datetime column.
pub fn datetime_lit(ts: NaiveDateTime) -> Expr {
    lit(to_us(ts)).cast(datetime_dtype())
}

/// `start <= datetime < end` on the given column.
pub fn in_range(column: &str, start: NaiveDateTime, end: NaiveDateTime) -> Expr {
    col(column)
        .gt_eq(datetime_lit(start))
        .and(col(column).lt(datetime_lit(end)))
}

/// Physical microsecond values of a datetime column, whatever its time unit.
pub fn timestamps_us(df: &DataFrame, column: &str) -> Result<Int64Chunked, ProximityError> {
    let s = df
        .column(column)
        .map_err(|_| ProximityError::MissingColumn(column.to_string()))?
        .as_materialized_series()
        .cast(&datetime_dtype())?
        .cast(&DataType::Int64)?;
    Ok(s.i64()?.clone())
}

/// Recast `column` to `datetime_dtype()` when it is stored in another time
/// unit. Frames without the column are returned as is.
pub fn normalize_datetime(mut df: DataFrame, column: &str) -> Result<DataFrame, ProximityError> {
    let Ok(current) = df.column(column) else {
        return Ok(df);
    };
    let target = datetime_dtype();
    if current.dtype() != &target {
        let recast = current.cast(&target)?;
        df.with_column(recast)?;
    }
    Ok(df)
}

/// Build a datetime column from microsecond values.
pub fn datetime_column(name: &str, values: &[i64]) -> Result<Column, ProximityError> {
    let s = Series::new(name.into(), values).cast(&datetime_dtype())?;
    Ok(s.into())
}

/// A weekly equipment blackout, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlackoutWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl BlackoutWindow {
    pub fn contains_us(&self, us: i64) -> bool {
        to_us(self.start) <= us && us <= to_us(self.end)
    }
}

/// Blackout windows for every matching weekday from the first study day
/// through the last one.
pub fn blackout_windows(config: &PipelineConfig) -> Vec<BlackoutWindow> {
    let (Some(first), Some(last)) = (config.periods.first(), config.periods.last()) else {
        return Vec::new();
    };
    let duration = Duration::minutes(i64::from(config.blackout.duration_minutes));

    let mut windows = Vec::new();
    let mut day = first.start.date();
    let last_day = last.end.date();
    while day <= last_day {
        if day.weekday() == config.blackout.weekday {
            let start = day.and_time(config.blackout.start_time);
            windows.push(BlackoutWindow {
                start,
                end: start + duration,
            });
        }
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    windows
}
