//! Time-bucket partitioning and data-parallel fan-out.
//!
//! Every stage splits the study into the same day chunks, hands each chunk to
//! an independent rayon task and concatenates the results in chunk order.

use std::fmt;

use chrono::NaiveDateTime;
use polars::prelude::*;
use rayon::prelude::*;
use tracing::debug;

use crate::config::{PipelineConfig, StudyPeriod};
use crate::error::ProximityError;

/// A half-open `[start, end)` slice of a study period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeChunk {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl fmt::Display for TimeChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.start, self.end)
    }
}

/// Split a period on local midnights.
///
/// The first chunk starts at the exact period start and the last one ends at
/// the exact period end.
pub fn period_chunks(period: &StudyPeriod) -> Vec<TimeChunk> {
    let mut bounds = vec![period.start];
    let mut day = period.start.date();
    while let Some(next) = day.succ_opt() {
        let midnight = next.and_time(chrono::NaiveTime::MIN);
        if midnight >= period.end {
            break;
        }
        bounds.push(midnight);
        day = next;
    }
    bounds.push(period.end);

    bounds
        .windows(2)
        .filter(|w| w[0] < w[1])
        .map(|w| TimeChunk {
            start: w[0],
            end: w[1],
        })
        .collect()
}

/// All chunks of all configured periods, in time order.
pub fn study_chunks(config: &PipelineConfig) -> Vec<TimeChunk> {
    config.periods.iter().flat_map(period_chunks).collect()
}

/// Result of one chunk's work.
pub struct ChunkOutcome<T> {
    pub chunk: TimeChunk,
    pub result: Result<T, ProximityError>,
}

/// Run `work` on every chunk on a dedicated pool of `workers` threads.
///
/// Outcomes come back in the same order as `chunks`; a failing chunk does
/// not stop the others.
pub fn fan_out<T, F>(
    chunks: &[TimeChunk],
    workers: usize,
    work: F,
) -> Result<Vec<ChunkOutcome<T>>, ProximityError>
where
    T: Send,
    F: Fn(&TimeChunk) -> Result<T, ProximityError> + Send + Sync,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()?;

    let outcomes = pool.install(|| {
        chunks
            .par_iter()
            .map(|chunk| {
                debug!(%chunk, "processing chunk");
                ChunkOutcome {
                    chunk: *chunk,
                    result: work(chunk),
                }
            })
            .collect::<Vec<_>>()
    });
    Ok(outcomes)
}

/// Concatenate partial tables in order. `None` when there is nothing to merge.
pub fn concat_frames(frames: Vec<DataFrame>) -> Result<Option<DataFrame>, ProximityError> {
    let frames: Vec<LazyFrame> = frames
        .into_iter()
        .filter(|df| df.height() > 0)
        .map(DataFrame::lazy)
        .collect();
    if frames.is_empty() {
        return Ok(None);
    }
    let args = UnionArgs {
        to_supertypes: true,
        ..Default::default()
    };
    Ok(Some(concat(frames, args)?.collect()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(m: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2018, m, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn chunks_start_and_end_exactly() {
        let period = StudyPeriod::new(ts(6, 12, 12, 0, 0), ts(6, 14, 23, 59, 45));
        let chunks = period_chunks(&period);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].start, ts(6, 12, 12, 0, 0));
        assert_eq!(chunks[0].end, ts(6, 13, 0, 0, 0));
        assert_eq!(chunks[2].start, ts(6, 14, 0, 0, 0));
        assert_eq!(chunks[2].end, ts(6, 14, 23, 59, 45));
    }

    #[test]
    fn midnight_end_has_no_empty_chunk() {
        let period = StudyPeriod::new(ts(6, 12, 0, 0, 0), ts(6, 14, 0, 0, 0));
        let chunks = period_chunks(&period);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.start < c.end));
    }

    #[test]
    fn fan_out_keeps_order_and_isolates_failures() {
        let period = StudyPeriod::new(ts(6, 12, 0, 0, 0), ts(6, 16, 0, 0, 0));
        let chunks = period_chunks(&period);
        let outcomes = fan_out(&chunks, 2, |chunk| {
            if chunk.start == ts(6, 13, 0, 0, 0) {
                Err(ProximityError::General("bad file".into()))
            } else {
                Ok(chunk.start)
            }
        })
        .unwrap();

        assert_eq!(outcomes.len(), 4);
        assert!(outcomes[1].result.is_err());
        for (outcome, chunk) in outcomes.iter().zip(&chunks) {
            assert_eq!(outcome.chunk, *chunk);
        }
        assert_eq!(outcomes[3].result.as_ref().ok(), Some(&ts(6, 15, 0, 0, 0)));
    }

    #[test]
    fn concat_skips_empty_parts() {
        let a = df!("x" => [1i64, 2]).unwrap();
        let b = df!("x" => [3i64]).unwrap();
        let merged = concat_frames(vec![a.head(Some(0)), a, b]).unwrap().unwrap();
        assert_eq!(merged.height(), 3);
        assert!(concat_frames(Vec::new()).unwrap().is_none());
    }
}
