//! Pipeline configuration.
//!
//! One `PipelineConfig` is built per run (from TOML or defaults) and passed by
//! reference into every stage. Defaults reproduce the 2018 badge study.

use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ProximityError;

/// Top-level configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Zone of every wall-clock timestamp in the stores
    pub time_zone: String,

    /// Width of a time bin, in seconds
    pub time_bin_secs: u32,

    /// Study periods, chronologically ordered and non-overlapping
    pub periods: Vec<StudyPeriod>,

    /// RSSI cutoffs to materialize connection tables for
    pub rssi_cutoffs: Vec<i32>,

    pub compliance: ComplianceConfig,

    pub blackout: BlackoutConfig,

    pub paths: PathsConfig,

    /// Size of the worker pool used for chunk fan-out
    pub workers: usize,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// A contiguous study period, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyPeriod {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceConfig {
    /// Max neighbour RSSI (dBm) at or below which a badge counts as worn
    pub board_rssi_threshold: f64,

    /// Observed ids below this value are member badges, the rest are beacons
    pub member_id_limit: i64,
}

/// Weekly recurring equipment blackout (battery changes).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlackoutConfig {
    pub weekday: Weekday,
    pub start_time: NaiveTime,
    pub duration_minutes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub metadata_dir: PathBuf,
    pub members_file: String,
    pub beacons_file: String,
    pub dirty_store: PathBuf,
    pub clean_store: PathBuf,
    pub analysis_store: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            time_zone: "US/Eastern".to_string(),
            time_bin_secs: 15,
            periods: vec![
                StudyPeriod::new(
                    study_ts(2018, 6, 12, 12, 0, 0),
                    study_ts(2018, 6, 29, 23, 59, 45),
                ),
                StudyPeriod::new(
                    study_ts(2018, 7, 30, 0, 0, 0),
                    study_ts(2018, 8, 15, 22, 59, 45),
                ),
            ],
            rssi_cutoffs: vec![-51, -57, -60, -62, -65],
            compliance: ComplianceConfig::default(),
            blackout: BlackoutConfig::default(),
            paths: PathsConfig::default(),
            workers: 4,
            log_level: "info".to_string(),
        }
    }
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            board_rssi_threshold: -48.0,
            member_id_limit: 16000,
        }
    }
}

impl Default for BlackoutConfig {
    fn default() -> Self {
        Self {
            weekday: Weekday::Sun,
            start_time: NaiveTime::from_hms_opt(19, 30, 0).unwrap_or(NaiveTime::MIN),
            duration_minutes: 240,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let data = PathBuf::from("data");
        let interim = data.join("interim");
        Self {
            metadata_dir: data.join("metadata"),
            members_file: "members.csv".to_string(),
            beacons_file: "beacons.csv".to_string(),
            dirty_store: interim.join("data_dirty"),
            clean_store: interim.join("data_cleaned"),
            analysis_store: interim.join("analysis"),
        }
    }
}

impl StudyPeriod {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self { start, end }
    }
}

impl PathsConfig {
    pub fn members_path(&self) -> PathBuf {
        self.metadata_dir.join(&self.members_file)
    }

    pub fn beacons_path(&self) -> PathBuf {
        self.metadata_dir.join(&self.beacons_file)
    }
}

impl PipelineConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ProximityError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!(path = %path.display(), "loaded pipeline config");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ProximityError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no stage can work with.
    ///
    /// Period ordering and disjointness are left to the caller.
    pub fn validate(&self) -> Result<(), ProximityError> {
        if self.time_bin_secs == 0 {
            return Err(ProximityError::Config("time_bin_secs must be > 0".into()));
        }
        if self.rssi_cutoffs.is_empty() {
            return Err(ProximityError::Config(
                "rssi_cutoffs must list at least one cutoff".into(),
            ));
        }
        if self.workers == 0 {
            return Err(ProximityError::Config("workers must be > 0".into()));
        }
        if self.time_zone.trim().is_empty() {
            return Err(ProximityError::Config("time_zone must be set".into()));
        }
        for period in &self.periods {
            if period.start >= period.end {
                return Err(ProximityError::Config(format!(
                    "period start {} is not before end {}",
                    period.start, period.end
                )));
            }
        }
        Ok(())
    }

    /// Bin width in microseconds, the unit of every datetime column.
    pub fn bin_us(&self) -> i64 {
        i64::from(self.time_bin_secs) * 1_000_000
    }

    /// Minutes one bin contributes to a connection total.
    pub fn bin_minutes(&self) -> f64 {
        f64::from(self.time_bin_secs) / 60.0
    }
}

fn study_ts(y: i32, m: u32, d: u32, hh: u32, mm: u32, ss: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .and_then(|date| date.and_hms_opt(hh, mm, ss))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_study() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.periods.len(), 2);
        assert_eq!(config.bin_us(), 15_000_000);
        assert!((config.bin_minutes() - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.blackout.weekday, Weekday::Sun);
    }

    #[test]
    fn toml_overrides_and_keeps_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            time_bin_secs = 60
            rssi_cutoffs = [-60]

            [[periods]]
            start = "2018-06-12T00:00:00"
            end = "2018-06-14T00:00:00"

            [blackout]
            weekday = "Sat"
            "#,
        )
        .unwrap();
        assert_eq!(config.time_bin_secs, 60);
        assert_eq!(config.rssi_cutoffs, vec![-60]);
        assert_eq!(config.periods.len(), 1);
        assert_eq!(config.blackout.weekday, Weekday::Sat);
        assert_eq!(config.blackout.duration_minutes, 240);
        assert!((config.compliance.board_rssi_threshold + 48.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_inverted_period() {
        let err = PipelineConfig::from_toml_str(
            r#"
            [[periods]]
            start = "2018-06-14T00:00:00"
            end = "2018-06-12T00:00:00"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ProximityError::Config(_)));
    }

    #[test]
    fn rejects_zero_bin() {
        let config = PipelineConfig {
            time_bin_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
