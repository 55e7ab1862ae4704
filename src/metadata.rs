//! Member and beacon reference tables.
//!
//! Both CSVs are read with every column as a string, then parsed row by row
//! into directories keyed by identifier. Lookups return
//! `ProximityError::MissingMetadata` instead of a null, so each join site
//! decides what to do with an unknown id.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::*;
use tracing::{debug, info, warn};

use crate::error::{MetadataKind, ProximityError};
use crate::location::{BeaconType, NearbyCompanies};
use crate::schema::{beacons, members};
use crate::time::{datetime_dtype, to_us};

#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub member: String,
    pub member_id: Option<i64>,
    pub company: String,
    pub participates: bool,
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
}

impl Member {
    /// Participation window `[start, end)`, if both ends are known.
    pub fn window(&self) -> Option<(NaiveDateTime, NaiveDateTime)> {
        match (self.participates, self.start, self.end) {
            (true, Some(start), Some(end)) => Some((start, end)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Beacon {
    pub beacon: String,
    pub beacon_id: Option<i64>,
    pub company: String,
    pub kind: BeaconType,
    pub nearby_companies: BTreeSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MemberDirectory {
    members: HashMap<String, Member>,
}

#[derive(Debug, Clone, Default)]
pub struct BeaconDirectory {
    beacons: HashMap<String, Beacon>,
}

/// Participation windows per member, as microsecond `[start, end)` pairs.
pub type ParticipationWindows = HashMap<String, Vec<(i64, i64)>>;

/// Rows dropped because an id had no metadata, per metadata table.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Unresolved {
    pub members: usize,
    pub beacons: usize,
}

impl Unresolved {
    pub fn record(&mut self, kind: MetadataKind) {
        match kind {
            MetadataKind::Member => self.members += 1,
            MetadataKind::Beacon => self.beacons += 1,
        }
    }

    pub fn merge(&mut self, other: Unresolved) {
        self.members += other.members;
        self.beacons += other.beacons;
    }

    pub fn total(&self) -> usize {
        self.members + self.beacons
    }
}

// ── Members ─────────────────────────────────────────────────────────────────

impl MemberDirectory {
    pub fn load(path: &Path) -> Result<Self, ProximityError> {
        let df = read_csv_as_strings(path)?;
        let directory = Self::from_frame(&df)?;
        info!(path = %path.display(), members = directory.len(), "loaded member metadata");
        Ok(directory)
    }

    /// Build from a string-typed members table.
    ///
    /// Rows without a `member_id` stay resolvable by company but never get a
    /// participation window.
    pub fn from_frame(df: &DataFrame) -> Result<Self, ProximityError> {
        require_columns(
            df,
            &[
                members::MEMBER,
                members::MEMBER_ID,
                members::COMPANY,
                members::PARTICIPATES,
                members::START_DATE,
                members::END_DATE,
            ],
        )?;

        let member = df.column(members::MEMBER)?.str()?;
        let member_id = df.column(members::MEMBER_ID)?.str()?;
        let company = df.column(members::COMPANY)?.str()?;
        let participates = df.column(members::PARTICIPATES)?.str()?;
        let start = df.column(members::START_DATE)?.str()?;
        let end = df.column(members::END_DATE)?.str()?;

        let mut out = HashMap::new();
        for i in 0..df.height() {
            let Some(id) = member.get(i).map(str::trim).filter(|s| !s.is_empty()) else {
                continue;
            };
            let numeric_id = member_id.get(i).and_then(parse_id);
            if numeric_id.is_none() {
                debug!(member = id, "member has no member_id");
            }
            let record = Member {
                member: id.to_string(),
                member_id: numeric_id,
                company: company.get(i).map(str::trim).unwrap_or_default().to_string(),
                participates: participates.get(i).is_some_and(parse_flag),
                start: start.get(i).map(parse_date).transpose()?.flatten(),
                end: end.get(i).map(parse_date).transpose()?.flatten(),
            };
            if record.participates && record.window().is_none() {
                warn!(member = id, "participating member has no complete start/end dates");
            }
            out.insert(record.member.clone(), record);
        }
        Ok(Self { members: out })
    }

    pub fn from_members(members: impl IntoIterator<Item = Member>) -> Self {
        Self {
            members: members
                .into_iter()
                .map(|m| (m.member.clone(), m))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn get(&self, member: &str) -> Result<&Member, ProximityError> {
        self.members
            .get(member)
            .ok_or_else(|| ProximityError::MissingMetadata {
                kind: MetadataKind::Member,
                id: member.to_string(),
            })
    }

    pub fn company(&self, member: &str) -> Result<&str, ProximityError> {
        self.get(member).map(|m| m.company.as_str())
    }

    /// Windows of participating members with a `member_id`. Members without
    /// a complete window are absent, so none of their records survive
    /// cleaning.
    pub fn participation_windows(&self) -> ParticipationWindows {
        let mut windows: ParticipationWindows = HashMap::new();
        for m in self.members.values().filter(|m| m.member_id.is_some()) {
            if let Some((start, end)) = m.window() {
                windows
                    .entry(m.member.clone())
                    .or_default()
                    .push((to_us(start), to_us(end)));
            }
        }
        windows
    }

    /// `metadata/members`: participating members with parsed window bounds.
    pub fn participants_frame(&self) -> Result<DataFrame, ProximityError> {
        let mut rows: Vec<&Member> = self
            .members
            .values()
            .filter(|m| m.participates && m.member_id.is_some())
            .collect();
        rows.sort_by(|a, b| a.member.cmp(&b.member));

        let ids: Vec<&str> = rows.iter().map(|m| m.member.as_str()).collect();
        let numeric: Vec<Option<i64>> = rows.iter().map(|m| m.member_id).collect();
        let companies: Vec<&str> = rows.iter().map(|m| m.company.as_str()).collect();
        let starts: Vec<Option<i64>> = rows.iter().map(|m| m.start.map(to_us)).collect();
        let ends: Vec<Option<i64>> = rows.iter().map(|m| m.end.map(to_us)).collect();

        let df = DataFrame::new(vec![
            Column::new(members::MEMBER.into(), &ids),
            Column::new(members::MEMBER_ID.into(), &numeric),
            Column::new(members::COMPANY.into(), &companies),
            Series::new(members::START_DATE_TS.into(), &starts)
                .cast(&datetime_dtype())?
                .into(),
            Series::new(members::END_DATE_TS.into(), &ends)
                .cast(&datetime_dtype())?
                .into(),
        ])?;
        Ok(df)
    }
}

// ── Beacons ─────────────────────────────────────────────────────────────────

impl BeaconDirectory {
    pub fn load(path: &Path) -> Result<Self, ProximityError> {
        let df = read_csv_as_strings(path)?;
        let directory = Self::from_frame(&df)?;
        info!(path = %path.display(), beacons = directory.len(), "loaded beacon metadata");
        Ok(directory)
    }

    pub fn from_frame(df: &DataFrame) -> Result<Self, ProximityError> {
        require_columns(
            df,
            &[beacons::BEACON, beacons::COMPANY, beacons::TYPE],
        )?;

        let beacon = df.column(beacons::BEACON)?.str()?;
        let company = df.column(beacons::COMPANY)?.str()?;
        let kind = df.column(beacons::TYPE)?.str()?;
        let beacon_id = df.column(beacons::BEACON_ID).ok().map(|c| c.str()).transpose()?;
        let nearby = df
            .column(beacons::NEARBY_COMPANIES)
            .ok()
            .map(|c| c.str())
            .transpose()?;

        let mut out = HashMap::new();
        for i in 0..df.height() {
            let Some(id) = beacon.get(i).map(str::trim).filter(|s| !s.is_empty()) else {
                continue;
            };
            let record = Beacon {
                beacon: id.to_string(),
                beacon_id: beacon_id.and_then(|c| c.get(i)).and_then(parse_id),
                company: company.get(i).map(str::trim).unwrap_or_default().to_string(),
                kind: BeaconType::parse(kind.get(i).unwrap_or_default()),
                nearby_companies: nearby
                    .and_then(|c| c.get(i))
                    .map(split_companies)
                    .unwrap_or_default(),
            };
            out.insert(record.beacon.clone(), record);
        }
        Ok(Self { beacons: out })
    }

    pub fn from_beacons(beacons: impl IntoIterator<Item = Beacon>) -> Self {
        Self {
            beacons: beacons
                .into_iter()
                .map(|b| (b.beacon.clone(), b))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.beacons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beacons.is_empty()
    }

    pub fn get(&self, beacon: &str) -> Result<&Beacon, ProximityError> {
        self.beacons
            .get(beacon)
            .ok_or_else(|| ProximityError::MissingMetadata {
                kind: MetadataKind::Beacon,
                id: beacon.to_string(),
            })
    }

    /// Nearby companies keyed by the company owning a home beacon.
    pub fn nearby_companies(&self) -> NearbyCompanies {
        let mut map: HashMap<String, BTreeSet<String>> = HashMap::new();
        for b in self.beacons.values() {
            if b.kind == BeaconType::Company {
                map.entry(b.company.clone())
                    .or_default()
                    .extend(b.nearby_companies.iter().cloned());
            }
        }
        NearbyCompanies::new(map)
    }
}

// ── Parse helpers ───────────────────────────────────────────────────────────

/// Read a CSV file with all columns as String dtype.
/// Trims whitespace from column names.
pub fn read_csv_as_strings(path: &Path) -> Result<DataFrame, ProximityError> {
    let mut df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0)) // all columns as String
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()?;

    let trimmed: Vec<String> = df
        .get_column_names_str()
        .iter()
        .map(|c| c.trim().to_string())
        .collect();
    df.set_column_names(trimmed.as_slice())?;
    Ok(df)
}

pub fn require_columns(df: &DataFrame, required: &[&str]) -> Result<(), ProximityError> {
    for &col_name in required {
        if df.column(col_name).is_err() {
            return Err(ProximityError::MissingColumn(col_name.to_string()));
        }
    }
    Ok(())
}

fn parse_id(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    raw.parse::<i64>()
        .ok()
        .or_else(|| raw.parse::<f64>().ok().map(|f| f as i64))
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "1.0" | "true" | "yes" | "y"
    )
}

/// Local-date or local-datetime string; empty means unknown.
fn parse_date(raw: &str) -> Result<Option<NaiveDateTime>, ProximityError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(Some(ts));
        }
    }
    for format in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Ok(Some(date.and_time(chrono::NaiveTime::MIN)));
        }
    }
    Err(ProximityError::InvalidData(format!(
        "unrecognised date: '{raw}'"
    )))
}

fn split_companies(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `(member, company)` lookup table for joins.
pub fn member_companies_frame(
    directory: &MemberDirectory,
    company_column: &str,
    member_column: &str,
) -> Result<DataFrame, ProximityError> {
    let mut rows: Vec<(&str, &str)> = directory
        .members
        .values()
        .map(|m| (m.member.as_str(), m.company.as_str()))
        .collect();
    rows.sort();
    let ids: Vec<&str> = rows.iter().map(|r| r.0).collect();
    let companies: Vec<&str> = rows.iter().map(|r| r.1).collect();
    Ok(DataFrame::new(vec![
        Column::new(member_column.into(), &ids),
        Column::new(company_column.into(), &companies),
    ])?)
}
