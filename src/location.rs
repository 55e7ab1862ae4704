//! Closest-beacon location classification (m1cb).

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use polars::prelude::*;
use tracing::{debug, warn};

use crate::error::ProximityError;
use crate::metadata::{require_columns, BeaconDirectory, MemberDirectory, Unresolved};
use crate::schema::{beacon_type, common, location_type, m1cb, m2b, m5cb};
use crate::time::{datetime_column, timestamps_us};

/// Beacon category from the beacon metadata `type` column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BeaconType {
    /// Communal badge-storage board.
    Board,
    /// A company's home beacon.
    Company,
    /// Any other fixed location (kitchen, lounge, ...).
    Other(String),
}

impl BeaconType {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            beacon_type::BOARD => Self::Board,
            beacon_type::COMPANY => Self::Company,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Board => beacon_type::BOARD,
            Self::Company => beacon_type::COMPANY,
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for BeaconType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a member is, judging by the closest beacon.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LocationType {
    AtCompany,
    AtDifferentCompany,
    AtNearbyCompany,
    AtFarCompany,
    /// Non-company beacon: the beacon type is the location.
    Fixed(BeaconType),
}

impl LocationType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::AtCompany => location_type::AT_COMPANY,
            Self::AtDifferentCompany => location_type::AT_DIFFERENT_COMPANY,
            Self::AtNearbyCompany => location_type::AT_NEARBY_COMPANY,
            Self::AtFarCompany => location_type::AT_FAR_COMPANY,
            Self::Fixed(kind) => kind.as_str(),
        }
    }
}

impl fmt::Display for LocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Nearby companies of each company that owns a home beacon.
#[derive(Debug, Clone, Default)]
pub struct NearbyCompanies {
    by_company: HashMap<String, BTreeSet<String>>,
}

impl NearbyCompanies {
    pub fn new(by_company: HashMap<String, BTreeSet<String>>) -> Self {
        Self { by_company }
    }

    pub fn has_home_beacon(&self, company: &str) -> bool {
        self.by_company.contains_key(company)
    }

    pub fn is_nearby(&self, company: &str, other: &str) -> bool {
        self.by_company
            .get(company)
            .is_some_and(|set| set.contains(other))
    }
}

/// The three location columns of one m1cb row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub location_type: LocationType,
    pub nearby: LocationType,
    pub merged: LocationType,
}

impl Location {
    /// Classify a member's position from its closest beacon.
    ///
    /// Members whose company has no home beacon are always at a far company
    /// when the closest beacon belongs to someone else.
    pub fn classify(
        kind: &BeaconType,
        member_company: &str,
        beacon_company: &str,
        nearby: &NearbyCompanies,
    ) -> Self {
        let location_type = match kind {
            BeaconType::Company if member_company == beacon_company => LocationType::AtCompany,
            BeaconType::Company => LocationType::AtDifferentCompany,
            other => LocationType::Fixed(other.clone()),
        };

        let refined = match &location_type {
            LocationType::AtDifferentCompany
                if nearby.is_nearby(member_company, beacon_company) =>
            {
                LocationType::AtNearbyCompany
            }
            LocationType::AtDifferentCompany => LocationType::AtFarCompany,
            other => other.clone(),
        };

        let merged = match &refined {
            LocationType::AtNearbyCompany => LocationType::AtCompany,
            other => other.clone(),
        };

        Self {
            location_type,
            nearby: refined,
            merged,
        }
    }
}

/// Build the member-to-closest-beacon table from m5cb.
///
/// Rows without a closest beacon are left out, so the bin reads as "no
/// beacon seen". Rows whose member or beacon has no metadata are dropped and
/// counted.
pub fn build_m1cb(
    m5cb_df: &DataFrame,
    members: &MemberDirectory,
    beacons: &BeaconDirectory,
) -> Result<(DataFrame, Unresolved), ProximityError> {
    require_columns(
        m5cb_df,
        &[common::DATETIME, common::MEMBER, m5cb::BEACON_0, m5cb::RSSI_0],
    )?;

    let nearby = beacons.nearby_companies();
    let times = timestamps_us(m5cb_df, common::DATETIME)?;
    let member_col = m5cb_df.column(common::MEMBER)?.str()?;
    let beacon_col = m5cb_df.column(m5cb::BEACON_0)?.str()?;
    let rssi_series = m5cb_df
        .column(m5cb::RSSI_0)?
        .as_materialized_series()
        .cast(&DataType::Float64)?;
    let rssi_col = rssi_series.f64()?;

    let mut out_time = Vec::with_capacity(m5cb_df.height());
    let mut out_member = Vec::new();
    let mut out_beacon = Vec::new();
    let mut out_rssi = Vec::new();
    let mut out_beacon_company = Vec::new();
    let mut out_beacon_type = Vec::new();
    let mut out_member_company = Vec::new();
    let mut out_location = Vec::new();
    let mut out_nearby = Vec::new();
    let mut out_merged = Vec::new();

    let mut unresolved = Unresolved::default();
    let mut no_beacon = 0usize;

    for i in 0..m5cb_df.height() {
        let (Some(t), Some(member)) = (times.get(i), member_col.get(i)) else {
            continue;
        };
        let Some(beacon_id) = beacon_col.get(i) else {
            no_beacon += 1;
            continue;
        };

        let beacon = match beacons.get(beacon_id) {
            Ok(b) => b,
            Err(ProximityError::MissingMetadata { kind, .. }) => {
                unresolved.record(kind);
                continue;
            }
            Err(e) => return Err(e),
        };
        let member_company = match members.company(member) {
            Ok(c) => c,
            Err(ProximityError::MissingMetadata { kind, .. }) => {
                unresolved.record(kind);
                continue;
            }
            Err(e) => return Err(e),
        };

        let location = Location::classify(&beacon.kind, member_company, &beacon.company, &nearby);

        out_time.push(t);
        out_member.push(member);
        out_beacon.push(beacon_id);
        out_rssi.push(rssi_col.get(i).unwrap_or(m5cb::RSSI_MISSING));
        out_beacon_company.push(beacon.company.as_str());
        out_beacon_type.push(beacon.kind.as_str());
        out_member_company.push(member_company);
        out_location.push(location.location_type.to_string());
        out_nearby.push(location.nearby.to_string());
        out_merged.push(location.merged.to_string());
    }

    if unresolved.total() > 0 {
        warn!(
            members = unresolved.members,
            beacons = unresolved.beacons,
            "m1cb rows dropped for missing metadata"
        );
    }
    debug!(no_beacon, kept = out_time.len(), "built m1cb");

    let df = DataFrame::new(vec![
        datetime_column(common::DATETIME, &out_time)?,
        Column::new(common::MEMBER.into(), &out_member),
        Column::new(m2b::BEACON.into(), &out_beacon),
        Column::new(common::RSSI.into(), &out_rssi),
        Column::new(m1cb::BEACON_COMPANY.into(), &out_beacon_company),
        Column::new(m1cb::BEACON_TYPE.into(), &out_beacon_type),
        Column::new(m1cb::MEMBER_COMPANY.into(), &out_member_company),
        Column::new(m1cb::LOCATION_TYPE.into(), &out_location),
        Column::new(m1cb::LOCATION_TYPE_NEARBY.into(), &out_nearby),
        Column::new(m1cb::LOCATION_TYPE_MERGED.into(), &out_merged),
    ])?
    .lazy()
    .sort([common::DATETIME, common::MEMBER], SortMultipleOptions::default())
    .collect()?;

    Ok((df, unresolved))
}
