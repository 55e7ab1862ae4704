//! Connection tables: how many minutes members and companies spent near
//! each other, per RSSI cutoff, at daily and annual granularity.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use polars::prelude::*;
use tracing::{info, warn};

use crate::error::ProximityError;
use crate::metadata::{member_companies_frame, require_columns, MemberDirectory, Unresolved};
use crate::schema::{common, keys, m2m};
use crate::time::{datetime_column, from_us, timestamps_us, to_us};

/// Time bucket of an aggregated table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Daily,
    Annual,
}

impl Granularity {
    /// Start of the bucket holding `ts`.
    pub fn bucket_start(&self, ts: NaiveDateTime) -> NaiveDateTime {
        let date = match self {
            Self::Daily => ts.date(),
            Self::Annual => NaiveDate::from_ymd_opt(ts.year(), 1, 1).unwrap_or(ts.date()),
        };
        date.and_time(NaiveTime::MIN)
    }
}

/// Which identifiers the two sides of an aggregated pair are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairLevel {
    MemberToMember,
    MemberToCompany,
    CompanyToCompany,
}

impl PairLevel {
    pub fn columns(&self) -> (&'static str, &'static str) {
        match self {
            Self::MemberToMember => (m2m::MEMBER1, m2m::MEMBER2),
            Self::MemberToCompany => (m2m::MEMBER1, m2m::COMPANY2),
            Self::CompanyToCompany => (m2m::COMPANY1, m2m::COMPANY2),
        }
    }

    /// Same-company c2c buckets see every interaction from both directions.
    fn halves_same_side(&self) -> bool {
        matches!(self, Self::CompanyToCompany)
    }
}

/// Keep records whose `rssi_max` is at least `rssi_cutoff`.
pub fn filter_cutoff(m2m_df: &DataFrame, rssi_cutoff: i32) -> Result<DataFrame, ProximityError> {
    require_columns(m2m_df, &[m2m::RSSI_MAX])?;
    let df = m2m_df
        .clone()
        .lazy()
        .filter(col(m2m::RSSI_MAX).gt_eq(lit(f64::from(rssi_cutoff))))
        .collect()?;
    info!(rssi_cutoff, before = m2m_df.height(), after = df.height(), "m2m cutoff filter");
    Ok(df)
}

/// Materialize every `(t, a, b)` record as `(t, b, a)` too and attach the
/// per-bin `minutes` measure.
pub fn make_double_sided(m2m_df: &DataFrame, bin_minutes: f64) -> Result<DataFrame, ProximityError> {
    require_columns(m2m_df, &[common::DATETIME, m2m::MEMBER1, m2m::MEMBER2])?;

    let swapped: Vec<Expr> = m2m_df
        .get_column_names_str()
        .iter()
        .map(|name| match *name {
            m2m::MEMBER1 => col(m2m::MEMBER2).alias(m2m::MEMBER1),
            m2m::MEMBER2 => col(m2m::MEMBER1).alias(m2m::MEMBER2),
            other => col(other),
        })
        .collect();

    let forward = m2m_df.clone().lazy();
    let reversed = m2m_df.clone().lazy().select(swapped);

    let df = concat([forward, reversed], UnionArgs::default())?
        .with_columns([lit(bin_minutes).alias(m2m::MINUTES)])
        .sort(
            [common::DATETIME, m2m::MEMBER1, m2m::MEMBER2],
            SortMultipleOptions::default(),
        )
        .collect()?;
    info!(before = m2m_df.height(), after = df.height(), "m2m made double sided");
    Ok(df)
}

/// Add `company1` / `company2` for both members.
///
/// Records with a member missing from the metadata are dropped and counted.
pub fn add_companies(
    m2m_dbl: &DataFrame,
    members: &MemberDirectory,
) -> Result<(DataFrame, Unresolved), ProximityError> {
    require_columns(m2m_dbl, &[m2m::MEMBER1, m2m::MEMBER2])?;
    let side1 = member_companies_frame(members, m2m::COMPANY1, m2m::MEMBER1)?;
    let side2 = member_companies_frame(members, m2m::COMPANY2, m2m::MEMBER2)?;

    let joined = m2m_dbl
        .clone()
        .lazy()
        .join(
            side1.lazy(),
            [col(m2m::MEMBER1)],
            [col(m2m::MEMBER1)],
            JoinArgs::new(JoinType::Left),
        )
        .join(
            side2.lazy(),
            [col(m2m::MEMBER2)],
            [col(m2m::MEMBER2)],
            JoinArgs::new(JoinType::Left),
        )
        .collect()?;

    let resolved = joined
        .clone()
        .lazy()
        .filter(
            col(m2m::COMPANY1)
                .is_not_null()
                .and(col(m2m::COMPANY2).is_not_null()),
        )
        .collect()?;

    let unresolved = Unresolved {
        members: joined.height() - resolved.height(),
        beacons: 0,
    };
    if unresolved.members > 0 {
        warn!(
            rows = unresolved.members,
            "m2m rows dropped for members without metadata"
        );
    }
    Ok((resolved, unresolved))
}

/// Sum `minutes` per time bucket and pair.
pub fn aggregate(
    m2m_dbl: &DataFrame,
    granularity: Granularity,
    level: PairLevel,
) -> Result<DataFrame, ProximityError> {
    let (side1, side2) = level.columns();
    require_columns(m2m_dbl, &[common::DATETIME, side1, side2, m2m::MINUTES])?;

    let times = timestamps_us(m2m_dbl, common::DATETIME)?;
    let buckets: Vec<Option<i64>> = times
        .into_iter()
        .map(|t| t.and_then(from_us).map(|ts| to_us(granularity.bucket_start(ts))))
        .collect();
    let bucket_col: Column = Series::new(common::DATETIME.into(), &buckets)
        .cast(&crate::time::datetime_dtype())?
        .into();

    let mut bucketed = m2m_dbl.select([side1, side2, m2m::MINUTES])?;
    bucketed.with_column(bucket_col)?;

    let minutes = if level.halves_same_side() {
        when(col(side1).eq(col(side2)))
            .then(col(m2m::MINUTES) / lit(2.0))
            .otherwise(col(m2m::MINUTES))
            .alias(m2m::MINUTES)
    } else {
        col(m2m::MINUTES)
    };

    let df = bucketed
        .lazy()
        .group_by([col(common::DATETIME), col(side1), col(side2)])
        .agg([col(m2m::MINUTES).sum()])
        .select([col(common::DATETIME), col(side1), col(side2), minutes])
        .sort(
            [common::DATETIME, side1, side2],
            SortMultipleOptions::default(),
        )
        .collect()?;
    info!(?granularity, ?level, records = df.height(), "aggregated connections");
    Ok(df)
}

/// Every table produced for one RSSI cutoff.
pub struct ConnectionTables {
    pub rssi_cutoff: i32,
    pub m2m_comply_filtered: DataFrame,
    pub m2m_dbl: DataFrame,
    pub m2m_dbl_daily: DataFrame,
    pub m2m_dbl_annual: DataFrame,
    pub m2c_daily: DataFrame,
    pub m2c_annual: DataFrame,
    pub c2c_dbl_daily: DataFrame,
    pub c2c_dbl_annual: DataFrame,
    pub unresolved: Unresolved,
}

impl ConnectionTables {
    /// Build all tables for one cutoff from the trusted m2m relation.
    pub fn build(
        trusted_m2m: &DataFrame,
        members: &MemberDirectory,
        rssi_cutoff: i32,
        bin_minutes: f64,
    ) -> Result<Self, ProximityError> {
        info!(rssi_cutoff, "building connection tables");
        let m2m_comply_filtered = filter_cutoff(trusted_m2m, rssi_cutoff)?;
        let m2m_dbl = make_double_sided(&m2m_comply_filtered, bin_minutes)?;

        let m2m_dbl_daily = aggregate(&m2m_dbl, Granularity::Daily, PairLevel::MemberToMember)?;
        let m2m_dbl_annual = aggregate(&m2m_dbl, Granularity::Annual, PairLevel::MemberToMember)?;

        let (with_company, unresolved) = add_companies(&m2m_dbl, members)?;
        let m2c_daily = aggregate(&with_company, Granularity::Daily, PairLevel::MemberToCompany)?;
        let m2c_annual = aggregate(&with_company, Granularity::Annual, PairLevel::MemberToCompany)?;
        let c2c_dbl_daily =
            aggregate(&with_company, Granularity::Daily, PairLevel::CompanyToCompany)?;
        let c2c_dbl_annual =
            aggregate(&with_company, Granularity::Annual, PairLevel::CompanyToCompany)?;

        Ok(Self {
            rssi_cutoff,
            m2m_comply_filtered,
            m2m_dbl,
            m2m_dbl_daily,
            m2m_dbl_annual,
            m2c_daily,
            m2c_annual,
            c2c_dbl_daily,
            c2c_dbl_annual,
            unresolved,
        })
    }

    /// `(store key, table)` pairs, one per table.
    pub fn keyed(&self) -> Vec<(String, &DataFrame)> {
        let key = |table: &str| keys::connections_key(self.rssi_cutoff, table);
        vec![
            (key(keys::M2M_COMPLY_FILTERED), &self.m2m_comply_filtered),
            (key(keys::M2M_DBL), &self.m2m_dbl),
            (key(keys::M2M_DBL_DAILY), &self.m2m_dbl_daily),
            (key(keys::M2M_DBL_ANNUAL), &self.m2m_dbl_annual),
            (key(keys::M2C_DAILY), &self.m2c_daily),
            (key(keys::M2C_ANNUAL), &self.m2c_annual),
            (key(keys::C2C_DBL_DAILY), &self.c2c_dbl_daily),
            (key(keys::C2C_DBL_ANNUAL), &self.c2c_dbl_annual),
        ]
    }
}

/// Member-to-member frame from plain slices.
pub fn m2m_frame(
    times_us: &[i64],
    member1: &[&str],
    member2: &[&str],
    rssi_max: &[f64],
) -> Result<DataFrame, ProximityError> {
    Ok(DataFrame::new(vec![
        datetime_column(common::DATETIME, times_us)?,
        Column::new(m2m::MEMBER1.into(), member1),
        Column::new(m2m::MEMBER2.into(), member2),
        Column::new(m2m::RSSI_MAX.into(), rssi_max),
    ])?)
}
