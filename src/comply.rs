//! Badge-worn ("compliance") inference.
//!
//! Two heuristics are computed per `(datetime, member)` bin:
//!
//! * closest beacon: worn unless the closest beacon is the board.
//!   Missing bins are filled with `false`.
//! * max neighbour RSSI: worn unless another member's badge is stronger than
//!   the board threshold (badges stacked together). Missing bins are filled
//!   with `true`.
//!
//! Each one is gap-filled on its own grid before they are AND-ed, with the
//! closest-beacon grid leading.

use std::collections::BTreeMap;

use polars::prelude::*;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::error::ProximityError;
use crate::metadata::require_columns;
use crate::schema::{beacon_type, comply, common, m1cb, m2badge};
use crate::time::{datetime_column, timestamps_us};

/// Closest-beacon heuristic: `comply` is true unless the beacon is the board.
pub fn closest_beacon_method(m1cb_df: &DataFrame) -> Result<DataFrame, ProximityError> {
    require_columns(m1cb_df, &[common::DATETIME, common::MEMBER, m1cb::BEACON_TYPE])?;
    let df = m1cb_df
        .clone()
        .lazy()
        .select([
            col(common::DATETIME),
            col(common::MEMBER),
            col(m1cb::BEACON_TYPE)
                .neq(lit(beacon_type::BOARD))
                .fill_null(lit(false))
                .alias(comply::COMPLY),
        ])
        .collect()?;
    Ok(df)
}

/// Max-RSSI heuristic over member badges only.
///
/// `comply` is true when the strongest other-member reading in the bin is at
/// or below `board_threshold`.
pub fn max_rssi_method(
    m2badge_df: &DataFrame,
    board_threshold: f64,
    member_id_limit: i64,
) -> Result<DataFrame, ProximityError> {
    require_columns(
        m2badge_df,
        &[common::DATETIME, common::MEMBER, m2badge::OBSERVED_ID, common::RSSI],
    )?;
    let df = m2badge_df
        .clone()
        .lazy()
        .filter(
            col(m2badge::OBSERVED_ID)
                .cast(DataType::Int64)
                .lt(lit(member_id_limit)),
        )
        .group_by([col(common::DATETIME), col(common::MEMBER)])
        .agg([col(common::RSSI)
            .cast(DataType::Float64)
            .max()
            .alias(comply::MAX_RSSI)])
        .with_columns([col(comply::MAX_RSSI)
            .lt_eq(lit(board_threshold))
            .alias(comply::COMPLY)])
        .sort(
            [common::DATETIME, common::MEMBER],
            SortMultipleOptions::default(),
        )
        .collect()?;
    Ok(df)
}

/// Resample each member onto the regular bin grid spanning its observed
/// range and fill missing bins with `fill`.
///
/// Output columns: `datetime, member, comply`, sorted by `(datetime, member)`.
pub fn fill_gaps(df: &DataFrame, bin_us: i64, fill: bool) -> Result<DataFrame, ProximityError> {
    require_columns(df, &[common::DATETIME, common::MEMBER, comply::COMPLY])?;
    if bin_us <= 0 {
        return Err(ProximityError::Config("bin width must be positive".into()));
    }

    let times = timestamps_us(df, common::DATETIME)?;
    let members = df.column(common::MEMBER)?.str()?;
    let values = df.column(comply::COMPLY)?.bool()?;

    let mut per_member: BTreeMap<&str, BTreeMap<i64, Option<bool>>> = BTreeMap::new();
    for i in 0..df.height() {
        if let (Some(t), Some(m)) = (times.get(i), members.get(i)) {
            per_member.entry(m).or_default().insert(t, values.get(i));
        }
    }

    let mut out_time = Vec::new();
    let mut out_member = Vec::new();
    let mut out_comply = Vec::new();
    for (member, observed) in &per_member {
        let (Some((&first, _)), Some((&last, _))) =
            (observed.first_key_value(), observed.last_key_value())
        else {
            continue;
        };
        let mut t = first;
        while t <= last {
            out_time.push(t);
            out_member.push(*member);
            out_comply.push(observed.get(&t).copied().flatten().unwrap_or(fill));
            t += bin_us;
        }
    }
    debug!(
        before = df.height(),
        after = out_time.len(),
        fill,
        "filled compliance gaps"
    );

    let filled = DataFrame::new(vec![
        datetime_column(common::DATETIME, &out_time)?,
        Column::new(common::MEMBER.into(), &out_member),
        Column::new(comply::COMPLY.into(), &out_comply),
    ])?
    .lazy()
    .sort(
        [common::DATETIME, common::MEMBER],
        SortMultipleOptions::default(),
    )
    .collect()?;
    Ok(filled)
}

/// Combine the two filled heuristics on the closest-beacon grid.
///
/// Bins missing from the max-RSSI side count as compliant.
pub fn combine(cb_filled: &DataFrame, rssi_filled: &DataFrame) -> Result<DataFrame, ProximityError> {
    let rssi = rssi_filled.clone().lazy().select([
        col(common::DATETIME),
        col(common::MEMBER),
        col(comply::COMPLY).alias(comply::COMPLY2),
    ]);
    let df = cb_filled
        .clone()
        .lazy()
        .join(
            rssi,
            [col(common::DATETIME), col(common::MEMBER)],
            [col(common::DATETIME), col(common::MEMBER)],
            JoinArgs::new(JoinType::Left),
        )
        .select([
            col(common::DATETIME),
            col(common::MEMBER),
            col(comply::COMPLY)
                .and(col(comply::COMPLY2).fill_null(lit(true)))
                .alias(comply::COMPLY),
        ])
        .sort(
            [common::DATETIME, common::MEMBER],
            SortMultipleOptions::default(),
        )
        .collect()?;
    Ok(df)
}

/// Per-bin compliance from the nearest-beacon table and raw badge readings.
pub fn compliance(
    m2badge_df: &DataFrame,
    m1cb_df: &DataFrame,
    config: &PipelineConfig,
) -> Result<DataFrame, ProximityError> {
    let bin_us = config.bin_us();

    let c_cb = closest_beacon_method(m1cb_df)?;
    let c_maxrssi = max_rssi_method(
        m2badge_df,
        config.compliance.board_rssi_threshold,
        config.compliance.member_id_limit,
    )?;

    // No closest beacon means not worn; no close neighbour means nothing
    // contradicts the badge being worn.
    let c_cb_fill = fill_gaps(&c_cb, bin_us, false)?;
    let c_maxrssi_fill = fill_gaps(&c_maxrssi, bin_us, true)?;

    let combo = combine(&c_cb_fill, &c_maxrssi_fill)?;
    info!(rows = combo.height(), "compliance table ready");
    Ok(combo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::m2b;

    const T0: i64 = 1_528_804_800_000_000;
    const BIN: i64 = 15_000_000;

    fn comply_values(df: &DataFrame) -> Vec<(i64, String, bool)> {
        let times = timestamps_us(df, common::DATETIME).unwrap();
        let members = df.column(common::MEMBER).unwrap().str().unwrap();
        let values = df.column(comply::COMPLY).unwrap().bool().unwrap();
        (0..df.height())
            .map(|i| {
                (
                    (times.get(i).unwrap() - T0) / BIN,
                    members.get(i).unwrap().to_string(),
                    values.get(i).unwrap(),
                )
            })
            .collect()
    }

    fn m1cb_df(times: &[i64], members: &[&str], kinds: &[&str]) -> DataFrame {
        DataFrame::new(vec![
            datetime_column(common::DATETIME, times).unwrap(),
            Column::new(common::MEMBER.into(), members),
            Column::new(m2b::BEACON.into(), kinds),
            Column::new(m1cb::BEACON_TYPE.into(), kinds),
        ])
        .unwrap()
    }

    #[test]
    fn board_is_not_worn() {
        let df = m1cb_df(&[T0, T0], &["A", "B"], &["board", "company"]);
        let out = closest_beacon_method(&df).unwrap();
        let v = comply_values(&out);
        assert!(!v[0].2);
        assert!(v[1].2);
    }

    #[test]
    fn max_rssi_ignores_beacons_and_uses_threshold() {
        let df = DataFrame::new(vec![
            datetime_column(common::DATETIME, &[T0, T0, T0, T0 + BIN]).unwrap(),
            Column::new(common::MEMBER.into(), &["A", "A", "B", "B"]),
            Column::new(m2badge::OBSERVED_ID.into(), &[2i64, 16001, 1, 1]),
            Column::new(common::RSSI.into(), &[-60.0, -30.0, -48.0, -40.0]),
        ])
        .unwrap();
        let out = max_rssi_method(&df, -48.0, 16000).unwrap();
        assert_eq!(
            comply_values(&out),
            vec![
                (0, "A".into(), true),
                (0, "B".into(), true),
                (1, "B".into(), false),
            ]
        );
    }

    #[test]
    fn fill_defaults_are_asymmetric() {
        let cb = DataFrame::new(vec![
            datetime_column(common::DATETIME, &[T0, T0 + 2 * BIN]).unwrap(),
            Column::new(common::MEMBER.into(), &["A", "A"]),
            Column::new(comply::COMPLY.into(), &[true, true]),
        ])
        .unwrap();
        let rssi = DataFrame::new(vec![
            datetime_column(common::DATETIME, &[T0, T0 + 2 * BIN]).unwrap(),
            Column::new(common::MEMBER.into(), &["A", "A"]),
            Column::new(comply::COMPLY.into(), &[false, false]),
        ])
        .unwrap();

        let cb_fill = fill_gaps(&cb, BIN, false).unwrap();
        let rssi_fill = fill_gaps(&rssi, BIN, true).unwrap();
        assert_eq!(comply_values(&cb_fill)[1], (1, "A".into(), false));
        assert_eq!(comply_values(&rssi_fill)[1], (1, "A".into(), true));

        let combo = combine(&cb_fill, &rssi_fill).unwrap();
        assert_eq!(
            comply_values(&combo),
            vec![
                (0, "A".into(), false),
                (1, "A".into(), false),
                (2, "A".into(), false),
            ]
        );
    }

    #[test]
    fn missing_rssi_bins_do_not_penalize() {
        let cb = DataFrame::new(vec![
            datetime_column(common::DATETIME, &[T0, T0 + BIN]).unwrap(),
            Column::new(common::MEMBER.into(), &["A", "A"]),
            Column::new(comply::COMPLY.into(), &[true, true]),
        ])
        .unwrap();
        let rssi = DataFrame::new(vec![
            datetime_column(common::DATETIME, &[T0 + BIN]).unwrap(),
            Column::new(common::MEMBER.into(), &["B"]),
            Column::new(comply::COMPLY.into(), &[false]),
        ])
        .unwrap();
        let combo = combine(&cb, &rssi).unwrap();
        assert_eq!(
            comply_values(&combo),
            vec![(0, "A".into(), true), (1, "A".into(), true)]
        );
    }

    #[test]
    fn grid_spans_each_member_separately() {
        let df = DataFrame::new(vec![
            datetime_column(common::DATETIME, &[T0, T0 + 3 * BIN, T0 + 2 * BIN]).unwrap(),
            Column::new(common::MEMBER.into(), &["A", "A", "B"]),
            Column::new(comply::COMPLY.into(), &[true, true, true]),
        ])
        .unwrap();
        let filled = fill_gaps(&df, BIN, false).unwrap();
        // A: bins 0..=3, B: bin 2 only
        assert_eq!(filled.height(), 5);
    }
}
