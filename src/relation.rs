use polars::prelude::*;
use tracing::info;

use crate::error::ProximityError;
use crate::metadata::require_columns;
use crate::schema::{comply, common, m2m};

/// Keep the member-to-member records where both sides wore their badge.
///
/// Compliance is joined on `(datetime, member1)` and `(datetime, member2)`
/// separately. A side without a compliance entry counts as not compliant.
pub fn filter_compliant(
    m2m_df: &DataFrame,
    m_comply: &DataFrame,
) -> Result<DataFrame, ProximityError> {
    require_columns(m2m_df, &[common::DATETIME, m2m::MEMBER1, m2m::MEMBER2])?;
    require_columns(m_comply, &[common::DATETIME, common::MEMBER, comply::COMPLY])?;

    let side = |member_col: &str, comply_col: &str| {
        m_comply.clone().lazy().select([
            col(common::DATETIME),
            col(common::MEMBER).alias(member_col),
            col(comply::COMPLY).alias(comply_col),
        ])
    };

    let output_cols: Vec<Expr> = m2m_df
        .get_column_names_str()
        .iter()
        .map(|c| col(*c))
        .collect();

    let df = m2m_df
        .clone()
        .lazy()
        .join(
            side(m2m::MEMBER1, comply::COMPLY1),
            [col(common::DATETIME), col(m2m::MEMBER1)],
            [col(common::DATETIME), col(m2m::MEMBER1)],
            JoinArgs::new(JoinType::Left),
        )
        .join(
            side(m2m::MEMBER2, comply::COMPLY2),
            [col(common::DATETIME), col(m2m::MEMBER2)],
            [col(common::DATETIME), col(m2m::MEMBER2)],
            JoinArgs::new(JoinType::Left),
        )
        .filter(
            col(comply::COMPLY1)
                .fill_null(lit(false))
                .and(col(comply::COMPLY2).fill_null(lit(false))),
        )
        .select(output_cols)
        .sort(
            [common::DATETIME, m2m::MEMBER1, m2m::MEMBER2],
            SortMultipleOptions::default(),
        )
        .collect()?;

    info!(before = m2m_df.height(), after = df.height(), "m2m compliance filter");
    Ok(df)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::datetime_column;

    const T0: i64 = 1_528_804_800_000_000;
    const BIN: i64 = 15_000_000;

    fn m_comply() -> DataFrame {
        DataFrame::new(vec![
            datetime_column(common::DATETIME, &[T0, T0, T0, T0 + BIN, T0 + BIN]).unwrap(),
            Column::new(common::MEMBER.into(), &["A", "B", "C", "A", "B"]),
            Column::new(comply::COMPLY.into(), &[true, true, false, true, true]),
        ])
        .unwrap()
    }

    #[test]
    fn keeps_only_both_sides_compliant() {
        let m2m_df = DataFrame::new(vec![
            datetime_column(
                common::DATETIME,
                &[T0, T0, T0 + BIN, T0 + 2 * BIN, T0 + BIN],
            )
            .unwrap(),
            Column::new(m2m::MEMBER1.into(), &["A", "A", "A", "A", "B"]),
            Column::new(m2m::MEMBER2.into(), &["B", "C", "B", "B", "D"]),
            Column::new(m2m::RSSI_MAX.into(), &[-50.0, -51.0, -52.0, -53.0, -54.0]),
        ])
        .unwrap();

        let out = filter_compliant(&m2m_df, &m_comply()).unwrap();
        assert!(out.height() <= m2m_df.height());
        let rssi: Vec<Option<f64>> = out
            .column(m2m::RSSI_MAX)
            .unwrap()
            .f64()
            .unwrap()
            .into_iter()
            .collect();
        // C is non-compliant, bin 2 has no compliance, D is unknown
        assert_eq!(rssi, vec![Some(-50.0), Some(-52.0)]);
        assert_eq!(
            out.get_column_names_str(),
            m2m_df.get_column_names_str()
        );
    }
}
