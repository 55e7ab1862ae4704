use std::fs;
use std::path::Path;

use badge_proximity::config::{PathsConfig, PipelineConfig, StudyPeriod};
use badge_proximity::schema::{common, keys, m2b, m2badge, m5cb};
use badge_proximity::store::TableStore;
use badge_proximity::time::{datetime_column, to_us};
use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::*;

pub const BIN: i64 = 15_000_000;

/// Initialize tracing once for integration tests.
pub fn init_tracing() {
    badge_proximity::logging::init_tracing("debug");
}

pub fn ts(d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2018, 6, d)
        .unwrap()
        .and_hms_opt(h, mi, s)
        .unwrap()
}

/// First bin of the fixture data, 2018-06-12 09:00:00.
pub fn t0() -> i64 {
    to_us(ts(12, 9, 0, 0))
}

/// Config rooted at `dir`: one period spanning two day chunks, cutoffs
/// -51 and -60.
pub fn temp_config(dir: &Path) -> PipelineConfig {
    PipelineConfig {
        periods: vec![StudyPeriod::new(ts(12, 8, 0, 0), ts(13, 8, 0, 0))],
        rssi_cutoffs: vec![-51, -60],
        workers: 2,
        paths: PathsConfig {
            metadata_dir: dir.join("metadata"),
            members_file: "members.csv".into(),
            beacons_file: "beacons.csv".into(),
            dirty_store: dir.join("data_dirty"),
            clean_store: dir.join("data_cleaned"),
            analysis_store: dir.join("analysis"),
        },
        ..PipelineConfig::default()
    }
}

/// A, C at acme and B at globex participate; N never does.
pub fn write_metadata(config: &PipelineConfig) {
    write_metadata_starting(config, "2018-06-01");
}

/// Same members, with every participation window opening on `start_date`.
pub fn write_metadata_starting(config: &PipelineConfig, start_date: &str) {
    fs::create_dir_all(&config.paths.metadata_dir).unwrap();
    fs::write(
        config.paths.members_path(),
        format!(
            "member,member_id,company,participates,start_date,end_date\n\
             A,1,acme,1,{start_date},2018-07-01\n\
             B,2,globex,1,{start_date},2018-07-01\n\
             C,3,acme,1,{start_date},2018-07-01\n\
             N,4,globex,0,,\n"
        ),
    )
    .unwrap();
    fs::write(
        config.paths.beacons_path(),
        "beacon,beacon_id,company,type,nearby_companies\n\
         bb,16001,hub,board,\n\
         ka,16002,acme,company,globex\n\
         kg,16003,globex,company,acme\n",
    )
    .unwrap();
}

fn m5cb_frame(times: &[i64], members: &[&str], beacons: &[&str], rssi: &[f64]) -> DataFrame {
    let mut columns = vec![
        datetime_column(common::DATETIME, times).unwrap(),
        Column::new(common::MEMBER.into(), members),
        Column::new(m5cb::BEACON_0.into(), beacons),
        Column::new(m5cb::RSSI_0.into(), rssi),
    ];
    let none_beacon: Vec<Option<&str>> = vec![None; times.len()];
    let missing_rssi: Vec<f64> = vec![m5cb::RSSI_MISSING; times.len()];
    for slot in 1..m5cb::SLOTS {
        columns.push(Column::new(m5cb::beacon_slot(slot).into(), &none_beacon));
        columns.push(Column::new(m5cb::rssi_slot(slot).into(), &missing_rssi));
    }
    DataFrame::new(columns).unwrap()
}

/// Raw tables for three bins starting at `t0()`:
///
/// * A is closest to the board, B and C to their own company beacon.
/// * A-B are near each other at -50 every bin, B-C at -55, -55, -70.
/// * N is seen near B but does not participate.
/// * C has one extra bin at an unknown beacon.
pub fn write_dirty_store(config: &PipelineConfig) -> TableStore {
    let store = TableStore::new(&config.paths.dirty_store);
    let t = t0();
    let bins = [t, t + BIN, t + 2 * BIN];

    let m2m_df = badge_proximity::connections::m2m_frame(
        &[bins[0], bins[1], bins[2], bins[0], bins[1], bins[2], bins[0]],
        &["A", "A", "A", "B", "B", "B", "N"],
        &["B", "B", "B", "C", "C", "C", "B"],
        &[-50.0, -50.0, -50.0, -55.0, -55.0, -70.0, -45.0],
    )
    .unwrap();
    store.put(keys::MEMBER_TO_MEMBER, &m2m_df).unwrap();

    let mut times = Vec::new();
    let mut members = Vec::new();
    let mut beacons = Vec::new();
    for &b in &bins {
        for (member, beacon) in [("A", "bb"), ("B", "kg"), ("C", "ka"), ("N", "kg")] {
            times.push(b);
            members.push(member);
            beacons.push(beacon);
        }
    }
    times.push(t + 3 * BIN);
    members.push("C");
    beacons.push("zz");
    let rssi = vec![-60.0; times.len()];
    let m5cb_df = m5cb_frame(&times, &members, &beacons, &rssi);
    store.put(keys::MEMBER_5_CLOSEST_BEACONS, &m5cb_df).unwrap();

    let m2b_df = DataFrame::new(vec![
        datetime_column(common::DATETIME, &times).unwrap(),
        Column::new(common::MEMBER.into(), &members),
        Column::new(m2b::BEACON.into(), &beacons),
        Column::new(common::RSSI.into(), &rssi),
    ])
    .unwrap();
    store.put(keys::MEMBER_TO_BEACON, &m2b_df).unwrap();

    // B hears C's badge well below the stacking threshold, A hears a beacon id
    // loudly, which the badge heuristic ignores.
    let m2badge_df = DataFrame::new(vec![
        datetime_column(common::DATETIME, &[bins[0], bins[1], bins[0]]).unwrap(),
        Column::new(common::MEMBER.into(), &["B", "B", "A"]),
        Column::new(m2badge::OBSERVED_ID.into(), &[3i64, 3, 16001]),
        Column::new(common::RSSI.into(), &[-60.0, -62.0, -40.0]),
    ])
    .unwrap();
    store.put(keys::MEMBER_TO_BADGE, &m2badge_df).unwrap();

    store
}

/// Replace the raw badge readings with one reading outside the study period,
/// so every chunk sees no neighbour RSSI at all.
pub fn clear_badge_readings(store: &TableStore) {
    let outside = to_us(ts(20, 9, 0, 0));
    let m2badge_df = DataFrame::new(vec![
        datetime_column(common::DATETIME, &[outside]).unwrap(),
        Column::new(common::MEMBER.into(), &["B"]),
        Column::new(m2badge::OBSERVED_ID.into(), &[3i64]),
        Column::new(common::RSSI.into(), &[-30.0]),
    ])
    .unwrap();
    store.put(keys::MEMBER_TO_BADGE, &m2badge_df).unwrap();
}
