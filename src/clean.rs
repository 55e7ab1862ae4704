//! Participation-window and blackout filtering of the raw proximity tables.

use polars::prelude::*;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::error::ProximityError;
use crate::metadata::{require_columns, MemberDirectory, ParticipationWindows};
use crate::schema::{common, keys, m2m};
use crate::time::{blackout_windows, timestamps_us, BlackoutWindow};

/// Raw tables that go through the cleaner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProximityTable {
    MemberToMember,
    MemberToBeacon,
    Member5ClosestBeacons,
}

impl ProximityTable {
    pub const ALL: [ProximityTable; 3] = [
        ProximityTable::MemberToMember,
        ProximityTable::MemberToBeacon,
        ProximityTable::Member5ClosestBeacons,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Self::MemberToMember => keys::MEMBER_TO_MEMBER,
            Self::MemberToBeacon => keys::MEMBER_TO_BEACON,
            Self::Member5ClosestBeacons => keys::MEMBER_5_CLOSEST_BEACONS,
        }
    }

    /// Member columns that must each be inside their own window.
    pub fn member_columns(&self) -> &'static [&'static str] {
        match self {
            Self::MemberToMember => &[m2m::MEMBER1, m2m::MEMBER2],
            Self::MemberToBeacon | Self::Member5ClosestBeacons => &[common::MEMBER],
        }
    }
}

pub struct WindowCleaner {
    windows: ParticipationWindows,
    blackouts: Vec<BlackoutWindow>,
}

impl WindowCleaner {
    pub fn new(members: &MemberDirectory, config: &PipelineConfig) -> Self {
        Self::from_parts(members.participation_windows(), blackout_windows(config))
    }

    pub fn from_parts(windows: ParticipationWindows, blackouts: Vec<BlackoutWindow>) -> Self {
        Self { windows, blackouts }
    }

    pub fn blackouts(&self) -> &[BlackoutWindow] {
        &self.blackouts
    }

    fn in_window(&self, member: &str, t: i64) -> bool {
        self.windows
            .get(member)
            .is_some_and(|ws| ws.iter().any(|&(start, end)| start <= t && t < end))
    }

    fn in_blackout(&self, t: i64) -> bool {
        self.blackouts.iter().any(|b| b.contains_us(t))
    }

    /// Keep the rows whose members are all inside their participation window
    /// and whose timestamp is outside every blackout.
    ///
    /// Returns `None` for an empty input. Surviving rows keep their order.
    pub fn clean(
        &self,
        table: ProximityTable,
        df: &DataFrame,
    ) -> Result<Option<DataFrame>, ProximityError> {
        info!(table = table.key(), rows = df.height(), "cleaning");
        if df.height() == 0 {
            return Ok(None);
        }

        let member_columns = table.member_columns();
        let mut required = vec![common::DATETIME];
        required.extend_from_slice(member_columns);
        require_columns(df, &required)?;

        let times = timestamps_us(df, common::DATETIME)?;
        let sides = member_columns
            .iter()
            .map(|name| df.column(name).and_then(|c| c.str()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut keep: Vec<bool> = (0..df.height())
            .map(|i| {
                times.get(i).is_some_and(|t| {
                    sides
                        .iter()
                        .all(|side| side.get(i).is_some_and(|m| self.in_window(m, t)))
                })
            })
            .collect();
        debug!(
            table = table.key(),
            kept = keep.iter().filter(|k| **k).count(),
            "after participation windows"
        );

        for (i, k) in keep.iter_mut().enumerate() {
            if *k && times.get(i).is_some_and(|t| self.in_blackout(t)) {
                *k = false;
            }
        }

        let mask = BooleanChunked::new("keep".into(), keep.as_slice());
        let cleaned = df.filter(&mask)?;
        info!(table = table.key(), rows = cleaned.height(), "after cleaning");
        Ok(Some(cleaned))
    }
}
