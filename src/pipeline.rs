//! Stage orchestration.
//!
//! A run goes clean -> comply -> metadata -> connections. The clean and
//! comply stages fan out over day chunks; connection tables are built once
//! per RSSI cutoff from the merged trusted relation. Every stage reads from
//! one store and writes into the next, so stages can also be re-run alone.

use std::path::Path;

use polars::prelude::*;
use tracing::{debug, info, warn};

use crate::clean::{ProximityTable, WindowCleaner};
use crate::comply::compliance;
use crate::config::PipelineConfig;
use crate::connections::ConnectionTables;
use crate::error::ProximityError;
use crate::location::build_m1cb;
use crate::logging::init_tracing;
use crate::metadata::{BeaconDirectory, MemberDirectory, Unresolved};
use crate::partition::{concat_frames, fan_out, study_chunks, ChunkOutcome, TimeChunk};
use crate::relation::filter_compliant;
use crate::schema::keys;
use crate::store::TableStore;

/// A chunk whose work failed, with the error text.
#[derive(Debug, Clone)]
pub struct ChunkFailure {
    pub chunk: TimeChunk,
    pub error: String,
}

/// Chunk bookkeeping for one fanned-out stage.
#[derive(Debug, Clone, Default)]
pub struct StageSummary {
    pub processed: usize,
    pub empty: usize,
    pub failed: Vec<ChunkFailure>,
}

/// Connection tables built (with their unresolved counts) and cutoffs that failed.
#[derive(Debug, Clone, Default)]
pub struct ConnectionsSummary {
    pub built: Vec<(i32, Unresolved)>,
    pub failed: Vec<(i32, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub clean: StageSummary,
    pub comply: StageSummary,
    pub connections: ConnectionsSummary,
    /// m1cb rows dropped for unknown members or beacons.
    pub unresolved: Unresolved,
}

impl RunSummary {
    pub fn failed_chunks(&self) -> usize {
        self.clean.failed.len() + self.comply.failed.len()
    }

    fn log(&self) {
        info!(
            clean_processed = self.clean.processed,
            clean_empty = self.clean.empty,
            clean_failed = self.clean.failed.len(),
            comply_processed = self.comply.processed,
            comply_empty = self.comply.empty,
            comply_failed = self.comply.failed.len(),
            cutoffs_built = self.connections.built.len(),
            cutoffs_failed = self.connections.failed.len(),
            unresolved_members = self.unresolved.members,
            unresolved_beacons = self.unresolved.beacons,
            "pipeline finished"
        );
    }
}

/// Output of the comply stage for one chunk. Clean-derived tables are
/// `None` on days where no participant was inside their window.
struct ComplianceChunk {
    m1cb: Option<DataFrame>,
    m_comply: Option<DataFrame>,
    m_comply_dirty: Option<DataFrame>,
    m2m_trusted: Option<DataFrame>,
    unresolved: Unresolved,
}

pub struct Pipeline {
    config: PipelineConfig,
    members: MemberDirectory,
    beacons: BeaconDirectory,
    dirty: TableStore,
    clean: TableStore,
    analysis: TableStore,
}

impl Pipeline {
    /// Validate `config` and load both metadata CSVs from its paths.
    pub fn new(config: PipelineConfig) -> Result<Self, ProximityError> {
        config.validate()?;
        let members = MemberDirectory::load(&config.paths.members_path())?;
        let beacons = BeaconDirectory::load(&config.paths.beacons_path())?;
        Self::with_metadata(config, members, beacons)
    }

    pub fn with_metadata(
        config: PipelineConfig,
        members: MemberDirectory,
        beacons: BeaconDirectory,
    ) -> Result<Self, ProximityError> {
        config.validate()?;
        let dirty = TableStore::new(&config.paths.dirty_store);
        let clean = TableStore::new(&config.paths.clean_store);
        let analysis = TableStore::new(&config.paths.analysis_store);
        Ok(Self {
            config,
            members,
            beacons,
            dirty,
            clean,
            analysis,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn dirty_store(&self) -> &TableStore {
        &self.dirty
    }

    pub fn clean_store(&self) -> &TableStore {
        &self.clean
    }

    pub fn analysis_store(&self) -> &TableStore {
        &self.analysis
    }

    /// Run every stage in order.
    pub fn run(&self) -> Result<RunSummary, ProximityError> {
        info!(
            time_zone = %self.config.time_zone,
            periods = self.config.periods.len(),
            workers = self.config.workers,
            "starting pipeline"
        );
        let clean = self.clean_stage()?;
        let (comply, unresolved) = self.compliance_stage()?;
        self.metadata_stage()?;
        let connections = self.connections_stage()?;

        let summary = RunSummary {
            clean,
            comply,
            connections,
            unresolved,
        };
        summary.log();
        Ok(summary)
    }

    /// Window-clean m2m, m2b and m5cb into a fresh clean store.
    pub fn clean_stage(&self) -> Result<StageSummary, ProximityError> {
        self.clean.clear()?;
        let cleaner = WindowCleaner::new(&self.members, &self.config);
        info!(blackouts = cleaner.blackouts().len(), "clean stage");

        let chunks = study_chunks(&self.config);
        let outcomes = fan_out(&chunks, self.config.workers, |chunk| {
            let mut parts = Vec::with_capacity(ProximityTable::ALL.len());
            for table in ProximityTable::ALL {
                let raw = self.dirty.read_range(table.key(), chunk.start, chunk.end)?;
                parts.push(cleaner.clean(table, &raw)?);
            }
            if parts.iter().all(Option::is_none) {
                return Ok(None);
            }
            Ok(Some(parts))
        })?;

        let mut summary = StageSummary::default();
        let results = collect_outcomes("clean", outcomes, &mut summary);

        for (index, table) in ProximityTable::ALL.iter().enumerate() {
            let frames: Vec<DataFrame> = results
                .iter()
                .filter_map(|parts| parts.get(index).cloned().flatten())
                .collect();
            self.put_merged(&self.clean, table.key(), frames)?;
        }
        Ok(summary)
    }

    /// Derive closest beacons, compliance and the trusted m2m relation into a
    /// fresh analysis store.
    pub fn compliance_stage(&self) -> Result<(StageSummary, Unresolved), ProximityError> {
        self.analysis.clear()?;
        info!("compliance stage");

        let chunks = study_chunks(&self.config);
        let outcomes = fan_out(&chunks, self.config.workers, |chunk| {
            self.compliance_chunk(chunk)
        })?;

        let mut summary = StageSummary::default();
        let results = collect_outcomes("comply", outcomes, &mut summary);

        let mut unresolved = Unresolved::default();
        let mut m1cb = Vec::with_capacity(results.len());
        let mut m_comply = Vec::with_capacity(results.len());
        let mut m_comply_dirty = Vec::with_capacity(results.len());
        let mut m2m_trusted = Vec::with_capacity(results.len());
        for part in results {
            unresolved.merge(part.unresolved);
            m1cb.extend(part.m1cb);
            m_comply.extend(part.m_comply);
            m_comply_dirty.extend(part.m_comply_dirty);
            m2m_trusted.extend(part.m2m_trusted);
        }

        self.put_merged(&self.analysis, keys::MEMBER_CLOSEST_BEACON, m1cb)?;
        self.put_merged(&self.analysis, keys::MEMBER_COMPLY, m_comply)?;
        self.put_merged(&self.analysis, keys::MEMBER_COMPLY_DIRTY, m_comply_dirty)?;
        self.put_merged(&self.analysis, keys::MEMBER_TO_MEMBER, m2m_trusted)?;
        Ok((summary, unresolved))
    }

    fn compliance_chunk(&self, chunk: &TimeChunk) -> Result<Option<ComplianceChunk>, ProximityError> {
        let m5cb_dirty = self
            .dirty
            .read_range(keys::MEMBER_5_CLOSEST_BEACONS, chunk.start, chunk.end)?;
        let m5cb = self
            .clean
            .read_range_opt(keys::MEMBER_5_CLOSEST_BEACONS, chunk.start, chunk.end)?
            .filter(|df| df.height() > 0);
        if m5cb_dirty.height() == 0 && m5cb.is_none() {
            return Ok(None);
        }
        let m2badge = self
            .dirty
            .read_range(keys::MEMBER_TO_BADGE, chunk.start, chunk.end)?;

        // The dirty variant sees every badge, participating or not, so it is
        // there even before anyone's window opens.
        let m_comply_dirty = if m5cb_dirty.height() > 0 {
            let (m1cb_dirty, _) = build_m1cb(&m5cb_dirty, &self.members, &self.beacons)?;
            Some(compliance(&m2badge, &m1cb_dirty, &self.config)?)
        } else {
            None
        };

        let Some(m5cb) = m5cb else {
            debug!(%chunk, "no cleaned m5cb, only dirty compliance");
            return Ok(Some(ComplianceChunk {
                m1cb: None,
                m_comply: None,
                m_comply_dirty,
                m2m_trusted: None,
                unresolved: Unresolved::default(),
            }));
        };

        let (m1cb, unresolved) = build_m1cb(&m5cb, &self.members, &self.beacons)?;
        let m_comply = compliance(&m2badge, &m1cb, &self.config)?;

        let m2m_trusted = match self
            .clean
            .read_range_opt(keys::MEMBER_TO_MEMBER, chunk.start, chunk.end)?
        {
            Some(m2m) if m2m.height() > 0 => Some(filter_compliant(&m2m, &m_comply)?),
            _ => None,
        };

        Ok(Some(ComplianceChunk {
            m1cb: Some(m1cb),
            m_comply: Some(m_comply),
            m_comply_dirty,
            m2m_trusted,
            unresolved,
        }))
    }

    /// Persist the participating members with parsed window bounds.
    pub fn metadata_stage(&self) -> Result<(), ProximityError> {
        let df = self.members.participants_frame()?;
        info!(members = df.height(), "metadata stage");
        self.analysis.put(keys::METADATA_MEMBERS, &df)
    }

    /// Build and store the connection tables for every configured cutoff.
    ///
    /// A failing cutoff is logged and skipped.
    pub fn connections_stage(&self) -> Result<ConnectionsSummary, ProximityError> {
        let mut summary = ConnectionsSummary::default();
        if !self.analysis.contains(keys::MEMBER_TO_MEMBER) {
            warn!("no trusted member-to-member table, skipping connections");
            return Ok(summary);
        }
        let trusted = self.analysis.read(keys::MEMBER_TO_MEMBER)?;
        info!(rows = trusted.height(), cutoffs = ?self.config.rssi_cutoffs, "connections stage");

        for &cutoff in &self.config.rssi_cutoffs {
            let result = ConnectionTables::build(
                &trusted,
                &self.members,
                cutoff,
                self.config.bin_minutes(),
            )
            .and_then(|tables| {
                for (key, df) in tables.keyed() {
                    self.analysis.put(&key, df)?;
                }
                Ok(tables.unresolved)
            });
            match result {
                Ok(unresolved) => summary.built.push((cutoff, unresolved)),
                Err(e) => {
                    warn!(rssi_cutoff = cutoff, error = %e, "connection tables failed");
                    summary.failed.push((cutoff, e.to_string()));
                }
            }
        }
        Ok(summary)
    }

    fn put_merged(
        &self,
        store: &TableStore,
        key: &str,
        frames: Vec<DataFrame>,
    ) -> Result<(), ProximityError> {
        match concat_frames(frames)? {
            Some(df) => {
                info!(key, rows = df.height(), "writing table");
                store.put(key, &df)
            }
            None => {
                warn!(key, "no rows for table, nothing written");
                Ok(())
            }
        }
    }
}

/// Unpack chunk outcomes in order, counting empty and failed chunks.
fn collect_outcomes<T>(
    stage: &str,
    outcomes: Vec<ChunkOutcome<Option<T>>>,
    summary: &mut StageSummary,
) -> Vec<T> {
    let mut results = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        match outcome.result {
            Ok(Some(value)) => {
                summary.processed += 1;
                results.push(value);
            }
            Ok(None) => {
                summary.empty += 1;
                debug!(stage, chunk = %outcome.chunk, "chunk had no rows");
            }
            Err(e) => {
                warn!(stage, chunk = %outcome.chunk, error = %e, "chunk failed");
                summary.failed.push(ChunkFailure {
                    chunk: outcome.chunk,
                    error: e.to_string(),
                });
            }
        }
    }
    results
}

/// Load the TOML config at `config_path`, set up logging and run every stage.
pub fn run_pipeline(config_path: &Path) -> Result<RunSummary, ProximityError> {
    let config = PipelineConfig::load(config_path)?;
    init_tracing(&config.log_level);
    Pipeline::new(config)?.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn chunk() -> TimeChunk {
        let day = NaiveDate::from_ymd_opt(2018, 6, 12).unwrap();
        TimeChunk {
            start: day.and_hms_opt(0, 0, 0).unwrap(),
            end: day.and_hms_opt(23, 59, 59).unwrap(),
        }
    }

    #[test]
    fn outcomes_are_counted_per_kind() {
        let outcomes = vec![
            ChunkOutcome {
                chunk: chunk(),
                result: Ok(Some(1)),
            },
            ChunkOutcome {
                chunk: chunk(),
                result: Ok(None),
            },
            ChunkOutcome {
                chunk: chunk(),
                result: Err(ProximityError::TableNotFound("proximity/m2m".into())),
            },
            ChunkOutcome {
                chunk: chunk(),
                result: Ok(Some(4)),
            },
        ];
        let mut summary = StageSummary::default();
        let values = collect_outcomes("test", outcomes, &mut summary);
        assert_eq!(values, vec![1, 4]);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.empty, 1);
        assert_eq!(summary.failed.len(), 1);
        assert!(summary.failed[0].error.contains("proximity/m2m"));
    }

    #[test]
    fn invalid_config_is_rejected_before_any_work() {
        let config = PipelineConfig {
            workers: 0,
            ..PipelineConfig::default()
        };
        let result = Pipeline::with_metadata(
            config,
            MemberDirectory::default(),
            BeaconDirectory::default(),
        );
        assert!(matches!(result, Err(ProximityError::Config(_))));
    }
}
