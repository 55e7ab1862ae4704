//! Keyed table store.
//!
//! Each key (`proximity/rssi_51/m2c_daily`, ...) is one parquet file under
//! the store root. A root that does not exist yet is created on first write.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use polars::prelude::*;
use tracing::{debug, info};

use crate::error::ProximityError;
use crate::partition::concat_frames;
use crate::schema::common;
use crate::time::{in_range, normalize_datetime};

const EXTENSION: &str = "parquet";

#[derive(Debug, Clone)]
pub struct TableStore {
    root: PathBuf,
}

impl TableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        path.set_extension(EXTENSION);
        path
    }

    pub fn contains(&self, key: &str) -> bool {
        self.path_for(key).is_file()
    }

    /// Replace the table stored under `key`.
    pub fn put(&self, key: &str, df: &DataFrame) -> Result<(), ProximityError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write beside the target and rename, so readers never see half a file.
        let tmp = path.with_extension("parquet.tmp");
        {
            let file = File::create(&tmp)?;
            let mut df = df.clone();
            ParquetWriter::new(file).finish(&mut df)?;
        }
        fs::rename(&tmp, &path)?;
        debug!(key, rows = df.height(), "stored table");
        Ok(())
    }

    /// Concatenate `df` onto the table under `key`, creating it if needed.
    pub fn append(&self, key: &str, df: &DataFrame) -> Result<(), ProximityError> {
        if !self.contains(key) {
            return self.put(key, df);
        }
        let existing = self.read(key)?;
        match concat_frames(vec![existing, df.clone()])? {
            Some(merged) => self.put(key, &merged),
            None => Ok(()),
        }
    }

    pub fn read(&self, key: &str) -> Result<DataFrame, ProximityError> {
        let path = self.path_for(key);
        if !path.is_file() {
            return Err(ProximityError::TableNotFound(key.to_string()));
        }
        let file = File::open(&path)?;
        let df = ParquetReader::new(file).finish()?;
        normalize_datetime(df, common::DATETIME)
    }

    /// Rows of `key` with `start <= datetime < end`.
    pub fn read_range(
        &self,
        key: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<DataFrame, ProximityError> {
        let df = self
            .read(key)?
            .lazy()
            .filter(in_range(common::DATETIME, start, end))
            .collect()?;
        Ok(df)
    }

    /// Like `read_range`, but a key that was never written reads as `None`.
    pub fn read_range_opt(
        &self,
        key: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Option<DataFrame>, ProximityError> {
        if !self.contains(key) {
            return Ok(None);
        }
        self.read_range(key, start, end).map(Some)
    }

    /// Every key in the store, sorted.
    pub fn keys(&self) -> Result<Vec<String>, ProximityError> {
        let mut keys = Vec::new();
        if self.root.is_dir() {
            collect_keys(&self.root, &self.root, &mut keys)?;
        }
        keys.sort();
        Ok(keys)
    }

    /// Delete the whole store. A missing store is not an error.
    pub fn clear(&self) -> Result<(), ProximityError> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {
                info!(root = %self.root.display(), "removed previous store");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn collect_keys(root: &Path, dir: &Path, keys: &mut Vec<String>) -> Result<(), ProximityError> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_keys(root, &path, keys)?;
        } else if path.extension().is_some_and(|e| e == EXTENSION) {
            if let Ok(rel) = path.with_extension("").strip_prefix(root) {
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                keys.push(key);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::keys;
    use crate::time::{datetime_column, from_us};

    const T0: i64 = 1_528_804_800_000_000;
    const BIN: i64 = 15_000_000;

    fn frame(times: &[i64], members: &[&str]) -> DataFrame {
        DataFrame::new(vec![
            datetime_column(common::DATETIME, times).unwrap(),
            Column::new(common::MEMBER.into(), members),
        ])
        .unwrap()
    }

    #[test]
    fn missing_store_is_created_on_put() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path().join("analysis"));
        assert!(store.keys().unwrap().is_empty());
        assert!(matches!(
            store.read(keys::MEMBER_COMPLY),
            Err(ProximityError::TableNotFound(_))
        ));

        store.put(keys::MEMBER_COMPLY, &frame(&[T0], &["A"])).unwrap();
        store
            .put(&keys::connections_key(-51, keys::M2C_DAILY), &frame(&[T0], &["A"]))
            .unwrap();
        assert_eq!(
            store.keys().unwrap(),
            vec![
                "proximity/member_comply".to_string(),
                "proximity/rssi_51/m2c_daily".to_string(),
            ]
        );
    }

    #[test]
    fn put_replaces_and_append_concatenates() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path());
        store.put("t", &frame(&[T0, T0], &["A", "B"])).unwrap();
        store.put("t", &frame(&[T0], &["C"])).unwrap();
        assert_eq!(store.read("t").unwrap().height(), 1);

        store.append("t", &frame(&[T0 + BIN], &["D"])).unwrap();
        let df = store.read("t").unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.column(common::MEMBER).unwrap().str().unwrap().get(1), Some("D"));
    }

    #[test]
    fn range_read_is_half_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path());
        store
            .put("t", &frame(&[T0, T0 + BIN, T0 + 2 * BIN], &["A", "B", "C"]))
            .unwrap();
        let df = store
            .read_range("t", from_us(T0).unwrap(), from_us(T0 + 2 * BIN).unwrap())
            .unwrap();
        assert_eq!(df.height(), 2);
    }

    #[test]
    fn reads_normalize_time_unit() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path());
        let mut df = frame(&[T0, T0 + BIN], &["A", "B"]);
        let ns = df
            .column(common::DATETIME)
            .unwrap()
            .cast(&DataType::Datetime(TimeUnit::Nanoseconds, None))
            .unwrap();
        df.with_column(ns).unwrap();
        store.put("t", &df).unwrap();

        let back = store.read("t").unwrap();
        assert_eq!(
            back.column(common::DATETIME).unwrap().dtype(),
            &crate::time::datetime_dtype()
        );
        let ranged = store
            .read_range("t", from_us(T0 + BIN).unwrap(), from_us(T0 + 2 * BIN).unwrap())
            .unwrap();
        assert_eq!(ranged.height(), 1);
    }

    #[test]
    fn clear_tolerates_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path().join("nothing-here"));
        assert!(store.clear().is_ok());
    }
}
