use std::collections::HashMap;
use std::path::PathBuf;

use pyo3::prelude::*;
use pyo3::types::PyModule;
use pyo3_polars::PyDataFrame;

use crate::pipeline;
use crate::schema;
use crate::store::TableStore;

/// Run every stage for the TOML config at `config_path`.
///
/// Returns the run counters as a dict.
#[pyfunction]
fn run_pipeline(py: Python<'_>, config_path: PathBuf) -> PyResult<HashMap<String, usize>> {
    let summary = py.allow_threads(|| pipeline::run_pipeline(&config_path))?;

    let mut out = HashMap::new();
    out.insert("clean_processed".to_string(), summary.clean.processed);
    out.insert("clean_empty".to_string(), summary.clean.empty);
    out.insert("clean_failed".to_string(), summary.clean.failed.len());
    out.insert("comply_processed".to_string(), summary.comply.processed);
    out.insert("comply_empty".to_string(), summary.comply.empty);
    out.insert("comply_failed".to_string(), summary.comply.failed.len());
    out.insert("cutoffs_built".to_string(), summary.connections.built.len());
    out.insert("cutoffs_failed".to_string(), summary.connections.failed.len());
    out.insert("unresolved_members".to_string(), summary.unresolved.members);
    out.insert("unresolved_beacons".to_string(), summary.unresolved.beacons);
    Ok(out)
}

/// Read one table, e.g. `proximity/rssi_62/c2c_dbl_annual`, from a store.
#[pyfunction]
fn read_table(store_root: PathBuf, key: &str) -> PyResult<PyDataFrame> {
    let df = TableStore::new(store_root).read(key)?;
    Ok(PyDataFrame(df))
}

/// Export column names and store keys as Python submodules
fn add_schema_exports(m: &Bound<'_, PyModule>) -> PyResult<()> {
    // Shared columns
    let common = PyModule::new(m.py(), "common")?;
    common.add("DATETIME", schema::common::DATETIME)?;
    common.add("MEMBER", schema::common::MEMBER)?;
    common.add("RSSI", schema::common::RSSI)?;
    m.add_submodule(&common)?;

    // Member-to-member
    let m2m = PyModule::new(m.py(), "m2m")?;
    m2m.add("MEMBER1", schema::m2m::MEMBER1)?;
    m2m.add("MEMBER2", schema::m2m::MEMBER2)?;
    m2m.add("RSSI_MAX", schema::m2m::RSSI_MAX)?;
    m2m.add("COMPANY1", schema::m2m::COMPANY1)?;
    m2m.add("COMPANY2", schema::m2m::COMPANY2)?;
    m2m.add("MINUTES", schema::m2m::MINUTES)?;
    m.add_submodule(&m2m)?;

    // Closest beacon
    let m1cb = PyModule::new(m.py(), "m1cb")?;
    m1cb.add("BEACON_COMPANY", schema::m1cb::BEACON_COMPANY)?;
    m1cb.add("BEACON_TYPE", schema::m1cb::BEACON_TYPE)?;
    m1cb.add("MEMBER_COMPANY", schema::m1cb::MEMBER_COMPANY)?;
    m1cb.add("LOCATION_TYPE", schema::m1cb::LOCATION_TYPE)?;
    m1cb.add("LOCATION_TYPE_NEARBY", schema::m1cb::LOCATION_TYPE_NEARBY)?;
    m1cb.add("LOCATION_TYPE_MERGED", schema::m1cb::LOCATION_TYPE_MERGED)?;
    m.add_submodule(&m1cb)?;

    // Compliance
    let comply = PyModule::new(m.py(), "comply")?;
    comply.add("COMPLY", schema::comply::COMPLY)?;
    comply.add("MAX_RSSI", schema::comply::MAX_RSSI)?;
    m.add_submodule(&comply)?;

    // Location types
    let location_type = PyModule::new(m.py(), "location_type")?;
    location_type.add("AT_COMPANY", schema::location_type::AT_COMPANY)?;
    location_type.add(
        "AT_DIFFERENT_COMPANY",
        schema::location_type::AT_DIFFERENT_COMPANY,
    )?;
    location_type.add("AT_NEARBY_COMPANY", schema::location_type::AT_NEARBY_COMPANY)?;
    location_type.add("AT_FAR_COMPANY", schema::location_type::AT_FAR_COMPANY)?;
    m.add_submodule(&location_type)?;

    // Store keys
    let keys = PyModule::new(m.py(), "keys")?;
    keys.add("MEMBER_TO_MEMBER", schema::keys::MEMBER_TO_MEMBER)?;
    keys.add("MEMBER_TO_BADGE", schema::keys::MEMBER_TO_BADGE)?;
    keys.add("MEMBER_TO_BEACON", schema::keys::MEMBER_TO_BEACON)?;
    keys.add(
        "MEMBER_5_CLOSEST_BEACONS",
        schema::keys::MEMBER_5_CLOSEST_BEACONS,
    )?;
    keys.add("MEMBER_CLOSEST_BEACON", schema::keys::MEMBER_CLOSEST_BEACON)?;
    keys.add("MEMBER_COMPLY", schema::keys::MEMBER_COMPLY)?;
    keys.add("MEMBER_COMPLY_DIRTY", schema::keys::MEMBER_COMPLY_DIRTY)?;
    keys.add("METADATA_MEMBERS", schema::keys::METADATA_MEMBERS)?;
    m.add_submodule(&keys)?;

    Ok(())
}

#[pymodule]
fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(run_pipeline, m)?)?;
    m.add_function(wrap_pyfunction!(read_table, m)?)?;
    add_schema_exports(m)?;
    Ok(())
}
