use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProximityError {
    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Worker pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("{0}")]
    General(String),

    #[error("Missing column: {0}")]
    MissingColumn(String),

    #[error("Missing {kind} metadata for id: {id}")]
    MissingMetadata { kind: MetadataKind, id: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("InvalidData: {0}")]
    InvalidData(String),

    #[error("Table not found in store: {0}")]
    TableNotFound(String),
}

/// Which metadata table a failed lookup went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataKind {
    Member,
    Beacon,
}

impl std::fmt::Display for MetadataKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Member => f.write_str("member"),
            Self::Beacon => f.write_str("beacon"),
        }
    }
}

#[cfg(feature = "python")]
impl From<ProximityError> for pyo3::PyErr {
    fn from(err: ProximityError) -> pyo3::PyErr {
        pyo3::exceptions::PyRuntimeError::new_err(err.to_string())
    }
}

#[cfg(feature = "python")]
impl From<pyo3::PyErr> for ProximityError {
    fn from(err: pyo3::PyErr) -> Self {
        ProximityError::General(err.to_string())
    }
}
