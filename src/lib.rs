pub mod clean;
pub mod comply;
pub mod config;
pub mod connections;
pub mod error;
pub mod location;
pub mod logging;
pub mod metadata;
pub mod partition;
pub mod pipeline;
pub mod relation;
pub mod schema;
pub mod store;
pub mod time;

#[cfg(feature = "python")]
mod python;

pub use config::PipelineConfig;
pub use error::ProximityError;
pub use pipeline::{run_pipeline, Pipeline, RunSummary};
pub use store::TableStore;
