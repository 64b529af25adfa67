//! Lead sync pipeline: record normalization, dedup and the resumable run orchestrator.

pub mod config;
pub mod dedup;
pub mod mapper;
pub mod normalize;
pub mod orchestrator;
pub mod score;

pub use config::{ColumnHeaders, LeadsyncConfig};
pub use dedup::{seed_unique_ids, UNIQUE_ID_HEADER};
pub use mapper::map_records;
pub use orchestrator::{
    ErrorBody, OrchestratorOptions, RunError, RunOrchestrator, SettingsRow, StartRunRequest,
    MAX_RUN_ROWS,
};
pub use score::lead_score;

pub const CRATE_NAME: &str = "leadsync-sync";
