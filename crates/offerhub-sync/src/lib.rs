//! Ingestion pipeline: normalization, merge policy, cycle orchestration,
//! publishing and the read-side catalog.

mod catalog;
mod config;
mod merge;
mod normalize;
mod orchestrator;
mod publish;
mod service;

pub use catalog::Catalog;
pub use config::{LogFormat, SyncConfig};
pub use merge::{ConflictReason, EntityPlan, MergeConfig, MergeConflict, MergeEngine, MergePlan, ReviewHint};
pub use normalize::{content_id, NormalizeError, Normalizer};
pub use orchestrator::{
    CycleError, CycleReport, IngestionOrchestrator, OrchestratorConfig, SourceFailure, LAST_CYCLE_REPORT,
};
pub use publish::{
    GitPublisher, ProjectionPublisher, PublishHandle, PublishJob, PublishStatus, Publisher, PublisherChain,
};
pub use service::{CycleJob, IngestionService};

pub const CRATE_NAME: &str = "offerhub-sync";
