pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod report;
pub mod store;

pub use checkpoint::Checkpoint;
pub use config::SweepConfig;
pub use data::{Database, RunStatus, SearchCursor};
pub use error::SweepError;
pub use orchestrator::{Collaborators, Orchestrator, SweepProgressCallback};
pub use recovery::{HarvestSignal, RecoveryConfig};
pub use report::SweepReport;
pub use store::{CheckpointStore, ListingStore, QuotaGate, SqliteStore};
