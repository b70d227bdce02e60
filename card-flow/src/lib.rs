//! Resumable slide-to-flash-card generation.
//!
//! Slides go out to a completion endpoint in batches, replies are reconciled
//! against the slides that were asked for, progress is checkpointed after every
//! batch, and the finished deck passes through a fixed sequence of refinement
//! stages that each record their decisions in a ledger.

pub mod client;
pub mod cloze;
pub mod config;
pub mod error;
pub mod ledger;
pub mod orchestrator;
pub mod package;
pub mod prompts;
pub mod reconcile;
pub mod request;
pub mod runner;
pub mod stage;
pub mod stages;
pub mod storage;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use client::{ClientResponse, CompletionClient};
#[cfg(feature = "http")]
pub use client::HttpCompletionClient;
pub use config::{PipelineConfig, RefinementConfig, RetryPolicy};
pub use error::{
    AttemptError, ClientError, PackageError, ParseFailure, PipelineError, Result, StoreError,
    TransportFailure,
};
pub use ledger::{DecisionAction, DecisionLedger, LedgerReport, RefinementDecision, StageKind};
pub use orchestrator::{PlannedStage, RefinementOrchestrator, RefinementRun};
pub use package::{DocumentOutput, Packager};
pub use runner::{CollectionRunner, CollectionSummary, DocumentOutcome, DocumentPipeline, SlideSource};
pub use stage::{RefinementStage, StageOutput};
pub use storage::{
    CollectionProgress, CollectionStore, FileProgressStore, InMemoryProgressStore, ProgressRecord,
    ProgressStore,
};
pub use transport::{AttemptBudget, BackoffPolicy, RetryingTransport, TimeoutPolicy};
pub use types::{CardRecord, ClozeMode, Slide, SlideResult};
