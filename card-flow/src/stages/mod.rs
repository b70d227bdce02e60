//! The four refinement stages, in the order the orchestrator runs them.

pub mod audit;
pub mod group;
pub mod hint;
pub mod refine;

pub use audit::AuditStage;
pub use group::GroupStage;
pub use hint::HintStage;
pub use refine::RefineStage;
