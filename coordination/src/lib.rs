//! Wordsmith coordination library
//!
//! Orchestration core for generating vocabulary material with several AI
//! providers at once:
//! - Rate-limited admission pools per provider (fixed window + concurrency ceiling)
//! - Multi-model consensus with primary-first and majority selection
//! - Line-level response diffing for divergence review
//! - Bounded-concurrency batch runs with per-item progress
//!
//! # Flow
//!
//! ```text
//! BatchOrchestrator ──► pipeline(item, index, ProgressReporter)
//!                          └─ stage ──► ConsensusInvoker ──► call(model)
//!                                          │                   └─ RateLimitedPool permit
//!                                          └─ ≥2 answers differ ──► DivergenceSink
//! ```
//!
//! Provider HTTP contracts live outside this crate; a model call is any
//! future resolving to `Result<T, E: Display>`.

pub mod batch;
pub mod config;
pub mod consensus;
pub mod diff;
pub mod divergence;
pub mod errors;
pub mod pool;

pub use batch::{
    group_by_owner, ArtifactBatch, BatchItem, BatchOrchestrator, BatchReport, BatchResult,
    ItemProgress, ItemStatus, ProgressReporter,
};
pub use config::{BatchSettings, EngineConfig, PermitBudget, ProviderQuota};
pub use consensus::{
    as_text, ConsensusInvoker, ConsensusOutcome, ModelDescriptor, SelectionStrategy,
};
pub use diff::{diff, diff_summary, render_diff, DiffKind, DiffLine, DiffSummary};
pub use divergence::{
    DivergenceRecord, DivergenceSink, JsonlDivergenceSink, MemoryDivergenceSink, ModelOutput,
    NullDivergenceSink, ResponseGroup, TracingDivergenceSink,
};
pub use errors::{CoordinationError, CoordinationResult, ModelFailure};
pub use pool::{PoolPermit, PoolRegistry, PoolSnapshot, RateLimitedPool};
