//! Hypothesis-driven investigation over a debugger session

mod author;
mod config;
mod engine;
mod error;
mod patterns;
mod pipeline;
mod placeholder;

pub use author::ReasoningAuthor;
pub use config::{Config, ExecutorConfig, RetrievalConfig};
pub use engine::{
    Classifier, Confidence, DeepFinding, DeepTask, EngineLimits, Evaluation, EvidenceSummary, FormRequest,
    Hypothesis, HypothesisAuthor, HypothesisDraft, HypothesisEngine, HypothesisState, InvestigationOutcome,
    InvestigationReport, SkippedCommand, Verdict,
};
pub use error::{EngineError, ExecutorError, ExecutorErrorKind};
pub use patterns::{format_hints, KnownPattern, PatternLibrary, PatternMatch};
pub use pipeline::{detect_command_error, CommandExecutor, CommandOutcome, EvidencePipeline, RunError};
pub use placeholder::{
    has_placeholders, normalize_address, placeholders, EvidenceSource, EvidenceText, Hint, Placeholder,
    PlaceholderKind, PlaceholderMatch, PlaceholderResolver, ResolvedCommand, StoredEvidence, Unresolved,
};
