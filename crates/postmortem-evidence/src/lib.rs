//! Evidence storage and analysis for crash-dump sessions

pub mod analyzer;
mod chunk;
mod excerpt;
pub mod reason;
mod redact;
pub mod store;
mod types;

pub use analyzer::{AnalysisOutcome, AnalyzeError, AnalyzerOptions, EvidenceAnalyzer, EMPTY_OUTPUT_SUMMARY};
pub use chunk::{split_chunks, tail_lines};
pub use excerpt::excerpt_summary;
pub use reason::{
    complete_within, extract_json, string_list, AnthropicReasoner, ReasonError, Reasoner, ReasonerSettings,
};
pub use redact::Redactor;
pub use store::{evidence_id, output_hash, EvidenceStore, StoreError, StoreOptions};
pub use types::{CancelFlag, Chunk, ChunkFinding, Evidence, EvidenceLocation, EvidenceRef, PutStatus, Summary};
