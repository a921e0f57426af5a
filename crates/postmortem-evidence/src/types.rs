use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Where the raw output of an evidence record lives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvidenceLocation {
    Inline { output: String },
    External { path: PathBuf },
}

impl EvidenceLocation {
    pub fn kind(&self) -> &'static str {
        match self {
            EvidenceLocation::Inline { .. } => "inline",
            EvidenceLocation::External { .. } => "external",
        }
    }
}

/// Durable record of one command's output plus its derived summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub id: String,
    pub session_id: String,
    pub command: String,
    pub output_hash: String,
    pub size: u64,
    pub location: EvidenceLocation,
    /// `None` until analysis completes; never an empty stand-in
    pub summary: Option<String>,
    pub key_findings: Vec<String>,
    pub embedding: Option<Vec<f32>>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    /// Creation order within the session
    pub seq: i64,
}

impl Evidence {
    pub fn needs_analysis(&self) -> bool {
        self.summary.is_none()
    }

    pub fn is_external(&self) -> bool {
        matches!(self.location, EvidenceLocation::External { .. })
    }

    pub fn inline_output(&self) -> Option<&str> {
        match &self.location {
            EvidenceLocation::Inline { output } => Some(output),
            EvidenceLocation::External { .. } => None,
        }
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PutStatus {
    /// A new record was written
    Created,
    /// An analyzed duplicate already existed
    Reused,
    /// A duplicate exists but was never analyzed; route it back through analysis
    NeedsAnalysis,
}

/// Handle returned by `put` and duplicate lookups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceRef {
    pub id: String,
    pub status: PutStatus,
}

impl EvidenceRef {
    pub fn needs_analysis(&self) -> bool {
        matches!(self.status, PutStatus::Created | PutStatus::NeedsAnalysis)
    }
}

/// Overall result of analyzing one evidence record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub overall: String,
    pub key_findings: Vec<String>,
}

/// Structured extraction from one chunk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkFinding {
    pub summary: String,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub blocking_operations: Vec<String>,
    #[serde(default)]
    pub identifiers: Vec<String>,
    #[serde(default)]
    pub exceptions: Vec<String>,
    /// False when the reasoning call for this chunk failed
    #[serde(default = "default_true")]
    pub available: bool,
    #[serde(default)]
    pub error: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ChunkFinding {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            error: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// A line-bounded slice of one evidence record's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub seq: usize,
    pub text: String,
    /// `None` while the chunk has not been analyzed
    pub finding: Option<ChunkFinding>,
}

/// Shared interruption signal, checked between sequential steps
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_tagging() {
        let inline = EvidenceLocation::Inline {
            output: "ok".to_string(),
        };
        let json = serde_json::to_value(&inline).unwrap();
        assert_eq!(json["kind"], "inline");
        assert_eq!(inline.kind(), "inline");

        let external: EvidenceLocation =
            serde_json::from_str(r#"{"kind":"external","path":"/tmp/ev.txt"}"#).unwrap();
        assert_eq!(external.kind(), "external");
    }

    #[test]
    fn test_chunk_finding_defaults_available() {
        let finding: ChunkFinding = serde_json::from_str(r#"{"summary":"x"}"#).unwrap();
        assert!(finding.available);
        assert!(!ChunkFinding::unavailable("timeout").available);
    }

    #[test]
    fn test_cancel_flag_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }
}
