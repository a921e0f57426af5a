//! Investigation configuration

use postmortem_evidence::{AnalyzerOptions, ReasonerSettings, StoreOptions};
use postmortem_index::RetrieverOptions;
use postmortem_session::RetentionPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Retrieval behaviour for ad-hoc questions
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Rank with the embedding model; keyword ranking is used when off or failing
    pub use_embeddings: bool,
    /// Minimum best cosine score before semantic results are trusted
    pub semantic_floor: Option<f32>,
    /// Let the reasoner reorder the top candidates
    pub rerank: bool,
}

impl RetrievalConfig {
    pub fn new() -> Self {
        Self {
            use_embeddings: true,
            semantic_floor: None,
            rerank: false,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// How the debugger process is launched for one command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Debugger executable
    pub program: String,
    /// Argument template; `{target}` and `{command}` are substituted
    pub args: Vec<String>,
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self {
            program: "cdb".to_string(),
            args: vec![
                "-z".to_string(),
                "{target}".to_string(),
                "-c".to_string(),
                "{command}; q".to_string(),
            ],
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Investigation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Outputs above this many bytes are stored as external files
    pub storage_threshold: usize,

    /// Maximum bytes per analysis chunk
    pub chunk_size: usize,

    /// Chunks of one output analyzed concurrently
    pub chunk_fan_out: usize,

    /// Outputs at or under this size get an excerpt summary, no reasoning call
    pub llm_analysis_threshold: usize,

    /// Duplicate reuse window; `None` covers the whole session
    pub dedup_window_secs: Option<u64>,

    /// Extra evidence rounds for an inconclusive hypothesis before it is rejected
    pub max_inconclusive_retries: usize,

    /// Test commands run per hypothesis round
    pub max_test_commands: usize,

    /// Hypotheses formed before giving up
    pub max_hypotheses: usize,

    /// Deep-investigation tasks after a confirmation
    pub max_deep_tasks: usize,

    /// Per-command debugger timeout
    pub command_timeout_secs: u64,

    /// Per-call reasoning timeout
    pub reasoner_timeout_secs: u64,

    /// Per-call embedding timeout
    pub embed_timeout_secs: u64,

    pub retrieval: RetrievalConfig,

    pub retention: RetentionPolicy,

    pub reasoner: ReasonerSettings,

    pub executor: ExecutorConfig,
}

impl Config {
    pub fn new() -> Self {
        Self {
            storage_threshold: 32 * 1024,
            chunk_size: 32 * 1024,
            chunk_fan_out: 4,
            llm_analysis_threshold: 2048,
            dedup_window_secs: None,
            max_inconclusive_retries: 2,
            max_test_commands: 3,
            max_hypotheses: 4,
            max_deep_tasks: 5,
            command_timeout_secs: 600,
            reasoner_timeout_secs: 120,
            embed_timeout_secs: 30,
            retrieval: RetrievalConfig::new(),
            retention: RetentionPolicy::new(),
            reasoner: ReasonerSettings::new(),
            executor: ExecutorConfig::new(),
        }
    }

    /// Load from a JSON file; a missing file yields the defaults
    pub fn load(path: &Path) -> std::io::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn reasoner_timeout(&self) -> Duration {
        Duration::from_secs(self.reasoner_timeout_secs)
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            inline_threshold: self.storage_threshold,
            dedup_window: self
                .dedup_window_secs
                .map(|secs| chrono::Duration::seconds(secs as i64)),
        }
    }

    pub fn analyzer_options(&self) -> AnalyzerOptions {
        AnalyzerOptions {
            chunk_size: self.chunk_size,
            fan_out: self.chunk_fan_out,
            reasoning_threshold: self.llm_analysis_threshold,
            reasoner_timeout: self.reasoner_timeout(),
            ..AnalyzerOptions::new()
        }
    }

    pub fn retriever_options(&self) -> RetrieverOptions {
        RetrieverOptions {
            use_embeddings: self.retrieval.use_embeddings,
            semantic_floor: self.retrieval.semantic_floor,
            rerank: self.retrieval.rerank,
            embed_timeout: Duration::from_secs(self.embed_timeout_secs),
            reasoner_timeout: self.reasoner_timeout(),
            ..RetrieverOptions::new()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::new();
        assert_eq!(config.storage_threshold, 32 * 1024);
        assert_eq!(config.max_inconclusive_retries, 2);
        assert_eq!(config.dedup_window_secs, None);
        assert!(config.retrieval.semantic_floor.is_none());
        assert_eq!(config.executor.program, "cdb");
    }

    #[test]
    fn test_partial_file_keeps_remaining_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"chunk_size": 4096, "retention": {"keep_recent": 2}, "retrieval": {"semantic_floor": 0.3}}"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.retention.keep_recent, 2);
        assert_eq!(config.retention.max_age_days, 7);
        assert_eq!(config.retrieval.semantic_floor, Some(0.3));
        assert!(config.retrieval.use_embeddings);
        assert_eq!(config.max_hypotheses, 4);
    }

    #[test]
    fn test_missing_file_is_default() {
        let temp = tempfile::tempdir().unwrap();
        let config = Config::load(&temp.path().join("absent.json")).unwrap();
        assert_eq!(config.chunk_fan_out, 4);
    }

    #[test]
    fn test_malformed_file_is_error() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_option_conversions() {
        let mut config = Config::new();
        config.dedup_window_secs = Some(90);
        config.chunk_fan_out = 1;
        assert_eq!(config.store_options().dedup_window, Some(chrono::Duration::seconds(90)));
        assert_eq!(config.analyzer_options().fan_out, 1);
        assert_eq!(config.retriever_options().embed_timeout, Duration::from_secs(30));
    }
}
