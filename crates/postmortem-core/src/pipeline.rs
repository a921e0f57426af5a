//! Executor → store → analyzer path shared by the engine and interactive commands

use crate::error::ExecutorError;
use crate::placeholder::StoredEvidence;
use async_trait::async_trait;
use postmortem_evidence::{AnalyzeError, EvidenceAnalyzer, EvidenceStore, PutStatus, StoreError, Summary};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

static COMMAND_ERROR_RE: OnceLock<Regex> = OnceLock::new();

/// A live debugger session; commands against it must never overlap
#[async_trait]
pub trait CommandExecutor: Send {
    async fn execute(&mut self, command: &str, timeout: Duration) -> Result<String, ExecutorError>;
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("command failed: {0}")]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// What running one command produced
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub command: String,
    pub evidence_id: String,
    pub status: PutStatus,
    /// `None` when analysis was interrupted; the record stays pending
    pub summary: Option<Summary>,
    /// First output line when the debugger reported a failure
    pub command_error: Option<String>,
}

pub struct EvidencePipeline {
    executor: Mutex<Box<dyn CommandExecutor>>,
    store: Arc<EvidenceStore>,
    analyzer: Arc<EvidenceAnalyzer>,
    command_timeout: Duration,
}

impl EvidencePipeline {
    pub fn new(
        executor: Box<dyn CommandExecutor>,
        store: Arc<EvidenceStore>,
        analyzer: Arc<EvidenceAnalyzer>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            executor: Mutex::new(executor),
            store,
            analyzer,
            command_timeout,
        }
    }

    pub fn store(&self) -> &Arc<EvidenceStore> {
        &self.store
    }

    pub fn analyzer(&self) -> &Arc<EvidenceAnalyzer> {
        &self.analyzer
    }

    /// Execute `command`, store its output through the dedup-aware `put`, and
    /// analyze the record if it has no summary yet
    pub async fn run(&self, command: &str, intent: Option<&str>) -> Result<CommandOutcome, RunError> {
        let output = self.execute(command).await?;

        let command_error = detect_command_error(&output);
        let mut metadata = Map::new();
        if let Some(intent) = intent {
            metadata.insert("intent".to_string(), Value::from(intent));
        }
        if let Some(line) = &command_error {
            warn!(command, error = %line, "debugger reported a command error");
            metadata.insert("command_error".to_string(), Value::from(line.as_str()));
        }

        let reference = self.store.put_with_metadata(command, &output, metadata)?;
        let evidence = self.store.require(&reference.id)?;

        let summary = if reference.needs_analysis() {
            match self.analyzer.analyze(&self.store, &evidence, intent).await {
                Ok(summary) => Some(summary),
                Err(AnalyzeError::Cancelled(id)) => {
                    info!(evidence = %id, "analysis interrupted, record left pending");
                    None
                }
                Err(AnalyzeError::Store(e)) => return Err(e.into()),
            }
        } else {
            debug!(evidence = %reference.id, "reusing analyzed evidence");
            evidence.summary.map(|overall| Summary {
                overall,
                key_findings: evidence.key_findings,
            })
        };

        Ok(CommandOutcome {
            command: command.to_string(),
            evidence_id: reference.id,
            status: reference.status,
            summary,
            command_error,
        })
    }

    async fn execute(&self, command: &str) -> Result<String, ExecutorError> {
        let mut executor = self.executor.lock().await;
        debug!(command, "executing");
        match tokio::time::timeout(self.command_timeout, executor.execute(command, self.command_timeout)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::timeout(format!(
                "`{}` did not finish within {:?}",
                command, self.command_timeout
            ))),
        }
    }

    /// Analyze every record left without a summary, oldest first.
    ///
    /// Returns the ids that were completed; stops early on interruption.
    pub async fn complete_pending(&self) -> Result<Vec<String>, StoreError> {
        let mut completed = Vec::new();
        for evidence in self.store.pending_analysis()? {
            let intent = evidence.metadata_str("intent").map(str::to_string);
            match self.analyzer.analyze(&self.store, &evidence, intent.as_deref()).await {
                Ok(_) => completed.push(evidence.id),
                Err(AnalyzeError::Cancelled(id)) => {
                    info!(evidence = %id, "reentry interrupted");
                    break;
                }
                Err(AnalyzeError::Store(e)) => return Err(e),
            }
        }
        Ok(completed)
    }

    /// Stored records, most recent first, for placeholder resolution; outputs load on demand
    pub fn prior_evidence(&self) -> Result<StoredEvidence<'_>, StoreError> {
        StoredEvidence::load(&self.store)
    }
}

/// First meaningful line of `output` when it carries a debugger failure marker
pub fn detect_command_error(output: &str) -> Option<String> {
    let re = COMMAND_ERROR_RE.get_or_init(|| {
        Regex::new(r"^(?:Error:|Couldn't resolve error at|Unable to|Failed to|Syntax error)").unwrap()
    });
    let first = output.lines().map(str::trim).find(|line| !line.is_empty())?;
    re.is_match(first).then(|| first.to_string())
}
