//! Subcommand implementations and the wiring they share

pub mod ask;
pub mod exec;
pub mod investigate;
pub mod resume;
pub mod sessions;
pub mod version;

use crate::executor::ProcessExecutor;
use anyhow::Context;
use postmortem_analyzers::{AnalysisContext, AnalyzerRegistry};
use postmortem_core::{Config, EvidencePipeline, PatternLibrary};
use postmortem_evidence::{AnthropicReasoner, CancelFlag, EvidenceAnalyzer, EvidenceStore, ReasonError, Reasoner};
use postmortem_session::{Paths, Session, SessionManager};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Storage root, configuration and session manager for one invocation
pub struct Workspace {
    pub paths: Paths,
    pub config: Config,
    pub sessions: SessionManager,
}

impl Workspace {
    pub fn load(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let paths = Paths::new()?;
        let file = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| paths.config_file());
        let config = Config::load(&file).with_context(|| format!("failed to read {}", file.display()))?;
        Ok(Self::new(paths, config))
    }

    pub fn new(paths: Paths, config: Config) -> Self {
        let sessions = SessionManager::new(paths.sessions_dir());
        Self {
            paths,
            config,
            sessions,
        }
    }

    pub fn store(&self, session: &Session) -> anyhow::Result<Arc<EvidenceStore>> {
        let store = EvidenceStore::open(session, self.config.store_options())
            .with_context(|| format!("failed to open evidence store of {}", session.id))?;
        Ok(Arc::new(store))
    }

    pub fn reasoner(&self) -> Result<Arc<dyn Reasoner>, ReasonError> {
        Ok(Arc::new(AnthropicReasoner::from_env(self.config.reasoner.clone())?))
    }

    /// Reasoner if configured; its absence only limits analysis to excerpts
    pub fn optional_reasoner(&self) -> Option<Arc<dyn Reasoner>> {
        match self.reasoner() {
            Ok(reasoner) => Some(reasoner),
            Err(e) => {
                warn!(error = %e, "reasoning disabled, large outputs get excerpt summaries");
                None
            }
        }
    }

    pub fn pipeline(
        &self,
        session: &Session,
        cancel: CancelFlag,
        reasoner: Option<Arc<dyn Reasoner>>,
    ) -> anyhow::Result<EvidencePipeline> {
        let store = self.store(session)?;
        let mut analyzer = EvidenceAnalyzer::new(
            AnalyzerRegistry::with_defaults(),
            Arc::new(AnalysisContext::new()),
            self.config.analyzer_options(),
        )
        .with_cancel(cancel);
        if let Some(reasoner) = reasoner {
            analyzer = analyzer.with_reasoner(reasoner);
        }
        let executor = ProcessExecutor::new(&self.config.executor, &session.target);
        Ok(EvidencePipeline::new(
            Box::new(executor),
            store,
            Arc::new(analyzer),
            self.config.command_timeout(),
        ))
    }

    /// User patterns when `patterns.json` exists, built-in ones otherwise
    pub fn patterns(&self) -> anyhow::Result<PatternLibrary> {
        let file = self.paths.patterns_file();
        if !file.exists() {
            return Ok(PatternLibrary::builtin());
        }
        PatternLibrary::from_json_file(&file).with_context(|| format!("failed to read {}", file.display()))
    }
}

/// Flag set when the user presses Ctrl-C
pub fn cancel_on_interrupt() -> CancelFlag {
    let cancel = CancelFlag::new();
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current command");
            flag.cancel();
        }
    });
    cancel
}
