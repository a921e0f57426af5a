use async_trait::async_trait;
use postmortem_analyzers::{AnalysisContext, AnalyzerRegistry};
use postmortem_core::{
    Classifier, CommandExecutor, Confidence, DeepTask, EngineLimits, Evaluation, EvidencePipeline, EvidenceSummary,
    ExecutorError, FormRequest, Hypothesis, HypothesisAuthor, HypothesisDraft, Verdict,
};
use postmortem_evidence::{AnalyzerOptions, CancelFlag, EvidenceAnalyzer, EvidenceStore, ReasonError, StoreOptions};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Canned debugger: scripted replies per command, echo output otherwise
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    replies: HashMap<String, Result<String, ExecutorError>>,
    cancel_on: Option<(String, CancelFlag)>,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedExecutor {
    pub fn reply(mut self, command: &str, output: &str) -> Self {
        self.replies.insert(command.to_string(), Ok(output.to_string()));
        self
    }

    pub fn fail(mut self, command: &str, error: ExecutorError) -> Self {
        self.replies.insert(command.to_string(), Err(error));
        self
    }

    /// Raise `cancel` while `command` is executing, as a Ctrl-C would
    pub fn cancelling_on(mut self, command: &str, cancel: CancelFlag) -> Self {
        self.cancel_on = Some((command.to_string(), cancel));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(&mut self, command: &str, _timeout: Duration) -> Result<String, ExecutorError> {
        self.calls.lock().unwrap().push(command.to_string());
        if let Some((trigger, cancel)) = &self.cancel_on {
            if trigger == command {
                cancel.cancel();
            }
        }
        match self.replies.get(command) {
            Some(reply) => reply.clone(),
            None => Ok(format!("output of {}\n", command)),
        }
    }
}

pub struct ScriptedAuthor {
    drafts: Mutex<VecDeque<HypothesisDraft>>,
    more: Vec<String>,
    deep: Vec<DeepTask>,
    pub formed: Mutex<Vec<usize>>,
}

impl ScriptedAuthor {
    pub fn new(drafts: Vec<HypothesisDraft>) -> Self {
        Self {
            drafts: Mutex::new(drafts.into()),
            more: Vec::new(),
            deep: Vec::new(),
            formed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_more(mut self, commands: &[&str]) -> Self {
        self.more = commands.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_deep(mut self, tasks: Vec<DeepTask>) -> Self {
        self.deep = tasks;
        self
    }
}

#[async_trait]
impl HypothesisAuthor for ScriptedAuthor {
    async fn form(&self, request: FormRequest<'_>) -> Result<HypothesisDraft, ReasonError> {
        self.formed.lock().unwrap().push(request.rejected.len());
        Ok(self
            .drafts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| draft("fallback hypothesis", &["!eeversion"])))
    }

    async fn plan_more(&self, _hypothesis: &Hypothesis, _round: usize) -> Result<Vec<String>, ReasonError> {
        Ok(self.more.clone())
    }

    async fn plan_deep(&self, _hypothesis: &Hypothesis) -> Result<Vec<DeepTask>, ReasonError> {
        Ok(self.deep.clone())
    }
}

/// Replays verdicts in order, then answers inconclusive
pub struct ScriptedClassifier {
    verdicts: Mutex<VecDeque<Verdict>>,
    cancel_on_call: Option<CancelFlag>,
    pub calls: Mutex<usize>,
}

impl ScriptedClassifier {
    pub fn new(verdicts: &[Verdict]) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.iter().copied().collect()),
            cancel_on_call: None,
            calls: Mutex::new(0),
        }
    }

    pub fn cancelling(mut self, cancel: CancelFlag) -> Self {
        self.cancel_on_call = Some(cancel);
        self
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn evaluate(&self, _hypothesis: &Hypothesis, _evidence: &[EvidenceSummary]) -> Result<Evaluation, ReasonError> {
        *self.calls.lock().unwrap() += 1;
        if let Some(cancel) = &self.cancel_on_call {
            cancel.cancel();
        }
        let verdict = self
            .verdicts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Verdict::Inconclusive);
        Ok(Evaluation {
            verdict,
            reasoning: format!("scripted {:?}", verdict),
        })
    }
}

pub fn draft(statement: &str, commands: &[&str]) -> HypothesisDraft {
    HypothesisDraft {
        statement: statement.to_string(),
        confidence: Confidence::Medium,
        test_commands: commands.iter().map(|c| c.to_string()).collect(),
        expected_if_confirmed: "signal present".to_string(),
        expected_if_rejected: "signal absent".to_string(),
    }
}

pub fn open_store(dir: &Path) -> Arc<EvidenceStore> {
    Arc::new(
        EvidenceStore::open_at(
            &dir.join("evidence.db"),
            dir.join("evidence"),
            "session_test",
            StoreOptions::default(),
        )
        .unwrap(),
    )
}

pub fn plain_analyzer() -> Arc<EvidenceAnalyzer> {
    Arc::new(EvidenceAnalyzer::new(
        AnalyzerRegistry::with_defaults(),
        Arc::new(AnalysisContext::new()),
        AnalyzerOptions::default(),
    ))
}

pub fn pipeline(executor: ScriptedExecutor, store: Arc<EvidenceStore>) -> Arc<EvidencePipeline> {
    Arc::new(EvidencePipeline::new(
        Box::new(executor),
        store,
        plain_analyzer(),
        Duration::from_secs(5),
    ))
}

pub fn limits(max_hypotheses: usize) -> EngineLimits {
    EngineLimits {
        max_inconclusive_retries: 2,
        max_test_commands: 3,
        max_hypotheses,
        max_deep_tasks: 5,
    }
}
