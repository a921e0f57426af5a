//! Adaptive hypothesis loop: form, test, evaluate, then pivot or deepen

use crate::config::Config;
use crate::error::{EngineError, ExecutorError, ExecutorErrorKind};
use crate::patterns::{PatternLibrary, PatternMatch};
use crate::pipeline::{CommandOutcome, EvidencePipeline, RunError};
use crate::placeholder::{has_placeholders, PlaceholderResolver};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use postmortem_evidence::{CancelFlag, ReasonError};
use postmortem_session::append_jsonl;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Confirmed,
    Rejected,
    Inconclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HypothesisState {
    Formed,
    Testing,
    Confirmed,
    Rejected,
    Inconclusive,
    DeepInvestigation,
    Done,
}

/// A proposed hypothesis before it is tested
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypothesisDraft {
    pub statement: String,
    pub confidence: Confidence,
    pub test_commands: Vec<String>,
    pub expected_if_confirmed: String,
    pub expected_if_rejected: String,
}

/// A hypothesis and everything learned while testing it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hypothesis {
    pub statement: String,
    pub confidence: Confidence,
    /// Every test command attempted, in order, across all rounds
    pub test_commands: Vec<String>,
    pub expected_if_confirmed: String,
    pub expected_if_rejected: String,
    pub outcome: Option<Verdict>,
    /// Why the last evaluation came out as it did
    pub reasoning: String,
    pub rounds: usize,
    pub evidence: Vec<EvidenceSummary>,
}

impl Hypothesis {
    fn from_draft(draft: HypothesisDraft) -> Self {
        Self {
            statement: draft.statement,
            confidence: draft.confidence,
            test_commands: Vec::new(),
            expected_if_confirmed: draft.expected_if_confirmed,
            expected_if_rejected: draft.expected_if_rejected,
            outcome: None,
            reasoning: String::new(),
            rounds: 0,
            evidence: Vec::new(),
        }
    }
}

/// Analyzed evidence as presented to collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSummary {
    pub evidence_id: String,
    pub command: String,
    pub summary: String,
    pub key_findings: Vec<String>,
}

impl EvidenceSummary {
    fn from_outcome(outcome: &CommandOutcome) -> Self {
        let (summary, key_findings) = match &outcome.summary {
            Some(summary) => (summary.overall.clone(), summary.key_findings.clone()),
            None => ("(analysis pending)".to_string(), Vec::new()),
        };
        Self {
            evidence_id: outcome.evidence_id.clone(),
            command: outcome.command.clone(),
            summary,
            key_findings,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub verdict: Verdict,
    pub reasoning: String,
}

/// A root-cause localization step after confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeepTask {
    pub description: String,
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepFinding {
    pub task: String,
    pub command: String,
    pub evidence_id: Option<String>,
    pub summary: Option<String>,
    pub error: Option<String>,
}

/// Input for forming the next hypothesis
#[derive(Debug, Clone, Copy)]
pub struct FormRequest<'a> {
    pub issue: &'a str,
    pub hints: &'a [PatternMatch],
    /// Earlier hypotheses with the reasons they were rejected
    pub rejected: &'a [Hypothesis],
}

#[async_trait]
pub trait HypothesisAuthor: Send + Sync {
    async fn form(&self, request: FormRequest<'_>) -> Result<HypothesisDraft, ReasonError>;

    /// Additional targeted commands after an inconclusive round
    async fn plan_more(&self, hypothesis: &Hypothesis, round: usize) -> Result<Vec<String>, ReasonError>;

    async fn plan_deep(&self, hypothesis: &Hypothesis) -> Result<Vec<DeepTask>, ReasonError>;
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn evaluate(&self, hypothesis: &Hypothesis, evidence: &[EvidenceSummary]) -> Result<Evaluation, ReasonError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestigationOutcome {
    RootCauseConfirmed,
    RejectedTrail,
    InsufficientEvidence,
    Interrupted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedCommand {
    pub template: String,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvestigationReport {
    pub issue: String,
    pub outcome: InvestigationOutcome,
    /// Every hypothesis, rejected ones included, in the order formed
    pub hypotheses: Vec<Hypothesis>,
    pub deep_findings: Vec<DeepFinding>,
    pub skipped_commands: Vec<SkippedCommand>,
    pub evidence_ids: Vec<String>,
}

impl InvestigationReport {
    pub fn confirmed(&self) -> Option<&Hypothesis> {
        self.hypotheses
            .iter()
            .find(|h| h.outcome == Some(Verdict::Confirmed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineLimits {
    pub max_inconclusive_retries: usize,
    pub max_test_commands: usize,
    pub max_hypotheses: usize,
    pub max_deep_tasks: usize,
}

impl From<&Config> for EngineLimits {
    fn from(config: &Config) -> Self {
        Self {
            max_inconclusive_retries: config.max_inconclusive_retries,
            max_test_commands: config.max_test_commands,
            max_hypotheses: config.max_hypotheses,
            max_deep_tasks: config.max_deep_tasks,
        }
    }
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self::from(&Config::new())
    }
}

#[derive(Debug, Serialize)]
struct TrailEvent<'a> {
    at: DateTime<Utc>,
    hypothesis: usize,
    state: HypothesisState,
    statement: &'a str,
    detail: &'a str,
}

/// Result of running one batch of commands
#[derive(Default)]
struct Round {
    evidence: Vec<EvidenceSummary>,
    failures: Vec<ExecutorError>,
    interrupted: bool,
}

/// Accumulated state for one `investigate` call
#[derive(Default)]
struct Progress {
    hypotheses: Vec<Hypothesis>,
    deep_findings: Vec<DeepFinding>,
    skipped: Vec<SkippedCommand>,
    evidence_ids: Vec<String>,
}

pub struct HypothesisEngine {
    pipeline: Arc<EvidencePipeline>,
    author: Arc<dyn HypothesisAuthor>,
    classifier: Arc<dyn Classifier>,
    patterns: PatternLibrary,
    limits: EngineLimits,
    cancel: CancelFlag,
    trail: Option<PathBuf>,
}

impl HypothesisEngine {
    pub fn new(
        pipeline: Arc<EvidencePipeline>,
        author: Arc<dyn HypothesisAuthor>,
        classifier: Arc<dyn Classifier>,
        limits: EngineLimits,
    ) -> Self {
        Self {
            pipeline,
            author,
            classifier,
            patterns: PatternLibrary::builtin(),
            limits,
            cancel: CancelFlag::new(),
            trail: None,
        }
    }

    pub fn with_patterns(mut self, patterns: PatternLibrary) -> Self {
        self.patterns = patterns;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Append state transitions as JSON lines to `path`
    pub fn with_trail(mut self, path: impl Into<PathBuf>) -> Self {
        self.trail = Some(path.into());
        self
    }

    pub async fn investigate(&self, issue: &str) -> Result<InvestigationReport, EngineError> {
        let hints = self.patterns.lookup(issue, 3);
        let mut progress = Progress::default();

        while progress.hypotheses.len() < self.limits.max_hypotheses {
            if self.cancel.is_cancelled() {
                return Ok(self.report(issue, InvestigationOutcome::Interrupted, progress));
            }

            let draft = self
                .author
                .form(FormRequest {
                    issue,
                    hints: &hints,
                    rejected: &progress.hypotheses,
                })
                .await?;
            let index = progress.hypotheses.len();
            let mut hypothesis = Hypothesis::from_draft(draft.clone());
            info!(hypothesis = index, statement = %hypothesis.statement, "hypothesis formed");
            self.record(index, HypothesisState::Formed, &hypothesis.statement, "");

            let mut commands = draft.test_commands;
            commands.truncate(self.limits.max_test_commands);
            let mut retries = 0;

            loop {
                hypothesis.rounds += 1;
                hypothesis.test_commands.extend(commands.iter().cloned());
                self.record(index, HypothesisState::Testing, &hypothesis.statement, &commands.join("; "));

                let round = self.run_commands(&commands, &hypothesis.statement, &mut progress).await?;
                hypothesis.evidence.extend(round.evidence.iter().cloned());
                if round.interrupted {
                    progress.hypotheses.push(hypothesis);
                    return Ok(self.report(issue, InvestigationOutcome::Interrupted, progress));
                }

                let evaluation = self.evaluate(&hypothesis, &round).await?;
                hypothesis.reasoning = evaluation.reasoning;

                match evaluation.verdict {
                    Verdict::Confirmed | Verdict::Rejected => {
                        hypothesis.outcome = Some(evaluation.verdict);
                        break;
                    }
                    Verdict::Inconclusive => {
                        self.record(index, HypothesisState::Inconclusive, &hypothesis.statement, &hypothesis.reasoning);
                        if retries >= self.limits.max_inconclusive_retries {
                            hypothesis.reasoning = format!(
                                "still inconclusive after {} additional rounds: {}",
                                retries, hypothesis.reasoning
                            );
                            warn!(hypothesis = index, "retry cap reached, treating as rejected");
                            hypothesis.outcome = Some(Verdict::Rejected);
                            break;
                        }
                        retries += 1;
                        commands = match self.author.plan_more(&hypothesis, retries).await {
                            Ok(more) => more,
                            Err(e) => {
                                warn!(error = %e, "could not plan more tests");
                                Vec::new()
                            }
                        };
                        commands.truncate(self.limits.max_test_commands);
                        if commands.is_empty() {
                            hypothesis.reasoning =
                                format!("no further test commands available: {}", hypothesis.reasoning);
                            hypothesis.outcome = Some(Verdict::Rejected);
                            break;
                        }
                    }
                }
            }

            if hypothesis.outcome == Some(Verdict::Confirmed) {
                self.record(index, HypothesisState::Confirmed, &hypothesis.statement, &hypothesis.reasoning);
                info!(hypothesis = index, "hypothesis confirmed");
                let interrupted = self.deep_investigation(index, &hypothesis, &mut progress).await?;
                progress.hypotheses.push(hypothesis);
                let outcome = if interrupted {
                    InvestigationOutcome::Interrupted
                } else {
                    InvestigationOutcome::RootCauseConfirmed
                };
                return Ok(self.report(issue, outcome, progress));
            }

            self.record(index, HypothesisState::Rejected, &hypothesis.statement, &hypothesis.reasoning);
            info!(hypothesis = index, reason = %hypothesis.reasoning, "hypothesis rejected");
            progress.hypotheses.push(hypothesis);
        }

        let outcome = if progress.evidence_ids.is_empty() {
            InvestigationOutcome::InsufficientEvidence
        } else {
            InvestigationOutcome::RejectedTrail
        };
        Ok(self.report(issue, outcome, progress))
    }

    async fn evaluate(&self, hypothesis: &Hypothesis, round: &Round) -> Result<Evaluation, EngineError> {
        if round.evidence.is_empty() {
            if !round.failures.is_empty()
                && round
                    .failures
                    .iter()
                    .all(|f| f.kind == ExecutorErrorKind::Unavailable)
            {
                return Err(EngineError::AllCommandsFailed(round.failures[0].message.clone()));
            }
            return Ok(Evaluation {
                verdict: Verdict::Inconclusive,
                reasoning: "no evidence was gathered in this round".to_string(),
            });
        }

        match self.classifier.evaluate(hypothesis, &hypothesis.evidence).await {
            Ok(evaluation) => Ok(evaluation),
            Err(e) => {
                warn!(error = %e, "evaluation failed, counting round as inconclusive");
                Ok(Evaluation {
                    verdict: Verdict::Inconclusive,
                    reasoning: format!("evaluation unavailable: {}", e),
                })
            }
        }
    }

    async fn deep_investigation(
        &self,
        index: usize,
        hypothesis: &Hypothesis,
        progress: &mut Progress,
    ) -> Result<bool, EngineError> {
        self.record(index, HypothesisState::DeepInvestigation, &hypothesis.statement, "");
        let mut tasks = match self.author.plan_deep(hypothesis).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "could not plan deep investigation");
                Vec::new()
            }
        };
        tasks.truncate(self.limits.max_deep_tasks);

        for task in &tasks {
            for template in &task.commands {
                if self.cancel.is_cancelled() {
                    return Ok(true);
                }
                let resolved = match self.resolve(template, progress)? {
                    Some(command) => command,
                    None => continue,
                };
                let finding = match self.pipeline.run(&resolved, Some(&task.description)).await {
                    Ok(outcome) => {
                        progress.note_evidence(&outcome.evidence_id);
                        DeepFinding {
                            task: task.description.clone(),
                            command: resolved,
                            evidence_id: Some(outcome.evidence_id),
                            summary: outcome.summary.map(|s| s.overall),
                            error: None,
                        }
                    }
                    Err(RunError::Executor(e)) => {
                        warn!(command = %resolved, error = %e, "deep task command failed");
                        DeepFinding {
                            task: task.description.clone(),
                            command: resolved,
                            evidence_id: None,
                            summary: None,
                            error: Some(e.to_string()),
                        }
                    }
                    Err(RunError::Storage(e)) => return Err(e.into()),
                };
                progress.deep_findings.push(finding);
            }
        }

        self.record(index, HypothesisState::Done, &hypothesis.statement, "");
        Ok(false)
    }

    async fn run_commands(&self, templates: &[String], intent: &str, progress: &mut Progress) -> Result<Round, EngineError> {
        let mut round = Round::default();
        for template in templates {
            if self.cancel.is_cancelled() {
                round.interrupted = true;
                break;
            }
            let Some(command) = self.resolve(template, progress)? else {
                continue;
            };
            match self.pipeline.run(&command, Some(intent)).await {
                Ok(outcome) => {
                    progress.note_evidence(&outcome.evidence_id);
                    round.evidence.push(EvidenceSummary::from_outcome(&outcome));
                }
                Err(RunError::Executor(e)) => {
                    warn!(command = %command, error = %e, "command failed, counting as inconclusive evidence");
                    round.failures.push(e);
                }
                Err(RunError::Storage(e)) => return Err(e.into()),
            }
        }
        // a cancel during the last command must still stop evaluation
        if self.cancel.is_cancelled() {
            round.interrupted = true;
        }
        Ok(round)
    }

    /// Concrete command for `template`, or `None` when it must be skipped
    fn resolve(&self, template: &str, progress: &mut Progress) -> Result<Option<String>, EngineError> {
        if !has_placeholders(template) {
            return Ok(Some(template.to_string()));
        }
        let prior = self.pipeline.prior_evidence()?;
        match PlaceholderResolver::new().resolve_from(template, &prior) {
            Ok(resolved) => Ok(Some(resolved.command)),
            Err(unresolved) => {
                warn!(template, reasons = ?unresolved.reasons, "skipping unresolved command");
                progress.skipped.push(SkippedCommand {
                    template: unresolved.template,
                    reasons: unresolved.reasons,
                });
                Ok(None)
            }
        }
    }

    fn record(&self, hypothesis: usize, state: HypothesisState, statement: &str, detail: &str) {
        let Some(path) = &self.trail else {
            return;
        };
        let event = TrailEvent {
            at: Utc::now(),
            hypothesis,
            state,
            statement,
            detail,
        };
        if let Err(e) = append_jsonl(path, &event) {
            warn!(error = %e, "could not append to investigation trail");
        }
    }

    fn report(&self, issue: &str, outcome: InvestigationOutcome, progress: Progress) -> InvestigationReport {
        InvestigationReport {
            issue: issue.to_string(),
            outcome,
            hypotheses: progress.hypotheses,
            deep_findings: progress.deep_findings,
            skipped_commands: progress.skipped,
            evidence_ids: progress.evidence_ids,
        }
    }
}

impl Progress {
    fn note_evidence(&mut self, id: &str) {
        if !self.evidence_ids.iter().any(|known| known == id) {
            self.evidence_ids.push(id.to_string());
        }
    }
}
