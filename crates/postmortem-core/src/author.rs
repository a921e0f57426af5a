//! Hypothesis author and classifier backed by a text reasoner

use crate::engine::{
    Classifier, Confidence, DeepTask, Evaluation, EvidenceSummary, FormRequest, Hypothesis, HypothesisAuthor,
    HypothesisDraft, Verdict,
};
use crate::patterns::format_hints;
use async_trait::async_trait;
use postmortem_evidence::{complete_within, extract_json, string_list, ReasonError, Reasoner};
use postmortem_session::truncate_to_tokens;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const FORM_TEMPERATURE: f32 = 0.3;
const EVALUATE_TEMPERATURE: f32 = 0.0;
const EVIDENCE_TOKEN_BUDGET: usize = 6000;
const MAX_ADDITIONAL_COMMANDS: usize = 2;

const COMMAND_GUIDELINES: &str = "Use plain debugger commands such as !threads, !threadpool, !dumpheap -stat, \
!clrstack, !syncblk, !eeheap, !finalizequeue. No pipes or shell syntax. \
Where a value must come from earlier output, write a placeholder such as <address>, <largest_address>, \
<thread_id> or <MT> instead of inventing one.";

pub struct ReasoningAuthor {
    reasoner: Arc<dyn Reasoner>,
    timeout: Duration,
}

impl ReasoningAuthor {
    pub fn new(reasoner: Arc<dyn Reasoner>, timeout: Duration) -> Self {
        Self { reasoner, timeout }
    }

    async fn ask(&self, prompt: &str, temperature: f32) -> Result<Value, ReasonError> {
        let reply = complete_within(self.reasoner.as_ref(), prompt, temperature, self.timeout).await?;
        debug!(chars = reply.len(), "reasoner replied");
        extract_json(&reply).ok_or_else(|| ReasonError::Malformed(preview(&reply)))
    }
}

#[async_trait]
impl HypothesisAuthor for ReasoningAuthor {
    async fn form(&self, request: FormRequest<'_>) -> Result<HypothesisDraft, ReasonError> {
        let value = self.ask(&form_prompt(&request), FORM_TEMPERATURE).await?;
        parse_draft(&value)
    }

    async fn plan_more(&self, hypothesis: &Hypothesis, round: usize) -> Result<Vec<String>, ReasonError> {
        let prompt = format!(
            "Hypothesis: {}\n\nEvidence collected so far is INCONCLUSIVE:\n{}\n\nCommands already run:\n{}\n\n\
             Attempt #{} - what different commands would clarify this? {}\n\n\
             Return JSON:\n{{\"additional_commands\": [\"command1\", \"command2\"], \"reasoning\": \"...\"}}\n\
             At most {} commands. Do not repeat commands already run.",
            hypothesis.statement,
            evidence_block(&hypothesis.evidence),
            hypothesis.test_commands.join("\n"),
            round,
            COMMAND_GUIDELINES,
            MAX_ADDITIONAL_COMMANDS,
        );
        let value = self.ask(&prompt, FORM_TEMPERATURE).await?;
        let mut commands: Vec<String> = string_list(&value, "additional_commands")
            .into_iter()
            .filter(|c| !hypothesis.test_commands.contains(c))
            .collect();
        commands.truncate(MAX_ADDITIONAL_COMMANDS);
        Ok(commands)
    }

    async fn plan_deep(&self, hypothesis: &Hypothesis) -> Result<Vec<DeepTask>, ReasonError> {
        let prompt = format!(
            "Hypothesis CONFIRMED: {}\n\nEvidence collected:\n{}\n\n\
             Now plan a focused investigation to find exactly where and why. {}\n\n\
             Return JSON:\n{{\"investigation_plan\": [{{\"task\": \"what to find\", \"commands\": [\"command\"]}}], \
             \"reasoning\": \"...\"}}\nKeep it to 3-5 tasks.",
            hypothesis.statement,
            evidence_block(&hypothesis.evidence),
            COMMAND_GUIDELINES,
        );
        let value = self.ask(&prompt, FORM_TEMPERATURE).await?;
        parse_plan(&value)
    }
}

#[async_trait]
impl Classifier for ReasoningAuthor {
    async fn evaluate(&self, hypothesis: &Hypothesis, evidence: &[EvidenceSummary]) -> Result<Evaluation, ReasonError> {
        let prompt = format!(
            "Evaluate this hypothesis against the evidence.\n\nHYPOTHESIS: {}\n\
             EXPECTED IF CONFIRMED: {}\nEXPECTED IF REJECTED: {}\n\nEVIDENCE:\n{}\n\n\
             Return JSON:\n{{\"result\": \"confirmed|rejected|inconclusive\", \"reasoning\": \"...\"}}\n\
             Answer inconclusive only when the evidence neither supports nor contradicts the hypothesis.",
            hypothesis.statement,
            hypothesis.expected_if_confirmed,
            hypothesis.expected_if_rejected,
            evidence_block(evidence),
        );
        let value = self.ask(&prompt, EVALUATE_TEMPERATURE).await?;
        parse_evaluation(&value)
    }
}

fn form_prompt(request: &FormRequest<'_>) -> String {
    let mut prompt = format!("USER QUESTION: {}\n\n", request.issue);
    let hints = format_hints(request.hints);
    if !hints.is_empty() {
        prompt.push_str(&hints);
        prompt.push('\n');
    }
    if !request.rejected.is_empty() {
        prompt.push_str("Previously rejected hypotheses (do not repeat them):\n");
        for h in request.rejected {
            prompt.push_str(&format!("- {}\n  Why rejected: {}\n", h.statement, h.reasoning));
        }
        prompt.push('\n');
    }
    prompt.push_str(
        "Form the most likely application-level hypothesis for the root cause. \
         Ignore debugger setup issues such as symbols or extension versions.\n\n",
    );
    prompt.push_str(COMMAND_GUIDELINES);
    prompt.push_str(
        "\n\nReturn JSON:\n{\"hypothesis\": \"...\", \"confidence\": \"high|medium|low\", \"reasoning\": \"...\", \
         \"test_commands\": [\"command1\", \"command2\"], \"expected_if_confirmed\": \"...\", \
         \"expected_if_rejected\": \"...\"}",
    );
    prompt
}

/// Evidence summaries as a prompt block, bounded to the token budget
fn evidence_block(evidence: &[EvidenceSummary]) -> String {
    if evidence.is_empty() {
        return "(none)".to_string();
    }
    let mut block = String::new();
    for e in evidence {
        block.push_str(&format!("[{}] {}\n", e.command, e.summary));
        for finding in &e.key_findings {
            block.push_str(&format!("  - {}\n", finding));
        }
    }
    truncate_to_tokens(&block, EVIDENCE_TOKEN_BUDGET).to_string()
}

fn text_field(value: &Value, key: &str) -> String {
    value[key].as_str().map(str::trim).unwrap_or_default().to_string()
}

fn parse_draft(value: &Value) -> Result<HypothesisDraft, ReasonError> {
    let statement = text_field(value, "hypothesis");
    if statement.is_empty() {
        return Err(ReasonError::Malformed("reply has no hypothesis".to_string()));
    }
    let confidence = match text_field(value, "confidence").to_lowercase().as_str() {
        "high" => Confidence::High,
        "low" => Confidence::Low,
        _ => Confidence::Medium,
    };
    Ok(HypothesisDraft {
        statement,
        confidence,
        test_commands: string_list(value, "test_commands"),
        expected_if_confirmed: text_field(value, "expected_if_confirmed"),
        expected_if_rejected: text_field(value, "expected_if_rejected"),
    })
}

fn parse_evaluation(value: &Value) -> Result<Evaluation, ReasonError> {
    let verdict = match text_field(value, "result").to_lowercase().as_str() {
        "confirmed" => Verdict::Confirmed,
        "rejected" => Verdict::Rejected,
        "inconclusive" => Verdict::Inconclusive,
        other => return Err(ReasonError::Malformed(format!("unknown verdict `{}`", other))),
    };
    Ok(Evaluation {
        verdict,
        reasoning: text_field(value, "reasoning"),
    })
}

/// Tasks given as objects carry commands; bare strings become tasks with none
fn parse_plan(value: &Value) -> Result<Vec<DeepTask>, ReasonError> {
    let items = value["investigation_plan"]
        .as_array()
        .ok_or_else(|| ReasonError::Malformed("reply has no investigation_plan".to_string()))?;
    Ok(items
        .iter()
        .filter_map(|item| match item {
            Value::String(task) => Some(DeepTask {
                description: task.trim().to_string(),
                commands: Vec::new(),
            }),
            Value::Object(_) => Some(DeepTask {
                description: text_field(item, "task"),
                commands: string_list(item, "commands"),
            }),
            _ => None,
        })
        .filter(|task| !task.description.is_empty())
        .collect())
}

fn preview(reply: &str) -> String {
    reply.chars().take(120).collect()
}
