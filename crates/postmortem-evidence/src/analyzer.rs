//! Output analysis: specialized analyzers first, then chunked reasoning

use crate::chunk::{split_chunks, tail_lines};
use crate::excerpt::excerpt_summary;
use crate::reason::{complete_within, extract_json, string_list, Reasoner};
use crate::store::{EvidenceStore, StoreError};
use crate::types::{CancelFlag, Chunk, ChunkFinding, Evidence, Summary};
use postmortem_analyzers::{AnalysisContext, AnalyzerRegistry, Tier};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

pub const EMPTY_OUTPUT_SUMMARY: &str = "Command produced no output.";

#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("analysis of {0} was cancelled")]
    Cancelled(String),
}

#[derive(Debug, Clone, Copy)]
pub struct AnalyzerOptions {
    /// Maximum bytes per chunk sent to the reasoner
    pub chunk_size: usize,
    /// Concurrent chunk calls; 1 analyzes sequentially with the previous finding carried forward
    pub fan_out: usize,
    /// Outputs at or under this size get an excerpt summary instead of reasoning
    pub reasoning_threshold: usize,
    pub reasoner_timeout: Duration,
    /// Lines of the previous chunk handed to the next one in concurrent mode
    pub carried_lines: usize,
}

impl AnalyzerOptions {
    pub fn new() -> Self {
        Self {
            chunk_size: 32 * 1024,
            fan_out: 4,
            reasoning_threshold: 2048,
            reasoner_timeout: Duration::from_secs(60),
            carried_lines: 8,
        }
    }
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of analyzing raw output, before anything is persisted
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    /// `None` when analysis was interrupted
    pub summary: Option<Summary>,
    pub tier: Tier,
    pub analyzer: String,
    pub chunks: Vec<Chunk>,
}

impl AnalysisOutcome {
    fn parsed(analyzer: &str, summary: Summary) -> Self {
        Self {
            summary: Some(summary),
            tier: Tier::Parse,
            analyzer: analyzer.to_string(),
            chunks: Vec::new(),
        }
    }
}

/// Turns stored command output into a summary and key findings
pub struct EvidenceAnalyzer {
    registry: AnalyzerRegistry,
    context: Arc<AnalysisContext>,
    reasoner: Option<Arc<dyn Reasoner>>,
    options: AnalyzerOptions,
    cancel: CancelFlag,
}

impl EvidenceAnalyzer {
    pub fn new(registry: AnalyzerRegistry, context: Arc<AnalysisContext>, options: AnalyzerOptions) -> Self {
        Self {
            registry,
            context,
            reasoner: None,
            options,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_reasoner(mut self, reasoner: Arc<dyn Reasoner>) -> Self {
        self.reasoner = Some(reasoner);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn context(&self) -> &Arc<AnalysisContext> {
        &self.context
    }

    pub fn registry(&self) -> &AnalyzerRegistry {
        &self.registry
    }

    pub fn options(&self) -> &AnalyzerOptions {
        &self.options
    }

    /// Analyze one stored record and persist the result.
    ///
    /// Records that already carry a summary are returned as-is. On cancellation
    /// the chunks are kept but the summary stays empty so the record is picked
    /// up again later.
    pub async fn analyze(
        &self,
        store: &EvidenceStore,
        evidence: &Evidence,
        intent: Option<&str>,
    ) -> Result<Summary, AnalyzeError> {
        if let Some(overall) = &evidence.summary {
            return Ok(Summary {
                overall: overall.clone(),
                key_findings: evidence.key_findings.clone(),
            });
        }

        let output = store.load_output(evidence)?;
        let outcome = self.analyze_output(&evidence.command, &output, intent).await;

        if !outcome.chunks.is_empty() {
            store.store_chunks(&evidence.id, &outcome.chunks)?;
        }

        let Some(summary) = outcome.summary else {
            return Err(AnalyzeError::Cancelled(evidence.id.clone()));
        };

        match store.update_summary(&evidence.id, &summary.overall, &summary.key_findings) {
            Ok(()) => {}
            Err(StoreError::AlreadySummarized(_)) => {
                // Another caller finished first; theirs stands
                let current = store.require(&evidence.id)?;
                return Ok(Summary {
                    overall: current.summary.unwrap_or_default(),
                    key_findings: current.key_findings,
                });
            }
            Err(e) => return Err(e.into()),
        }

        let mut entries = Map::new();
        if let Some(intent) = intent {
            entries.insert("intent".to_string(), Value::from(intent));
        }
        entries.insert("tier".to_string(), Value::from(outcome.tier.as_str()));
        entries.insert("analyzer".to_string(), Value::from(outcome.analyzer.as_str()));
        entries.insert("chunk_count".to_string(), Value::from(outcome.chunks.len()));
        store.merge_metadata(&evidence.id, entries)?;

        debug!(
            evidence = %evidence.id,
            analyzer = %outcome.analyzer,
            tier = %outcome.tier,
            findings = summary.key_findings.len(),
            "evidence analyzed"
        );
        Ok(summary)
    }

    /// Analyze raw output without touching the store
    pub async fn analyze_output(&self, command: &str, output: &str, intent: Option<&str>) -> AnalysisOutcome {
        if let Some(analysis) = self.registry.analyze(command, output, &self.context) {
            return AnalysisOutcome {
                summary: Some(Summary {
                    overall: analysis.summary,
                    key_findings: analysis.findings,
                }),
                tier: analysis.tier,
                analyzer: analysis.analyzer,
                chunks: Vec::new(),
            };
        }

        if output.trim().is_empty() {
            return AnalysisOutcome::parsed(
                "empty",
                Summary {
                    overall: EMPTY_OUTPUT_SUMMARY.to_string(),
                    key_findings: Vec::new(),
                },
            );
        }

        let reasoner = match &self.reasoner {
            Some(reasoner) if output.len() > self.options.reasoning_threshold => Arc::clone(reasoner),
            _ => return AnalysisOutcome::parsed("excerpt", excerpt_summary(command, output)),
        };

        let texts = split_chunks(output, self.options.chunk_size);
        let findings = if self.options.fan_out <= 1 {
            self.analyze_sequential(reasoner.as_ref(), command, intent, &texts).await
        } else {
            self.analyze_concurrent(Arc::clone(&reasoner), command, intent, &texts).await
        };

        let chunks: Vec<Chunk> = texts
            .iter()
            .zip(findings)
            .enumerate()
            .map(|(seq, (text, finding))| Chunk {
                seq,
                text: text.to_string(),
                finding,
            })
            .collect();

        if self.cancel.is_cancelled() {
            return AnalysisOutcome {
                summary: None,
                tier: Tier::DeepReasoning,
                analyzer: "reasoning".to_string(),
                chunks,
            };
        }

        let summary = self
            .summarize_chunks(reasoner.as_ref(), command, output, intent, &chunks)
            .await;
        AnalysisOutcome {
            summary: Some(summary),
            tier: Tier::DeepReasoning,
            analyzer: "reasoning".to_string(),
            chunks,
        }
    }

    async fn analyze_sequential(
        &self,
        reasoner: &dyn Reasoner,
        command: &str,
        intent: Option<&str>,
        texts: &[&str],
    ) -> Vec<Option<ChunkFinding>> {
        let total = texts.len();
        let mut findings = Vec::with_capacity(total);
        let mut carried: Option<String> = None;

        for (seq, text) in texts.iter().enumerate() {
            if self.cancel.is_cancelled() {
                findings.push(None);
                continue;
            }
            let prompt = chunk_prompt(command, intent, seq, total, text, carried.as_deref());
            let finding = analyze_chunk(reasoner, &prompt, self.options.reasoner_timeout).await;
            if finding.available && !finding.summary.is_empty() {
                carried = Some(finding.summary.clone());
            }
            findings.push(Some(finding));
        }
        findings
    }

    async fn analyze_concurrent(
        &self,
        reasoner: Arc<dyn Reasoner>,
        command: &str,
        intent: Option<&str>,
        texts: &[&str],
    ) -> Vec<Option<ChunkFinding>> {
        let total = texts.len();
        let semaphore = Arc::new(Semaphore::new(self.options.fan_out));
        let mut tasks = JoinSet::new();

        for (seq, text) in texts.iter().enumerate() {
            let carried = seq
                .checked_sub(1)
                .map(|prev| tail_lines(texts[prev], self.options.carried_lines).to_string());
            let prompt = chunk_prompt(command, intent, seq, total, text, carried.as_deref());
            let reasoner = Arc::clone(&reasoner);
            let semaphore = Arc::clone(&semaphore);
            let cancel = self.cancel.clone();
            let timeout = self.options.reasoner_timeout;

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (seq, None);
                };
                if cancel.is_cancelled() {
                    return (seq, None);
                }
                (seq, Some(analyze_chunk(reasoner.as_ref(), &prompt, timeout).await))
            });
        }

        let mut findings: Vec<Option<ChunkFinding>> = vec![None; total];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((seq, finding)) => findings[seq] = finding,
                Err(e) => warn!(error = %e, "chunk analysis task aborted"),
            }
        }

        if !self.cancel.is_cancelled() {
            for slot in findings.iter_mut().filter(|slot| slot.is_none()) {
                *slot = Some(ChunkFinding::unavailable("chunk analysis task aborted"));
            }
        }
        findings
    }

    async fn summarize_chunks(
        &self,
        reasoner: &dyn Reasoner,
        command: &str,
        output: &str,
        intent: Option<&str>,
        chunks: &[Chunk],
    ) -> Summary {
        let available: Vec<&ChunkFinding> = chunks
            .iter()
            .filter_map(|chunk| chunk.finding.as_ref())
            .filter(|finding| finding.available)
            .collect();

        if available.is_empty() {
            let mut summary = excerpt_summary(command, output);
            summary
                .overall
                .push_str(" (reasoning was unavailable for every chunk)");
            return summary;
        }

        let mut synthesized: Option<(String, Vec<String>)> = None;
        if chunks.len() > 1 {
            let prompt = synthesis_prompt(command, intent, &available);
            match complete_within(reasoner, &prompt, 0.0, self.options.reasoner_timeout).await {
                Ok(reply) => synthesized = Some(parse_synthesis(&reply)),
                Err(e) => warn!(error = %e, command, "synthesis failed, joining chunk summaries"),
            }
        }

        let (synth_overall, synth_findings) = synthesized.unwrap_or_default();
        let mut overall = if synth_overall.is_empty() {
            available
                .iter()
                .map(|finding| finding.summary.trim())
                .filter(|summary| !summary.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        } else {
            synth_overall
        };
        if overall.is_empty() {
            overall = excerpt_summary(command, output).overall;
        }

        let missing = chunks.len() - available.len();
        if missing > 0 {
            overall.push_str(&format!(
                " ({} of {} chunks could not be analyzed)",
                missing,
                chunks.len()
            ));
        }

        Summary {
            overall,
            key_findings: merge_findings(synth_findings, &available),
        }
    }
}

async fn analyze_chunk(reasoner: &dyn Reasoner, prompt: &str, timeout: Duration) -> ChunkFinding {
    match complete_within(reasoner, prompt, 0.0, timeout).await {
        Ok(reply) => parse_chunk_reply(&reply),
        Err(e) => {
            warn!(error = %e, "chunk analysis failed");
            ChunkFinding::unavailable(e.to_string())
        }
    }
}

fn chunk_prompt(
    command: &str,
    intent: Option<&str>,
    seq: usize,
    total: usize,
    text: &str,
    carried: Option<&str>,
) -> String {
    let mut prompt = format!(
        "You are analyzing output of the debugger command `{}` from a crash dump (part {} of {}).\n",
        command,
        seq + 1,
        total
    );
    if let Some(intent) = intent {
        prompt.push_str(&format!("The command was run to: {}\n", intent));
    }
    if let Some(carried) = carried {
        prompt.push_str(&format!("\nContext from the previous part:\n{}\n", carried));
    }
    prompt.push_str(&format!("\nOutput:\n{}\n", text));
    prompt.push_str(
        "\nRespond with JSON only:\n\
         {\"summary\": \"...\", \"findings\": [], \"blocking_operations\": [], \"identifiers\": [], \"exceptions\": []}\n\
         Keep addresses, thread ids and type names exactly as they appear.",
    );
    prompt
}

fn synthesis_prompt(command: &str, intent: Option<&str>, findings: &[&ChunkFinding]) -> String {
    let mut prompt = format!(
        "The output of `{}` was analyzed in {} parts. Combine the partial analyses into one.\n",
        command,
        findings.len()
    );
    if let Some(intent) = intent {
        prompt.push_str(&format!("The command was run to: {}\n", intent));
    }
    for (i, finding) in findings.iter().enumerate() {
        prompt.push_str(&format!("\nPart {}: {}\n", i + 1, finding.summary));
        for item in finding
            .findings
            .iter()
            .chain(&finding.exceptions)
            .chain(&finding.blocking_operations)
        {
            prompt.push_str(&format!("- {}\n", item));
        }
    }
    prompt.push_str("\nRespond with JSON only: {\"summary\": \"...\", \"key_findings\": []}");
    prompt
}

fn parse_chunk_reply(reply: &str) -> ChunkFinding {
    match extract_json(reply) {
        Some(value) if value.is_object() => {
            let findings = string_list(&value, "findings");
            let summary = value["summary"]
                .as_str()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .or_else(|| findings.first().cloned())
                .unwrap_or_default();
            ChunkFinding {
                summary,
                findings,
                blocking_operations: string_list(&value, "blocking_operations"),
                identifiers: string_list(&value, "identifiers"),
                exceptions: string_list(&value, "exceptions"),
                available: true,
                error: None,
            }
        }
        _ => ChunkFinding {
            summary: reply.trim().to_string(),
            available: true,
            ..ChunkFinding::default()
        },
    }
}

fn parse_synthesis(reply: &str) -> (String, Vec<String>) {
    match extract_json(reply) {
        Some(value) if value.is_object() => (
            value["summary"].as_str().unwrap_or("").trim().to_string(),
            string_list(&value, "key_findings"),
        ),
        _ => (reply.trim().to_string(), Vec::new()),
    }
}

/// Synthesized findings first, then every chunk's own; nothing a single chunk saw is dropped
fn merge_findings(synthesized: Vec<String>, chunks: &[&ChunkFinding]) -> Vec<String> {
    let mut seen = HashSet::new();
    let per_chunk = chunks.iter().flat_map(|finding| {
        finding
            .findings
            .iter()
            .chain(&finding.exceptions)
            .chain(&finding.blocking_operations)
            .cloned()
    });

    synthesized
        .into_iter()
        .chain(per_chunk)
        .filter(|item| seen.insert(item.trim().to_lowercase()))
        .collect()
}
