use super::{cancel_on_interrupt, Workspace};
use anyhow::Context;
use postmortem_core::{EngineLimits, HypothesisEngine, InvestigationOutcome, InvestigationReport, ReasoningAuthor};
use postmortem_session::write_json;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const REPORT_FILE: &str = "report.json";

pub async fn run(config: Option<&Path>, target: &Path, issue: &str, json: bool) -> anyhow::Result<()> {
    if !target.exists() {
        anyhow::bail!("target not found: {}", target.display());
    }
    let workspace = Workspace::load(config)?;
    let reasoner = workspace
        .reasoner()
        .context("investigation needs a reasoner")?;

    let session = workspace.sessions.create(&target.to_string_lossy())?;
    info!(session = %session.id, "session created");

    let cancel = cancel_on_interrupt();
    let pipeline = Arc::new(workspace.pipeline(&session, cancel.clone(), Some(Arc::clone(&reasoner)))?);
    let author = Arc::new(ReasoningAuthor::new(reasoner, workspace.config.reasoner_timeout()));
    let engine = HypothesisEngine::new(
        pipeline,
        author.clone(),
        author,
        EngineLimits::from(&workspace.config),
    )
    .with_patterns(workspace.patterns()?)
    .with_cancel(cancel)
    .with_trail(session.trail_path());

    let report = engine.investigate(issue).await?;
    write_json(&session.root.join(REPORT_FILE), &report)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render(&session.id, &report));
    }
    Ok(())
}

fn render(session_id: &str, report: &InvestigationReport) -> String {
    let mut out = format!("Session: {}\nIssue: {}\n", session_id, report.issue);
    let verdict = match report.outcome {
        InvestigationOutcome::RootCauseConfirmed => "root cause confirmed",
        InvestigationOutcome::RejectedTrail => "no hypothesis confirmed",
        InvestigationOutcome::InsufficientEvidence => "insufficient evidence",
        InvestigationOutcome::Interrupted => "interrupted",
    };
    out.push_str(&format!("Outcome: {}\n\n", verdict));

    for (i, hypothesis) in report.hypotheses.iter().enumerate() {
        let outcome = hypothesis
            .outcome
            .map(|v| format!("{:?}", v).to_uppercase())
            .unwrap_or_else(|| "UNTESTED".to_string());
        out.push_str(&format!(
            "{}. [{}] {} ({} rounds)\n   {}\n",
            i + 1,
            outcome,
            hypothesis.statement,
            hypothesis.rounds,
            hypothesis.reasoning
        ));
    }

    if !report.deep_findings.is_empty() {
        out.push_str("\nRoot cause details:\n");
        for finding in &report.deep_findings {
            let detail = finding
                .summary
                .as_deref()
                .or(finding.error.as_deref())
                .unwrap_or("(analysis pending)");
            out.push_str(&format!("- {}: `{}`\n  {}\n", finding.task, finding.command, detail));
        }
    }

    if !report.skipped_commands.is_empty() {
        out.push_str("\nSkipped commands:\n");
        for skipped in &report.skipped_commands {
            out.push_str(&format!("- {}: {}\n", skipped.template, skipped.reasons.join("; ")));
        }
    }
    out.push_str(&format!("\n{} evidence records collected\n", report.evidence_ids.len()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use postmortem_core::{Confidence, Hypothesis, SkippedCommand, Verdict};

    #[test]
    fn test_render_report() {
        let report = InvestigationReport {
            issue: "service hangs".to_string(),
            outcome: InvestigationOutcome::RejectedTrail,
            hypotheses: vec![Hypothesis {
                statement: "thread pool starvation".to_string(),
                confidence: Confidence::Medium,
                test_commands: vec!["!threadpool".to_string()],
                expected_if_confirmed: String::new(),
                expected_if_rejected: String::new(),
                outcome: Some(Verdict::Rejected),
                reasoning: "queue is empty".to_string(),
                rounds: 1,
                evidence: Vec::new(),
            }],
            deep_findings: Vec::new(),
            skipped_commands: vec![SkippedCommand {
                template: "!do <address>".to_string(),
                reasons: vec!["no address value found".to_string()],
            }],
            evidence_ids: vec!["ev_threadpool_1".to_string()],
        };

        let text = render("session_1", &report);
        assert!(text.contains("Outcome: no hypothesis confirmed"));
        assert!(text.contains("1. [REJECTED] thread pool starvation (1 rounds)"));
        assert!(text.contains("!do <address>: no address value found"));
        assert!(text.contains("1 evidence records collected"));
    }
}
