use super::{cancel_on_interrupt, Workspace};
use postmortem_core::PlaceholderResolver;
use std::path::Path;

pub async fn run(config: Option<&Path>, session_id: &str, command: &str) -> anyhow::Result<()> {
    let workspace = Workspace::load(config)?;
    let session = workspace.sessions.open(session_id)?;
    let pipeline = workspace.pipeline(&session, cancel_on_interrupt(), workspace.optional_reasoner())?;

    let resolved = PlaceholderResolver::new().resolve_from(command, &pipeline.prior_evidence()?)?;
    if resolved.command != command {
        println!("Resolved: {}", resolved.command);
    }

    let outcome = pipeline.run(&resolved.command, None).await?;
    println!("Evidence: {} ({:?})", outcome.evidence_id, outcome.status);
    if let Some(error) = &outcome.command_error {
        println!("Debugger error: {}", error);
    }
    match &outcome.summary {
        Some(summary) => {
            println!("{}", summary.overall);
            for finding in &summary.key_findings {
                println!("  - {}", finding);
            }
        }
        None => println!("Analysis interrupted; run `postmortem resume --session {}`", session.id),
    }
    Ok(())
}
