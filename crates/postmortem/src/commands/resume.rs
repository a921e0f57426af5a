use super::{cancel_on_interrupt, Workspace};
use std::path::Path;

pub async fn run(config: Option<&Path>, session_id: &str) -> anyhow::Result<()> {
    let workspace = Workspace::load(config)?;
    let session = workspace.sessions.open(session_id)?;
    let pipeline = workspace.pipeline(&session, cancel_on_interrupt(), workspace.optional_reasoner())?;

    let completed = pipeline.complete_pending().await?;
    for id in &completed {
        println!("analyzed {}", id);
    }
    let remaining = pipeline.store().pending_analysis()?.len();
    println!("{} completed, {} still pending", completed.len(), remaining);
    Ok(())
}
