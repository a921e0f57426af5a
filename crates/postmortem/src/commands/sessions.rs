use super::Workspace;
use postmortem_session::RetentionPolicy;
use std::path::Path;

pub fn run_list(config: Option<&Path>) -> anyhow::Result<()> {
    let workspace = Workspace::load(config)?;
    print!("{}", list(&workspace)?);
    Ok(())
}

pub fn run_show(config: Option<&Path>, id: &str) -> anyhow::Result<()> {
    let workspace = Workspace::load(config)?;
    print!("{}", show(&workspace, id)?);
    Ok(())
}

pub fn run_cleanup(config: Option<&Path>, days: Option<i64>, keep: Option<usize>) -> anyhow::Result<()> {
    let workspace = Workspace::load(config)?;
    let removed = cleanup(&workspace, days, keep)?;
    for id in &removed {
        println!("removed {}", id);
    }
    println!("{} sessions removed", removed.len());
    Ok(())
}

fn list(workspace: &Workspace) -> anyhow::Result<String> {
    let sessions = workspace.sessions.list()?;
    if sessions.is_empty() {
        return Ok("No sessions\n".to_string());
    }
    let mut out = String::new();
    for info in sessions {
        out.push_str(&format!(
            "{}  {}  {}  {} external files, {} KB\n",
            info.session.id,
            info.session.created_at.format("%Y-%m-%d %H:%M"),
            info.session.target,
            info.external_files,
            info.disk_bytes / 1024
        ));
    }
    Ok(out)
}

fn show(workspace: &Workspace, id: &str) -> anyhow::Result<String> {
    let session = workspace.sessions.open(id)?;
    let store = workspace.store(&session)?;
    let evidence = store.list()?;

    let mut out = format!(
        "Session: {}\nTarget: {}\nCreated: {}\nEvidence: {}\n",
        session.id,
        session.target,
        session.created_at.to_rfc3339(),
        evidence.len()
    );
    for record in evidence {
        out.push_str(&format!(
            "\n{}  {} ({} bytes, {})\n  {}\n",
            record.id,
            record.command,
            record.size,
            record.location.kind(),
            record.summary.as_deref().unwrap_or("(analysis pending)")
        ));
    }
    Ok(out)
}

fn cleanup(workspace: &Workspace, days: Option<i64>, keep: Option<usize>) -> anyhow::Result<Vec<String>> {
    let configured = workspace.config.retention;
    let policy = RetentionPolicy {
        max_age_days: days.unwrap_or(configured.max_age_days),
        keep_recent: keep.unwrap_or(configured.keep_recent),
    };
    Ok(workspace.sessions.cleanup(&policy)?)
}
