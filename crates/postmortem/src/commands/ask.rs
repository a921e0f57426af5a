use super::Workspace;
use postmortem_index::{EvidenceRetriever, FastEmbedder, SearchMode, SearchResults};
use std::path::Path;
use std::sync::Arc;

pub async fn run(config: Option<&Path>, session_id: &str, question: &str, k: usize) -> anyhow::Result<()> {
    let workspace = Workspace::load(config)?;
    let session = workspace.sessions.open(session_id)?;
    let store = workspace.store(&session)?;

    let mut retriever = EvidenceRetriever::new(workspace.config.retriever_options());
    if workspace.config.retrieval.use_embeddings {
        let embedder = FastEmbedder::new().with_cache_dir(workspace.paths.root.join("models"));
        retriever = retriever.with_embedder(Arc::new(embedder));
    }
    if workspace.config.retrieval.rerank {
        if let Some(reasoner) = workspace.optional_reasoner() {
            retriever = retriever.with_reasoner(reasoner);
        }
    }

    let results = retriever.search(&store, question, k).await?;
    print!("{}", render(&results));
    Ok(())
}

fn render(results: &SearchResults) -> String {
    let mode = match results.mode {
        SearchMode::Semantic => "semantic",
        SearchMode::Keyword { degraded: true } => "keyword (embeddings unavailable)",
        SearchMode::Keyword { degraded: false } => "keyword",
    };
    if results.hits.is_empty() {
        return format!("No matching evidence ({} search)\n", mode);
    }
    let mut out = format!("{} results ({} search)\n", results.hits.len(), mode);
    for (i, hit) in results.hits.iter().enumerate() {
        out.push_str(&format!(
            "{}. [{:.3}] {}  {}\n   {}\n",
            i + 1,
            hit.score,
            hit.evidence.command,
            hit.evidence.id,
            hit.evidence.summary.as_deref().unwrap_or("(analysis pending)")
        ));
    }
    out
}
