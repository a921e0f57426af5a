//! Ranks stored evidence against a free-text question

use crate::bm25::{tokenize, Bm25};
use crate::embed::{cosine_similarity, embed_within, EmbedError, Embedder};
use postmortem_evidence::{complete_within, extract_json, Evidence, EvidenceStore, Reasoner, StoreError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

const OUTPUT_EXCERPT_BYTES: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SearchMode {
    Semantic,
    /// `degraded` is set when the embedding path failed rather than being switched off
    Keyword { degraded: bool },
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub evidence: Evidence,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub mode: SearchMode,
    pub hits: Vec<SearchHit>,
}

#[derive(Debug, Clone, Copy)]
pub struct RetrieverOptions {
    pub use_embeddings: bool,
    /// Below this best cosine score the keyword ranking is used instead
    pub semantic_floor: Option<f32>,
    pub rerank: bool,
    pub embed_timeout: Duration,
    pub reasoner_timeout: Duration,
    /// Concurrent embedding calls when filling in missing vectors
    pub embed_concurrency: usize,
}

impl RetrieverOptions {
    pub fn new() -> Self {
        Self {
            use_embeddings: true,
            semantic_floor: None,
            rerank: false,
            embed_timeout: Duration::from_secs(30),
            reasoner_timeout: Duration::from_secs(120),
            embed_concurrency: 4,
        }
    }
}

impl Default for RetrieverOptions {
    fn default() -> Self {
        Self::new()
    }
}

pub struct EvidenceRetriever {
    embedder: Option<Arc<dyn Embedder>>,
    reasoner: Option<Arc<dyn Reasoner>>,
    options: RetrieverOptions,
}

impl EvidenceRetriever {
    pub fn new(options: RetrieverOptions) -> Self {
        Self {
            embedder: None,
            reasoner: None,
            options,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_reasoner(mut self, reasoner: Arc<dyn Reasoner>) -> Self {
        self.reasoner = Some(reasoner);
        self
    }

    /// Top `k` evidence records for `query`, best first.
    ///
    /// Every call re-ranks the store's current contents. Equal scores keep the
    /// most recent record first. Only storage failures are errors; a broken
    /// embedding path falls back to keyword ranking.
    pub async fn search(&self, store: &EvidenceStore, query: &str, k: usize) -> Result<SearchResults, StoreError> {
        let candidates = store.list()?;

        let (mode, mut ranked) = match self.semantic_rank(store, query, &candidates).await {
            Ok(Some(ranked)) => match self.options.semantic_floor {
                Some(floor) if ranked.first().map_or(true, |(_, score)| *score < floor) => {
                    let keyword = keyword_rank(query, &candidates);
                    if keyword.is_empty() {
                        (SearchMode::Semantic, ranked)
                    } else {
                        debug!(floor, "semantic scores under floor, using keyword ranking");
                        (SearchMode::Keyword { degraded: false }, keyword)
                    }
                }
                _ => (SearchMode::Semantic, ranked),
            },
            Ok(None) => (SearchMode::Keyword { degraded: false }, keyword_rank(query, &candidates)),
            Err(e) => {
                warn!(error = %e, "semantic retrieval unavailable, falling back to keyword ranking");
                (SearchMode::Keyword { degraded: true }, keyword_rank(query, &candidates))
            }
        };

        if self.options.rerank && ranked.len() > 1 {
            if let Some(reasoner) = &self.reasoner {
                let pool = ranked.len().min(k.max(1) * 2);
                self.rerank(reasoner.as_ref(), query, &candidates, &mut ranked[..pool]).await;
            }
        }

        ranked.truncate(k);
        let mut candidates: Vec<Option<Evidence>> = candidates.into_iter().map(Some).collect();
        let hits = ranked
            .into_iter()
            .filter_map(|(idx, score)| {
                candidates[idx].take().map(|evidence| SearchHit { evidence, score })
            })
            .collect();

        Ok(SearchResults { mode, hits })
    }

    /// `Ok(None)` when embeddings are switched off
    async fn semantic_rank(
        &self,
        store: &EvidenceStore,
        query: &str,
        candidates: &[Evidence],
    ) -> Result<Option<Vec<(usize, f32)>>, EmbedError> {
        let embedder = match &self.embedder {
            Some(embedder) if self.options.use_embeddings => Arc::clone(embedder),
            _ => return Ok(None),
        };
        if candidates.is_empty() {
            return Ok(Some(Vec::new()));
        }

        let query_vec = embed_within(embedder.as_ref(), vec![query.to_string()], self.options.embed_timeout)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::Model("no vector returned for query".to_string()))?;

        let mut vectors: Vec<Option<Vec<f32>>> = candidates
            .iter()
            .map(|evidence| {
                evidence
                    .embedding
                    .clone()
                    .filter(|vector| vector.len() == query_vec.len())
            })
            .collect();

        let missing: Vec<usize> = (0..candidates.len()).filter(|&i| vectors[i].is_none()).collect();
        if !missing.is_empty() {
            for (idx, vector) in self.embed_missing(embedder, candidates, &missing).await? {
                if let Err(e) = store.update_embedding(&candidates[idx].id, &vector) {
                    warn!(evidence = %candidates[idx].id, error = %e, "could not cache embedding");
                }
                vectors[idx] = Some(vector);
            }
        }

        let mut ranked: Vec<(usize, f32)> = vectors
            .iter()
            .enumerate()
            .map(|(idx, vector)| {
                let score = vector
                    .as_deref()
                    .map_or(0.0, |vector| cosine_similarity(&query_vec, vector));
                (idx, score)
            })
            .collect();
        sort_by_score(&mut ranked);
        Ok(Some(ranked))
    }

    async fn embed_missing(
        &self,
        embedder: Arc<dyn Embedder>,
        candidates: &[Evidence],
        missing: &[usize],
    ) -> Result<Vec<(usize, Vec<f32>)>, EmbedError> {
        let semaphore = Arc::new(Semaphore::new(self.options.embed_concurrency.max(1)));
        let timeout = self.options.embed_timeout;
        let mut tasks = JoinSet::new();

        for &idx in missing {
            let document = search_document(&candidates[idx]);
            let embedder = Arc::clone(&embedder);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| EmbedError::Unavailable(e.to_string()))?;
                let vector = embed_within(embedder.as_ref(), vec![document], timeout)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| EmbedError::Model("no vector returned".to_string()))?;
                Ok::<_, EmbedError>((idx, vector))
            });
        }

        let mut computed = Vec::with_capacity(missing.len());
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| EmbedError::Model(e.to_string()))?;
            computed.push(result?);
        }
        Ok(computed)
    }

    /// Reorder `pool` by the reasoner's judgement; any failure leaves it untouched
    async fn rerank(&self, reasoner: &dyn Reasoner, query: &str, candidates: &[Evidence], pool: &mut [(usize, f32)]) {
        let mut prompt = format!(
            "Question about a crash dump: {}\n\nRank these evidence records by how well they answer it.\n",
            query
        );
        for (pos, (idx, _)) in pool.iter().enumerate() {
            let evidence = &candidates[*idx];
            prompt.push_str(&format!(
                "[{}] {}: {}\n",
                pos,
                evidence.command,
                evidence.summary.as_deref().unwrap_or("(not analyzed)")
            ));
        }
        prompt.push_str("\nRespond with JSON only: {\"order\": [most relevant index first]}");

        let reply = match complete_within(reasoner, &prompt, 0.0, self.options.reasoner_timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "rerank failed, keeping original order");
                return;
            }
        };
        let Some(order) = extract_json(&reply).and_then(|v| v["order"].as_array().cloned()) else {
            warn!("rerank reply had no order, keeping original order");
            return;
        };

        let original = pool.to_vec();
        let mut placed = vec![false; original.len()];
        let mut reordered = Vec::with_capacity(original.len());
        for pos in order.iter().filter_map(|v| v.as_u64()).map(|v| v as usize) {
            if pos < original.len() && !placed[pos] {
                placed[pos] = true;
                reordered.push(original[pos]);
            }
        }
        reordered.extend(
            original
                .iter()
                .zip(&placed)
                .filter(|(_, placed)| !**placed)
                .map(|(entry, _)| *entry),
        );
        pool.copy_from_slice(&reordered);
    }
}

/// Keyword ranking over the search documents; records with no overlap are left out
pub fn keyword_rank(query: &str, candidates: &[Evidence]) -> Vec<(usize, f32)> {
    let query_tokens = tokenize(query);
    if query_tokens.is_empty() || candidates.is_empty() {
        return Vec::new();
    }
    let documents: Vec<Vec<String>> = candidates.iter().map(|e| tokenize(&search_document(e))).collect();
    let bm25 = Bm25::new(&documents);

    let mut ranked: Vec<(usize, f32)> = bm25
        .scores(&query_tokens)
        .into_iter()
        .enumerate()
        .filter(|(_, score)| *score > 0.0)
        .map(|(idx, score)| (idx, score as f32))
        .collect();
    sort_by_score(&mut ranked);
    ranked
}

/// Text an evidence record is matched on
pub fn search_document(evidence: &Evidence) -> String {
    let mut doc = evidence.command.clone();
    match &evidence.summary {
        Some(summary) => {
            doc.push('\n');
            doc.push_str(summary);
            for finding in &evidence.key_findings {
                doc.push('\n');
                doc.push_str(finding);
            }
        }
        None => {
            if let Some(output) = evidence.inline_output() {
                let mut end = output.len().min(OUTPUT_EXCERPT_BYTES);
                while !output.is_char_boundary(end) {
                    end -= 1;
                }
                doc.push('\n');
                doc.push_str(&output[..end]);
            }
        }
    }
    doc
}

/// Descending by score; the sort is stable so input order breaks ties
fn sort_by_score(ranked: &mut [(usize, f32)]) {
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
}
