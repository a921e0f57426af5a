use async_trait::async_trait;
use postmortem_evidence::{EvidenceStore, StoreOptions};
use postmortem_index::{EmbedError, Embedder, EvidenceRetriever, RetrieverOptions, SearchMode};
use std::path::Path;
use std::sync::Arc;

/// Bag-of-keywords vectors: [heap, lock/monitor, thread]
struct KeywordEmbedder;

#[async_trait]
impl Embedder for KeywordEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts
            .iter()
            .map(|text| {
                let text = text.to_lowercase();
                vec![
                    text.matches("heap").count() as f32,
                    (text.matches("lock").count() + text.matches("monitor").count()) as f32,
                    text.matches("thread").count() as f32,
                ]
            })
            .collect())
    }
}

struct BrokenEmbedder;

#[async_trait]
impl Embedder for BrokenEmbedder {
    async fn embed(&self, _texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbedError> {
        Err(EmbedError::Unavailable("no model configured".to_string()))
    }
}

fn seeded_store(dir: &Path) -> EvidenceStore {
    let store = EvidenceStore::open_at(
        &dir.join("evidence.db"),
        dir.join("evidence"),
        "session_test",
        StoreOptions::default(),
    )
    .unwrap();
    for (command, output, summary) in [
        ("!dumpheap -stat", "MT Count TotalSize", "heap dominated by strings"),
        ("!syncblk", "Index SyncBlock MonitorHeld", "monitor lock held by thread 6"),
        ("!eeversion", "8.0.1", "runtime version 8.0.1"),
    ] {
        let reference = store.put(command, output).unwrap();
        store.update_summary(&reference.id, summary, &[]).unwrap();
    }
    store
}

#[tokio::test]
async fn test_keyword_fallback_when_embeddings_disabled() {
    let temp = tempfile::tempdir().unwrap();
    let store = seeded_store(temp.path());
    let retriever = EvidenceRetriever::new(RetrieverOptions::default());

    let first = retriever.search(&store, "which monitor is held", 5).await.unwrap();
    assert_eq!(first.mode, SearchMode::Keyword { degraded: false });
    assert!(!first.hits.is_empty());
    assert_eq!(first.hits[0].evidence.command, "!syncblk");

    let second = retriever.search(&store, "which monitor is held", 5).await.unwrap();
    let ids = |results: &postmortem_index::SearchResults| {
        results.hits.iter().map(|hit| hit.evidence.id.clone()).collect::<Vec<_>>()
    };
    assert_eq!(ids(&first), ids(&second));
}

#[tokio::test]
async fn test_equal_scores_favor_most_recent() {
    let temp = tempfile::tempdir().unwrap();
    let store = EvidenceStore::open_at(
        &temp.path().join("evidence.db"),
        temp.path().join("evidence"),
        "session_test",
        StoreOptions::default(),
    )
    .unwrap();
    let older = store.put("!clrstack -a", "frames of thread 6").unwrap();
    store.update_summary(&older.id, "thread blocked on monitor", &[]).unwrap();
    let newer = store.put("!clrstack -p", "frames of thread 9").unwrap();
    store.update_summary(&newer.id, "thread blocked on monitor", &[]).unwrap();

    let retriever = EvidenceRetriever::new(RetrieverOptions::default());
    let results = retriever.search(&store, "monitor", 2).await.unwrap();
    assert_eq!(results.hits.len(), 2);
    assert_eq!(results.hits[0].score, results.hits[1].score);
    assert_eq!(results.hits[0].evidence.id, newer.id);
    assert_eq!(results.hits[1].evidence.id, older.id);
}

#[tokio::test]
async fn test_semantic_ranking_caches_embeddings() {
    let temp = tempfile::tempdir().unwrap();
    let store = seeded_store(temp.path());
    let retriever = EvidenceRetriever::new(RetrieverOptions::default()).with_embedder(Arc::new(KeywordEmbedder));

    let results = retriever.search(&store, "who holds the lock", 2).await.unwrap();
    assert_eq!(results.mode, SearchMode::Semantic);
    assert_eq!(results.hits.len(), 2);
    assert_eq!(results.hits[0].evidence.command, "!syncblk");
    assert!(results.hits[0].score > results.hits[1].score);

    assert!(store.list().unwrap().iter().all(|evidence| evidence.embedding.is_some()));
}

#[tokio::test]
async fn test_broken_embedder_degrades_to_keywords() {
    let temp = tempfile::tempdir().unwrap();
    let store = seeded_store(temp.path());
    let retriever = EvidenceRetriever::new(RetrieverOptions::default()).with_embedder(Arc::new(BrokenEmbedder));

    let results = retriever.search(&store, "heap strings", 3).await.unwrap();
    assert_eq!(results.mode, SearchMode::Keyword { degraded: true });
    assert_eq!(results.hits[0].evidence.command, "!dumpheap -stat");
}

#[tokio::test]
async fn test_weak_semantic_match_uses_keywords_under_floor() {
    let temp = tempfile::tempdir().unwrap();
    let store = seeded_store(temp.path());
    let options = RetrieverOptions {
        semantic_floor: Some(0.5),
        ..RetrieverOptions::default()
    };
    let retriever = EvidenceRetriever::new(options).with_embedder(Arc::new(KeywordEmbedder));

    let results = retriever.search(&store, "strings please", 3).await.unwrap();
    assert_eq!(results.mode, SearchMode::Keyword { degraded: false });
    assert_eq!(results.hits.len(), 1);
    assert_eq!(results.hits[0].evidence.command, "!dumpheap -stat");
}
