//! Semantic evidence retrieval with BM25 keyword fallback

mod bm25;
mod embed;
mod retriever;

pub use bm25::{tokenize, Bm25};
pub use embed::{cosine_similarity, embed_within, EmbedError, Embedder, FastEmbedder};
pub use retriever::{
    keyword_rank, search_document, EvidenceRetriever, RetrieverOptions, SearchHit, SearchMode, SearchResults,
};
