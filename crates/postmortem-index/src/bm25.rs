//! BM25 keyword scoring

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

const K1: f64 = 1.5;
const B: f64 = 0.75;

static TOKENIZE_RE: OnceLock<Regex> = OnceLock::new();

pub fn tokenize(text: &str) -> Vec<String> {
    let re = TOKENIZE_RE.get_or_init(|| Regex::new(r"[a-z][a-z0-9_]{2,}").unwrap());
    re.find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

/// BM25 over a fixed corpus; documents are addressed by position
#[derive(Debug, Clone)]
pub struct Bm25 {
    avg_doc_len: f64,
    doc_lens: Vec<usize>,
    term_freqs: Vec<HashMap<String, usize>>,
    idf: HashMap<String, f64>,
}

impl Bm25 {
    pub fn new(documents: &[Vec<String>]) -> Self {
        let doc_count = documents.len();
        let total_len: usize = documents.iter().map(Vec::len).sum();
        let avg_doc_len = if doc_count == 0 {
            0.0
        } else {
            total_len as f64 / doc_count as f64
        };

        let mut doc_freq: HashMap<&str, usize> = HashMap::new();
        for tokens in documents {
            let unique: HashSet<&str> = tokens.iter().map(String::as_str).collect();
            for token in unique {
                *doc_freq.entry(token).or_insert(0) += 1;
            }
        }

        let idf = doc_freq
            .into_iter()
            .map(|(term, df)| {
                let idf = ((doc_count as f64 - df as f64 + 0.5) / (df as f64 + 0.5) + 1.0).ln();
                (term.to_string(), idf)
            })
            .collect();

        let term_freqs = documents
            .iter()
            .map(|tokens| {
                let mut tf = HashMap::new();
                for token in tokens {
                    *tf.entry(token.clone()).or_insert(0) += 1;
                }
                tf
            })
            .collect();

        Self {
            avg_doc_len,
            doc_lens: documents.iter().map(Vec::len).collect(),
            term_freqs,
            idf,
        }
    }

    pub fn len(&self) -> usize {
        self.doc_lens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_lens.is_empty()
    }

    pub fn score(&self, doc: usize, query_tokens: &[String]) -> f64 {
        let doc_len = self.doc_lens[doc] as f64;
        let avg = if self.avg_doc_len > 0.0 { self.avg_doc_len } else { 1.0 };
        let tf = &self.term_freqs[doc];

        query_tokens
            .iter()
            .filter_map(|term| {
                let freq = *tf.get(term)? as f64;
                let idf = self.idf.get(term)?;
                let norm = freq + K1 * (1.0 - B + B * doc_len / avg);
                Some(idf * freq * (K1 + 1.0) / norm)
            })
            .sum()
    }

    /// Score of every document, in corpus order
    pub fn scores(&self, query_tokens: &[String]) -> Vec<f64> {
        (0..self.len()).map(|doc| self.score(doc, query_tokens)).collect()
    }
}
