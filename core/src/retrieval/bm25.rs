//! Okapi BM25 (k1=1.5, b=0.75) over an in-memory document set (§4.2).

use std::collections::HashMap;

use super::tokenize::tokenize;

const K1: f64 = 1.5;
const B: f64 = 0.75;

pub struct Document {
    pub id: String,
    pub text: String,
}

struct IndexedDoc {
    id: String,
    term_counts: HashMap<String, u32>,
    len: usize,
}

/// A disposable BM25 index built fresh per query over the candidate document set
/// (retrieval is stateless over Storage — no persistent index is kept).
pub struct Bm25Index {
    docs: Vec<IndexedDoc>,
    doc_freq: HashMap<String, u32>,
    avg_len: f64,
}

impl Bm25Index {
    pub fn build(documents: &[Document]) -> Self {
        let mut docs = Vec::with_capacity(documents.len());
        let mut doc_freq: HashMap<String, u32> = HashMap::new();
        let mut total_len = 0usize;

        for d in documents {
            let terms = tokenize(&d.text);
            total_len += terms.len();
            let mut counts: HashMap<String, u32> = HashMap::new();
            for t in &terms {
                *counts.entry(t.clone()).or_insert(0) += 1;
            }
            for t in counts.keys() {
                *doc_freq.entry(t.clone()).or_insert(0) += 1;
            }
            docs.push(IndexedDoc {
                id: d.id.clone(),
                term_counts: counts,
                len: terms.len(),
            });
        }

        let avg_len = if docs.is_empty() {
            0.0
        } else {
            total_len as f64 / docs.len() as f64
        };

        Self {
            docs,
            doc_freq,
            avg_len,
        }
    }

    fn idf(&self, term: &str) -> f64 {
        let n = self.docs.len() as f64;
        let df = *self.doc_freq.get(term).unwrap_or(&0) as f64;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// Returns `(doc_id, score)` pairs for all documents with nonzero score,
    /// sorted descending by score, truncated to `top_k`.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<(String, f64)> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() || self.docs.is_empty() {
            return Vec::new();
        }

        let mut scores: Vec<(String, f64)> = self
            .docs
            .iter()
            .map(|doc| {
                let mut score = 0.0;
                for term in &query_terms {
                    let tf = *doc.term_counts.get(term).unwrap_or(&0) as f64;
                    if tf == 0.0 {
                        continue;
                    }
                    let idf = self.idf(term);
                    let denom = tf + K1 * (1.0 - B + B * (doc.len as f64 / self.avg_len.max(1.0)));
                    score += idf * (tf * (K1 + 1.0)) / denom;
                }
                (doc.id.clone(), score)
            })
            .filter(|(_, score)| *score > 0.0)
            .collect();

        scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scores.truncate(top_k);
        scores
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_exact_term_match_highest() {
        let docs = vec![
            Document {
                id: "a".into(),
                text: "the gpu temperature is high".into(),
            },
            Document {
                id: "b".into(),
                text: "unrelated note about cooking pasta".into(),
            },
        ];
        let index = Bm25Index::build(&docs);
        let hits = index.search("gpu temperature", 5);
        assert_eq!(hits[0].0, "a");
    }

    #[test]
    fn empty_query_returns_nothing() {
        let docs = vec![Document {
            id: "a".into(),
            text: "hello world".into(),
        }];
        let index = Bm25Index::build(&docs);
        assert!(index.search("", 5).is_empty());
    }
}
