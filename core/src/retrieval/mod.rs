//! Stateless retrieval over Storage: BM25 ranking, optional hybrid vector+MMR
//! re-ranking, and graph-memory BFS (§4.2).

pub mod bm25;
pub mod graph;
pub mod tokenize;

use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::storage::record::Experience;
use crate::storage::{Storage, Stream};
use bm25::{Bm25Index, Document};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchMode {
    Bm25,
    Hybrid,
}

const MMR_LAMBDA: f64 = 0.72;
const OVERSAMPLE_FACTOR: usize = 3;

/// A candidate record, plus the caller's memory-recall boosts (§4.2 "importance +
/// session boosts").
pub struct SearchCandidate {
    pub id: String,
    pub text: String,
    pub importance: f64,
    pub session_id: Option<String>,
    pub topic: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
}

/// Optional embedding provider for hybrid mode. Implementors own the model/backend;
/// this stays a narrow seam so BM25-only builds never need one.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        (dot / (na * nb)) as f64
    }
}

/// Runs BM25 (and optionally vector+MMR hybrid re-ranking) over `candidates`, applying
/// the importance/session/topic boosts, caller-supplied for memory-recall callers.
pub fn search(
    candidates: &[SearchCandidate],
    query: &str,
    top_k: usize,
    mode: SearchMode,
    caller_session_id: Option<&str>,
    inferred_topic: Option<&str>,
    embedder: Option<&dyn Embedder>,
) -> Vec<SearchHit> {
    let documents: Vec<Document> = candidates
        .iter()
        .map(|c| Document {
            id: c.id.clone(),
            text: c.text.clone(),
        })
        .collect();
    let index = Bm25Index::build(&documents);

    let pool_size = match mode {
        SearchMode::Bm25 => top_k,
        SearchMode::Hybrid => top_k * OVERSAMPLE_FACTOR,
    };
    let bm25_hits = index.search(query, pool_size.max(top_k));

    let by_id: std::collections::HashMap<&str, &SearchCandidate> =
        candidates.iter().map(|c| (c.id.as_str(), c)).collect();

    let mut boosted: Vec<SearchHit> = bm25_hits
        .into_iter()
        .map(|(id, score)| {
            let mut s = score;
            if let Some(c) = by_id.get(id.as_str()) {
                s *= 1.0 + 0.2 * c.importance;
                if let (Some(caller_sid), Some(record_sid)) = (caller_session_id, c.session_id.as_deref()) {
                    if caller_sid == record_sid {
                        s *= 1.5;
                    }
                }
                if let (Some(q_topic), Some(record_topic)) = (inferred_topic, c.topic.as_deref()) {
                    if q_topic == record_topic {
                        s *= 1.3;
                    }
                }
            }
            SearchHit { id, score: s }
        })
        .collect();

    if mode == SearchMode::Hybrid {
        if let Some(embedder) = embedder {
            let query_vec = embedder.embed(query);
            let mut selected: Vec<SearchHit> = Vec::new();
            let mut remaining = boosted.clone();
            while !remaining.is_empty() && selected.len() < top_k {
                let mut best_idx = 0usize;
                let mut best_score = f64::MIN;
                for (idx, candidate) in remaining.iter().enumerate() {
                    let relevance = if let Some(c) = by_id.get(candidate.id.as_str()) {
                        cosine(&query_vec, &embedder.embed(&c.text))
                    } else {
                        0.0
                    };
                    let diversity = selected
                        .iter()
                        .map(|s| {
                            if let (Some(a), Some(b)) = (by_id.get(s.id.as_str()), by_id.get(candidate.id.as_str())) {
                                cosine(&embedder.embed(&a.text), &embedder.embed(&b.text))
                            } else {
                                0.0
                            }
                        })
                        .fold(0.0, f64::max);
                    let mmr_score = MMR_LAMBDA * relevance - (1.0 - MMR_LAMBDA) * diversity;
                    if mmr_score > best_score {
                        best_score = mmr_score;
                        best_idx = idx;
                    }
                }
                let mut picked = remaining.remove(best_idx);
                picked.score = best_score;
                selected.push(picked);
            }
            return selected;
        }
    }

    boosted.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    boosted.truncate(top_k);
    boosted
}

/// Convenience: searches the `experiences` stream directly for simple callers that
/// don't need hybrid boosts (used by the continue-classifier prompt assembly).
pub fn search_experiences(storage: &Storage, query: &str, top_k: usize) -> CoreResult<Vec<SearchHit>> {
    let records: Vec<Experience> = storage.read(Stream::Experiences, Some(2000))?;
    let candidates: Vec<SearchCandidate> = records
        .iter()
        .enumerate()
        .map(|(i, e)| SearchCandidate {
            id: i.to_string(),
            text: format!("{} {}", e.user_request, e.result_preview),
            importance: if e.success { 0.6 } else { 0.2 },
            session_id: e.session_id.clone(),
            topic: None,
        })
        .collect();
    Ok(search(&candidates, query, top_k, SearchMode::Bm25, None, None, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_boost_reorders_ties() {
        let candidates = vec![
            SearchCandidate {
                id: "a".into(),
                text: "deploy the service".into(),
                importance: 0.0,
                session_id: Some("s1".into()),
                topic: None,
            },
            SearchCandidate {
                id: "b".into(),
                text: "deploy the service".into(),
                importance: 0.0,
                session_id: Some("other".into()),
                topic: None,
            },
        ];
        let hits = search(&candidates, "deploy service", 5, SearchMode::Bm25, Some("s1"), None, None);
        assert_eq!(hits[0].id, "a");
    }
}
