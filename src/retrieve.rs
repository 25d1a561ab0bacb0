//! Hybrid retrieval: dense pgvector cosine search plus BM25 full-text
//! search, fused by Reciprocal Rank Fusion with domain boosts.
//!
//! Determinism: every candidate list is ordered `score desc, doc_id asc,
//! chunk_id asc`, and fusion/boost ties break on `chunk_id` ascending, so
//! identical database state and query always produce the identical ranking.
//!
//! A request moves through `received → embedded → dense_done → bm25_done →
//! fused → boosted → packed → returned`; a recoverable failure on one leg
//! (e.g. the BM25 index is missing) degrades to the other leg and records
//! the reason instead of failing the request.

use anyhow::{bail, Result};
use regex::Regex;
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Instant;

use crate::classify::QueryClassifier;
use crate::config::Config;
use crate::pack;
use crate::provider::create_provider;

static MONTH_OR_YEAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(january|february|march|april|may|june|july|august|september|october|november|december)\b|\b20\d{2}\b",
    )
    .unwrap()
});

/// One retrieval hit, carrying the evidence trail of how it was ranked.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub doc_id: String,
    pub title: String,
    pub url: String,
    pub source_system: String,
    pub text_md: String,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boost_applied: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dense_rank: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bm25_rank: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rrf_score: Option<f64>,
}

/// Cosine similarity with the denominators guarded like the embedding side.
pub fn cosine_sim(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += *x as f64 * *y as f64;
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    dot / ((norm_a.sqrt() + 1e-8) * (norm_b.sqrt() + 1e-8))
}

/// Reciprocal Rank Fusion: `score(c) = Σ 1/(k + rank_i(c))` over the lists
/// the chunk appears in. Result is ordered by RRF score descending with
/// `chunk_id` ascending as the tiebreak.
pub fn reciprocal_rank_fusion(
    dense: &[SearchHit],
    bm25: &[SearchHit],
    rrf_k: i64,
) -> Vec<SearchHit> {
    let dense_ranks: HashMap<&str, usize> = dense
        .iter()
        .enumerate()
        .map(|(i, h)| (h.chunk_id.as_str(), i + 1))
        .collect();
    let bm25_ranks: HashMap<&str, usize> = bm25
        .iter()
        .enumerate()
        .map(|(i, h)| (h.chunk_id.as_str(), i + 1))
        .collect();

    let mut by_id: HashMap<&str, &SearchHit> = HashMap::new();
    for hit in dense.iter().chain(bm25.iter()) {
        by_id.entry(hit.chunk_id.as_str()).or_insert(hit);
    }

    let k = rrf_k as f64;
    let mut fused: Vec<SearchHit> = by_id
        .into_values()
        .map(|hit| {
            let mut rrf = 0.0;
            let dense_rank = dense_ranks.get(hit.chunk_id.as_str()).copied();
            let bm25_rank = bm25_ranks.get(hit.chunk_id.as_str()).copied();
            if let Some(rank) = dense_rank {
                rrf += 1.0 / (k + rank as f64);
            }
            if let Some(rank) = bm25_rank {
                rrf += 1.0 / (k + rank as f64);
            }
            SearchHit {
                score: rrf,
                rrf_score: Some(rrf),
                dense_rank,
                bm25_rank,
                ..hit.clone()
            }
        })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    fused
}

/// Additive title boosts: methodology +0.20, playbook +0.15, runbook +0.10;
/// month-name or 4-digit-year titles −0.10. Each hit records its boost.
pub fn apply_domain_boosts(hits: Vec<SearchHit>, enabled: bool) -> Vec<SearchHit> {
    if !enabled {
        return hits;
    }
    hits.into_iter()
        .map(|mut hit| {
            let title = hit.title.to_lowercase();
            let mut boost = 0.0;
            if title.contains("methodology") {
                boost = 0.20;
            } else if title.contains("playbook") {
                boost = 0.15;
            } else if title.contains("runbook") {
                boost = 0.10;
            }
            if MONTH_OR_YEAR_RE.is_match(&title) {
                boost -= 0.10;
            }
            hit.score += boost;
            hit.boost_applied = Some(boost);
            hit
        })
        .collect()
}

fn sort_final(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

type CandidateRow = (String, String, String, String, String, String, f64);

fn hit_from_row(row: CandidateRow) -> SearchHit {
    SearchHit {
        chunk_id: row.0,
        doc_id: row.1,
        text_md: row.2,
        title: row.3,
        url: row.4,
        source_system: row.5,
        score: row.6,
        boost_applied: None,
        dense_rank: None,
        bm25_rank: None,
        rrf_score: None,
    }
}

/// Dense nearest-neighbor search via the pgvector cosine operator.
async fn search_dense(
    pool: &PgPool,
    query_vec: &[f32],
    provider: &str,
    dim: usize,
    top_k: i64,
    space_whitelist: Option<&[String]>,
) -> Result<Vec<SearchHit>> {
    let mut sql = String::from(
        r#"
        SELECT c.chunk_id, c.doc_id, c.text_md,
               COALESCE(d.title, '') AS title, COALESCE(d.url, '') AS url,
               d.source_system,
               (1 - (ce.embedding <=> $1))::float8 AS score
        FROM chunks c
        JOIN chunk_embeddings ce ON c.chunk_id = ce.chunk_id
        JOIN documents d ON c.doc_id = d.doc_id
        WHERE ce.provider = $2 AND ce.dim = $3
        "#,
    );
    if space_whitelist.is_some() {
        sql.push_str(" AND d.space_key = ANY($5)");
    }
    sql.push_str(" ORDER BY score DESC, c.doc_id ASC, c.chunk_id ASC LIMIT $4");

    let mut query = sqlx::query_as::<_, CandidateRow>(&sql)
        .bind(pgvector::Vector::from(query_vec.to_vec()))
        .bind(provider)
        .bind(dim as i32)
        .bind(top_k);
    if let Some(spaces) = space_whitelist {
        query = query.bind(spaces.to_vec());
    }

    let rows = query.fetch_all(pool).await?;
    Ok(rows.into_iter().map(hit_from_row).collect())
}

/// Dense search without the vector operator: deserialize every stored
/// vector and scan. Only acceptable for test configurations.
async fn search_dense_scan(
    pool: &PgPool,
    query_vec: &[f32],
    provider: &str,
    dim: usize,
    top_k: i64,
    space_whitelist: Option<&[String]>,
) -> Result<Vec<SearchHit>> {
    let mut sql = String::from(
        r#"
        SELECT c.chunk_id, c.doc_id, c.text_md,
               COALESCE(d.title, '') AS title, COALESCE(d.url, '') AS url,
               d.source_system, ce.embedding
        FROM chunks c
        JOIN chunk_embeddings ce ON c.chunk_id = ce.chunk_id
        JOIN documents d ON c.doc_id = d.doc_id
        WHERE ce.provider = $1 AND ce.dim = $2
        "#,
    );
    if space_whitelist.is_some() {
        sql.push_str(" AND d.space_key = ANY($3)");
    }
    sql.push_str(" ORDER BY c.doc_id ASC, c.ord ASC");

    let mut query = sqlx::query_as::<
        _,
        (String, String, String, String, String, String, pgvector::Vector),
    >(&sql)
    .bind(provider)
    .bind(dim as i32);
    if let Some(spaces) = space_whitelist {
        query = query.bind(spaces.to_vec());
    }

    let rows = query.fetch_all(pool).await?;
    let mut hits: Vec<SearchHit> = rows
        .into_iter()
        .map(|row| {
            let score = cosine_sim(query_vec, row.6.as_slice());
            hit_from_row((row.0, row.1, row.2, row.3, row.4, row.5, score))
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.doc_id.cmp(&b.doc_id))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    hits.truncate(top_k as usize);
    Ok(hits)
}

/// BM25 lexical search over the chunk tsvector index.
async fn search_bm25(
    pool: &PgPool,
    query: &str,
    top_k: i64,
    space_whitelist: Option<&[String]>,
    domain_filter: Option<&str>,
) -> Result<Vec<SearchHit>> {
    let mut sql = String::from(
        r#"
        SELECT c.chunk_id, c.doc_id, c.text_md,
               COALESCE(d.title, '') AS title, COALESCE(d.url, '') AS url,
               d.source_system,
               ts_rank_cd(to_tsvector('english', c.text_md),
                          plainto_tsquery('english', $1))::float8 AS score
        FROM chunks c
        JOIN documents d ON c.doc_id = d.doc_id
        WHERE to_tsvector('english', c.text_md) @@ plainto_tsquery('english', $1)
        "#,
    );
    if let Some(filter) = domain_filter {
        sql.push_str(" AND ");
        sql.push_str(filter);
    }
    if space_whitelist.is_some() {
        sql.push_str(" AND d.space_key = ANY($3)");
    }
    sql.push_str(" ORDER BY score DESC, c.doc_id ASC, c.chunk_id ASC LIMIT $2");

    let mut query = sqlx::query_as::<_, CandidateRow>(&sql).bind(query).bind(top_k);
    if let Some(spaces) = space_whitelist {
        query = query.bind(spaces.to_vec());
    }

    let rows = query.fetch_all(pool).await?;
    Ok(rows.into_iter().map(hit_from_row).collect())
}

#[derive(Debug, Clone, Default)]
pub struct RetrieveOptions {
    pub top_k: Option<usize>,
    pub space_whitelist: Option<Vec<String>>,
    pub max_chars: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Timing {
    pub embed_ms: u64,
    pub dense_ms: u64,
    pub bm25_ms: u64,
    pub total_ms: u64,
}

/// Full retrieval result: ranked hits, packed context, and summary.
#[derive(Debug, Serialize)]
pub struct Retrieval {
    pub query: String,
    pub expanded_query: Option<String>,
    pub hits: Vec<SearchHit>,
    pub context: String,
    pub selected: Vec<SearchHit>,
    pub summary: pack::RetrievalSummary,
    /// Reason the request degraded to a single retrieval leg, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
}

/// Answer a query with the top-k most relevant chunks packed into a
/// character budget.
pub async fn search(
    config: &Config,
    pool: &PgPool,
    query: &str,
    opts: &RetrieveOptions,
) -> Result<Retrieval> {
    if query.trim().is_empty() {
        bail!("Empty query");
    }
    let total_start = Instant::now();
    let classifier = QueryClassifier::new();
    let is_domain = classifier.is_domain_query(query);

    let expanded = if config.retrieval.enable_expansion && is_domain {
        let expanded = classifier.expand_query(query);
        if expanded != query {
            Some(expanded)
        } else {
            None
        }
    } else {
        None
    };
    let bm25_query = expanded.as_deref().unwrap_or(query);
    let domain_filter = if is_domain {
        Some(classifier.domain_filter_sql())
    } else {
        None
    };

    let provider = create_provider(&config.embedding)?;
    let dim = provider.dimension();

    // Dense leg. The query is normalized the same way chunk text was.
    let embed_start = Instant::now();
    let normalized_query = query.replace("\r\n", "\n").replace('\r', "\n");
    let query_vec = provider.embed(&normalized_query).await?;
    let embed_ms = embed_start.elapsed().as_millis() as u64;

    let whitelist = opts.space_whitelist.as_deref();

    let dense_start = Instant::now();
    let dense_result = if config.retrieval.linear_scan {
        search_dense_scan(
            pool,
            &query_vec,
            provider.provider_name(),
            dim,
            config.retrieval.topk_dense,
            whitelist,
        )
        .await
    } else {
        search_dense(
            pool,
            &query_vec,
            provider.provider_name(),
            dim,
            config.retrieval.topk_dense,
            whitelist,
        )
        .await
    };
    let (dense, dense_err) = match dense_result {
        Ok(hits) => (hits, None),
        Err(e) => (Vec::new(), Some(format!("dense retrieval failed: {}", e))),
    };
    let dense_ms = dense_start.elapsed().as_millis() as u64;

    // Lexical leg; a missing index degrades to dense-only.
    let bm25_start = Instant::now();
    let (bm25, bm25_err) = match search_bm25(
        pool,
        bm25_query,
        config.retrieval.topk_bm25,
        whitelist,
        domain_filter,
    )
    .await
    {
        Ok(hits) => (hits, None),
        Err(e) => (Vec::new(), Some(format!("bm25 retrieval failed: {}", e))),
    };
    let bm25_ms = bm25_start.elapsed().as_millis() as u64;

    if let (Some(dense_reason), Some(bm25_reason)) = (&dense_err, &bm25_err) {
        bail!(
            "Retrieval failed on both legs: {}; {}",
            dense_reason,
            bm25_reason
        );
    }
    let degraded_reason = dense_err.or(bm25_err);

    let fused = reciprocal_rank_fusion(&dense, &bm25, config.retrieval.rrf_k);
    let mut boosted = apply_domain_boosts(fused, config.retrieval.enable_boosts);
    sort_final(&mut boosted);

    let top_k = opts.top_k.unwrap_or(config.retrieval.final_limit);
    boosted.truncate(top_k);

    let grouped = pack::group_by_doc(&boosted, config.retrieval.max_chunks_per_doc);
    let max_chars = opts.max_chars.unwrap_or(config.retrieval.max_chars);
    let (context, selected) = pack::pack_context(&grouped, max_chars);

    let timing = Timing {
        embed_ms,
        dense_ms,
        bm25_ms,
        total_ms: total_start.elapsed().as_millis() as u64,
    };
    let summary = pack::summarize(&boosted, &timing);

    Ok(Retrieval {
        query: query.to_string(),
        expanded_query: expanded,
        hits: boosted,
        context,
        selected,
        summary,
        degraded_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn hit(chunk_id: &str, doc_id: &str, score: f64) -> SearchHit {
        SearchHit {
            chunk_id: chunk_id.to_string(),
            doc_id: doc_id.to_string(),
            title: String::new(),
            url: String::new(),
            source_system: "confluence".to_string(),
            text_md: format!("text of {}", chunk_id),
            score,
            boost_applied: None,
            dense_rank: None,
            bm25_rank: None,
            rrf_score: None,
        }
    }

    #[test]
    fn test_rrf_merging_with_tiebreak() {
        let dense = vec![hit("c1", "d1", 0.9), hit("c2", "d2", 0.8), hit("c3", "d3", 0.7)];
        let bm25 = vec![hit("c2", "d2", 5.0), hit("c1", "d1", 4.0), hit("c4", "d4", 3.0)];
        let fused = reciprocal_rank_fusion(&dense, &bm25, 60);

        let order: Vec<&str> = fused.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(order, vec!["c1", "c2", "c3", "c4"]);

        // c1 and c2 tie exactly: 1/61 + 1/62 each.
        let expected = 1.0 / 61.0 + 1.0 / 62.0;
        assert!((fused[0].score - expected).abs() < 1e-12);
        assert!((fused[1].score - expected).abs() < 1e-12);
        assert!((fused[2].score - 1.0 / 63.0).abs() < 1e-12);
        assert!((fused[3].score - 1.0 / 63.0).abs() < 1e-12);

        assert_eq!(fused[0].dense_rank, Some(1));
        assert_eq!(fused[0].bm25_rank, Some(2));
        assert_eq!(fused[2].bm25_rank, None);
    }

    #[test]
    fn test_rrf_reproducible() {
        let dense = vec![hit("b", "d1", 0.9), hit("a", "d2", 0.8)];
        let bm25 = vec![hit("a", "d2", 2.0), hit("b", "d1", 1.0)];
        let first = reciprocal_rank_fusion(&dense, &bm25, 60);
        for _ in 0..10 {
            let again = reciprocal_rank_fusion(&dense, &bm25, 60);
            let ids: Vec<&str> = again.iter().map(|h| h.chunk_id.as_str()).collect();
            let expected: Vec<&str> = first.iter().map(|h| h.chunk_id.as_str()).collect();
            assert_eq!(ids, expected);
        }
    }

    #[test]
    fn test_methodology_boost_wins_tie() {
        let mut a = hit("c1", "d1", 0.40);
        a.title = "N2S Methodology Guide".to_string();
        let mut b = hit("c2", "d2", 0.40);
        b.title = "Project Notes".to_string();

        let mut boosted = apply_domain_boosts(vec![a, b], true);
        sort_final(&mut boosted);

        assert_eq!(boosted[0].title, "N2S Methodology Guide");
        assert!((boosted[0].score - 0.60).abs() < 1e-9);
        assert!((boosted[1].score - 0.40).abs() < 1e-9);
        assert_eq!(boosted[0].boost_applied, Some(0.20));
        assert_eq!(boosted[1].boost_applied, Some(0.0));
    }

    #[test]
    fn test_monthly_page_demoted() {
        let mut a = hit("c1", "d1", 0.5);
        a.title = "Status Update January 2024".to_string();
        let boosted = apply_domain_boosts(vec![a], true);
        assert!((boosted[0].score - 0.4).abs() < 1e-9);
        assert_eq!(boosted[0].boost_applied, Some(-0.10));
    }

    #[test]
    fn test_playbook_and_runbook_boosts() {
        let mut a = hit("c1", "d1", 0.0);
        a.title = "Deployment Playbook".to_string();
        let mut b = hit("c2", "d2", 0.0);
        b.title = "Incident Runbook".to_string();
        let boosted = apply_domain_boosts(vec![a, b], true);
        assert_eq!(boosted[0].boost_applied, Some(0.15));
        assert_eq!(boosted[1].boost_applied, Some(0.10));
    }

    #[test]
    fn test_boosts_disabled_passthrough() {
        let mut a = hit("c1", "d1", 0.5);
        a.title = "Methodology".to_string();
        let boosted = apply_domain_boosts(vec![a], false);
        assert!((boosted[0].score - 0.5).abs() < 1e-9);
        assert_eq!(boosted[0].boost_applied, None);
    }

    #[test]
    fn test_cosine_identical_and_orthogonal() {
        let a = vec![1.0f32, 0.0, 0.0];
        let b = vec![0.0f32, 1.0, 0.0];
        assert!((cosine_sim(&a, &a) - 1.0).abs() < 1e-6);
        assert!(cosine_sim(&a, &b).abs() < 1e-6);
        assert_eq!(cosine_sim(&[], &[]), 0.0);
        assert_eq!(cosine_sim(&a, &[1.0]), 0.0);
    }
}
