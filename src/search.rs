//! Search engine with lexical and semantic retrieval.
//!
//! # Classification
//!
//! A trimmed query containing a dot OR shorter than three characters is
//! treated as a filename lookup (**lexical**); everything else is
//! **semantic**. `"IMG_001.jpg"` and `"a1"` go lexical; `"red bicycle"`
//! goes semantic.
//!
//! # Paths
//!
//! - **Lexical** — ranked filename match (exact > prefix > substring,
//!   case-insensitive, ties by name ascending) with pseudo-scores
//!   1.0 / 0.8 / 0.6.
//! - **Semantic** — the query is normalized exactly like ingest text,
//!   embedded, and matched by cosine distance; similarity = 1 − distance,
//!   rounded to three decimals for display.
//!
//! # Degradation
//!
//! When the store reports `VectorBackendUnavailable`, semantic queries fall
//! back to the lexical path on the same query and the response is annotated
//! `search_type = "filename"`. Search never fails because vectors are
//! missing.
//!
//! # Caption cleanup
//!
//! Early deployments stored captions JSON-wrapped or HTML-entity-encoded.
//! Every caption leaving the store passes through [`clean_caption`]; writers
//! emit plain text.

use serde::Serialize;
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::app::AppContext;
use crate::error::{Error, Result};
use crate::models::ImageRecord;
use crate::store::MatchTier;

pub const MAX_TOP_K: i64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Lexical,
    Semantic,
}

/// Classifies a query string; see module docs for the rule.
pub fn classify_query(query: &str) -> QueryKind {
    let trimmed = query.trim();
    if trimmed.contains('.') || trimmed.chars().count() < 3 {
        QueryKind::Lexical
    } else {
        QueryKind::Semantic
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: Uuid,
    pub name: String,
    pub thumbnail_url: Option<String>,
    pub view_url: Option<String>,
    pub caption: Option<String>,
    pub tags: Vec<String>,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    /// `"semantic"` or `"filename"`.
    pub search_type: &'static str,
    pub took_ms: u64,
}

pub async fn run_search(
    ctx: &AppContext,
    folder_id: Uuid,
    query: &str,
    top_k: i64,
) -> Result<SearchResponse> {
    if query.trim().is_empty() {
        return Err(Error::InvalidInput("query must not be empty".into()));
    }
    let limit = top_k.max(1).min(MAX_TOP_K);

    if ctx.store.get_folder(folder_id).await?.is_none() {
        return Err(Error::NotFound(format!("folder {folder_id}")));
    }

    let started = Instant::now();

    let (results, search_type) = match classify_query(query) {
        QueryKind::Lexical => (lexical_search(ctx, folder_id, query, limit).await?, "filename"),
        QueryKind::Semantic => match ctx.store.ensure_vector_infra().await {
            Ok(()) => (
                semantic_search(ctx, folder_id, query, limit).await?,
                "semantic",
            ),
            Err(Error::VectorBackendUnavailable(reason)) => {
                debug!(reason = %reason, "vector backend unavailable, degrading to filename search");
                (lexical_search(ctx, folder_id, query, limit).await?, "filename")
            }
            Err(e) => return Err(e),
        },
    };

    Ok(SearchResponse {
        results,
        search_type,
        took_ms: started.elapsed().as_millis() as u64,
    })
}

async fn lexical_search(
    ctx: &AppContext,
    folder_id: Uuid,
    query: &str,
    limit: i64,
) -> Result<Vec<SearchHit>> {
    let hits = ctx
        .store
        .search_by_filename(folder_id, query.trim(), limit)
        .await?;
    Ok(hits
        .into_iter()
        .map(|hit| to_hit(hit.image, tier_score(hit.tier)))
        .collect())
}

async fn semantic_search(
    ctx: &AppContext,
    folder_id: Uuid,
    query: &str,
    limit: i64,
) -> Result<Vec<SearchHit>> {
    // The adapter normalizes before embedding, so case/whitespace variants
    // of a query share one vector; the limiter gates the outbound call.
    ctx.caption_limiter.acquire().await;
    let query_vec = ctx.captioner.embed(query).await?;

    let hits = ctx
        .store
        .search_by_similarity(folder_id, &query_vec, limit)
        .await?;
    Ok(hits
        .into_iter()
        .map(|hit| to_hit(hit.image, round3(1.0 - hit.distance)))
        .collect())
}

fn tier_score(tier: MatchTier) -> f32 {
    match tier {
        MatchTier::Exact => 1.0,
        MatchTier::Prefix => 0.8,
        MatchTier::Contains => 0.6,
    }
}

fn round3(value: f32) -> f32 {
    (value * 1000.0).round() / 1000.0
}

fn to_hit(image: ImageRecord, similarity: f32) -> SearchHit {
    SearchHit {
        id: image.id,
        name: image.name,
        thumbnail_url: image.thumbnail_url,
        view_url: image.view_url,
        caption: image.caption.as_deref().map(clean_caption),
        tags: image
            .tags
            .as_deref()
            .map(|t| {
                t.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        similarity,
    }
}

/// Normalizes legacy caption payloads to plain text: decodes `&quot;`,
/// strips ```` ```json ```` fences, and unwraps `{"caption":"…"}` objects.
/// Current writers emit plain text, so this usually passes through.
pub fn clean_caption(raw: &str) -> String {
    let mut text = raw.trim().replace("&quot;", "\"");

    // Fenced code blocks: drop the fence lines, keep the body.
    if text.starts_with("```") {
        text = text
            .lines()
            .filter(|line| !line.trim_start().starts_with("```"))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string();
    }

    if text.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
            if let Some(caption) = value.get("caption").and_then(|c| c.as_str()) {
                return caption.to_string();
            }
        }
    }

    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_rule() {
        assert_eq!(classify_query("IMG_001.jpg"), QueryKind::Lexical);
        assert_eq!(classify_query("ab"), QueryKind::Lexical);
        assert_eq!(classify_query("  a  "), QueryKind::Lexical);
        assert_eq!(classify_query("red bicycle"), QueryKind::Semantic);
        assert_eq!(classify_query("dog"), QueryKind::Semantic);
        // A dot anywhere forces the filename path.
        assert_eq!(classify_query("sunset over the v2.0 launch"), QueryKind::Lexical);
    }

    #[test]
    fn tier_scores() {
        assert_eq!(tier_score(MatchTier::Exact), 1.0);
        assert_eq!(tier_score(MatchTier::Prefix), 0.8);
        assert_eq!(tier_score(MatchTier::Contains), 0.6);
    }

    #[test]
    fn similarity_rounds_to_three_decimals() {
        assert_eq!(round3(0.123456), 0.123);
        assert_eq!(round3(0.9996), 1.0);
    }

    #[test]
    fn clean_caption_passthrough() {
        assert_eq!(clean_caption("a plain caption"), "a plain caption");
    }

    #[test]
    fn clean_caption_decodes_entities() {
        assert_eq!(
            clean_caption("a &quot;red&quot; bicycle"),
            "a \"red\" bicycle"
        );
    }

    #[test]
    fn clean_caption_unwraps_json_shape() {
        assert_eq!(
            clean_caption(r#"{"caption":"a red bicycle"}"#),
            "a red bicycle"
        );
        // Entity-encoded JSON wrapper, as the oldest rows stored it.
        assert_eq!(
            clean_caption("{&quot;caption&quot;:&quot;a red bicycle&quot;}"),
            "a red bicycle"
        );
    }

    #[test]
    fn clean_caption_strips_fences() {
        let raw = "```json\n{\"caption\":\"a red bicycle\"}\n```";
        assert_eq!(clean_caption(raw), "a red bicycle");

        let plain_fence = "```\njust text\n```";
        assert_eq!(clean_caption(plain_fence), "just text");
    }

    #[test]
    fn clean_caption_leaves_unrelated_json_alone() {
        assert_eq!(clean_caption(r#"{"note":"x"}"#), r#"{"note":"x"}"#);
    }
}
