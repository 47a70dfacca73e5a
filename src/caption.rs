//! Captioning and embedding adapter.
//!
//! Defines the [`CaptionProvider`] trait and the production [`GeminiCaptioner`]
//! implementation, plus the pure text machinery both ingest and query paths
//! share:
//!
//! - [`normalize_text`] — trim, lowercase, collapse whitespace. Applied before
//!   every embedding request; the embedding space is only consistent when the
//!   ingest and query paths normalize identically.
//! - [`parse_caption_response`] — forgiving markdown section parser with a
//!   safe fallback. Captions arrive as free-form markdown; sections are
//!   located by header regex, never modeled as a nominal type.
//!
//! # Prompt Shape
//!
//! The captioning prompt asks for a fixed set of markdown sections:
//! Subjects, Actions, Setting, Visual Attributes, Visible Text, Notable
//! Details, Search Keywords. The parser keys off those section names.
//!
//! # Tag Pipeline
//!
//! 1. Comma-split the Search Keywords section.
//! 2. Lowercase, map inner spaces to hyphens, drop anything over 30 chars.
//! 3. Union the first five tokens of the Subjects section.
//! 4. Deduplicate preserving order; cap at 20.
//!
//! On parse failure the fallback produces a whitespace-normalized raw caption
//! (≤500 chars) and up to 10 distinct word-tokens of length 3–15.
//!
//! # Rate limiting
//!
//! This adapter performs no limiter accounting itself. Callers hold the
//! captioning limiter and acquire before invoking it: the image worker before
//! the download/caption/embed sequence, the search engine before a query
//! embed. Keeping acquisition at the call sites lets tests substitute
//! deterministic limiters.

use async_trait::async_trait;
use base64::Engine;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

use crate::config::CaptionConfig;
use crate::error::{Error, Result};

/// Caption text plus extracted search tags.
#[derive(Debug, Clone, PartialEq)]
pub struct Captioned {
    pub caption: String,
    pub tags: Vec<String>,
}

/// Multimodal captioning and text embedding API surface.
#[async_trait]
pub trait CaptionProvider: Send + Sync {
    /// Captions an image from its raw bytes.
    async fn caption(&self, bytes: &[u8], mime_type: &str) -> Result<Captioned>;

    /// Embeds text into a fixed-dimension vector. Implementations must apply
    /// [`normalize_text`] before submission.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embeds the caption concatenated with its space-joined tags.
    async fn embed_caption(&self, caption: &str, tags: &[String]) -> Result<Vec<f32>> {
        let combined = format!("{} {}", caption, tags.join(" "));
        self.embed(&combined).await
    }

    /// Embedding dimensionality of this deployment.
    fn dims(&self) -> usize;
}

const MAX_CAPTION_CHARS: usize = 1500;
const MAX_FALLBACK_CAPTION_CHARS: usize = 500;
const MAX_TAGS: usize = 20;
const MAX_TAG_CHARS: usize = 30;
const MAX_FALLBACK_TAGS: usize = 10;

/// Prompt sent with every captioning request. Section names are load-bearing:
/// [`parse_caption_response`] locates them by header.
pub const CAPTION_PROMPT: &str = "\
Describe this image for a search index. Respond in markdown with exactly these sections:

## Subjects
The main people, animals, or objects.

## Actions
What is happening.

## Setting
Location, environment, time of day.

## Visual Attributes
Colors, lighting, composition, style.

## Visible Text
Any readable text in the image (OCR), or 'none'.

## Notable Details
Anything distinctive a person would remember.

## Search Keywords
A comma-separated list of 10-20 search terms someone might type to find this image.";

/// Normalizes text for embedding: trim, lowercase, collapse whitespace runs.
///
/// MUST be applied identically on the ingest and query paths.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn section_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?mi)^[#*\s]*(subjects|actions|setting|visual attributes|visible text|notable details|search keywords)\b[:*\s]*$",
        )
        .expect("section header regex")
    })
}

/// Parses the model's markdown response into a caption and tags.
///
/// Never fails: when no recognizable sections are present, falls back to the
/// raw-text caption and word-extracted tags.
pub fn parse_caption_response(raw: &str) -> Captioned {
    let re = section_header_re();

    let mut sections: Vec<(String, usize, usize)> = Vec::new();
    let matches: Vec<_> = re.captures_iter(raw).collect();
    for (i, cap) in matches.iter().enumerate() {
        let whole = cap.get(0).unwrap();
        let name = cap.get(1).unwrap().as_str().to_lowercase();
        let body_start = whole.end();
        let body_end = matches
            .get(i + 1)
            .map(|next| next.get(0).unwrap().start())
            .unwrap_or(raw.len());
        sections.push((name, body_start, body_end));
    }

    let section = |name: &str| -> Option<&str> {
        sections
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|&(_, start, end)| raw[start..end].trim())
    };

    let keywords = section("search keywords");
    let subjects = section("subjects");

    if keywords.is_none() && subjects.is_none() {
        return fallback_caption(raw);
    }

    let mut tags: Vec<String> = Vec::new();
    if let Some(kw) = keywords {
        for term in kw.split(',') {
            let tag = clean_tag(term);
            if !tag.is_empty() && tag.chars().count() <= MAX_TAG_CHARS {
                tags.push(tag);
            }
        }
    }
    if let Some(subj) = subjects {
        for token in subj.split_whitespace().take(5) {
            let tag = clean_tag(token);
            if !tag.is_empty() && tag.chars().count() <= MAX_TAG_CHARS {
                tags.push(tag);
            }
        }
    }
    dedup_preserving_order(&mut tags);
    tags.truncate(MAX_TAGS);

    let caption = truncate_chars(&strip_markdown(raw), MAX_CAPTION_CHARS);

    Captioned { caption, tags }
}

fn fallback_caption(raw: &str) -> Captioned {
    let caption = truncate_chars(
        &raw.split_whitespace().collect::<Vec<_>>().join(" "),
        MAX_FALLBACK_CAPTION_CHARS,
    );

    let mut tags: Vec<String> = Vec::new();
    for token in raw.split_whitespace() {
        let word: String = token
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        let len = word.chars().count();
        if (3..=15).contains(&len) {
            tags.push(word);
        }
        if tags.iter().collect::<std::collections::HashSet<_>>().len() >= MAX_FALLBACK_TAGS {
            break;
        }
    }
    dedup_preserving_order(&mut tags);
    tags.truncate(MAX_FALLBACK_TAGS);

    Captioned { caption, tags }
}

fn clean_tag(term: &str) -> String {
    term.trim()
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

fn dedup_preserving_order(tags: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    tags.retain(|t| seen.insert(t.clone()));
}

/// Strips markdown structure markers and normalizes whitespace, leaving the
/// section text readable as one flowing caption.
fn strip_markdown(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for line in raw.lines() {
        let line = line.trim_start_matches(['#', '>', ' ', '\t']);
        let line = line.trim_start_matches(['-', '*', ' ']);
        if line.is_empty() || line.starts_with("```") {
            continue;
        }
        let cleaned: String = line.chars().filter(|&c| c != '*' && c != '`').collect();
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(cleaned.trim());
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

// ============ Gemini implementation ============

/// Production adapter over the Gemini REST API: `generateContent` for
/// captions (image bytes inlined as base64) and `embedContent` for
/// embeddings.
///
/// Requires the `GEMINI_API_KEY` environment variable.
///
/// Retry strategy mirrors the drive adapter: HTTP 429 and 5xx retry with
/// exponential backoff (1 s, 2 s, 4 s); 401/403 fail immediately as
/// `PermissionDenied` (quota-auth failures must surface unretried so the
/// batch short-circuit can fire); other 4xx fail immediately as permanent.
pub struct GeminiCaptioner {
    client: reqwest::Client,
    api_key: String,
    config: CaptionConfig,
}

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const API_MAX_RETRIES: u32 = 3;

impl GeminiCaptioner {
    pub fn from_env(config: CaptionConfig) -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| Error::InvalidInput("GEMINI_API_KEY environment variable not set".into()))?;
        Self::new(api_key, config)
    }

    pub fn new(api_key: String, config: CaptionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            config,
        })
    }

    async fn post_with_retry(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let mut last_err = None;

        for attempt in 0..=API_MAX_RETRIES {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(url)
                .query(&[("key", self.api_key.as_str())])
                .json(body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response.json::<serde_json::Value>().await?);
                    }

                    if status.as_u16() == 401 || status.as_u16() == 403 {
                        return Err(Error::PermissionDenied(
                            "captioning API rejected the configured key".into(),
                        ));
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(Error::TransientUpstream(format!(
                            "captioning API error {status}: {body_text}"
                        )));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    return Err(Error::ProcessingFailed(format!(
                        "captioning API error {status}: {body_text}"
                    )));
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::TransientUpstream("captioning API retries exhausted".into())))
    }
}

#[async_trait]
impl CaptionProvider for GeminiCaptioner {
    async fn caption(&self, bytes: &[u8], mime_type: &str) -> Result<Captioned> {
        let url = format!(
            "{GEMINI_API_BASE}/models/{}:generateContent",
            self.config.model
        );
        let data = base64::engine::general_purpose::STANDARD.encode(bytes);
        let body = serde_json::json!({
            "contents": [{
                "parts": [
                    { "inline_data": { "mime_type": mime_type, "data": data } },
                    { "text": CAPTION_PROMPT },
                ]
            }]
        });

        let json = self.post_with_retry(&url, &body).await?;

        let text = json["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(Error::TransientUpstream(
                "captioning API returned an empty response".into(),
            ));
        }

        Ok(parse_caption_response(&text))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!(
            "{GEMINI_API_BASE}/models/{}:embedContent",
            self.config.embed_model
        );
        let body = serde_json::json!({
            "content": { "parts": [{ "text": normalize_text(text) }] }
        });

        let json = self.post_with_retry(&url, &body).await?;

        let values: Vec<f32> = json["embedding"]["values"]
            .as_array()
            .map(|vs| {
                vs.iter()
                    .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                    .collect()
            })
            .unwrap_or_default();

        if values.is_empty() {
            return Err(Error::TransientUpstream(
                "embedding API returned an empty vector".into(),
            ));
        }

        Ok(values)
    }

    fn dims(&self) -> usize {
        self.config.dims
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_case_and_whitespace() {
        assert_eq!(normalize_text("  RED  Bicycle "), "red bicycle");
        assert_eq!(normalize_text("a\tb\n\nc"), "a b c");
        assert_eq!(normalize_text(""), "");
    }

    const SAMPLE: &str = "\
## Subjects
A red bicycle and a brick wall

## Actions
Leaning

## Setting
Urban alley, daytime

## Visual Attributes
Warm light, shallow depth of field

## Visible Text
none

## Notable Details
Rust on the handlebars

## Search Keywords
red bicycle, brick wall, urban photography, vintage bike, street scene";

    #[test]
    fn parses_sections_into_tags() {
        let result = parse_caption_response(SAMPLE);

        assert!(result.tags.contains(&"red-bicycle".to_string()));
        assert!(result.tags.contains(&"brick-wall".to_string()));
        assert!(result.tags.contains(&"urban-photography".to_string()));
        // First five Subjects tokens union in after the keywords.
        assert!(result.tags.contains(&"red".to_string()));
        assert!(result.tags.contains(&"bicycle".to_string()));
        assert!(result.tags.len() <= 20);

        assert!(result.caption.contains("red bicycle"));
        assert!(!result.caption.contains('#'));
        assert!(result.caption.chars().count() <= 1500);
    }

    #[test]
    fn tags_deduplicate_preserving_order() {
        let raw = "## Subjects\nbicycle bicycle wall\n\n## Search Keywords\nbicycle, wall, bicycle";
        let result = parse_caption_response(raw);
        let bike_count = result.tags.iter().filter(|t| *t == "bicycle").count();
        assert_eq!(bike_count, 1);
        assert_eq!(result.tags[0], "bicycle");
    }

    #[test]
    fn overlong_keywords_are_dropped() {
        let long = "x".repeat(40);
        let raw = format!("## Search Keywords\nshort, {long}");
        let result = parse_caption_response(&raw);
        assert_eq!(result.tags, vec!["short".to_string()]);
    }

    #[test]
    fn bold_header_variant_is_recognized() {
        let raw = "**Subjects:**\na dog\n\n**Search Keywords:**\ndog, park";
        let result = parse_caption_response(raw);
        assert!(result.tags.contains(&"dog".to_string()));
        assert!(result.tags.contains(&"park".to_string()));
    }

    #[test]
    fn fallback_on_unstructured_response() {
        let raw = "This image shows a fluffy   orange cat sleeping on a windowsill in sunlight.";
        let result = parse_caption_response(raw);

        assert_eq!(
            result.caption,
            "This image shows a fluffy orange cat sleeping on a windowsill in sunlight."
        );
        assert!(result.tags.contains(&"fluffy".to_string()));
        assert!(result.tags.contains(&"orange".to_string()));
        assert!(result.tags.contains(&"cat".to_string()));
        assert!(result.tags.len() <= 10);
        // "on", "a" are shorter than three chars.
        assert!(!result.tags.contains(&"on".to_string()));
    }

    #[test]
    fn fallback_caption_truncates_at_500_chars() {
        let raw = "word ".repeat(200);
        let result = parse_caption_response(&raw);
        assert!(result.caption.chars().count() <= 500);
    }

    #[test]
    fn caption_truncates_at_1500_chars() {
        let raw = format!("## Subjects\n{}\n\n## Search Keywords\na, b", "x ".repeat(2000));
        let result = parse_caption_response(&raw);
        assert!(result.caption.chars().count() <= 1500);
    }
}
