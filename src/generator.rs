//! Request/response adapter to the external text-generation service
//! (spec §4.C). The backend's internals are out of scope; this module
//! only knows the HTTP surface of §6: a model-list endpoint, a generate
//! endpoint, and a health endpoint.

use crate::error::GeneratorError;
use crate::models::Message;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

const EGRESS_LIMIT: usize = 500;
const CATALOG_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    models: Vec<String>,
}

struct CatalogCache {
    models: Vec<String>,
    fetched_at: Instant,
}

pub struct GeneratorClient {
    http: reqwest::Client,
    base_url: String,
    catalog: Mutex<Option<CatalogCache>>,
}

impl GeneratorClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("failed to build generator HTTP client");

        GeneratorClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            catalog: Mutex::new(None),
        }
    }

    /// Lightweight probe: the health endpoint. Never panics or blocks
    /// longer than the client's configured timeout.
    pub async fn is_available(&self) -> bool {
        match self.http.get(format!("{}/health", self.base_url)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// List models, using the cached catalog when fresh (spec: ~5 minute
    /// cache interval).
    pub async fn list_models(&self) -> Result<Vec<String>, GeneratorError> {
        if let Some(cached) = self.cached_catalog() {
            return Ok(cached);
        }

        let resp = self
            .http
            .get(format!("{}/models", self.base_url))
            .send()
            .await
            .map_err(|e| GeneratorError::Unavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(GeneratorError::Unavailable(format!(
                "models endpoint returned {}",
                resp.status()
            )));
        }

        let parsed: ModelsResponse = resp
            .json()
            .await
            .map_err(|e| GeneratorError::Unavailable(e.to_string()))?;

        *self.catalog.lock().unwrap() = Some(CatalogCache {
            models: parsed.models.clone(),
            fetched_at: Instant::now(),
        });

        Ok(parsed.models)
    }

    fn cached_catalog(&self) -> Option<Vec<String>> {
        let guard = self.catalog.lock().unwrap();
        guard.as_ref().and_then(|c| {
            if c.fetched_at.elapsed() < CATALOG_CACHE_TTL {
                Some(c.models.clone())
            } else {
                None
            }
        })
    }

    fn invalidate_catalog(&self) {
        *self.catalog.lock().unwrap() = None;
    }

    /// Startup-fatal check (spec §4.C / §4.G step 4): fails if the
    /// configured default model is not present in the catalog.
    pub async fn validate_startup_model(&self, default_model: &str) -> Result<(), GeneratorError> {
        let catalog = self.list_models().await?;
        if catalog.iter().any(|m| m == default_model) {
            Ok(())
        } else {
            self.invalidate_catalog();
            Err(GeneratorError::StartupFatal(default_model.to_string(), catalog))
        }
    }

    /// One conversational utterance matching ambient tone, addressing
    /// no one in particular.
    pub async fn generate_spontaneous(
        &self,
        model: &str,
        recent: &[Message],
        char_limit: usize,
    ) -> Result<String, GeneratorError> {
        let prompt = spontaneous_prompt(recent);
        self.generate(model, prompt, char_limit).await
    }

    /// A reply addressed to `user_name`'s `user_text`, with the same
    /// recent-context block as the spontaneous template.
    pub async fn generate_response(
        &self,
        model: &str,
        recent: &[Message],
        user_name: &str,
        user_text: &str,
        char_limit: usize,
    ) -> Result<String, GeneratorError> {
        let prompt = response_prompt(recent, user_name, user_text);
        self.generate(model, prompt, char_limit).await
    }

    async fn generate(
        &self,
        model: &str,
        prompt: String,
        char_limit: usize,
    ) -> Result<String, GeneratorError> {
        let req = GenerateRequest {
            model,
            prompt,
            stream: false,
        };

        let resp = self
            .http
            .post(format!("{}/generate", self.base_url))
            .json(&req)
            .send()
            .await
            .map_err(|e| GeneratorError::Unavailable(e.to_string()))?;

        if resp.status().as_u16() >= 500 {
            return Err(GeneratorError::Unavailable(format!(
                "generate endpoint returned {}",
                resp.status()
            )));
        }
        if !resp.status().is_success() {
            return Err(GeneratorError::Invalid);
        }

        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| GeneratorError::Unavailable(e.to_string()))?;

        match postprocess(&parsed.text, char_limit.min(EGRESS_LIMIT)) {
            Some(text) => Ok(text),
            None => {
                warn!("generator output was empty or whitespace-only after post-processing");
                Err(GeneratorError::Invalid)
            }
        }
    }
}

fn render_context(recent: &[Message]) -> String {
    recent
        .iter()
        .map(|m| format!("[{}]: {}", m.user_display_name, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

fn spontaneous_prompt(recent: &[Message]) -> String {
    format!(
        "You are a participant in an ongoing group chat. Produce exactly one \
         conversational utterance that matches the ambient tone of the \
         conversation below. Do not address any specific user by name.\n\n\
         Recent conversation:\n{}",
        render_context(recent)
    )
}

fn response_prompt(recent: &[Message], user_name: &str, user_text: &str) -> String {
    format!(
        "You are a participant in an ongoing group chat. {user_name} just said: \
         \"{user_text}\". Produce exactly one reply directly addressing them, \
         matching the ambient tone of the conversation below.\n\n\
         Recent conversation:\n{}",
        render_context(recent)
    )
}

/// Strip leading/trailing whitespace, collapse internal newlines to
/// spaces, remove unsupported formatting markers, then enforce the
/// egress limit by truncating on the last word boundary. Returns `None`
/// for empty/whitespace-only results. Idempotent.
fn postprocess(raw: &str, char_limit: usize) -> Option<String> {
    let no_markers: String = raw
        .chars()
        .filter(|c| !matches!(c, '*' | '_' | '`' | '~'))
        .collect();

    let collapsed = no_markers
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let trimmed = collapsed.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.len() <= char_limit {
        return Some(trimmed.to_string());
    }

    // Find the largest char-boundary index <= char_limit before slicing;
    // `char_limit` itself may land inside a multi-byte UTF-8 sequence.
    let mut boundary = char_limit;
    while boundary > 0 && !trimmed.is_char_boundary(boundary) {
        boundary -= 1;
    }
    let candidate = &trimmed[..boundary];

    let truncated = match candidate.rfind(' ') {
        Some(last_space) => &candidate[..last_space],
        None => candidate,
    };

    let result = truncated.trim();
    if result.is_empty() {
        None
    } else {
        Some(result.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postprocess_trims_and_collapses_newlines() {
        let out = postprocess("  hello\n\nworld  ", 500).unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn postprocess_strips_formatting_markers() {
        let out = postprocess("*bold* and _italic_ and `code`", 500).unwrap();
        assert_eq!(out, "bold and italic and code");
    }

    #[test]
    fn postprocess_empty_is_invalid() {
        assert_eq!(postprocess("   \n\n  ", 500), None);
        assert_eq!(postprocess("", 500), None);
    }

    #[test]
    fn postprocess_truncates_at_word_boundary_no_ellipsis() {
        let long = "word ".repeat(200);
        let out = postprocess(&long, 500).unwrap();
        assert!(out.len() <= 500);
        assert!(!out.ends_with("..."));
        assert!(!out.is_empty());
    }

    #[test]
    fn postprocess_exact_limit_unchanged() {
        let text = "a".repeat(500);
        let out = postprocess(&text, 500).unwrap();
        assert_eq!(out.len(), 500);
        assert_eq!(out, text);
    }

    #[test]
    fn postprocess_is_idempotent() {
        let raw = "  *hello*\nworld   foo  ";
        let once = postprocess(raw, 500).unwrap();
        let twice = postprocess(&once, 500).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn context_renders_newest_last() {
        let recent = vec![
            Message {
                message_id: "1".into(),
                channel: "c".into(),
                user_id: "u1".into(),
                user_display_name: "alice".into(),
                content: "first".into(),
                timestamp: chrono::Utc::now(),
            },
            Message {
                message_id: "2".into(),
                channel: "c".into(),
                user_id: "u2".into(),
                user_display_name: "bob".into(),
                content: "second".into(),
                timestamp: chrono::Utc::now(),
            },
        ];
        let rendered = render_context(&recent);
        let first_pos = rendered.find("[alice]: first").unwrap();
        let second_pos = rendered.find("[bob]: second").unwrap();
        assert!(first_pos < second_pos);
    }
}
