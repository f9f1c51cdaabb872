//! OpenAI-compatible chat-completions classifier.

use async_trait::async_trait;
use feedtag_core::{ClassifierSettings, Tag, TagId};
use feedtag_storage::{HttpClientConfig, HttpFetcher};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::text::{html_to_text, truncate_chars};
use crate::{ClassifyError, ClassifyInput, Classifier};

const MAX_CONTENT_CHARS: usize = 4000;

const SYSTEM_PROMPT: &str = "You classify feed articles into a fixed set of tags. \
Only use tag ids from the provided list. Choose every tag that clearly applies and none that \
do not. Reply with JSON only, shaped as {\"tag_ids\": [1, 2]}. Reply {\"tag_ids\": []} when no \
tag applies.";

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiClassifier {
    settings: ClassifierSettings,
    http: HttpFetcher,
}

impl OpenAiClassifier {
    pub fn new(settings: ClassifierSettings, http: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            settings,
            http: HttpFetcher::new(http)?,
        })
    }

    fn endpoint(&self) -> Option<String> {
        let base = self.settings.api_base.as_deref()?.trim_end_matches('/');
        Some(format!("{base}/chat/completions"))
    }
}

pub(crate) fn build_user_prompt(input: ClassifyInput<'_>, tags: &[Tag]) -> String {
    let tag_lines = tags
        .iter()
        .map(|t| match t.description.as_deref().filter(|d| !d.trim().is_empty()) {
            Some(desc) => format!("{}: {} ({})", t.id, t.name, desc.trim()),
            None => format!("{}: {}", t.id, t.name),
        })
        .collect::<Vec<_>>()
        .join("\n");
    let content = html_to_text(input.content);
    let summary = html_to_text(input.summary);
    format!(
        "Tags:\n{tag_lines}\n\nTitle: {}\nSummary: {}\nContent: {}",
        input.title.trim(),
        summary,
        truncate_chars(&content, MAX_CONTENT_CHARS)
    )
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn id_from_value(value: &JsonValue) -> Option<TagId> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse a classifier reply into tag ids, keeping only ids present in `candidates`.
pub fn parse_tag_ids(reply: &str, candidates: &[Tag]) -> Result<Vec<TagId>, ClassifyError> {
    let body = strip_code_fence(reply);
    let value: JsonValue = serde_json::from_str(body)
        .map_err(|e| ClassifyError::MalformedResponse(format!("{e}: {body:.120}")))?;
    let items = match &value {
        JsonValue::Array(items) => items,
        JsonValue::Object(map) => match map.get("tag_ids") {
            Some(JsonValue::Array(items)) => items,
            _ => {
                return Err(ClassifyError::MalformedResponse(
                    "missing tag_ids array".to_string(),
                ))
            }
        },
        _ => {
            return Err(ClassifyError::MalformedResponse(
                "expected object or array".to_string(),
            ))
        }
    };

    let mut out = Vec::new();
    for id in items.iter().filter_map(id_from_value) {
        if candidates.iter().any(|t| t.id == id) && !out.contains(&id) {
            out.push(id);
        }
    }
    Ok(out)
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    async fn classify(
        &self,
        input: ClassifyInput<'_>,
        tags: &[Tag],
    ) -> Result<Vec<TagId>, ClassifyError> {
        if !self.settings.is_configured() {
            return Err(ClassifyError::NotConfigured);
        }
        let url = self.endpoint().ok_or(ClassifyError::NotConfigured)?;
        let body = json!({
            "model": self.settings.model,
            "temperature": 0,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": build_user_prompt(input, tags)},
            ],
        });

        let bytes = self
            .http
            .post_json(&url, self.settings.api_key.as_deref(), &body)
            .await?;
        let completion: ChatCompletion = serde_json::from_slice(&bytes)
            .map_err(|e| ClassifyError::MalformedResponse(e.to_string()))?;
        let reply = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ClassifyError::MalformedResponse("empty completion".to_string()))?;
        parse_tag_ids(&reply, tags)
    }
}
