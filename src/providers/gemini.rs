use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{Value, json};

use super::retry::{
    RATE_LIMIT_BASE_DELAY, RATE_LIMIT_MAX_RETRIES, is_rate_limited, retry_after, wait_with_backoff,
};
use super::{
    Message, MessageRole, Provider, ProviderFuture, ProviderResponse, ProviderUsage,
    format_error_parts, system_text,
};

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
pub(crate) const DEFAULT_MODEL: &str = "gemini-2.5-flash";

#[derive(Debug, Clone)]
pub struct Gemini {
    key: String,
    model: String,
    search_model: String,
    base_url: Option<String>,
    temperature: Option<f32>,
    messages: Vec<Message>,
}

impl Gemini {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            model: DEFAULT_MODEL.to_string(),
            search_model: DEFAULT_MODEL.to_string(),
            base_url: None,
            temperature: None,
            messages: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        if !model.trim().is_empty() {
            self.model = model;
        }
        self
    }

    pub fn with_search_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        if !model.trim().is_empty() {
            self.search_model = model;
        }
        self
    }

    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url.filter(|value| !value.trim().is_empty());
        self
    }

    fn url(&self, model: &str) -> String {
        let base = self.base_url.as_deref().unwrap_or(BASE_URL);
        format!("{}/{}:generateContent", base.trim_end_matches('/'), model)
    }

    fn request_body(&self, extra_user_text: Option<String>) -> Value {
        let system_instruction = system_text(&self.messages);
        let mut contents = self
            .messages
            .iter()
            .filter(|message| message.role == MessageRole::User)
            .map(|message| json!({"role": "user", "parts": [{"text": message.content}]}))
            .collect::<Vec<_>>();
        if let Some(extra) = extra_user_text {
            contents.push(json!({"role": "user", "parts": [{"text": extra}]}));
        }

        let mut body = json!({ "contents": contents });
        if !system_instruction.trim().is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system_instruction}]});
        }
        body
    }

    /// google_search grounding has no location parameter, so the region
    /// goes in as an extra user part.
    fn search_body(&self, region: &str) -> Value {
        let hint = format!("Search region (ISO 3166-1 alpha-2): {}", region);
        let mut body = self.request_body(Some(hint));
        body["tools"] = json!([{"google_search": {}}]);
        body
    }
}

impl Provider for Gemini {
    fn append_system_input(mut self, input: String) -> Self {
        self.messages.push(Message::system(input));
        self
    }

    fn append_user_input(mut self, input: String) -> Self {
        self.messages.push(Message::user(input));
        self
    }

    fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    fn complete(self) -> ProviderFuture {
        Box::pin(async move {
            let mut body = self.request_body(None);
            if let Some(temperature) = self.temperature {
                body["generationConfig"] = json!({"temperature": temperature});
            }
            let text = post_generate_content(&self, &self.url(&self.model), &body).await?;
            extract_text_response(&text, &self.model)
        })
    }

    fn search(self, region: &str) -> ProviderFuture {
        let body = self.search_body(region);
        Box::pin(async move {
            let text = post_generate_content(&self, &self.url(&self.search_model), &body).await?;
            extract_text_response(&text, &self.search_model)
        })
    }
}

async fn post_generate_content(provider: &Gemini, url: &str, body: &Value) -> Result<String> {
    let client = reqwest::Client::new();

    let mut attempt = 0usize;
    let mut delay = RATE_LIMIT_BASE_DELAY;
    loop {
        attempt += 1;
        let response = client
            .post(url)
            .header("x-goog-api-key", &provider.key)
            .json(body)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", url))?;

        let status = response.status();
        let retry_after = retry_after(response.headers());
        let text = response.text().await.unwrap_or_default();
        if status.is_success() {
            return Ok(text);
        }
        if is_rate_limited(status, &text) && attempt < RATE_LIMIT_MAX_RETRIES {
            delay = wait_with_backoff("Gemini", attempt, delay, retry_after).await;
            continue;
        }
        return Err(anyhow!(
            "Gemini API error ({}): {}",
            status,
            extract_gemini_error(&text).unwrap_or(text)
        ));
    }
}

fn extract_text_response(text: &str, fallback_model: &str) -> Result<ProviderResponse> {
    let payload: GeminiResponse = serde_json::from_str(text)
        .map_err(|err| anyhow!("failed to parse Gemini response JSON: {}", err))?;
    let candidate = payload
        .candidates
        .first()
        .and_then(|candidate| candidate.content.as_ref())
        .ok_or_else(|| anyhow!("no candidate returned from Gemini"))?;

    let content = candidate
        .parts
        .iter()
        .filter_map(|part| part.text.as_deref())
        .collect::<String>();
    let content = content.trim();
    if content.is_empty() {
        return Err(anyhow!("empty response from Gemini"));
    }

    let model = payload
        .model_version
        .filter(|value| !value.trim().is_empty())
        .or_else(|| Some(fallback_model.to_string()));
    let usage = payload.usage_metadata.map(|usage| ProviderUsage {
        prompt_tokens: usage.prompt_token_count,
        completion_tokens: usage.candidates_token_count,
        total_tokens: usage.total_token_count,
    });
    Ok(ProviderResponse {
        text: content.to_string(),
        model,
        usage,
    })
}

fn extract_gemini_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<GeminiError>,
    }

    #[derive(Deserialize)]
    struct GeminiError {
        message: Option<String>,
        status: Option<String>,
        code: Option<i32>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    let error = parsed.error?;
    Some(format_error_parts(
        error.message,
        error.status,
        error.code.map(|value| value.to_string()),
    ))
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
    #[serde(rename = "modelVersion")]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u64>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u64>,
    #[serde(rename = "totalTokenCount")]
    total_token_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: Option<String>,
}
