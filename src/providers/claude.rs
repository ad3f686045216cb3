use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};

use super::retry::{
    RATE_LIMIT_BASE_DELAY, RATE_LIMIT_MAX_RETRIES, is_rate_limited, retry_after, wait_with_backoff,
};
use super::{
    Message, MessageRole, Provider, ProviderFuture, ProviderResponse, ProviderUsage,
    format_error_parts, system_text,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1/messages";
pub(crate) const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
const MAX_TOKENS: u32 = 2048;
const WEB_SEARCH_MAX_USES: u32 = 5;

#[derive(Debug, Clone)]
pub struct Claude {
    key: String,
    model: String,
    search_model: String,
    base_url: Option<String>,
    temperature: Option<f32>,
    messages: Vec<Message>,
}

impl Claude {
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

    fn base_url(&self) -> String {
        self.base_url
            .clone()
            .or_else(|| std::env::var("ANTHROPIC_BASE_URL").ok())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    fn request_body(&self, model: &str) -> Value {
        let system = system_text(&self.messages);
        let messages = self
            .messages
            .iter()
            .filter(|message| message.role == MessageRole::User)
            .map(|message| {
                json!({
                    "role": "user",
                    "content": [{"type": "text", "text": message.content}]
                })
            })
            .collect::<Vec<_>>();

        let mut body = json!({
            "model": model,
            "max_tokens": MAX_TOKENS,
            "messages": messages,
        });
        if !system.trim().is_empty() {
            body["system"] = json!(system);
        }
        body
    }

    fn search_body(&self, region: &str) -> Value {
        let mut body = self.request_body(&self.search_model);
        body["tools"] = json!([
            {
                "type": "web_search_20250305",
                "name": "web_search",
                "max_uses": WEB_SEARCH_MAX_USES,
                "user_location": {"type": "approximate", "country": region}
            }
        ]);
        body
    }
}

impl Provider for Claude {
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
            let mut body = self.request_body(&self.model);
            if let Some(temperature) = self.temperature {
                body["temperature"] = json!(temperature);
            }
            let text = post_messages(&self, &body).await?;
            extract_text_response(&text, &self.model)
        })
    }

    fn search(self, region: &str) -> ProviderFuture {
        let body = self.search_body(region);
        Box::pin(async move {
            let text = post_messages(&self, &body).await?;
            extract_text_response(&text, &self.search_model)
        })
    }
}

async fn post_messages(provider: &Claude, body: &Value) -> Result<String> {
    let client = reqwest::Client::new();
    let url = provider.base_url();

    let mut attempt = 0usize;
    let mut delay = RATE_LIMIT_BASE_DELAY;
    loop {
        attempt += 1;
        let response = client
            .post(&url)
            .header("x-api-key", &provider.key)
            .header("anthropic-version", "2023-06-01")
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
            delay = wait_with_backoff("Claude", attempt, delay, retry_after).await;
            continue;
        }
        return Err(anyhow!(
            "Claude API error ({}): {}",
            status,
            extract_claude_error(&text).unwrap_or(text)
        ));
    }
}

/// Concatenates every text block. Search responses interleave text with
/// `server_tool_use` and `web_search_tool_result` blocks, which are skipped.
fn extract_text_response(text: &str, fallback_model: &str) -> Result<ProviderResponse> {
    let payload: ClaudeResponse = serde_json::from_str(text)
        .map_err(|err| anyhow!("failed to parse Claude response JSON: {}", err))?;
    let content = payload
        .content
        .iter()
        .filter(|block| block.kind == "text")
        .filter_map(|block| block.text.as_deref())
        .collect::<String>();
    let content = content.trim();
    if content.is_empty() {
        return Err(anyhow!("empty response from Claude"));
    }

    let model = payload
        .model
        .filter(|value| !value.trim().is_empty())
        .or_else(|| Some(fallback_model.to_string()));
    let usage = payload.usage.map(|usage| ProviderUsage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage
            .input_tokens
            .zip(usage.output_tokens)
            .map(|(input, output)| input + output),
    });
    Ok(ProviderResponse {
        text: content.to_string(),
        model,
        usage,
    })
}

fn extract_claude_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<ClaudeError>,
    }

    #[derive(Deserialize)]
    struct ClaudeError {
        #[serde(rename = "type")]
        kind: Option<String>,
        message: Option<String>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    let error = parsed.error?;
    Some(format_error_parts(error.message, error.kind, None))
}

#[derive(Debug, Deserialize)]
struct ClaudeResponse {
    #[serde(default)]
    content: Vec<ClaudeContent>,
    model: Option<String>,
    usage: Option<ClaudeUsage>,
}

#[derive(Debug, Deserialize)]
struct ClaudeUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ClaudeContent {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_text_blocks_around_search_results() {
        let payload = include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tests/fixtures/claude_search_response.json"
        ));
        let response = extract_text_response(payload, DEFAULT_MODEL).unwrap();
        assert_eq!(
            response.text,
            "JWALK, LLC is a consulting firm based in New York. It focuses on market research."
        );
        assert_eq!(response.model.as_deref(), Some("claude-sonnet-4-5-20250929"));
        let usage = response.usage.unwrap();
        assert_eq!(usage.total_tokens, Some(1530));
    }

    #[test]
    fn plain_body_has_no_tools() {
        let provider = Claude::new("key")
            .append_system_input("system".to_string())
            .append_user_input("query".to_string());
        let body = provider.request_body(DEFAULT_MODEL);
        assert_eq!(body["system"], "system");
        assert_eq!(body["messages"][0]["content"][0]["text"], "query");
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn search_body_carries_region() {
        let provider = Claude::new("key")
            .with_search_model("claude-haiku-4-5")
            .append_user_input("JWALK, LLC".to_string());
        let body = provider.search_body("DE");
        assert_eq!(body["model"], "claude-haiku-4-5");
        let tool = &body["tools"][0];
        assert_eq!(tool["type"], "web_search_20250305");
        assert_eq!(tool["max_uses"], WEB_SEARCH_MAX_USES);
        assert_eq!(tool["user_location"]["type"], "approximate");
        assert_eq!(tool["user_location"]["country"], "DE");
    }

    #[test]
    fn error_body_is_summarized() {
        let body = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        assert_eq!(
            extract_claude_error(body).unwrap(),
            "Overloaded | type: overloaded_error"
        );
    }
}
