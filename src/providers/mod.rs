use anyhow::{anyhow, Result};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;

mod claude;
mod gemini;
mod openai;
pub(crate) mod retry;

pub use claude::Claude;
pub use gemini::Gemini;
pub use openai::OpenAI;
pub use retry::{retry_with_policy, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAI,
    Gemini,
    Claude,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Claude => "claude",
        }
    }

    /// Settings key holding the web-search model for this provider.
    pub fn search_key(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai_search",
            ProviderKind::Gemini => "gemini_search",
            ProviderKind::Claude => "claude_search",
        }
    }

    fn default_models(&self) -> (&'static str, &'static str) {
        match self {
            ProviderKind::OpenAI => (openai::DEFAULT_MODEL, openai::DEFAULT_SEARCH_MODEL),
            ProviderKind::Gemini => (gemini::DEFAULT_MODEL, gemini::DEFAULT_MODEL),
            ProviderKind::Claude => (claude::DEFAULT_MODEL, claude::DEFAULT_MODEL),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderSelection {
    pub provider: ProviderKind,
    pub requested_model: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderResponse {
    pub text: String,
    pub model: Option<String>,
    pub usage: Option<ProviderUsage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    System,
    User,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: String) -> Self {
        Self {
            role: MessageRole::System,
            content,
        }
    }

    pub fn user(content: String) -> Self {
        Self {
            role: MessageRole::User,
            content,
        }
    }
}

pub type ProviderFuture = Pin<Box<dyn Future<Output = Result<ProviderResponse>> + Send>>;

/// A text-generation backend. Builders are consumed by value so a configured
/// provider can be cloned once per row and extended without shared state.
pub trait Provider: Clone + Send + Sync {
    fn append_system_input(self, input: String) -> Self;
    fn append_user_input(self, input: String) -> Self;
    fn with_temperature(self, temperature: f32) -> Self;
    /// Plain completion with the translation model.
    fn complete(self) -> ProviderFuture;
    /// Completion backed by live web search, scoped to a 2-letter region code.
    fn search(self, region: &str) -> ProviderFuture;
}

#[derive(Debug, Clone)]
pub enum ProviderImpl {
    OpenAI(OpenAI),
    Gemini(Gemini),
    Claude(Claude),
}

impl Provider for ProviderImpl {
    fn append_system_input(self, input: String) -> Self {
        match self {
            ProviderImpl::OpenAI(provider) => {
                ProviderImpl::OpenAI(provider.append_system_input(input))
            }
            ProviderImpl::Gemini(provider) => {
                ProviderImpl::Gemini(provider.append_system_input(input))
            }
            ProviderImpl::Claude(provider) => {
                ProviderImpl::Claude(provider.append_system_input(input))
            }
        }
    }

    fn append_user_input(self, input: String) -> Self {
        match self {
            ProviderImpl::OpenAI(provider) => {
                ProviderImpl::OpenAI(provider.append_user_input(input))
            }
            ProviderImpl::Gemini(provider) => {
                ProviderImpl::Gemini(provider.append_user_input(input))
            }
            ProviderImpl::Claude(provider) => {
                ProviderImpl::Claude(provider.append_user_input(input))
            }
        }
    }

    fn with_temperature(self, temperature: f32) -> Self {
        match self {
            ProviderImpl::OpenAI(provider) => {
                ProviderImpl::OpenAI(provider.with_temperature(temperature))
            }
            ProviderImpl::Gemini(provider) => {
                ProviderImpl::Gemini(provider.with_temperature(temperature))
            }
            ProviderImpl::Claude(provider) => {
                ProviderImpl::Claude(provider.with_temperature(temperature))
            }
        }
    }

    fn complete(self) -> ProviderFuture {
        match self {
            ProviderImpl::OpenAI(provider) => provider.complete(),
            ProviderImpl::Gemini(provider) => provider.complete(),
            ProviderImpl::Claude(provider) => provider.complete(),
        }
    }

    fn search(self, region: &str) -> ProviderFuture {
        match self {
            ProviderImpl::OpenAI(provider) => provider.search(region),
            ProviderImpl::Gemini(provider) => provider.search(region),
            ProviderImpl::Claude(provider) => provider.search(region),
        }
    }
}

/// Model names and endpoint used to build a provider.
#[derive(Debug, Clone, Default)]
pub struct ProviderSetup {
    pub model: Option<String>,
    pub search_model: Option<String>,
    pub base_url: Option<String>,
}

pub fn build_provider(provider: ProviderKind, key: String, setup: ProviderSetup) -> ProviderImpl {
    let (default_model, default_search) = provider.default_models();
    let model = setup.model.unwrap_or_else(|| default_model.to_string());
    let search_model = setup
        .search_model
        .unwrap_or_else(|| default_search.to_string());
    match provider {
        ProviderKind::OpenAI => ProviderImpl::OpenAI(
            OpenAI::new(key)
                .with_model(model)
                .with_search_model(search_model)
                .with_base_url(setup.base_url),
        ),
        ProviderKind::Gemini => ProviderImpl::Gemini(
            Gemini::new(key)
                .with_model(model)
                .with_search_model(search_model)
                .with_base_url(setup.base_url),
        ),
        ProviderKind::Claude => ProviderImpl::Claude(
            Claude::new(key)
                .with_model(model)
                .with_search_model(search_model)
                .with_base_url(setup.base_url),
        ),
    }
}

pub fn resolve_provider_selection(
    model_arg: Option<&str>,
    override_key: Option<&str>,
) -> Result<ProviderSelection> {
    match model_arg {
        Some(model) => parse_model_arg(model),
        None => default_provider_selection(override_key),
    }
}

pub fn resolve_key(provider: ProviderKind, override_key: Option<&str>) -> Result<String> {
    if let Some(key) = override_key {
        return Ok(key.to_string());
    }

    match provider {
        ProviderKind::OpenAI => get_env("OPENAI_API_KEY"),
        ProviderKind::Gemini => get_env("GEMINI_API_KEY").or_else(|| get_env("GOOGLE_API_KEY")),
        ProviderKind::Claude => get_env("ANTHROPIC_API_KEY"),
    }
    .ok_or_else(|| anyhow!("API key not found for provider {}", provider.as_str()))
}

fn default_provider_selection(override_key: Option<&str>) -> Result<ProviderSelection> {
    if override_key.is_some() || get_env("OPENAI_API_KEY").is_some() {
        return Ok(ProviderSelection {
            provider: ProviderKind::OpenAI,
            requested_model: None,
        });
    }

    if get_env("GEMINI_API_KEY").is_some() || get_env("GOOGLE_API_KEY").is_some() {
        return Ok(ProviderSelection {
            provider: ProviderKind::Gemini,
            requested_model: None,
        });
    }

    if get_env("ANTHROPIC_API_KEY").is_some() {
        return Ok(ProviderSelection {
            provider: ProviderKind::Claude,
            requested_model: None,
        });
    }

    Err(anyhow!(
        "no API keys found (checked OPENAI_API_KEY, GEMINI_API_KEY/GOOGLE_API_KEY, ANTHROPIC_API_KEY)"
    ))
}

fn parse_model_arg(model_arg: &str) -> Result<ProviderSelection> {
    let raw = model_arg.trim();
    if raw.is_empty() {
        return Err(anyhow!("model argument is empty"));
    }

    let lower = raw.to_lowercase();
    if let Some(provider) = provider_from_name(&lower) {
        return Ok(ProviderSelection {
            provider,
            requested_model: None,
        });
    }

    if let Some((provider, model)) = parse_provider_model_pair(raw) {
        return Ok(ProviderSelection {
            provider,
            requested_model: model,
        });
    }

    Err(anyhow!(
        "unable to infer provider from model '{}'. Use provider:model (openai:, gemini:, claude:)",
        raw
    ))
}

fn parse_provider_model_pair(input: &str) -> Option<(ProviderKind, Option<String>)> {
    let (provider_part, model_part) = input.split_once(':')?;
    let provider = provider_from_name(&provider_part.to_lowercase())?;
    let model = if model_part.trim().is_empty() {
        None
    } else {
        Some(model_part.trim().to_string())
    };
    Some((provider, model))
}

fn provider_from_name(name: &str) -> Option<ProviderKind> {
    match name {
        "openai" => Some(ProviderKind::OpenAI),
        "gemini" | "google" => Some(ProviderKind::Gemini),
        "claude" | "anthropic" => Some(ProviderKind::Claude),
        _ => None,
    }
}

fn get_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

/// Joins the text of every system message, in order.
pub(crate) fn system_text(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|message| message.role == MessageRole::System)
        .map(|message| message.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub(crate) fn format_error_parts(
    message: Option<String>,
    kind: Option<String>,
    code: Option<String>,
) -> String {
    let mut parts = Vec::new();
    if let Some(message) = message
        && !message.trim().is_empty()
    {
        parts.push(message);
    }
    if let Some(kind) = kind
        && !kind.trim().is_empty()
    {
        parts.push(format!("type: {}", kind));
    }
    if let Some(code) = code
        && !code.trim().is_empty()
    {
        parts.push(format!("code: {}", code));
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(" | ")
    }
}
