use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::providers::{
    Message, MessageRole, Provider, ProviderFuture, ProviderResponse, ProviderUsage,
};

type CompleteScript = dyn Fn(&str) -> Result<String> + Send + Sync;
type SearchScript = dyn Fn(&str, &str) -> Result<String> + Send + Sync;
type DelayScript = dyn Fn(&str) -> Duration + Send + Sync;

#[derive(Debug, Clone, Default)]
pub(crate) struct RecordedRequest {
    pub system: String,
    pub user: String,
    pub temperature: Option<f32>,
    pub region: Option<String>,
}

/// In-memory provider whose answers come from closures keyed on the user
/// prompt. Counters and the request log are shared between clones.
#[derive(Clone)]
pub(crate) struct ScriptedProvider {
    complete: Arc<CompleteScript>,
    search: Arc<SearchScript>,
    delay: Arc<DelayScript>,
    completions: Arc<AtomicUsize>,
    searches: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    messages: Vec<Message>,
    temperature: Option<f32>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new(|_| Err(anyhow!("no completion scripted")))
    }
}

impl ScriptedProvider {
    pub fn new<F>(complete: F) -> Self
    where
        F: Fn(&str) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            complete: Arc::new(complete),
            search: Arc::new(|_: &str, _: &str| Err(anyhow!("no search scripted"))),
            delay: Arc::new(|_: &str| Duration::ZERO),
            completions: Arc::new(AtomicUsize::new(0)),
            searches: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
            messages: Vec::new(),
            temperature: None,
        }
    }

    pub fn with_search<F>(mut self, search: F) -> Self
    where
        F: Fn(&str, &str) -> Result<String> + Send + Sync + 'static,
    {
        self.search = Arc::new(search);
        self
    }

    pub fn with_delay<F>(mut self, delay: F) -> Self
    where
        F: Fn(&str) -> Duration + Send + Sync + 'static,
    {
        self.delay = Arc::new(delay);
        self
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.requests.lock().expect("request log").last().cloned()
    }

    fn record(&self, region: Option<&str>) -> RecordedRequest {
        let join = |role: MessageRole| {
            self.messages
                .iter()
                .filter(|message| message.role == role)
                .map(|message| message.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n")
        };
        let request = RecordedRequest {
            system: join(MessageRole::System),
            user: join(MessageRole::User),
            temperature: self.temperature,
            region: region.map(str::to_string),
        };
        self.requests
            .lock()
            .expect("request log")
            .push(request.clone());
        request
    }
}

impl Provider for ScriptedProvider {
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
            self.completions.fetch_add(1, Ordering::SeqCst);
            let request = self.record(None);
            let delay = (self.delay)(&request.user);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let text = (self.complete)(&request.user)?;
            Ok(ProviderResponse {
                text,
                model: Some("scripted".to_string()),
                usage: Some(ProviderUsage {
                    prompt_tokens: Some(10),
                    completion_tokens: Some(5),
                    total_tokens: Some(15),
                }),
            })
        })
    }

    fn search(self, region: &str) -> ProviderFuture {
        let region = region.to_string();
        Box::pin(async move {
            self.searches.fetch_add(1, Ordering::SeqCst);
            let request = self.record(Some(&region));
            let text = (self.search)(&request.user, &region)?;
            Ok(ProviderResponse {
                text,
                model: Some("scripted-search".to_string()),
                usage: None,
            })
        })
    }
}
