//! LLM provider dispatch: a single `ask(prompt) -> text` seam over
//! provider-specific HTTP APIs, a write-once registry keyed by symbolic
//! name, and deadline enforcement for every call.

use async_trait::async_trait;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod claude;
pub mod gemini;
pub mod openai;

/// Per-call deadline applied when a transformer does not override it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const ERROR_BODY_SNIPPET_CHARS: usize = 256;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Upstream responded with a non-success status.
    #[error("provider returned status {status}: {body}")]
    Http { status: u16, body: String },
    /// The response decoded but carried no candidate text, or did not match
    /// the provider's documented shape.
    #[error("provider returned an empty or malformed response")]
    EmptyResponse,
    /// The call exceeded its deadline; the HTTP request is cancelled.
    #[error("provider request exceeded its deadline")]
    Timeout,
    /// The forest is stopping and cancelled the in-flight request.
    #[error("provider request cancelled by shutdown")]
    Cancelled,
    /// Transport-level failure before any status was received.
    #[error("provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// A single-turn, user-role completion. Implementations perform one HTTP
/// request per call and return the first candidate's text.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn ask(&self, prompt: &str) -> Result<String, ProviderError>;
}

pub type ProviderFactory = fn(api_key: String, model: String) -> Arc<dyn Provider>;

lazy_static! {
    // Written once at process init, read lock-free-ish afterwards.
    static ref PROVIDER_REGISTRY: RwLock<HashMap<String, ProviderFactory>> =
        RwLock::new(HashMap::new());
}

pub fn register_provider(name: &str, factory: ProviderFactory) {
    PROVIDER_REGISTRY
        .write()
        .expect("provider registry poisoned")
        .insert(name.to_string(), factory);
}

pub fn provider_registered(name: &str) -> bool {
    PROVIDER_REGISTRY
        .read()
        .expect("provider registry poisoned")
        .contains_key(name)
}

pub fn registered_provider_names() -> Vec<String> {
    let mut names: Vec<String> = PROVIDER_REGISTRY
        .read()
        .expect("provider registry poisoned")
        .keys()
        .cloned()
        .collect();
    names.sort();
    names
}

/// Instantiates a provider by symbolic name. `None` when the name was never
/// registered.
pub fn create_provider(name: &str, api_key: String, model: String) -> Option<Arc<dyn Provider>> {
    let factory = *PROVIDER_REGISTRY
        .read()
        .expect("provider registry poisoned")
        .get(name)?;
    Some(factory(api_key, model))
}

/// Registers the built-in providers. Called once by the daemon before any
/// configuration is loaded.
pub fn register_builtin_providers() {
    register_provider("claude", |api_key, model| {
        Arc::new(claude::ClaudeProvider::new(api_key, model))
    });
    register_provider("openai", |api_key, model| {
        Arc::new(openai::OpenAiProvider::new(api_key, model))
    });
    register_provider("gemini", |api_key, model| {
        Arc::new(gemini::GeminiProvider::new(api_key, model))
    });
}

/// `{PROVIDER}_API_KEY` for a registered provider name.
pub fn api_key_from_env(provider: &str) -> Option<String> {
    std::env::var(format!("{}_API_KEY", provider.to_uppercase())).ok()
}

/// `{PROVIDER}_MODEL` fallback when a transformer omits its model.
pub fn model_from_env(provider: &str) -> Option<String> {
    std::env::var(format!("{}_MODEL", provider.to_uppercase())).ok()
}

/// Runs one `ask` under the caller's deadline, racing the forest's
/// cancellation handle so shutdown does not wait out slow providers.
pub async fn ask_with_deadline(
    provider: &dyn Provider,
    prompt: &str,
    deadline: Duration,
    cancel: &CancellationToken,
) -> Result<String, ProviderError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ProviderError::Cancelled),
        outcome = tokio::time::timeout(deadline, provider.ask(prompt)) => match outcome {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        },
    }
}

/// Returns the body for success statuses, a snipped [`ProviderError::Http`]
/// otherwise.
pub(crate) async fn require_success(response: reqwest::Response) -> Result<String, ProviderError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ProviderError::Http {
            status: status.as_u16(),
            body: body_snippet(&body),
        });
    }
    Ok(body)
}

fn body_snippet(body: &str) -> String {
    let collapsed = body.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > ERROR_BODY_SNIPPET_CHARS {
        let shortened: String = collapsed.chars().take(ERROR_BODY_SNIPPET_CHARS).collect();
        return format!("{shortened}...");
    }
    collapsed
}
