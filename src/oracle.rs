//! Chat oracle adapters.
//!
//! - [`ChatOracle`] — OpenAI-compatible `/v1/chat/completions` or Ollama
//!   `/api/chat`, with the same retry and backoff rules as the embedding
//!   client.
//! - [`CachedOracle`] — wraps any [`Oracle`] with the shared cache store.
//!   Responses are keyed by model, temperature, and both prompts.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use qualcode_core::oracle::Oracle;
use std::time::Duration;
use tracing::debug;

use crate::cache::{cache_key, SharedCache};
use crate::config::OracleConfig;

/// Oracle used when `oracle.provider = "disabled"`.
pub struct DisabledOracle;

#[async_trait]
impl Oracle for DisabledOracle {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn ask(&self, _system: &str, _user: &str, _temperature: f32) -> Result<String> {
        bail!("Oracle provider is disabled; set [oracle] provider and model in the config")
    }
}

pub struct ChatOracle {
    config: OracleConfig,
    model: String,
    client: reqwest::Client,
    api_key: Option<String>,
}

impl ChatOracle {
    pub fn new(config: &OracleConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("oracle.model required for {} provider", config.provider))?;
        let api_key = match config.provider.as_str() {
            "openai" => Some(
                std::env::var("OPENAI_API_KEY")
                    .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?,
            ),
            "ollama" => None,
            other => bail!("Unknown oracle provider: {}", other),
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config: config.clone(),
            model,
            client,
            api_key,
        })
    }

    fn endpoint(&self) -> String {
        match self.config.provider.as_str() {
            "openai" => format!(
                "{}/v1/chat/completions",
                self.config.url.as_deref().unwrap_or("https://api.openai.com")
            ),
            _ => format!(
                "{}/api/chat",
                self.config.url.as_deref().unwrap_or("http://localhost:11434")
            ),
        }
    }

    fn request_body(&self, system: &str, user: &str, temperature: f32) -> serde_json::Value {
        let messages = serde_json::json!([
            {"role": "system", "content": system},
            {"role": "user", "content": user},
        ]);
        match self.config.provider.as_str() {
            "openai" => serde_json::json!({
                "model": self.model,
                "messages": messages,
                "temperature": temperature,
            }),
            _ => serde_json::json!({
                "model": self.model,
                "messages": messages,
                "stream": false,
                "options": {"temperature": temperature},
            }),
        }
    }
}

#[async_trait]
impl Oracle for ChatOracle {
    fn name(&self) -> &str {
        &self.model
    }

    async fn ask(&self, system: &str, user: &str, temperature: f32) -> Result<String> {
        let url = self.endpoint();
        let body = self.request_body(system, user, temperature);
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.post(&url).json(&body);
            if let Some(key) = &self.api_key {
                request = request.header("Authorization", format!("Bearer {}", key));
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        let content = parse_chat_response(&json)?;
                        debug!(model = %self.model, chars = content.len(), "chat response");
                        return Ok(content);
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow!("Chat API error {}: {}", status, body_text));
                        continue;
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Chat API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(anyhow!("Chat connection error ({}): {}", url, e));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("Chat request failed after retries")))
    }
}

/// Extract the assistant text from an OpenAI (`choices[0].message`) or
/// Ollama (`message`) reply.
pub fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    let message = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .or_else(|| json.get("message"))
        .ok_or_else(|| anyhow!("Invalid chat response: missing message"))?;
    message
        .get("content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Invalid chat response: missing content"))
}

/// Build the oracle selected by the config.
pub fn create_oracle(config: &OracleConfig) -> Result<Box<dyn Oracle>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledOracle)),
        "openai" | "ollama" => Ok(Box::new(ChatOracle::new(config)?)),
        other => bail!("Unknown oracle provider: {}", other),
    }
}

/// Serves repeated prompts from the cache.
pub struct CachedOracle {
    inner: Box<dyn Oracle>,
    cache: SharedCache,
}

impl CachedOracle {
    pub fn new(inner: Box<dyn Oracle>, cache: SharedCache) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl Oracle for CachedOracle {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn ask(&self, system: &str, user: &str, temperature: f32) -> Result<String> {
        let temperature_key = format!("{:.2}", temperature);
        let key = cache_key(&[self.inner.name(), temperature_key.as_str(), system, user]);
        let cached = {
            let cache = self.cache.lock().map_err(|_| anyhow!("cache lock poisoned"))?;
            cache.get(&key).map(str::to_string)
        };
        if let Some(hit) = cached {
            debug!(key = %&key[..12], "oracle cache hit");
            return Ok(hit);
        }

        let response = self.inner.ask(system, user, temperature).await?;
        self.cache
            .lock()
            .map_err(|_| anyhow!("cache lock poisoned"))?
            .set(key, response.clone());
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl Oracle for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        async fn ask(&self, _system: &str, user: &str, _temperature: f32) -> Result<String> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{}#{}", user, n))
        }
    }

    #[test]
    fn parses_openai_and_ollama_replies() {
        let openai = serde_json::json!({"choices": [{"message": {"role": "assistant", "content": "hi"}}]});
        assert_eq!(parse_chat_response(&openai).unwrap(), "hi");
        let ollama = serde_json::json!({"message": {"role": "assistant", "content": "hey"}, "done": true});
        assert_eq!(parse_chat_response(&ollama).unwrap(), "hey");
        assert!(parse_chat_response(&serde_json::json!({"error": "boom"})).is_err());
    }

    #[tokio::test]
    async fn cache_hits_skip_inner_oracle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = CacheStore::in_memory().shared();
        let oracle = CachedOracle::new(Box::new(Counting(calls.clone())), cache.clone());

        let first = oracle.ask("sys", "user", 0.5).await.unwrap();
        let second = oracle.ask("sys", "user", 0.5).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // a warmer retry is a different request
        oracle.ask("sys", "user", 0.7).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn disabled_oracle_errors() {
        let oracle = create_oracle(&OracleConfig::default()).unwrap();
        assert!(oracle.ask("a", "b", 0.0).await.is_err());
    }

    #[test]
    fn ollama_body_carries_temperature_option() {
        let config = OracleConfig {
            provider: "ollama".into(),
            model: Some("llama3".into()),
            ..Default::default()
        };
        let oracle = ChatOracle::new(&config).unwrap();
        let body = oracle.request_body("s", "u", 0.3);
        assert_eq!(body["stream"], serde_json::json!(false));
        assert!((body["options"]["temperature"].as_f64().unwrap() - 0.3).abs() < 1e-6);
        assert_eq!(body["messages"][1]["content"], "u");
        assert_eq!(oracle.endpoint(), "http://localhost:11434/api/chat");
    }
}
