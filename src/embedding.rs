//! Embedding client used by the subprocess cluster oracle.
//!
//! Supports the OpenAI `/v1/embeddings` endpoint and Ollama's `/api/embed`.
//! Texts are embedded in batches of `embedding.batch_size`; vectors already
//! in the cache are not requested again.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{anyhow, bail, Result};
use std::time::Duration;
use tracing::{debug, info};

use crate::cache::{cache_key, SharedCache};
use crate::config::EmbeddingConfig;

/// Batched, cached embedding client.
pub struct Embedder {
    config: EmbeddingConfig,
    client: reqwest::Client,
    cache: Option<SharedCache>,
}

impl Embedder {
    /// # Errors
    ///
    /// Fails for a disabled provider, missing model or dims, or a missing
    /// `OPENAI_API_KEY` with the OpenAI provider.
    pub fn new(config: &EmbeddingConfig, cache: Option<SharedCache>) -> Result<Self> {
        match config.provider.as_str() {
            "disabled" => bail!("Embedding provider is disabled; clustering needs [embedding] configured"),
            "openai" => {
                if std::env::var("OPENAI_API_KEY").is_err() {
                    bail!("OPENAI_API_KEY environment variable not set");
                }
            }
            "ollama" => {}
            other => bail!("Unknown embedding provider: {}", other),
        }
        if config.model.is_none() {
            bail!("embedding.model required for {} provider", config.provider);
        }
        if config.dims.is_none() {
            bail!("embedding.dims required for {} provider", config.provider);
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config: config.clone(),
            client,
            cache,
        })
    }

    pub fn model_name(&self) -> &str {
        self.config.model.as_deref().unwrap_or("unknown")
    }

    pub fn dims(&self) -> usize {
        self.config.dims.unwrap_or(0)
    }

    fn key(&self, text: &str) -> String {
        cache_key(&["embedding", self.config.provider.as_str(), self.model_name(), text])
    }

    /// Embed `texts`, returning one vector per text in input order.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        if let Some(cache) = &self.cache {
            let cache = cache.lock().map_err(|_| anyhow!("cache lock poisoned"))?;
            for (slot, text) in vectors.iter_mut().zip(texts) {
                *slot = cache.get_vector(&self.key(text));
            }
        }

        let missing: Vec<usize> = (0..texts.len()).filter(|&i| vectors[i].is_none()).collect();
        info!(
            total = texts.len(),
            cached = texts.len() - missing.len(),
            model = self.model_name(),
            "embedding texts"
        );

        for batch in missing.chunks(self.config.batch_size.max(1)) {
            let inputs: Vec<String> = batch.iter().map(|&i| texts[i].clone()).collect();
            let embedded = match self.config.provider.as_str() {
                "openai" => self.embed_openai(&inputs).await?,
                _ => self.embed_ollama(&inputs).await?,
            };
            if embedded.len() != inputs.len() {
                bail!(
                    "Embedding response has {} vectors for {} inputs",
                    embedded.len(),
                    inputs.len()
                );
            }
            debug!(batch = inputs.len(), "embedded batch");
            for (&i, vector) in batch.iter().zip(embedded) {
                if let Some(cache) = &self.cache {
                    let mut cache = cache.lock().map_err(|_| anyhow!("cache lock poisoned"))?;
                    cache.set_vector(self.key(&texts[i]), &vector);
                }
                vectors[i] = Some(vector);
            }
        }

        let dims = self.dims();
        vectors
            .into_iter()
            .map(|v| {
                let v = v.ok_or_else(|| anyhow!("missing embedding"))?;
                if dims > 0 && v.len() != dims {
                    bail!("Embedding has {} dimensions, expected {}", v.len(), dims);
                }
                Ok(v)
            })
            .collect()
    }

    /// POST `body` to `url` with retry and backoff, returning the JSON reply.
    async fn post_with_retry(
        &self,
        label: &str,
        url: &str,
        bearer: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut request = self
                .client
                .post(url)
                .header("Content-Type", "application/json")
                .json(body);
            if let Some(token) = bearer {
                request = request.header("Authorization", format!("Bearer {}", token));
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow!("{} API error {}: {}", label, status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("{} API error {}: {}", label, status, body_text);
                }
                Err(e) => {
                    last_err = Some(anyhow!("{} connection error ({}): {}", label, url, e));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("{} embedding failed after retries", label)))
    }

    async fn embed_openai(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| anyhow!("OPENAI_API_KEY not set"))?;
        let base = self.config.url.as_deref().unwrap_or("https://api.openai.com");
        let body = serde_json::json!({
            "model": self.model_name(),
            "input": texts,
        });
        let json = self
            .post_with_retry("OpenAI", &format!("{}/v1/embeddings", base), Some(&api_key), &body)
            .await?;
        parse_openai_response(&json)
    }

    async fn embed_ollama(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let base = self.config.url.as_deref().unwrap_or("http://localhost:11434");
        let body = serde_json::json!({
            "model": self.model_name(),
            "input": texts,
        });
        let json = self
            .post_with_retry("Ollama", &format!("{}/api/embed", base), None, &body)
            .await?;
        parse_ollama_response(&json)
    }
}

fn number_array(value: &serde_json::Value, what: &str) -> Result<Vec<f32>> {
    value
        .as_array()
        .ok_or_else(|| anyhow!("Invalid {} response: embedding is not an array", what))?
        .iter()
        .enumerate()
        .map(|(i, v)| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| anyhow!("Invalid {} response: embedding value {} is not a number", what, i))
        })
        .collect()
}

/// Extract `data[].embedding`, ordered by `index` when present.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map_or(position, |i| i as usize);
        indexed.push((index, number_array(embedding, "OpenAI")?));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?
        .iter()
        .map(|e| number_array(e, "Ollama"))
        .collect()
}

/// Encode a float vector as little-endian f32 bytes.
///
/// # Example
///
/// ```rust
/// use qualcode::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode bytes written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_response_is_reordered_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.5, 0.5]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.5, 0.5]]);
    }

    #[test]
    fn ollama_response_parses() {
        let json = serde_json::json!({"embeddings": [[0.1, 0.2], [0.3, 0.4]]});
        let vectors = parse_ollama_response(&json).unwrap();
        assert_eq!(vectors.len(), 2);
        assert!((vectors[1][0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn malformed_responses_fail() {
        assert!(parse_openai_response(&serde_json::json!({"error": "x"})).is_err());
        assert!(parse_ollama_response(&serde_json::json!({"embeddings": [1]})).is_err());
    }

    #[test]
    fn non_numeric_values_are_rejected() {
        let err = parse_ollama_response(&serde_json::json!({"embeddings": [[0.5, "x"]]})).unwrap_err();
        assert!(err.to_string().contains("value 1 is not a number"));
        let openai = serde_json::json!({"data": [{"index": 0, "embedding": [null, 1.0]}]});
        assert!(parse_openai_response(&openai).is_err());
    }

    #[test]
    fn disabled_provider_is_rejected() {
        let err = Embedder::new(&EmbeddingConfig::default(), None).err().unwrap();
        assert!(err.to_string().contains("disabled"));
    }

    #[tokio::test]
    async fn cached_vectors_skip_the_network() {
        use crate::cache::CacheStore;
        let config = EmbeddingConfig {
            provider: "ollama".into(),
            model: Some("nomic-embed-text".into()),
            dims: Some(2),
            // unroutable; any request would fail
            url: Some("http://127.0.0.1:9".into()),
            max_retries: 0,
            ..Default::default()
        };
        let cache = CacheStore::in_memory().shared();
        let embedder = Embedder::new(&config, Some(cache.clone())).unwrap();
        {
            let mut store = cache.lock().unwrap();
            store.set_vector(embedder.key("hello"), &[1.0, 2.0]);
        }
        let vectors = embedder.embed(&["hello".to_string()]).await.unwrap();
        assert_eq!(vectors, vec![vec![1.0, 2.0]]);
    }
}
