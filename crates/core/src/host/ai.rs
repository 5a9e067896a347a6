use log::*;
use parking_lot::Mutex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AiError {
  #[error("request failed: {0}")]
  Request(#[from] reqwest::Error),
  #[error("provider returned no completion")]
  EmptyCompletion,
  #[error("provider returned no embedding")]
  EmptyEmbedding,
}

const EMBEDDING_MODEL: &str = "text-embedding-3-small";

#[derive(Deserialize)]
struct ChatResponse {
  choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
  message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
  content: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
  data: Vec<EmbeddingEntry>,
}

#[derive(Deserialize)]
struct EmbeddingEntry {
  embedding: Vec<f64>,
}

/// Chat-completion and embedding client for the `host_ask_ai` import and the
/// agentic router. Completions are cached on `(model, sha256(prompt))` for
/// the process lifetime; embeddings per exact text.
#[derive(Debug)]
pub struct AiClient {
  endpoint: String,
  token: String,
  model: String,
  http: reqwest::Client,
  completion_cache: Mutex<HashMap<String, String>>,
  embedding_cache: Mutex<HashMap<String, Vec<f64>>>,
}

impl AiClient {
  pub fn new(endpoint: &str, token: &str, model: &str) -> Self {
    return Self {
      endpoint: endpoint.trim_end_matches('/').to_string(),
      token: token.to_string(),
      model: model.to_string(),
      http: reqwest::Client::new(),
      completion_cache: Mutex::new(HashMap::new()),
      embedding_cache: Mutex::new(HashMap::new()),
    };
  }

  fn cache_key(&self, prompt: &str) -> String {
    return format!("{}:{}", self.model, hex::encode(Sha256::digest(prompt.as_bytes())));
  }

  /// Issue a chat completion, serving repeats from the response cache.
  pub async fn ask(&self, prompt: &str) -> Result<String, AiError> {
    let key = self.cache_key(prompt);
    if let Some(cached) = self.completion_cache.lock().get(&key).cloned() {
      debug!("AI response cache hit");
      return Ok(cached);
    }

    let body = serde_json::json!({
      "model": self.model,
      "messages": [{"role": "user", "content": prompt}],
    });

    let response: ChatResponse = self
      .http
      .post(format!("{}/chat/completions", self.endpoint))
      .bearer_auth(&self.token)
      .json(&body)
      .send()
      .await?
      .error_for_status()?
      .json()
      .await?;

    let text = response
      .choices
      .into_iter()
      .next()
      .map(|c| c.message.content)
      .ok_or(AiError::EmptyCompletion)?;

    self.completion_cache.lock().insert(key, text.clone());
    return Ok(text);
  }

  /// Embedding for semantic routing, cached per exact text.
  pub async fn embedding(&self, text: &str) -> Result<Vec<f64>, AiError> {
    let key = format!("emb_{text}");
    if let Some(cached) = self.embedding_cache.lock().get(&key).cloned() {
      return Ok(cached);
    }

    let body = serde_json::json!({
      "input": text,
      "model": EMBEDDING_MODEL,
    });

    let response: EmbeddingResponse = self
      .http
      .post(format!("{}/embeddings", self.endpoint))
      .bearer_auth(&self.token)
      .json(&body)
      .send()
      .await?
      .error_for_status()?
      .json()
      .await?;

    let embedding = response
      .data
      .into_iter()
      .next()
      .map(|e| e.embedding)
      .ok_or(AiError::EmptyEmbedding)?;

    self.embedding_cache.lock().insert(key, embedding.clone());
    return Ok(embedding);
  }
}

/// Cosine similarity; mismatched lengths and zero-norm vectors yield 0.0
/// rather than NaN.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
  if a.len() != b.len() {
    return 0.0;
  }

  let mut dot = 0.0;
  let mut norm_a = 0.0;
  let mut norm_b = 0.0;
  for i in 0..a.len() {
    dot += a[i] * b[i];
    norm_a += a[i] * a[i];
    norm_b += b[i] * b[i];
  }

  if norm_a == 0.0 || norm_b == 0.0 {
    return 0.0;
  }
  return dot / (norm_a.sqrt() * norm_b.sqrt());
}
