//! HTTP client for the LLM collaborator (Ollama wire format): health probe,
//! query expansion, and final answer generation.

use crate::config::RagConfig;
use crate::error::{RagError, RagResult};
use crate::execution::{self, RetryPolicy, REMOTE_RETRY};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

pub struct LlmClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    retry: RetryPolicy,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl LlmClient {
    pub fn new(config: &RagConfig) -> RagResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;
        Ok(Self {
            http,
            endpoint: config.llm_endpoint.trim_end_matches('/').to_string(),
            model: config.llm_model.clone(),
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
            retry: REMOTE_RETRY,
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// `GET {endpoint}/api/tags`; any 2xx means the collaborator is up.
    pub async fn health_check(&self) -> RagResult<()> {
        let response = self
            .http
            .get(format!("{}/api/tags", self.endpoint))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RagError::TransientRemote(format!(
                "LLM health check returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Single completion under the remote retry policy.
    pub async fn generate(&self, prompt: &str) -> RagResult<String> {
        execution::retry(self.retry, "llm_generate", || self.generate_once(prompt)).await
    }

    async fn generate_once(&self, prompt: &str) -> RagResult<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": self.temperature,
                "top_p": self.top_p,
                "num_predict": self.max_tokens,
            },
        });

        let response = self
            .http
            .post(format!("{}/api/generate", self.endpoint))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(RagError::TransientRemote(format!(
                "LLM returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(RagError::Resource(format!(
                "LLM returned {}; check llm_endpoint and llm_model",
                status
            )));
        }
        Ok(response.json::<GenerateResponse>().await?.response)
    }

    /// Ask for `extra` alternative phrasings of the question. Lines
    /// containing a question mark are accepted, deduplicated against the
    /// original by exact string equality. Returns the original first; on any
    /// LLM failure the original alone comes back.
    pub async fn expand_query(&self, question: &str, extra: usize) -> Vec<String> {
        let mut variants = vec![question.to_string()];
        if extra == 0 {
            return variants;
        }

        let prompt = format!(
            "Rephrase the following question in {extra} different ways. \
             Produce one rephrasing per line, each ending with a question mark, \
             and nothing else.\n\nQuestion: {question}\n"
        );

        match self.generate(&prompt).await {
            Ok(text) => {
                for line in text.lines() {
                    let line = line.trim();
                    if !line.contains('?') {
                        continue;
                    }
                    if variants.iter().any(|v| v == line) {
                        continue;
                    }
                    variants.push(line.to_string());
                    if variants.len() > extra {
                        break;
                    }
                }
                debug!(count = variants.len(), "Query expansion produced variants");
            }
            Err(e) => {
                warn!(error = %e, "Query expansion failed, continuing with the original question");
            }
        }
        variants
    }

    /// Final grounded answer over the assembled context.
    pub async fn answer(&self, question: &str, context: &str) -> RagResult<String> {
        let prompt = format!(
            "You are a helpful assistant answering questions about a document collection. \
             Use only the context below; if the context does not contain the answer, say so.\n\n\
             Context:\n{context}\nQuestion: {question}\n\nAnswer:"
        );
        self.generate(&prompt).await
    }
}
