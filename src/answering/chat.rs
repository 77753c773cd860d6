// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Question answering through an OpenAI-compatible chat completions endpoint

use async_trait::async_trait;
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::QaBackend;
use crate::config::Options;
use crate::error::{Result, VqaError};

/// Body of `POST /v1/chat/completions`
#[derive(serde::Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Turn<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(serde::Serialize)]
struct Turn<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(serde::Deserialize)]
struct CompletionReply {
    #[serde(default)]
    choices: Vec<ReplyChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(serde::Deserialize)]
struct ReplyChoice {
    message: ReplyMessage,
}

#[derive(serde::Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: String,
}

#[derive(serde::Deserialize)]
struct TokenUsage {
    total_tokens: u32,
}

/// Short-answer instruction used when no system prompt is configured
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "أجب عن السؤال بكلمة واحدة أو بعبارة قصيرة جدا، مستعينا بأوصاف الصورة المرفقة.";

#[derive(Debug, Clone, PartialEq)]
pub struct ChatAnswererConfig {
    pub endpoint: String,
    pub model: String,
    /// `None` sends only the user message
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for ChatAnswererConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".to_string(),
            model: "default".to_string(),
            system_prompt: Some(DEFAULT_SYSTEM_PROMPT.to_string()),
            max_tokens: 16,
            temperature: 0.0,
            timeout_secs: 120,
        }
    }
}

impl ChatAnswererConfig {
    pub fn from_options(options: &Options) -> Result<Self> {
        let d = Self::default();
        let system_prompt = match options.get("system_prompt") {
            Some(serde_json::Value::String(s)) if s.is_empty() => None,
            _ => options.get_or("system_prompt", d.system_prompt)?,
        };
        Ok(Self {
            endpoint: options.get_or("endpoint", d.endpoint)?,
            model: options.get_or("model", d.model)?,
            system_prompt,
            max_tokens: options.get_or("max_tokens", d.max_tokens)?,
            temperature: options.get_f32("temperature", d.temperature)?,
            timeout_secs: options.get_or("timeout_secs", d.timeout_secs)?,
        })
    }
}

/// Client for a chat model answering fused prompts
#[derive(Debug, Clone)]
pub struct ChatAnswerer {
    client: Client,
    endpoint: String,
    config: ChatAnswererConfig,
}

impl ChatAnswerer {
    pub fn new(config: ChatAnswererConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        info!(
            "Chat answerer configured: endpoint={}, model={}",
            endpoint, config.model
        );

        Ok(Self {
            client,
            endpoint,
            config,
        })
    }

    pub fn from_options(options: &Options) -> anyhow::Result<Self> {
        Self::new(ChatAnswererConfig::from_options(options)?)
    }

    pub fn model_name(&self) -> &str {
        &self.config.model
    }

    /// `GET {endpoint}/health` answered with a 2xx
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.endpoint);
        self.client
            .get(&url)
            .send()
            .await
            .map(|resp| resp.status().is_success())
            .unwrap_or_else(|e| {
                debug!("Health check {} failed: {}", url, e);
                false
            })
    }

    fn build_request<'a>(&'a self, question: &'a str) -> CompletionRequest<'a> {
        let system = self
            .config
            .system_prompt
            .as_deref()
            .map(|content| Turn { role: "system", content });
        let messages = system
            .into_iter()
            .chain(std::iter::once(Turn {
                role: "user",
                content: question,
            }))
            .collect();

        CompletionRequest {
            model: &self.config.model,
            messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        }
    }
}

fn answer_error(e: impl std::fmt::Display) -> VqaError {
    VqaError::AnswerGeneration(e.to_string())
}

#[async_trait]
impl QaBackend for ChatAnswerer {
    fn name(&self) -> &str {
        "chat"
    }

    async fn answer(&self, question: &str) -> Result<String> {
        let start = Instant::now();
        let request = self.build_request(question);

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.endpoint))
            .json(&request)
            .send()
            .await
            .map_err(answer_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VqaError::AnswerGeneration(format!(
                "endpoint returned {}: {}",
                status, body
            )));
        }

        let reply: CompletionReply = response.json().await.map_err(answer_error)?;
        let tokens = reply.usage.as_ref().map_or(0, |u| u.total_tokens);
        let answer = reply
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| VqaError::AnswerGeneration("response has no choices".to_string()))?;

        debug!(
            "Answered in {} ms ({} tokens)",
            start.elapsed().as_millis(),
            tokens
        );
        Ok(answer)
    }
}
