/// Text responders: one HTTP adapter per provider behind the `TextResponder` trait.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{Provider, ResponderConfig};

/// Forced-choice question used by `pairpoll ping`.
pub const PING_QUESTION: &str = "What is the more delicious food, Jollof Rice or Pepperoni Pizza? \
                              Answer with only and exactly one of these two options.";

/// Anthropic requires `max_tokens` on every request.
const DEFAULT_MAX_TOKENS: u32 = 1024;
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Longest slice of an error body kept in `ResponderError::Api`.
const ERROR_BODY_LIMIT: usize = 200;

#[derive(Debug, Error)]
pub enum ResponderError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("API key environment variable {var} is not set")]
    MissingApiKey { var: String },
    #[error("response contained no text")]
    EmptyResponse,
}

/// Anything that answers a question with text.
#[async_trait]
pub trait TextResponder: Send + Sync {
    /// Queue name; also used for export file names.
    fn name(&self) -> &str;

    /// Minimum wait between two calls. Zero means no pacing.
    fn pacing_interval(&self) -> Duration;

    async fn answer(&self, question: &str) -> Result<String, ResponderError>;
}

/// Settings every HTTP adapter shares.
struct Endpoint {
    client: Client,
    name: String,
    model: String,
    base_url: String,
    api_key: String,
    pacing: Duration,
    max_tokens: Option<u32>,
}

impl Endpoint {
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ResponderError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(ResponderError::Api {
        status,
        body: body.chars().take(ERROR_BODY_LIMIT).collect(),
    })
}

fn non_empty(text: Option<String>) -> Result<String, ResponderError> {
    text.filter(|t| !t.trim().is_empty())
        .ok_or(ResponderError::EmptyResponse)
}

// OpenAI-schema chat completions

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    content: Option<String>,
}

impl ChatCompletionResponse {
    fn into_text(self) -> Option<String> {
        self.choices.into_iter().next().and_then(|c| c.message.content)
    }
}

pub struct OpenAiResponder(Endpoint);

#[async_trait]
impl TextResponder for OpenAiResponder {
    fn name(&self) -> &str {
        &self.0.name
    }

    fn pacing_interval(&self) -> Duration {
        self.0.pacing
    }

    async fn answer(&self, question: &str) -> Result<String, ResponderError> {
        let ep = &self.0;
        let request = ChatCompletionRequest {
            model: &ep.model,
            messages: vec![ChatMessage { role: "user", content: question }],
            stream: false,
            max_tokens: ep.max_tokens,
        };
        let resp = ep
            .client
            .post(ep.url("chat/completions"))
            .bearer_auth(&ep.api_key)
            .json(&request)
            .send()
            .await?;
        let data: ChatCompletionResponse = check_status(resp).await?.json().await?;
        non_empty(data.into_text())
    }
}

// Anthropic messages

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    text: Option<String>,
}

impl MessagesResponse {
    fn into_text(self) -> Option<String> {
        self.content.into_iter().find_map(|block| block.text)
    }
}

pub struct AnthropicResponder(Endpoint);

#[async_trait]
impl TextResponder for AnthropicResponder {
    fn name(&self) -> &str {
        &self.0.name
    }

    fn pacing_interval(&self) -> Duration {
        self.0.pacing
    }

    async fn answer(&self, question: &str) -> Result<String, ResponderError> {
        let ep = &self.0;
        let request = MessagesRequest {
            model: &ep.model,
            max_tokens: ep.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages: vec![ChatMessage { role: "user", content: question }],
        };
        let resp = ep
            .client
            .post(ep.url("v1/messages"))
            .header("x-api-key", &ep.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await?;
        let data: MessagesResponse = check_status(resp).await?.json().await?;
        non_empty(data.into_text())
    }
}

// Google generateContent

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl GenerateContentResponse {
    fn into_text(self) -> Option<String> {
        let parts = self.candidates.into_iter().next()?.content?.parts;
        let text: String = parts.into_iter().filter_map(|p| p.text).collect();
        Some(text)
    }
}

pub struct GoogleResponder(Endpoint);

#[async_trait]
impl TextResponder for GoogleResponder {
    fn name(&self) -> &str {
        &self.0.name
    }

    fn pacing_interval(&self) -> Duration {
        self.0.pacing
    }

    async fn answer(&self, question: &str) -> Result<String, ResponderError> {
        let ep = &self.0;
        let request = GenerateContentRequest {
            contents: vec![Content { parts: vec![Part { text: question }] }],
            generation_config: ep.max_tokens.map(|max_output_tokens| GenerationConfig { max_output_tokens }),
        };
        let resp = ep
            .client
            .post(ep.url(&format!("v1beta/models/{}:generateContent", ep.model)))
            .header("x-goog-api-key", &ep.api_key)
            .json(&request)
            .send()
            .await?;
        let data: GenerateContentResponse = check_status(resp).await?.json().await?;
        non_empty(data.into_text())
    }
}

/// Build the adapter for one configured responder. Reads the API key from the environment.
pub fn build_responder(config: &ResponderConfig, client: Client) -> Result<Arc<dyn TextResponder>, ResponderError> {
    let var = config.api_key_env();
    let api_key = std::env::var(var).map_err(|_| ResponderError::MissingApiKey { var: var.to_string() })?;

    let endpoint = Endpoint {
        client,
        name: config.name().to_string(),
        model: config.model.clone(),
        base_url: config.base_url().to_string(),
        api_key,
        pacing: config.pacing(),
        max_tokens: config.max_tokens,
    };

    Ok(match config.provider {
        Provider::OpenAi => Arc::new(OpenAiResponder(endpoint)),
        Provider::Anthropic => Arc::new(AnthropicResponder(endpoint)),
        Provider::Google => Arc::new(GoogleResponder(endpoint)),
    })
}
