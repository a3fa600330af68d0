//! OpenAI-compatible text completion backend (`POST {base_url}/completions`).
//!
//! Works against OpenAI itself and against self-hosted servers exposing the
//! same API (vLLM, Aphrodite, llama.cpp server).

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{CompletionStream, TokenGenerator};
use crate::types::{DirectiveArgs, LogitBias, TokenScores};
use crate::{Error, Result};

/// SentencePiece word-boundary marker some servers leave in token text.
const SPACE_MARKER: char = '\u{2581}';

const STREAM_BUFFER: usize = 32;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Connection settings plus default completion parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiConfig {
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the API key; used when `api_key` is unset.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Number of alternatives requested per logprob query.
    #[serde(default = "default_top_logprobs")]
    pub top_logprobs: u32,
    /// Defaults merged under every request; directive arguments win.
    #[serde(default)]
    pub params: Map<String, Value>,
}

fn default_model() -> String {
    "default".to_string()
}

fn default_top_logprobs() -> u32 {
    10
}

impl OpenAiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: default_model(),
            api_key: None,
            api_key_env: None,
            top_logprobs: default_top_logprobs(),
            params: Map::new(),
        }
    }

    fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| self.api_key_env.as_deref().and_then(|var| std::env::var(var).ok()))
            .filter(|key| !key.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    logprobs: Option<ChoiceLogprobs>,
}

#[derive(Debug, Deserialize)]
struct ChoiceLogprobs {
    #[serde(default)]
    top_logprobs: Vec<Option<BTreeMap<String, f64>>>,
}

/// Backend error for a 2xx body that does not parse as a completion.
fn malformed(raw: &str, err: &serde_json::Error) -> Error {
    Error::Backend { status: 200, body: format!("malformed completion response ({err}): {raw}") }
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

pub struct OpenAiGenerator {
    client: reqwest::Client,
    config: OpenAiConfig,
    api_key: Option<String>,
}

impl OpenAiGenerator {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        let api_key = config.resolve_api_key();
        Ok(Self { client, config, api_key })
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!("{}/completions", self.config.base_url.trim_end_matches('/'))
    }

    /// Default params, then `overrides`, then the fields the engine owns.
    fn request_body(&self, prompt: &str, overrides: Map<String, Value>) -> Value {
        let mut body = self.config.params.clone();
        body.extend(overrides);
        body.insert("model".to_string(), Value::String(self.config.model.clone()));
        body.insert("prompt".to_string(), Value::String(prompt.to_string()));
        Value::Object(body)
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let mut request = self.client.post(self.endpoint()).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Backend { status: status.as_u16(), body });
        }
        Ok(response)
    }
}

impl TokenGenerator for OpenAiGenerator {
    async fn generate_string(&self, prompt: &str, args: &DirectiveArgs) -> Result<CompletionStream> {
        let Value::Object(mut overrides) = serde_json::to_value(args)? else {
            return Err(Error::InvalidDirective("arguments must form an object".to_string()));
        };
        overrides.insert("stream".to_string(), Value::Bool(true));
        let body = self.request_body(prompt, overrides);

        debug!(model = %self.config.model, prompt_len = prompt.len(), "Starting completion stream");
        let response = self.post(&body).await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            if let Err(e) = pump_events(response, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });
        Ok(rx)
    }

    async fn generate_token_logprobs(&self, prompt: &str, bias: &LogitBias) -> Result<TokenScores> {
        let start = Instant::now();
        let mut overrides = Map::new();
        overrides.insert("logit_bias".to_string(), serde_json::to_value(bias)?);
        overrides.insert("logprobs".to_string(), json!(self.config.top_logprobs));
        overrides.insert("max_tokens".to_string(), json!(1));
        overrides.insert("stream".to_string(), Value::Bool(false));
        let body = self.request_body(prompt, overrides);

        let raw = self.post(&body).await?.text().await?;
        let response: CompletionResponse = serde_json::from_str(&raw).map_err(|e| malformed(&raw, &e))?;
        if let Some(error) = response.error {
            return Err(Error::Backend { status: 200, body: error.to_string() });
        }
        let top = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.logprobs)
            .and_then(|logprobs| logprobs.top_logprobs.into_iter().flatten().next())
            .unwrap_or_default();

        let scores = normalize_logprobs(top);
        debug!(
            candidates = scores.len(),
            biased = bias.len(),
            time_ms = start.elapsed().as_millis() as u64,
            "Logprob query"
        );
        Ok(scores)
    }
}

// ---------------------------------------------------------------------------
// Server-sent events
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum SseEvent {
    Text(String),
    Done,
    Skip,
}

fn parse_event(line: &str) -> Result<SseEvent> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseEvent::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }
    let chunk: CompletionResponse = serde_json::from_str(data).map_err(|e| malformed(data, &e))?;
    if let Some(error) = chunk.error {
        return Err(Error::Backend { status: 200, body: error.to_string() });
    }
    match chunk.choices.into_iter().next().and_then(|choice| choice.text) {
        Some(text) if !text.is_empty() => Ok(SseEvent::Text(text)),
        _ => Ok(SseEvent::Skip),
    }
}

/// Drain the complete lines from `buffer`. With `flush`, an unterminated
/// final line is returned too and the buffer is left empty.
fn take_lines(buffer: &mut Vec<u8>, flush: bool) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        lines.push(String::from_utf8_lossy(&line).trim().to_string());
    }
    if flush && !buffer.is_empty() {
        let rest = std::mem::take(buffer);
        lines.push(String::from_utf8_lossy(&rest).trim().to_string());
    }
    lines
}

/// Forward accumulated completion text until `[DONE]`, end of body, or the
/// receiver going away. A last event without a trailing newline still counts.
async fn pump_events(mut response: reqwest::Response, tx: &mpsc::Sender<Result<String>>) -> Result<()> {
    let mut buffer: Vec<u8> = Vec::new();
    let mut text = String::new();

    loop {
        let chunk = tokio::select! {
            chunk = response.chunk() => chunk?,
            () = tx.closed() => return Ok(()),
        };
        let finished = chunk.is_none();
        if let Some(chunk) = chunk {
            buffer.extend_from_slice(&chunk);
        }

        for line in take_lines(&mut buffer, finished) {
            match parse_event(&line)? {
                SseEvent::Done => return Ok(()),
                SseEvent::Skip => {}
                SseEvent::Text(delta) => {
                    text.push_str(&delta);
                    trace!(len = text.len(), "Completion chunk");
                    if tx.send(Ok(text.clone())).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
        if finished {
            return Ok(());
        }
    }
}

/// Replace a leading `▁` with a literal space; on collisions keep the higher
/// score.
fn normalize_logprobs(raw: BTreeMap<String, f64>) -> TokenScores {
    let mut scores = TokenScores::new();
    for (key, score) in raw {
        let key = match key.strip_prefix(SPACE_MARKER) {
            Some(rest) => format!(" {rest}"),
            None => key,
        };
        scores
            .entry(key)
            .and_modify(|best| {
                if score > *best {
                    *best = score;
                }
            })
            .or_insert(score);
    }
    scores
}
