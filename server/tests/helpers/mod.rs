//! Test harness for HTTP API integration tests.
//!
//! Starts a mock OpenAI-compatible completions backend, writes a
//! `guidance.toml` plus SentencePiece piece table into a temp dir, loads it
//! through the real config path and serves the router on an ephemeral port.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use guidance_server::api::router;
use guidance_server::types::AppContext;
use guidance_server::{build_models, load_config};
use serde_json::{json, Value};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Mock completions backend
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct Backend {
    pub requests: Mutex<Vec<Value>>,
}

async fn completions(State(backend): State<Arc<Backend>>, Json(body): Json<Value>) -> Response {
    backend.requests.lock().unwrap().push(body.clone());

    if body["stream"] == true {
        let mut sse = String::new();
        for piece in ["It", " is", " sunny"] {
            let chunk = json!({"choices": [{"text": piece, "index": 0}]});
            sse.push_str(&format!("data: {chunk}\n\n"));
        }
        sse.push_str("data: [DONE]\n\n");
        return ([(header::CONTENT_TYPE, "text/event-stream")], sse).into_response();
    }

    Json(json!({
        "choices": [{
            "text": "r",
            "index": 0,
            "logprobs": { "top_logprobs": [{ "r": -0.1, "s": -2.5, "\u{2581}c": -3.0 }] }
        }]
    }))
    .into_response()
}

async fn spawn(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

// ---------------------------------------------------------------------------
// Server under test
// ---------------------------------------------------------------------------

/// Letter-level piece table: `<unk>`, `<s>`, `</s>`, `▁`, `a..z`, `A..Z`.
fn piece_table() -> Value {
    let pieces: Vec<Value> = ["<unk>", "<s>", "</s>", "\u{2581}"]
        .into_iter()
        .map(String::from)
        .chain(('a'..='z').chain('A'..='Z').map(String::from))
        .map(|piece| json!([piece, 0.0]))
        .collect();
    json!({ "pieces": pieces, "bos_id": 1, "eos_id": 2 })
}

/// Token id of a lowercase letter in [`piece_table`].
pub fn letter(c: char) -> u32 {
    4 + (c as u32 - 'a' as u32)
}

pub struct TestServer {
    pub base: String,
    pub client: reqwest::Client,
    pub backend: Arc<Backend>,
    _temp_dir: TempDir,
}

impl TestServer {
    pub async fn start() -> Self {
        let backend = Arc::new(Backend::default());
        let backend_app =
            Router::new().route("/v1/completions", post(completions)).with_state(Arc::clone(&backend));
        let backend_url = spawn(backend_app).await;

        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::write(temp_dir.path().join("pieces.json"), piece_table().to_string()).unwrap();
        let config = format!(
            r#"
[models.tiny]
tokenizer = "sentencepiece"
tokenizer_path = "pieces.json"

[models.tiny.backend]
base_url = "{backend_url}/v1"
model = "tiny-7b"

[models.tiny.backend.params]
temperature = 0.7

[models.isolated]
tokenizer = "sentencepiece"
tokenizer_path = "pieces.json"
walk = "isolated"

[models.isolated.backend]
base_url = "{backend_url}/v1"
"#
        );
        let config_path = temp_dir.path().join("guidance.toml");
        std::fs::write(&config_path, config).unwrap();

        let config = load_config(&config_path).unwrap();
        let models = build_models(&config).unwrap();
        let base = spawn(router(AppContext::new(models))).await;

        Self { base, client: reqwest::Client::new(), backend, _temp_dir: temp_dir }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client.post(self.url(path)).json(&body).send().await.unwrap()
    }

    pub fn backend_requests(&self) -> Vec<Value> {
        self.backend.requests.lock().unwrap().clone()
    }
}

pub fn weather_request(model: &str, stream: bool) -> Value {
    json!({
        "model": model,
        "template": "Weather is {{SEL w options=options}}. {{GEN more stop=.}}",
        "variables": { "options": ["sunny", "rainy", "cloudy"] },
        "stream": stream,
    })
}
