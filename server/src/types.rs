use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use guidance_core::Variables;
use serde::{Deserialize, Serialize};

use crate::Processor;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// State shared by every HTTP handler.
#[derive(Clone)]
pub struct AppContext {
    pub models: Arc<BTreeMap<String, Arc<Processor>>>,
    /// Server start time for uptime reporting via `/health`.
    pub start_time: Instant,
}

impl AppContext {
    pub fn new(models: BTreeMap<String, Arc<Processor>>) -> Self {
        Self { models: Arc::new(models), start_time: Instant::now() }
    }
}

// ---------------------------------------------------------------------------
// Request and response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct GuidanceRequest {
    pub model: String,
    pub template: String,
    #[serde(default)]
    pub variables: Variables,
    /// Stream NDJSON snapshots instead of returning only the final map.
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub struct TokenizeRequest {
    pub model: String,
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenizeResponse {
    pub tokens: Vec<u32>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub models: Vec<String>,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub tokenizer: String,
    pub walk: String,
    pub backend_model: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelInfo>,
}
