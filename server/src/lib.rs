//! Guidance server: configuration loading and the HTTP API over
//! [`guidance_core`].
//!
//! # Modules
//!
//! - [`api`]: HTTP handlers and the router
//! - [`types`]: shared state plus request and response bodies

pub mod api;
pub mod types;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use guidance_core::{
    create_tokenizer, create_walk, Error, OpenAiConfig, OpenAiGenerator, Result, TemplateProcessor, TokenizerKind,
    UnmatchedScores, WalkKind,
};
use serde::Deserialize;
use tracing::{debug, info, warn};

/// Processor type served for every configured model.
pub type Processor = TemplateProcessor<OpenAiGenerator>;

pub const DEFAULT_BIND: &str = "127.0.0.1:8080";
const DEFAULT_PORT: &str = "8080";

// ---------------------------------------------------------------------------
// guidance.toml
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GuidanceConfig {
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
}

/// One served model: tokenizer family, SEL walk, unmatched-score policy and
/// the completion backend.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub tokenizer: TokenizerKind,
    #[serde(default)]
    pub tokenizer_path: Option<PathBuf>,
    #[serde(default)]
    pub walk: WalkKind,
    #[serde(default)]
    pub unmatched: UnmatchedScores,
    pub backend: OpenAiConfig,
}

/// Known keys at each level of `guidance.toml` for config validation.
const KNOWN_CONFIG_KEYS: &[&str] = &["bind", "models"];
const KNOWN_MODEL_KEYS: &[&str] = &["tokenizer", "tokenizer_path", "walk", "unmatched", "backend"];
const KNOWN_BACKEND_KEYS: &[&str] = &["base_url", "model", "api_key", "api_key_env", "top_logprobs", "params"];

/// Simple Levenshtein edit distance for typo suggestions.
fn edit_distance(a: &str, b: &str) -> usize {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Keys of `table` missing from `known`, each with the closest known key when
/// it is within three edits.
pub fn unknown_keys<'a>(table: &'a toml::Table, known: &[&'static str]) -> Vec<(&'a str, Option<&'static str>)> {
    table
        .keys()
        .filter(|key| !known.contains(&key.as_str()))
        .map(|key| {
            let suggestion = known
                .iter()
                .copied()
                .min_by_key(|k| edit_distance(key, k))
                .filter(|k| edit_distance(key, k) <= 3);
            (key.as_str(), suggestion)
        })
        .collect()
}

fn warn_unknown_keys(section: &str, table: &toml::Table, known: &[&'static str]) {
    for (key, suggestion) in unknown_keys(table, known) {
        match suggestion {
            Some(suggestion) => warn!(
                section,
                key,
                suggestion,
                "Unknown key in guidance.toml, did you mean '{suggestion}'?"
            ),
            None => warn!(section, key, "Unknown key in guidance.toml (known keys: {})", known.join(", ")),
        }
    }
}

fn validate_keys(table: &toml::Table) {
    warn_unknown_keys("top level", table, KNOWN_CONFIG_KEYS);
    let Some(models) = table.get("models").and_then(|v| v.as_table()) else {
        return;
    };
    for (name, model) in models {
        let Some(model) = model.as_table() else {
            continue;
        };
        warn_unknown_keys(&format!("models.{name}"), model, KNOWN_MODEL_KEYS);
        if let Some(backend) = model.get("backend").and_then(|v| v.as_table()) {
            warn_unknown_keys(&format!("models.{name}.backend"), backend, KNOWN_BACKEND_KEYS);
        }
    }
}

/// Parse `guidance.toml` content. Relative `tokenizer_path` entries resolve
/// against `base_dir`.
///
/// # Errors
/// Returns [`Error::Config`] for invalid TOML, missing fields or an empty
/// model list.
pub fn parse_config(content: &str, base_dir: &Path) -> Result<GuidanceConfig> {
    let table: toml::Table = content.parse().map_err(|e| Error::Config(format!("{e}")))?;
    validate_keys(&table);

    let mut config: GuidanceConfig =
        toml::Value::Table(table).try_into().map_err(|e| Error::Config(format!("{e}")))?;
    if config.models.is_empty() {
        return Err(Error::Config("no models configured".to_string()));
    }
    for model in config.models.values_mut() {
        if let Some(path) = model.tokenizer_path.as_mut() {
            if path.is_relative() {
                *path = base_dir.join(&*path);
            }
        }
    }
    Ok(config)
}

/// Load and validate the config file at `path`.
///
/// # Errors
/// Returns [`Error::Config`] if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> Result<GuidanceConfig> {
    debug!(path = %path.display(), "Loading config");
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse_config(&content, base_dir).map_err(|e| match e {
        Error::Config(msg) => Error::Config(format!("{}: {msg}", path.display())),
        other => other,
    })
}

/// Bind address: the configured one (or [`DEFAULT_BIND`]), on all interfaces
/// when `bind_all`, with the port replaced by a valid `port_override`.
pub fn resolve_bind(configured: Option<&str>, bind_all: bool, port_override: Option<&str>) -> String {
    let addr = configured.unwrap_or(DEFAULT_BIND);
    let (host, port) = addr.rsplit_once(':').unwrap_or((addr, DEFAULT_PORT));
    let host = if bind_all { "0.0.0.0" } else { host };
    let port = port_override
        .and_then(|p| p.parse::<u16>().ok())
        .map_or_else(|| port.to_string(), |p| p.to_string());
    format!("{host}:{port}")
}

/// Parse a `KEY=VALUE` command-line input. The value may contain `=`.
///
/// # Errors
/// Returns a message if there is no `=` or the key is empty.
pub fn parse_input(arg: &str) -> std::result::Result<(String, String), String> {
    match arg.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {arg:?}")),
    }
}

// ---------------------------------------------------------------------------
// Model construction
// ---------------------------------------------------------------------------

/// Build the processor for one configured model.
///
/// # Errors
/// Fails if the tokenizer cannot be loaded or the HTTP client cannot be built.
pub fn build_processor(name: &str, model: &ModelConfig) -> Result<Processor> {
    let tokenizer = create_tokenizer(model.tokenizer, model.tokenizer_path.as_deref())?;
    let generator = OpenAiGenerator::new(model.backend.clone())?;
    let walk = create_walk(model.walk);
    info!(
        model = name,
        tokenizer = tokenizer.name(),
        walk = walk.name(),
        backend = %model.backend.base_url,
        "Initialized model"
    );
    Ok(TemplateProcessor::new(tokenizer, generator).with_walk(walk).with_unmatched(model.unmatched))
}

/// Build processors for every model in `config`, keyed by model name.
///
/// # Errors
/// Fails on the first model that cannot be built.
pub fn build_models(config: &GuidanceConfig) -> Result<BTreeMap<String, Arc<Processor>>> {
    config
        .models
        .iter()
        .map(|(name, model)| {
            let processor = build_processor(name, model)
                .map_err(|e| Error::Config(format!("model {name}: {e}")))?;
            Ok((name.clone(), Arc::new(processor)))
        })
        .collect()
}
