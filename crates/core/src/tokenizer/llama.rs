//! Llama-family tokenizer using the `tokenizers` crate.
//!
//! Loads a HuggingFace `tokenizer.json`; special-token text comes from the
//! sibling `tokenizer_config.json` when present.

use std::path::Path;

use serde::Deserialize;
use tokenizers::Tokenizer as HfTokenizer;
use tracing::debug;

use super::{decode_with_eos, encode_with_eos, Tokenizer};
use crate::types::Token;
use crate::{Error, Result};

const DEFAULT_EOS: &str = "</s>";
const DEFAULT_BOS: &str = "<s>";

/// `tokenizer_config.json` stores special tokens either as plain strings or
/// as `AddedToken` objects.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SpecialToken {
    Text(String),
    Added { content: String },
}

impl SpecialToken {
    fn into_content(self) -> String {
        match self {
            SpecialToken::Text(s) | SpecialToken::Added { content: s } => s,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TokenizerConfig {
    eos_token: Option<SpecialToken>,
    bos_token: Option<SpecialToken>,
}

/// Wrapper around a HuggingFace tokenizer for Llama, Mistral and similar models
pub struct LlamaTokenizer {
    tokenizer: HfTokenizer,
    eos: String,
    eos_id: Token,
    bos: String,
}

impl LlamaTokenizer {
    /// Load a tokenizer from a directory containing `tokenizer.json` and,
    /// optionally, `tokenizer_config.json`.
    ///
    /// # Errors
    /// Returns an error if the tokenizer cannot be loaded or its EOS token is
    /// not in the vocabulary.
    pub fn from_pretrained(model_path: impl AsRef<Path>) -> Result<Self> {
        let model_path = model_path.as_ref();

        let tokenizer_path = model_path.join("tokenizer.json");
        if !tokenizer_path.exists() {
            return Err(Error::Tokenizer(format!("No tokenizer.json found in {}", model_path.display())));
        }
        let tokenizer = HfTokenizer::from_file(&tokenizer_path).map_err(|e| Error::Tokenizer(e.to_string()))?;

        let config_path = model_path.join("tokenizer_config.json");
        let config: TokenizerConfig = if config_path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&config_path)?)?
        } else {
            TokenizerConfig::default()
        };

        let eos = config.eos_token.map_or_else(|| DEFAULT_EOS.to_string(), SpecialToken::into_content);
        let bos = config.bos_token.map_or_else(|| DEFAULT_BOS.to_string(), SpecialToken::into_content);
        debug!(path = %model_path.display(), eos = %eos, bos = %bos, "Loaded tokenizer.json");

        Self::with_tokenizer(tokenizer, eos, bos)
    }

    /// Build from an in-memory `tokenizer.json` document.
    ///
    /// # Errors
    /// Returns an error if the JSON is not a valid tokenizer or `eos` is not
    /// in its vocabulary.
    pub fn from_json(json: &str, eos: &str, bos: &str) -> Result<Self> {
        let tokenizer: HfTokenizer = json.parse().map_err(|e| Error::Tokenizer(format!("{e}")))?;
        Self::with_tokenizer(tokenizer, eos.to_string(), bos.to_string())
    }

    fn with_tokenizer(tokenizer: HfTokenizer, eos: String, bos: String) -> Result<Self> {
        let eos_id = tokenizer
            .token_to_id(&eos)
            .ok_or_else(|| Error::Tokenizer(format!("EOS token {eos} is not in the vocabulary")))?;
        Ok(Self { tokenizer, eos, eos_id, bos })
    }

    #[must_use]
    pub fn eos_token_id(&self) -> Token {
        self.eos_id
    }

    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    /// Chat templates sometimes render `"<s> "` ahead of the prompt; the model
    /// adds BOS on its own, so it is never part of the text.
    fn strip_bos<'a>(&self, text: &'a str) -> &'a str {
        text.strip_prefix(self.bos.as_str()).and_then(|rest| rest.strip_prefix(' ')).unwrap_or(text)
    }

    fn encode_text(&self, text: &str) -> Result<Vec<Token>> {
        let encoding =
            self.tokenizer.encode(self.strip_bos(text), false).map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode_text(&self, ids: &[Token]) -> Result<String> {
        let text = self.tokenizer.decode(ids, true).map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(self.strip_bos(&text).to_string())
    }
}

impl Tokenizer for LlamaTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<Token>> {
        encode_with_eos(text, &self.eos, self.eos_id, |t| self.encode_text(t))
    }

    fn decode(&self, tokens: &[Token]) -> Result<String> {
        decode_with_eos(tokens, &self.eos, self.eos_id, |t| self.decode_text(t))
    }

    fn eos(&self) -> &str {
        &self.eos
    }

    fn name(&self) -> &str {
        "huggingface"
    }
}
