//! Pluggable text↔token codecs, one per model family.
//!
//! Defines the [`Tokenizer`] trait and three implementations:
//! [`SentencePieceTokenizer`] (pure Rust, in-memory piece table),
//! `GptTokenizer` (tiktoken BPE, feature `tiktoken`) and `LlamaTokenizer`
//! (HuggingFace `tokenizer.json`, feature `hf`). The engine only ever sees the
//! trait object.

#[cfg(feature = "tiktoken")]
mod gpt;
#[cfg(feature = "hf")]
mod llama;
mod sentencepiece;

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::types::Token;
use crate::{Error, Result};

#[cfg(feature = "tiktoken")]
pub use gpt::GptTokenizer;
#[cfg(feature = "hf")]
pub use llama::LlamaTokenizer;
pub use sentencepiece::SentencePieceTokenizer;

/// Text↔token codec for one model family.
///
/// Implementations must round-trip representable text:
/// `decode(encode(x)) == x`. Text ending in [`Tokenizer::eos`] encodes to the
/// tokens of the remaining text followed by the reserved EOS id, and decoding
/// inverts that.
pub trait Tokenizer: Send + Sync {
    /// Encode text to token ids.
    ///
    /// # Errors
    /// Returns an error if the backend cannot encode the text.
    fn encode(&self, text: &str) -> Result<Vec<Token>>;

    /// Decode token ids to text.
    ///
    /// # Errors
    /// Returns an error if an id is outside the vocabulary.
    fn decode(&self, tokens: &[Token]) -> Result<String>;

    /// Text form of the end-of-sequence marker.
    fn eos(&self) -> &str;

    /// Short backend name for logs.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// EOS suffix handling shared by every implementation
// ---------------------------------------------------------------------------

/// Encode `text`, special-casing a trailing EOS marker: the marker is stripped
/// before `encode` runs and the reserved `eos_id` appended afterwards.
pub(crate) fn encode_with_eos(
    text: &str,
    eos: &str,
    eos_id: Token,
    encode: impl FnOnce(&str) -> Result<Vec<Token>>,
) -> Result<Vec<Token>> {
    match text.strip_suffix(eos) {
        Some(body) if !eos.is_empty() => {
            let mut tokens = encode(body)?;
            tokens.push(eos_id);
            Ok(tokens)
        }
        _ => encode(text),
    }
}

/// Inverse of [`encode_with_eos`].
pub(crate) fn decode_with_eos(
    tokens: &[Token],
    eos: &str,
    eos_id: Token,
    decode: impl FnOnce(&[Token]) -> Result<String>,
) -> Result<String> {
    match tokens.split_last() {
        Some((&last, body)) if last == eos_id => Ok(decode(body)? + eos),
        _ => decode(tokens),
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Model families with a bundled tokenizer implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerKind {
    /// SentencePiece models shipped as a HuggingFace `tokenizer.json`.
    Llama,
    /// OpenAI `cl100k_base` BPE.
    Gpt,
    /// Score-ordered BPE over a JSON piece table.
    SentencePiece,
}

impl std::str::FromStr for TokenizerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "llama" => Ok(TokenizerKind::Llama),
            "gpt" => Ok(TokenizerKind::Gpt),
            "sentencepiece" => Ok(TokenizerKind::SentencePiece),
            other => Err(Error::Config(format!(
                "Unknown tokenizer '{other}' (expected llama, gpt or sentencepiece)"
            ))),
        }
    }
}

/// Create a tokenizer for `kind`. `path` is the directory holding
/// `tokenizer.json` for [`TokenizerKind::Llama`], the piece table file for
/// [`TokenizerKind::SentencePiece`], and is ignored for GPT.
///
/// # Errors
/// Returns an error if the tokenizer files cannot be loaded or the backend was
/// compiled out.
pub fn create_tokenizer(kind: TokenizerKind, path: Option<&Path>) -> Result<Arc<dyn Tokenizer>> {
    match kind {
        #[cfg(feature = "hf")]
        TokenizerKind::Llama => {
            let dir = path.ok_or_else(|| {
                Error::Config("llama tokenizer requires tokenizer_path".to_string())
            })?;
            Ok(Arc::new(LlamaTokenizer::from_pretrained(dir)?))
        }
        #[cfg(not(feature = "hf"))]
        TokenizerKind::Llama => {
            let _ = path;
            Err(Error::Config("built without the `hf` feature".to_string()))
        }
        #[cfg(feature = "tiktoken")]
        TokenizerKind::Gpt => Ok(Arc::new(GptTokenizer::new()?)),
        #[cfg(not(feature = "tiktoken"))]
        TokenizerKind::Gpt => Err(Error::Config("built without the `tiktoken` feature".to_string())),
        TokenizerKind::SentencePiece => {
            let file = path.ok_or_else(|| {
                Error::Config("sentencepiece tokenizer requires tokenizer_path".to_string())
            })?;
            Ok(Arc::new(SentencePieceTokenizer::from_file(file)?))
        }
    }
}
