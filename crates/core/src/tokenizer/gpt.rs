//! GPT-family tokenizer over tiktoken's `cl100k_base` BPE.

use tiktoken_rs::CoreBPE;

use super::{decode_with_eos, encode_with_eos, Tokenizer};
use crate::types::Token;
use crate::{Error, Result};

const EOS: &str = "<|endoftext|>";

pub struct GptTokenizer {
    bpe: CoreBPE,
    eos_id: Token,
}

impl GptTokenizer {
    /// Load the bundled `cl100k_base` ranks.
    ///
    /// # Errors
    /// Returns an error if the BPE tables cannot be built.
    pub fn new() -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base().map_err(|e| Error::Tokenizer(e.to_string()))?;
        let eos_id = bpe
            .encode_with_special_tokens(EOS)
            .first()
            .copied()
            .ok_or_else(|| Error::Tokenizer(format!("{EOS} is not a special token")))?;
        Ok(Self { bpe, eos_id })
    }

    #[must_use]
    pub fn eos_token_id(&self) -> Token {
        self.eos_id
    }
}

impl Tokenizer for GptTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<Token>> {
        encode_with_eos(text, EOS, self.eos_id, |t| Ok(self.bpe.encode_ordinary(t)))
    }

    fn decode(&self, tokens: &[Token]) -> Result<String> {
        decode_with_eos(tokens, EOS, self.eos_id, |t| {
            self.bpe.decode(t.to_vec()).map_err(|e| Error::Tokenizer(e.to_string()))
        })
    }

    fn eos(&self) -> &str {
        EOS
    }

    fn name(&self) -> &str {
        "tiktoken"
    }
}
