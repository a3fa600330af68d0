//! SEL walk strategies.
//!
//! A strategy decides how option text and the growing working prompt map onto
//! trie positions. [`ContextualWalk`] tokenizes options together with the
//! prompt, since sub-word tokenization is context-sensitive. [`IsolatedWalk`]
//! tokenizes options on their own beneath a synthetic root token, for
//! tokenizers whose encoding of the prompt does not stay a stable prefix.

use std::sync::Arc;

use serde::Deserialize;

use crate::tokenizer::Tokenizer;
use crate::types::Token;
use crate::{Error, Result};

/// Maps between text and trie positions during one SEL resolution.
///
/// `prompt` is always the canonicalized prompt the selection started from;
/// `text` is that prompt followed by the fragments chosen so far.
pub trait WalkStrategy: Send + Sync {
    /// Token sequence stored in the trie for `option`.
    fn option_tokens(&self, tokenizer: &dyn Tokenizer, prompt: &str, option: &str) -> Result<Vec<Token>>;

    /// Trie path corresponding to the working text.
    fn walk_tokens(&self, tokenizer: &dyn Tokenizer, prompt: &str, text: &str) -> Result<Vec<Token>>;

    /// Working text for a trie path; sent to the backend as the prompt.
    fn path_text(&self, tokenizer: &dyn Tokenizer, prompt: &str, path: &[Token]) -> Result<String>;

    /// Selected option for a complete stored path, without prompt or EOS.
    fn completion(&self, tokenizer: &dyn Tokenizer, prompt: &str, word: &[Token]) -> Result<String>;

    fn name(&self) -> &str;
}

fn strip_eos<'a>(tokenizer: &dyn Tokenizer, text: &'a str) -> &'a str {
    text.strip_suffix(tokenizer.eos()).unwrap_or(text)
}

// ---------------------------------------------------------------------------
// Contextual
// ---------------------------------------------------------------------------

/// Options are encoded as `prompt + option + EOS`; the walk re-encodes the
/// whole working text each step.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextualWalk;

impl WalkStrategy for ContextualWalk {
    fn option_tokens(&self, tokenizer: &dyn Tokenizer, prompt: &str, option: &str) -> Result<Vec<Token>> {
        tokenizer.encode(&format!("{prompt}{option}{}", tokenizer.eos()))
    }

    fn walk_tokens(&self, tokenizer: &dyn Tokenizer, _prompt: &str, text: &str) -> Result<Vec<Token>> {
        tokenizer.encode(text)
    }

    fn path_text(&self, tokenizer: &dyn Tokenizer, _prompt: &str, path: &[Token]) -> Result<String> {
        tokenizer.decode(path)
    }

    fn completion(&self, tokenizer: &dyn Tokenizer, prompt: &str, word: &[Token]) -> Result<String> {
        let text = tokenizer.decode(word)?;
        let selected = match text.strip_prefix(prompt) {
            Some(rest) => rest,
            None => text.get(prompt.len()..).ok_or_else(|| {
                Error::Tokenizer(format!("Decoded selection {text:?} is shorter than its prompt"))
            })?,
        };
        Ok(strip_eos(tokenizer, selected).to_string())
    }

    fn name(&self) -> &str {
        "contextual"
    }
}

// ---------------------------------------------------------------------------
// Isolated
// ---------------------------------------------------------------------------

/// Options are encoded without the prompt and stored under a synthetic
/// `root` token; the walk restarts from that root every step and encodes only
/// the text chosen since the prompt.
#[derive(Debug, Clone, Copy)]
pub struct IsolatedWalk {
    pub root: Token,
}

impl Default for IsolatedWalk {
    fn default() -> Self {
        Self { root: Token::MAX }
    }
}

impl IsolatedWalk {
    fn rooted(&self, mut tokens: Vec<Token>) -> Vec<Token> {
        tokens.insert(0, self.root);
        tokens
    }

    /// Path below the synthetic root.
    fn below_root<'a>(&self, path: &'a [Token]) -> &'a [Token] {
        match path.split_first() {
            Some((&first, rest)) if first == self.root => rest,
            _ => path,
        }
    }
}

impl WalkStrategy for IsolatedWalk {
    fn option_tokens(&self, tokenizer: &dyn Tokenizer, _prompt: &str, option: &str) -> Result<Vec<Token>> {
        Ok(self.rooted(tokenizer.encode(&format!("{option}{}", tokenizer.eos()))?))
    }

    fn walk_tokens(&self, tokenizer: &dyn Tokenizer, prompt: &str, text: &str) -> Result<Vec<Token>> {
        let chosen = text.strip_prefix(prompt).unwrap_or_default();
        Ok(self.rooted(tokenizer.encode(chosen)?))
    }

    fn path_text(&self, tokenizer: &dyn Tokenizer, prompt: &str, path: &[Token]) -> Result<String> {
        Ok(format!("{prompt}{}", tokenizer.decode(self.below_root(path))?))
    }

    fn completion(&self, tokenizer: &dyn Tokenizer, _prompt: &str, word: &[Token]) -> Result<String> {
        let text = tokenizer.decode(self.below_root(word))?;
        Ok(strip_eos(tokenizer, &text).to_string())
    }

    fn name(&self) -> &str {
        "isolated"
    }
}

/// Configurable walk dialects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalkKind {
    #[default]
    Contextual,
    Isolated,
}

pub fn create_walk(kind: WalkKind) -> Arc<dyn WalkStrategy> {
    match kind {
        WalkKind::Contextual => Arc::new(ContextualWalk),
        WalkKind::Isolated => Arc::new(IsolatedWalk::default()),
    }
}
