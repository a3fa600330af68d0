//! Guided generation engine.
//!
//! Fills `{{GEN ...}}` and `{{SEL ...}}` directives inside a text template
//! using an external completion service. GEN streams free-form text bounded by
//! backend stop conditions; SEL picks one of a fixed set of options, enforced
//! at the token level through a prefix trie so that only genuine branch
//! points cost a model round-trip.
//!
//! - [`tokenizer`]: text↔token codecs, one per model family
//! - [`generator`]: model backends (OpenAI-compatible completions)
//! - [`trie`]: token prefix tree used by SEL
//! - [`parser`]: directive parser
//! - [`walk`]: SEL walk strategies
//! - [`processor`]: the template processor tying it all together
//! - [`agent`]: few-shot instruction prompts rendered into templates

pub mod agent;
pub mod error;
pub mod generator;
pub mod parser;
pub mod processor;
pub mod tokenizer;
pub mod trie;
pub mod types;
pub mod walk;

pub use agent::{AgentPrompt, InstructSettings, Shot, ShotTemplate};
pub use error::{Error, Result};
pub use generator::{CompletionStream, OpenAiConfig, OpenAiGenerator, TokenGenerator};
pub use parser::{parse_directive, Directive, DirectiveKind};
pub use processor::{TemplateProcessor, TemplateStream, UnmatchedScores};
pub use tokenizer::{create_tokenizer, SentencePieceTokenizer, Tokenizer, TokenizerKind};
pub use trie::Trie;
pub use types::{
    DirectiveArgs, LogitBias, ParamValue, ResultMap, Token, TokenScores, Variable, Variables, SELECT_BIAS,
};
pub use walk::{create_walk, ContextualWalk, IsolatedWalk, WalkKind, WalkStrategy};

#[cfg(feature = "tiktoken")]
pub use tokenizer::GptTokenizer;
#[cfg(feature = "hf")]
pub use tokenizer::LlamaTokenizer;

// Re-exported so callers can cancel runs without naming tokio-util.
pub use tokio_util::sync::CancellationToken;
