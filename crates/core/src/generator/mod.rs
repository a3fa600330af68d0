//! Model backends.
//!
//! A [`TokenGenerator`] answers the two questions the processor asks a model:
//! "continue this prompt" (streamed) and "score the next token under this
//! logit bias" (one step). [`OpenAiGenerator`] speaks the OpenAI-compatible
//! text completion API.

mod openai;

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::types::{DirectiveArgs, LogitBias, TokenScores};
use crate::Result;

pub use openai::{OpenAiConfig, OpenAiGenerator};

/// Ever-longer completion strings for one GEN directive. The stream ends when
/// the backend reaches a stop condition; dropping the receiver stops it early.
pub type CompletionStream = mpsc::Receiver<Result<String>>;

pub trait TokenGenerator: Send + Sync {
    /// Start a streamed completion of `prompt`. `args` are forwarded to the
    /// backend verbatim.
    fn generate_string(
        &self,
        prompt: &str,
        args: &DirectiveArgs,
    ) -> impl Future<Output = Result<CompletionStream>> + Send;

    /// Score candidate next tokens of `prompt` under `bias`. Keys are token
    /// text; the set may contain tokens outside `bias` or miss some of them.
    fn generate_token_logprobs(
        &self,
        prompt: &str,
        bias: &LogitBias,
    ) -> impl Future<Output = Result<TokenScores>> + Send;
}

impl<G: TokenGenerator> TokenGenerator for Arc<G> {
    fn generate_string(
        &self,
        prompt: &str,
        args: &DirectiveArgs,
    ) -> impl Future<Output = Result<CompletionStream>> + Send {
        (**self).generate_string(prompt, args)
    }

    fn generate_token_logprobs(
        &self,
        prompt: &str,
        bias: &LogitBias,
    ) -> impl Future<Output = Result<TokenScores>> + Send {
        (**self).generate_token_logprobs(prompt, bias)
    }
}
