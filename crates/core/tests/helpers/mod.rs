//! Test harness for processor integration tests.
//!
//! `CharTokenizer` maps every character to its code point so token paths are
//! easy to reason about; `ScriptedGenerator` replays canned completions,
//! scores branch points with a test-supplied closure and records every call.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use guidance_core::{
    CompletionStream, DirectiveArgs, Error, LogitBias, Result, TemplateProcessor, Token, TokenGenerator,
    TokenScores, Tokenizer, Variable, Variables,
};
use tokio::sync::mpsc;

pub const EOS: &str = "</s>";
/// First id past the Unicode scalar range.
pub const EOS_ID: Token = 0x11_0000;

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

pub struct CharTokenizer;

impl Tokenizer for CharTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<Token>> {
        let (body, eos) = match text.strip_suffix(EOS) {
            Some(body) => (body, true),
            None => (text, false),
        };
        let mut tokens: Vec<Token> = body.chars().map(Token::from).collect();
        if eos {
            tokens.push(EOS_ID);
        }
        Ok(tokens)
    }

    fn decode(&self, tokens: &[Token]) -> Result<String> {
        tokens
            .iter()
            .map(|&t| {
                if t == EOS_ID {
                    Ok(EOS.to_string())
                } else {
                    char::from_u32(t).map(String::from).ok_or_else(|| Error::Tokenizer(format!("bad id {t}")))
                }
            })
            .collect()
    }

    fn eos(&self) -> &str {
        EOS
    }

    fn name(&self) -> &str {
        "char"
    }
}

pub fn token(c: char) -> Token {
    Token::from(c)
}

/// Greedy longest-match over a fixed vocabulary; ids are vocabulary indices.
///
/// With a multi-character piece such as `"bc"`, encoding `"ab"` gives
/// `[a, b]` while `"abcd"` gives `[a, bc, d]`, so extending the text can
/// rewrite tokens before the extension point.
pub struct GreedyTokenizer {
    vocab: Vec<String>,
}

impl GreedyTokenizer {
    pub fn new(vocab: &[&str]) -> Self {
        Self { vocab: vocab.iter().map(|p| p.to_string()).collect() }
    }

    pub fn id(&self, piece: &str) -> Token {
        self.vocab.iter().position(|p| p == piece).expect("piece in vocabulary") as Token
    }

    fn eos_id(&self) -> Token {
        self.vocab.len() as Token
    }
}

impl Tokenizer for GreedyTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<Token>> {
        let (mut rest, eos) = match text.strip_suffix(EOS) {
            Some(body) => (body, true),
            None => (text, false),
        };
        let mut tokens = Vec::new();
        while !rest.is_empty() {
            let (id, piece) = self
                .vocab
                .iter()
                .enumerate()
                .filter(|(_, piece)| rest.starts_with(piece.as_str()))
                .max_by_key(|(_, piece)| piece.len())
                .ok_or_else(|| Error::Tokenizer(format!("no piece for {rest:?}")))?;
            tokens.push(id as Token);
            rest = &rest[piece.len()..];
        }
        if eos {
            tokens.push(self.eos_id());
        }
        Ok(tokens)
    }

    fn decode(&self, tokens: &[Token]) -> Result<String> {
        tokens
            .iter()
            .map(|&t| match self.vocab.get(t as usize) {
                Some(piece) => Ok(piece.clone()),
                None if t == self.eos_id() => Ok(EOS.to_string()),
                None => Err(Error::Tokenizer(format!("bad id {t}"))),
            })
            .collect()
    }

    fn eos(&self) -> &str {
        EOS
    }

    fn name(&self) -> &str {
        "greedy"
    }
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Generate { prompt: String, args: DirectiveArgs },
    Logprobs { prompt: String, bias: LogitBias },
}

type Scorer = Box<dyn Fn(&str, &LogitBias) -> Result<TokenScores> + Send + Sync>;

pub struct ScriptedGenerator {
    completions: Mutex<VecDeque<Vec<String>>>,
    scorer: Scorer,
    calls: Mutex<Vec<Call>>,
    /// Senders of streams that never finish, kept alive on purpose.
    stalled: Mutex<Vec<mpsc::Sender<Result<String>>>>,
    stall: bool,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            completions: Mutex::new(VecDeque::new()),
            scorer: Box::new(|_, _| Ok(TokenScores::new())),
            calls: Mutex::new(Vec::new()),
            stalled: Mutex::new(Vec::new()),
            stall: false,
        }
    }

    /// Queue the cumulative chunks returned by the next GEN call.
    pub fn with_completion(self, chunks: &[&str]) -> Self {
        self.completions.lock().unwrap().push_back(chunks.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn with_scorer(
        mut self,
        scorer: impl Fn(&str, &LogitBias) -> Result<TokenScores> + Send + Sync + 'static,
    ) -> Self {
        self.scorer = Box::new(scorer);
        self
    }

    /// Score branch points so the walk spells out `target` after `prompt`.
    pub fn preferring(self, prompt: &'static str, target: &'static str) -> Self {
        self.with_scorer(move |working, bias| {
            let done = working.strip_prefix(prompt).expect("working prompt extends the SEL prompt");
            let remaining = format!("{target}{EOS}")[done.len()..].to_string();
            let wanted = if remaining.starts_with(EOS) {
                EOS.to_string()
            } else {
                remaining.chars().next().map(String::from).unwrap_or_default()
            };
            let mut scores: TokenScores = bias
                .keys()
                .map(|&t| {
                    let text = if t == EOS_ID { EOS.to_string() } else { char::from_u32(t).unwrap().to_string() };
                    (text, -5.0)
                })
                .collect();
            scores.insert(wanted, -0.1);
            Ok(scores)
        })
    }

    /// GEN streams never produce a chunk and never end.
    pub fn stalling(mut self) -> Self {
        self.stall = true;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn logprob_calls(&self) -> usize {
        self.calls().iter().filter(|c| matches!(c, Call::Logprobs { .. })).count()
    }

    pub fn generate_prompts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Generate { prompt, .. } => Some(prompt),
                Call::Logprobs { .. } => None,
            })
            .collect()
    }
}

impl TokenGenerator for ScriptedGenerator {
    async fn generate_string(&self, prompt: &str, args: &DirectiveArgs) -> Result<CompletionStream> {
        self.calls.lock().unwrap().push(Call::Generate { prompt: prompt.to_string(), args: args.clone() });

        let chunks = self.completions.lock().unwrap().pop_front().unwrap_or_default();
        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        if self.stall {
            self.stalled.lock().unwrap().push(tx);
            return Ok(rx);
        }
        for chunk in chunks {
            tx.try_send(Ok(chunk)).expect("channel sized for every chunk");
        }
        Ok(rx)
    }

    async fn generate_token_logprobs(&self, prompt: &str, bias: &LogitBias) -> Result<TokenScores> {
        self.calls.lock().unwrap().push(Call::Logprobs { prompt: prompt.to_string(), bias: bias.clone() });
        (self.scorer)(prompt, bias)
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn processor(generator: ScriptedGenerator) -> (TemplateProcessor<Arc<ScriptedGenerator>>, Arc<ScriptedGenerator>) {
    let generator = Arc::new(generator);
    let processor = TemplateProcessor::new(Arc::new(CharTokenizer), Arc::clone(&generator));
    (processor, generator)
}

pub fn processor_with(
    tokenizer: Arc<dyn Tokenizer>,
    generator: ScriptedGenerator,
) -> (TemplateProcessor<Arc<ScriptedGenerator>>, Arc<ScriptedGenerator>) {
    let generator = Arc::new(generator);
    let processor = TemplateProcessor::new(tokenizer, Arc::clone(&generator));
    (processor, generator)
}

pub fn vars(pairs: &[(&str, Variable)]) -> Variables {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

pub fn weather_options() -> Variables {
    vars(&[("options", Variable::from(vec!["sunny", "rainy", "cloudy"]))])
}
