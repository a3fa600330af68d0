//! Template processor: resolves `{{GEN}}` and `{{SEL}}` directives in
//! document order, feeding each resolved value back into the prompt.
//!
//! GEN streams a free-form completion. SEL builds a fresh [`Trie`] over the
//! token sequences of its options and walks it, asking the backend for
//! logprobs only at branch points.

use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use regex::{Captures, Regex};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::generator::TokenGenerator;
use crate::parser::{parse_directive, Directive, DirectiveKind};
use crate::tokenizer::Tokenizer;
use crate::trie::Trie;
use crate::types::{favoring, ParamValue, ResultMap, Token, TokenScores, Variable, Variables};
use crate::walk::{ContextualWalk, WalkStrategy};
use crate::{Error, Result};

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([^{}\s]+)\}\}").expect("placeholder pattern is valid"));

const DIRECTIVE_OPENERS: [&str; 2] = ["{{GEN", "{{SEL"];
const SNAPSHOT_BUFFER: usize = 16;

/// What a SEL branch step does when no scored key continues into a trie
/// child.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnmatchedScores {
    /// Append the highest-scored key anyway. The walk then continues only if
    /// the new text re-encodes onto a stored path; otherwise the selection
    /// completes with the first option below the last branch point.
    #[default]
    BestOverall,
    /// Fail the directive with [`Error::NoMatchingCandidate`].
    Reject,
}

/// Resolves templates against one tokenizer and one [`TokenGenerator`].
///
/// Directives run in document order; each resolved value is appended to the
/// prompt for the next one. SEL walks use the configured [`WalkStrategy`]
/// (contextual by default) and [`UnmatchedScores`] policy.
pub struct TemplateProcessor<G> {
    tokenizer: Arc<dyn Tokenizer>,
    generator: G,
    walk: Arc<dyn WalkStrategy>,
    unmatched: UnmatchedScores,
}

impl<G: TokenGenerator> TemplateProcessor<G> {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, generator: G) -> Self {
        Self { tokenizer, generator, walk: Arc::new(ContextualWalk), unmatched: UnmatchedScores::default() }
    }

    #[must_use]
    pub fn with_walk(mut self, walk: Arc<dyn WalkStrategy>) -> Self {
        self.walk = walk;
        self
    }

    #[must_use]
    pub fn with_unmatched(mut self, unmatched: UnmatchedScores) -> Self {
        self.unmatched = unmatched;
        self
    }

    pub fn set_tokenizer(&mut self, tokenizer: Arc<dyn Tokenizer>) {
        self.tokenizer = tokenizer;
    }

    pub fn set_generator(&mut self, generator: G) {
        self.generator = generator;
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn walk(&self) -> &Arc<dyn WalkStrategy> {
        &self.walk
    }

    pub fn unmatched(&self) -> UnmatchedScores {
        self.unmatched
    }

    /// Resolve every directive in `template` and return the final result map.
    ///
    /// # Errors
    /// Fails on malformed directives, unresolvable SEL options and any
    /// backend error. No partial result is returned.
    pub async fn process_template(&self, template: &str, variables: &Variables) -> Result<ResultMap> {
        self.process_template_with_cancel(template, variables, &CancellationToken::new()).await
    }

    /// Like [`Self::process_template`], aborting with [`Error::Cancelled`] at
    /// the next backend await once `cancel` fires.
    ///
    /// # Errors
    /// See [`Self::process_template`].
    pub async fn process_template_with_cancel(
        &self,
        template: &str,
        variables: &Variables,
        cancel: &CancellationToken,
    ) -> Result<ResultMap> {
        self.run(template, variables, cancel, &mut Snapshots::default()).await
    }

    /// Resolve `template` on a background task, yielding a snapshot of the
    /// result map after every GEN chunk and every resolved directive.
    ///
    /// Dropping the returned stream cancels the run.
    pub fn process_template_stream(self: &Arc<Self>, template: &str, variables: &Variables) -> TemplateStream
    where
        G: 'static,
    {
        let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);
        let cancel = CancellationToken::new();

        let processor = Arc::clone(self);
        let template = template.to_string();
        let variables = variables.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            let mut snapshots = Snapshots { tx: Some(&tx), sent: None };
            match processor.run(&template, &variables, &token, &mut snapshots).await {
                Ok(_) | Err(Error::Cancelled) => {}
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                }
            }
        });

        TemplateStream { rx, guard: cancel.clone().drop_guard(), cancel }
    }

    // -----------------------------------------------------------------------
    // Directive loop
    // -----------------------------------------------------------------------

    async fn run(
        &self,
        template: &str,
        variables: &Variables,
        cancel: &CancellationToken,
        snapshots: &mut Snapshots<'_>,
    ) -> Result<ResultMap> {
        let start = Instant::now();
        let source = substitute(template, variables);
        let mut prompt = String::with_capacity(source.len());
        let mut results = ResultMap::new();
        let mut cursor = 0;
        let mut resolved = 0usize;

        while let Some(offset) = next_directive(&source[cursor..]) {
            let begin = cursor + offset;
            let end = source[begin..]
                .find("}}")
                .map(|i| begin + i + 2)
                .ok_or_else(|| Error::Template(format!("Unterminated directive at byte {begin}")))?;
            let span = &source[begin..end];
            let directive = parse_directive(span);
            let Some(kind) = directive.kind else {
                return Err(Error::InvalidDirective(span.to_string()));
            };

            prompt.push_str(&source[cursor..begin]);
            let value = match kind {
                DirectiveKind::Gen => self.run_gen(&prompt, &directive, &mut results, cancel, snapshots).await?,
                DirectiveKind::Sel => self.run_sel(&prompt, &directive, variables, cancel).await?,
            };
            prompt.push_str(&value);
            results.insert(directive.name, value);
            snapshots.publish(&results, cancel).await;

            cursor = end;
            resolved += 1;
        }

        snapshots.publish(&results, cancel).await;
        info!(
            directives = resolved,
            prompt_len = prompt.len(),
            time_ms = start.elapsed().as_millis() as u64,
            "Template processed"
        );
        Ok(results)
    }

    async fn run_gen(
        &self,
        prompt: &str,
        directive: &Directive,
        results: &mut ResultMap,
        cancel: &CancellationToken,
        snapshots: &mut Snapshots<'_>,
    ) -> Result<String> {
        debug!(directive = %directive.name, params = directive.params.len(), "GEN");
        let mut stream = cancellable(cancel, self.generator.generate_string(prompt, &directive.params)).await?;

        let mut latest = String::new();
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                next = stream.recv() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            latest = chunk?;
            results.insert(directive.name.clone(), latest.clone());
            snapshots.publish(results, cancel).await;
        }
        Ok(latest)
    }

    // -----------------------------------------------------------------------
    // SEL
    // -----------------------------------------------------------------------

    async fn run_sel(
        &self,
        prompt: &str,
        directive: &Directive,
        variables: &Variables,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let name = directive.name.as_str();
        let options = resolve_options(directive, variables)?;

        let tokenizer = self.tokenizer.as_ref();
        let walk = self.walk.as_ref();
        let prompt = tokenizer.decode(&tokenizer.encode(prompt)?)?;

        let mut trie = Trie::new();
        for option in options {
            trie.add_prefix(&walk.option_tokens(tokenizer, &prompt, option)?);
        }
        debug!(directive = name, options = options.len(), walk = walk.name(), "SEL");

        let mut working = prompt.clone();
        // Trie position reached by the previous step and the child it chose
        let mut position: Option<Vec<Token>> = None;
        let mut chosen: Option<Token> = None;
        let mut queries = 0usize;

        loop {
            let walked = trie.next_prefix(&walk.walk_tokens(tokenizer, &prompt, &working)?);
            let current = match &position {
                None if walked.is_empty() => trie.next_prefix(&[]),
                None => walked,
                Some(last) if walked.len() > last.len() && walked.starts_with(last) => walked,
                Some(last) => match chosen {
                    Some(child) => {
                        let mut path = last.clone();
                        path.push(child);
                        trie.next_prefix(&path)
                    }
                    None => return self.finish_sel(name, &prompt, &trie.word(last), queries),
                },
            };

            let children = trie.next_children(&current);
            if children.len() < 2 {
                return self.finish_sel(name, &prompt, &trie.word(&current), queries);
            }

            working = walk.path_text(tokenizer, &prompt, &current)?;
            let scores =
                cancellable(cancel, self.generator.generate_token_logprobs(&working, &favoring(&children))).await?;
            queries += 1;

            match self.pick(&prompt, &working, &current, &children, &scores)? {
                Some((key, child)) => {
                    debug!(directive = name, key = %key, children = children.len(), "SEL branch");
                    working.push_str(&key);
                    chosen = Some(child);
                }
                None => match self.unmatched {
                    UnmatchedScores::Reject => return Err(Error::NoMatchingCandidate(name.to_string())),
                    UnmatchedScores::BestOverall => match best_overall(&scores) {
                        Some(key) => {
                            warn!(directive = name, key = %key, "No scored token continues an option, using best overall");
                            working.push_str(key);
                            chosen = None;
                        }
                        None => return self.finish_sel(name, &prompt, &trie.word(&current), queries),
                    },
                },
            }
            position = Some(current);
        }
    }

    /// Highest-scored key whose first new token is one of `children`.
    fn pick(
        &self,
        prompt: &str,
        working: &str,
        current: &[Token],
        children: &[Token],
        scores: &TokenScores,
    ) -> Result<Option<(String, Token)>> {
        let mut best: Option<(&str, f64, Token)> = None;
        for (key, &score) in scores {
            if best.is_some_and(|(_, top, _)| score <= top) {
                continue;
            }
            let tokens = self.walk.walk_tokens(self.tokenizer.as_ref(), prompt, &format!("{working}{key}"))?;
            if let Some(&next) = tokens.get(current.len()) {
                if children.contains(&next) {
                    best = Some((key.as_str(), score, next));
                }
            }
        }
        Ok(best.map(|(key, _, child)| (key.to_string(), child)))
    }

    fn finish_sel(&self, name: &str, prompt: &str, word: &[Token], queries: usize) -> Result<String> {
        let value = self.walk.completion(self.tokenizer.as_ref(), prompt, word)?;
        debug!(directive = name, queries, value = %value, "SEL resolved");
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Snapshots of a running template. Dropping the stream cancels the run.
pub struct TemplateStream {
    rx: mpsc::Receiver<Result<ResultMap>>,
    guard: DropGuard,
    cancel: CancellationToken,
}

impl TemplateStream {
    /// Next snapshot, or `None` once the run has finished. An `Err` item is
    /// always the last one.
    pub async fn next(&mut self) -> Option<Result<ResultMap>> {
        self.rx.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Split into the raw receiver and the guard that cancels the run when
    /// dropped.
    pub fn into_parts(self) -> (mpsc::Receiver<Result<ResultMap>>, DropGuard) {
        (self.rx, self.guard)
    }

    /// Drain the stream and return the last snapshot.
    ///
    /// # Errors
    /// Returns the run's error, or [`Error::Cancelled`] if it stopped without
    /// producing a snapshot.
    pub async fn collect_last(mut self) -> Result<ResultMap> {
        let mut last = None;
        while let Some(item) = self.next().await {
            last = Some(item?);
        }
        last.ok_or(Error::Cancelled)
    }
}

/// Publishes result snapshots to a stream consumer, skipping repeats.
#[derive(Default)]
struct Snapshots<'a> {
    tx: Option<&'a mpsc::Sender<Result<ResultMap>>>,
    sent: Option<ResultMap>,
}

impl Snapshots<'_> {
    async fn publish(&mut self, results: &ResultMap, cancel: &CancellationToken) {
        let Some(tx) = self.tx else {
            return;
        };
        if self.sent.as_ref() == Some(results) {
            return;
        }
        if tx.send(Ok(results.clone())).await.is_err() {
            // Consumer went away; stop at the next backend await.
            cancel.cancel();
        }
        self.sent = Some(results.clone());
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn cancellable<T>(cancel: &CancellationToken, future: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        result = future => result,
    }
}

/// Replace `{{name}}` for every bound name in one pass; unbound placeholders
/// are left untouched.
fn substitute(template: &str, variables: &Variables) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &Captures| match variables.get(&caps[1]) {
            Some(value) => value.substitution(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Byte offset of the earliest `{{GEN` or `{{SEL`.
fn next_directive(text: &str) -> Option<usize> {
    DIRECTIVE_OPENERS.iter().filter_map(|opener| text.find(opener)).min()
}

fn resolve_options<'v>(directive: &Directive, variables: &'v Variables) -> Result<&'v [String]> {
    let reference = directive
        .params
        .get("options")
        .and_then(ParamValue::as_str)
        .ok_or_else(|| Error::InvalidDirective(format!("SEL {} requires options=<variable>", directive.name)))?;
    match variables.get(reference) {
        Some(Variable::List(items)) if items.is_empty() => Err(Error::NoOptions(directive.name.clone())),
        Some(Variable::List(items)) => Ok(items),
        Some(Variable::Text(_)) => Err(Error::NotAList(reference.to_string())),
        None => Err(Error::MissingVariable(reference.to_string())),
    }
}

fn best_overall(scores: &TokenScores) -> Option<&str> {
    let mut best: Option<(&str, f64)> = None;
    for (key, &score) in scores {
        if best.map_or(true, |(_, top)| score > top) {
            best = Some((key.as_str(), score));
        }
    }
    best.map(|(key, _)| key)
}
