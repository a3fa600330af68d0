//! Integration tests for the template processor against the scripted
//! generator and the character tokenizer.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use guidance_core::{
    CancellationToken, Error, IsolatedWalk, ParamValue, ResultMap, TokenScores, UnmatchedScores, Variable,
    Variables, SELECT_BIAS,
};
use helpers::{
    processor, processor_with, token, vars, weather_options, Call, GreedyTokenizer, ScriptedGenerator, EOS_ID,
};

fn result(pairs: &[(&str, &str)]) -> ResultMap {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

// ---------------------------------------------------------------------------
// GEN
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_gen_call_shape() {
    let (p, generator) = processor(ScriptedGenerator::new().with_completion(&["sun", "sunny"]));

    let out = p.process_template("Weather is {{GEN w stop=.}}", &Variables::new()).await.unwrap();

    assert_eq!(out, result(&[("w", "sunny")]));
    let calls = generator.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0],
        Call::Generate {
            prompt: "Weather is ".to_string(),
            args: [("stop".to_string(), ParamValue::from("."))].into_iter().collect(),
        }
    );
}

#[tokio::test]
async fn test_gen_forwards_typed_arguments() {
    let (p, generator) = processor(ScriptedGenerator::new().with_completion(&["ok"]));

    p.process_template(r#"Q: {{GEN a max_tokens=5 stop=["\n", "User:"] temperature=0.5}}"#, &Variables::new())
        .await
        .unwrap();

    let Call::Generate { args, .. } = &generator.calls()[0] else {
        panic!("expected a GEN call");
    };
    assert_eq!(args["max_tokens"], ParamValue::from(5));
    assert_eq!(args["stop"], ParamValue::from(vec!["\n", "User:"]));
    assert_eq!(args["temperature"].to_string(), "0.5");
}

#[tokio::test]
async fn test_sequential_directives_splice_results() {
    let generator = ScriptedGenerator::new().with_completion(&["x"]).with_completion(&["y", "yz"]);
    let (p, generator) = processor(generator);

    let out = p.process_template("A: {{GEN a}} then B: {{GEN b}} end", &Variables::new()).await.unwrap();

    assert_eq!(out, result(&[("a", "x"), ("b", "yz")]));
    assert_eq!(generator.generate_prompts(), vec!["A: ".to_string(), "A: x then B: ".to_string()]);
}

#[tokio::test]
async fn test_empty_gen_stream_records_empty_value() {
    let (p, _) = processor(ScriptedGenerator::new());
    let out = p.process_template("{{GEN nothing}}", &Variables::new()).await.unwrap();
    assert_eq!(out, result(&[("nothing", "")]));
}

#[tokio::test]
async fn test_plain_substitution_before_directives() {
    let (p, generator) = processor(ScriptedGenerator::new().with_completion(&["hi"]));
    let variables = vars(&[("user", Variable::from("Hina")), ("tags", Variable::from(vec!["a", "b"]))]);

    p.process_template("{{user}} [{{tags}}] {{unbound}}: {{GEN reply}}", &variables).await.unwrap();

    assert_eq!(generator.generate_prompts(), vec!["Hina [a,b] {{unbound}}: ".to_string()]);
}

#[tokio::test]
async fn test_template_without_directives() {
    let (p, generator) = processor(ScriptedGenerator::new());
    let out = p.process_template("just text", &Variables::new()).await.unwrap();
    assert!(out.is_empty());
    assert!(generator.calls().is_empty());
}

// ---------------------------------------------------------------------------
// SEL
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_single_option_needs_no_logprobs() {
    let (p, generator) = processor(ScriptedGenerator::new());
    let variables = vars(&[("only", Variable::from(vec!["sunny"]))]);

    let out = p.process_template("Weather is {{SEL w options=only}}", &variables).await.unwrap();

    assert_eq!(out, result(&[("w", "sunny")]));
    assert_eq!(generator.logprob_calls(), 0);
}

#[tokio::test]
async fn test_branching_follows_backend_preference() {
    let (p, generator) = processor(ScriptedGenerator::new().preferring("Weather is ", "rainy"));

    let out = p.process_template("Weather is {{SEL w options=options}}", &weather_options()).await.unwrap();

    assert_eq!(out, result(&[("w", "rainy")]));
    // All three options diverge at their first character
    let calls = generator.calls();
    assert_eq!(calls.len(), 1);
    let Call::Logprobs { prompt, bias } = &calls[0] else {
        panic!("expected a logprob query");
    };
    assert_eq!(prompt, "Weather is ");
    let expected: Vec<_> = ['c', 'r', 's'].into_iter().map(|c| (token(c), SELECT_BIAS)).collect();
    assert_eq!(bias.clone().into_iter().collect::<Vec<_>>(), expected);
}

#[tokio::test]
async fn test_shared_prefixes_query_each_branch_point() {
    let (p, generator) = processor(ScriptedGenerator::new().preferring("Pet: ", "car"));
    let variables = vars(&[("pets", Variable::from(vec!["cat", "car", "dog"]))]);

    let out = p.process_template("Pet: {{SEL pet options=pets}}", &variables).await.unwrap();

    assert_eq!(out, result(&[("pet", "car")]));
    let prompts: Vec<_> = generator
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::Logprobs { prompt, .. } => Some(prompt),
            Call::Generate { .. } => None,
        })
        .collect();
    assert_eq!(prompts, vec!["Pet: ".to_string(), "Pet: ca".to_string()]);
}

#[tokio::test]
async fn test_option_that_prefixes_another() {
    let (p, generator) = processor(ScriptedGenerator::new().preferring("Answer: ", "no"));
    let variables = vars(&[("answers", Variable::from(vec!["nope", "no"]))]);

    let out = p.process_template("Answer: {{SEL a options=answers}}", &variables).await.unwrap();

    assert_eq!(out, result(&[("a", "no")]));
    let Some(Call::Logprobs { bias, .. }) = generator.calls().pop() else {
        panic!("expected a logprob query");
    };
    assert!(bias.contains_key(&EOS_ID));
    assert!(bias.contains_key(&token('p')));
}

#[tokio::test]
async fn test_selection_feeds_following_gen() {
    let generator = ScriptedGenerator::new().preferring("Weather is ", "cloudy").with_completion(&["rain"]);
    let (p, generator) = processor(generator);

    let out = p
        .process_template("Weather is {{SEL w options=options}}. Tomorrow: {{GEN t}}", &weather_options())
        .await
        .unwrap();

    assert_eq!(out, result(&[("t", "rain"), ("w", "cloudy")]));
    assert_eq!(generator.generate_prompts(), vec!["Weather is cloudy. Tomorrow: ".to_string()]);
}

#[tokio::test]
async fn test_isolated_walk_resolves_same_option() {
    let generator = Arc::new(ScriptedGenerator::new().preferring("Weather is ", "sunny"));
    let p = guidance_core::TemplateProcessor::new(Arc::new(helpers::CharTokenizer), Arc::clone(&generator))
        .with_walk(Arc::new(IsolatedWalk::default()));

    let out = p.process_template("Weather is {{SEL w options=options}}", &weather_options()).await.unwrap();

    assert_eq!(out, result(&[("w", "sunny")]));
    assert_eq!(generator.logprob_calls(), 1);
}

#[tokio::test]
async fn test_unmatched_scores_fall_back_to_first_option() {
    let generator =
        ScriptedGenerator::new().with_scorer(|_, _| Ok(TokenScores::from([("zzz".to_string(), -0.1)])));
    let (p, _) = processor(generator);

    let out = p.process_template("Weather is {{SEL w options=options}}", &weather_options()).await.unwrap();

    // First child in token order under the branch point
    assert_eq!(out, result(&[("w", "cloudy")]));
}

#[tokio::test]
async fn test_unmatched_scores_rejected_when_strict() {
    let generator =
        ScriptedGenerator::new().with_scorer(|_, _| Ok(TokenScores::from([("zzz".to_string(), -0.1)])));
    let (p, _) = processor(generator);
    let p = p.with_unmatched(UnmatchedScores::Reject);

    let err = p.process_template("Weather is {{SEL w options=options}}", &weather_options()).await.unwrap_err();
    assert!(matches!(err, Error::NoMatchingCandidate(name) if name == "w"));
}

#[tokio::test]
async fn test_empty_scores_degrade_to_first_option() {
    let (p, _) = processor(ScriptedGenerator::new());
    let out = p.process_template("Weather is {{SEL w options=options}}", &weather_options()).await.unwrap();
    assert_eq!(out, result(&[("w", "cloudy")]));
}

#[tokio::test]
async fn test_extra_keys_are_ignored() {
    let generator = ScriptedGenerator::new().with_scorer(|_, _| {
        Ok(TokenScores::from([("x".to_string(), -0.01), ("s".to_string(), -0.5), ("r".to_string(), -2.0)]))
    });
    let (p, _) = processor(generator);

    let out = p.process_template("Weather is {{SEL w options=options}}", &weather_options()).await.unwrap();
    assert_eq!(out, result(&[("w", "sunny")]));
}

// ---------------------------------------------------------------------------
// SEL with context-sensitive tokenization
// ---------------------------------------------------------------------------

/// `"bc"` is a piece, so appending a fragment that starts with `c` after the
/// branch point `Q: ab` re-encodes as `.. a bc ..` and leaves the stored
/// `.. a b ..` paths.
fn merging_tokenizer() -> Arc<GreedyTokenizer> {
    Arc::new(GreedyTokenizer::new(&["Q", ":", " ", "a", "b", "c", "d", "e", "bc"]))
}

fn merging_options() -> Variables {
    vars(&[("o", Variable::from(vec!["abd", "abe"]))])
}

#[tokio::test]
async fn test_rewritten_prefix_resyncs_on_chosen_child() {
    let tokenizer = merging_tokenizer();
    let generator = ScriptedGenerator::new()
        .with_scorer(|_, _| Ok(TokenScores::from([("ce".to_string(), -0.1), ("d".to_string(), -1.0)])));
    let (p, generator) = processor_with(tokenizer.clone(), generator);

    let out = p.process_template("Q: {{SEL w options=o}}", &merging_options()).await.unwrap();

    assert_eq!(out, result(&[("w", "abe")]));
    let calls = generator.calls();
    assert_eq!(calls.len(), 1);
    match &calls[0] {
        Call::Logprobs { prompt, bias } => {
            assert_eq!(prompt, "Q: ab");
            assert_eq!(bias.keys().copied().collect::<Vec<_>>(), vec![tokenizer.id("d"), tokenizer.id("e")]);
        }
        other => panic!("expected a logprob query, got {other:?}"),
    }
}

#[tokio::test]
async fn test_fallback_key_off_the_trie_takes_first_option_under_branch() {
    let generator =
        ScriptedGenerator::new().with_scorer(|_, _| Ok(TokenScores::from([("c".to_string(), -0.1)])));
    let (p, generator) = processor_with(merging_tokenizer(), generator);

    let out = p.process_template("Q: {{SEL w options=o}}", &merging_options()).await.unwrap();

    assert_eq!(out, result(&[("w", "abd")]));
    assert_eq!(generator.logprob_calls(), 1);
}

#[tokio::test]
async fn test_fallback_key_off_the_trie_rejected_when_strict() {
    let generator =
        ScriptedGenerator::new().with_scorer(|_, _| Ok(TokenScores::from([("c".to_string(), -0.1)])));
    let (p, _) = processor_with(merging_tokenizer(), generator);
    let p = p.with_unmatched(UnmatchedScores::Reject);

    let err = p.process_template("Q: {{SEL w options=o}}", &merging_options()).await.unwrap_err();
    assert!(matches!(err, Error::NoMatchingCandidate(_)));
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_missing_options_variable() {
    let (p, _) = processor(ScriptedGenerator::new());
    let err = p.process_template("{{SEL w options=choices}}", &Variables::new()).await.unwrap_err();
    assert_eq!(err.to_string(), "choices variable not found");
}

#[tokio::test]
async fn test_malformed_directives() {
    let (p, _) = processor(ScriptedGenerator::new());

    let err = p.process_template("x {{GEN a", &Variables::new()).await.unwrap_err();
    assert!(matches!(err, Error::Template(_)));

    let err = p.process_template("x {{GEN }}", &Variables::new()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidDirective(_)));
}

#[tokio::test]
async fn test_backend_error_propagates() {
    let generator = ScriptedGenerator::new()
        .with_completion(&["ok"])
        .with_scorer(|_, _| Err(Error::Backend { status: 503, body: "busy".to_string() }));
    let (p, _) = processor(generator);

    let err = p
        .process_template("{{GEN first}} Weather is {{SEL w options=options}}", &weather_options())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Backend { status: 503, .. }));
}

// ---------------------------------------------------------------------------
// Streaming and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stream_yields_growing_snapshots() {
    let generator = ScriptedGenerator::new().with_completion(&["a", "ab"]).preferring("ab is ", "rainy");
    let (p, _) = processor(generator);
    let p = Arc::new(p);

    let mut stream = p.process_template_stream("{{GEN g}} is {{SEL w options=options}}", &weather_options());
    let mut snapshots = Vec::new();
    while let Some(item) = stream.next().await {
        snapshots.push(item.unwrap());
    }

    assert_eq!(
        snapshots,
        vec![result(&[("g", "a")]), result(&[("g", "ab")]), result(&[("g", "ab"), ("w", "rainy")])]
    );
}

#[tokio::test]
async fn test_stream_ends_with_error_after_partial_results() {
    let generator = ScriptedGenerator::new().with_completion(&["done"]);
    let (p, _) = processor(generator);
    let p = Arc::new(p);

    let mut stream = p.process_template_stream("{{GEN g}} {{SEL w options=nowhere}}", &Variables::new());
    assert_eq!(stream.next().await.unwrap().unwrap(), result(&[("g", "done")]));
    assert!(matches!(stream.next().await, Some(Err(Error::MissingVariable(_)))));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_collect_last_returns_final_map() {
    let (p, _) = processor(ScriptedGenerator::new().with_completion(&["1", "12"]));
    let p = Arc::new(p);
    let last = p.process_template_stream("{{GEN n}}", &Variables::new()).collect_last().await.unwrap();
    assert_eq!(last, result(&[("n", "12")]));
}

#[tokio::test]
async fn test_cancel_interrupts_pending_gen() {
    let (p, _) = processor(ScriptedGenerator::new().stalling());
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        p.process_template_with_cancel("{{GEN forever}}", &Variables::new(), &cancel),
    )
    .await
    .expect("cancellation should stop the run");
    assert!(matches!(outcome, Err(Error::Cancelled)));
}

#[tokio::test]
async fn test_cancelled_stream_closes() {
    let (p, _) = processor(ScriptedGenerator::new().stalling());
    let p = Arc::new(p);

    let stream = p.process_template_stream("{{GEN forever}}", &Variables::new());
    stream.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(5), stream.collect_last())
        .await
        .expect("stream should close after cancel");
    assert!(matches!(outcome, Err(Error::Cancelled)));
}
