//! Few-shot instruction prompts.
//!
//! An [`AgentPrompt`] renders a system preamble, a task description and
//! instruction, worked examples ("shots") and finally the caller's input,
//! ending on the output template with its `{{GEN ..}}` / `{{SEL ..}}`
//! directives left in place for [`TemplateProcessor`](crate::TemplateProcessor)
//! to resolve.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

/// A GEN or SEL span; group 1 is the directive name.
static OUTPUT_DIRECTIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{(?:GEN|SEL)\s+(\w+)[^}]*\}\}").expect("output directive pattern is valid"));

/// Section headers wrapped around every block of the prompt. Missing fields
/// keep their Alpaca-style defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstructSettings {
    pub system: String,
    pub instruction: String,
    pub input: String,
    pub output: String,
}

impl Default for InstructSettings {
    fn default() -> Self {
        Self {
            system: String::new(),
            instruction: "\n### Instruction:\n".to_string(),
            input: "\n### Input:\n".to_string(),
            output: "\n### Response:\n".to_string(),
        }
    }
}

/// Input and output halves shared by every shot and by the final query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShotTemplate {
    pub input: String,
    pub output: String,
}

/// One worked example.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shot {
    /// Values for `{{name}}` placeholders in the input template.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    /// Values for `{{name}}` placeholders and for the GEN/SEL directives
    /// named `name` in the output template.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPrompt {
    pub instruction: String,
    pub description: String,
    #[serde(alias = "shotTemplate")]
    pub shot_template: ShotTemplate,
    #[serde(default)]
    pub shots: Vec<Shot>,
    #[serde(default, alias = "instructSettings")]
    pub instruct_settings: InstructSettings,
}

impl AgentPrompt {
    /// Render the prompt for `inputs`.
    ///
    /// Each shot appends its input and output sections and then fills them
    /// in: `{{key}}` placeholders with the shot's values, and every GEN or
    /// SEL directive whose name is an output key with that output. The final
    /// section is filled from `inputs` only, so its output directives stay
    /// for the processor. Substitution applies to the whole prompt built so
    /// far, and a value is inserted literally.
    pub fn generate_prompt(&self, inputs: &BTreeMap<String, String>) -> String {
        let settings = &self.instruct_settings;
        let mut prompt =
            format!("{}{}{}{}", settings.system, self.description, settings.instruction, self.instruction);

        for shot in &self.shots {
            prompt.push_str(&settings.input);
            prompt.push_str(&self.shot_template.input);
            prompt = fill_placeholders(&prompt, &shot.inputs);

            prompt.push_str(&settings.output);
            prompt.push_str(&self.shot_template.output);
            prompt = fill_placeholders(&prompt, &shot.outputs);
            prompt = fill_directives(&prompt, &shot.outputs);
        }

        prompt.push_str(&settings.input);
        prompt.push_str(&self.shot_template.input);
        prompt = fill_placeholders(&prompt, inputs);
        prompt.push_str(&settings.output);
        prompt.push_str(&self.shot_template.output);
        prompt
    }
}

fn fill_placeholders(text: &str, values: &BTreeMap<String, String>) -> String {
    values.iter().fold(text.to_string(), |text, (key, value)| text.replace(&format!("{{{{{key}}}}}"), value))
}

fn fill_directives(text: &str, values: &BTreeMap<String, String>) -> String {
    OUTPUT_DIRECTIVE_RE
        .replace_all(text, |caps: &Captures| match values.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}
