use chrono::NaiveDate;
use std::sync::LazyLock;

use crate::config::PromptConfig;
use crate::llm::PromptMessage;
use crate::types::ChatType;

/// Retrieved context (or map-step extracts) in the document prompt.
pub const SUMMARIES_VAR: &str = "summaries";
/// The user's question in the document and map prompts.
pub const QUESTION_VAR: &str = "question";
/// The user's message in the conversation prompt.
pub const INPUT_VAR: &str = "input";
/// One retrieved chunk in the map prompt.
pub const CONTEXT_VAR: &str = "context";

static VARIABLE_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\{([a-z_]+)\}").expect("template variable regex is valid"));

const DOCUMENT_INSTRUCTIONS: &str = "\
- Your task is to analyze the following document contents and respond to the prompt(s) that follow.
- If the document is empty, respond that you're having trouble processing the document or it may be empty.
- If you don't know the answer to a question, politely decline to answer. Don't try to make up an answer.
- If asked to summarize a document, first determine the most important parts of the document (but don't output these unless requested), then attempt to summarize the document.
- Remember your responses as you provide them to best answer any follow-up prompts.
----------------
document contents: {summaries}
";

const MAP_INSTRUCTIONS: &str = "\
Use the following portion of a long document to see if any of the text is relevant to answer the question.
Return any relevant text verbatim.
______________________
{context}";

/// Knowledge-cutoff notice for the three known deployments. Exact match only;
/// any other model gets an empty clause.
pub fn knowledge_cutoff_clause(model: &str) -> &'static str {
    match model {
        "gpt-35-turbo" => "- Your knowledge cutoff is September 2021.\n- Your model is GPT-3.5.\n",
        "gpt-4o" => "- Your knowledge cutoff is October 2023.\n- Your model is GPT-4o.\n",
        "gpt-4-32k" => "- Your knowledge cutoff is September 2021.\n- Your model is GPT-4-32K.\n",
        _ => "",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    System(String),
    /// Stored conversation turns go here.
    History,
    Human(String),
}

/// Ordered chat prompt with `{variable}` slots.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatTemplate {
    parts: Vec<TemplatePart>,
}

impl ChatTemplate {
    pub fn new(parts: Vec<TemplatePart>) -> Self {
        Self { parts }
    }

    pub fn has_history(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, TemplatePart::History))
    }

    pub fn has_variable(&self, name: &str) -> bool {
        let slot = format!("{{{}}}", name);
        self.parts.iter().any(|p| match p {
            TemplatePart::System(t) | TemplatePart::Human(t) => t.contains(&slot),
            TemplatePart::History => false,
        })
    }

    /// Fill variables and splice in `history`. Substituted values are not
    /// scanned again, so document text containing `{...}` stays literal.
    pub fn render(&self, vars: &[(&str, &str)], history: &[PromptMessage]) -> Vec<PromptMessage> {
        let mut messages = Vec::with_capacity(self.parts.len() + history.len());
        for part in &self.parts {
            match part {
                TemplatePart::System(t) => messages.push(PromptMessage::system(fill(t, vars))),
                TemplatePart::Human(t) => messages.push(PromptMessage::user(fill(t, vars))),
                TemplatePart::History => messages.extend_from_slice(history),
            }
        }
        messages
    }
}

fn fill(template: &str, vars: &[(&str, &str)]) -> String {
    VARIABLE_RE
        .replace_all(template, |caps: &regex::Captures| {
            vars.iter()
                .find(|(name, _)| *name == &caps[1])
                .map(|(_, value)| value.to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Builds system instructions and the per-mode chat templates.
#[derive(Debug, Clone)]
pub struct PromptAssembler {
    assistant_name: String,
    organization: String,
}

impl PromptAssembler {
    pub fn new(config: &PromptConfig) -> Self {
        Self {
            assistant_name: config.assistant_name.clone(),
            organization: config.organization.clone(),
        }
    }

    fn persona(&self, today: NaiveDate) -> String {
        format!(
            "- You are {}; a helpful AI assistant for {}.
- Provide clear and concise responses, and respond with polite and professional answers.
- Avoid unnecessary explanation of your answers as well as tangential details unless requested.
- Supply additional explanation or context if prompts indicate misconception or lack of understanding.
- Answer questions truthfully and accurately unless explicitly requested otherwise.
- If unsure about a response, indicate your uncertainty or lack of information.
- If you need more information to provide an accurate response, ask for clarification.
- The current date is {}
",
            self.assistant_name,
            self.organization,
            today.format("%Y-%m-%d")
        )
    }

    /// Persona and cutoff for every mode; document mode adds the grounding
    /// instructions and the `{summaries}` slot.
    pub fn build_system_prompt(&self, model: &str, mode: ChatType, today: NaiveDate) -> String {
        let mut prompt = self.persona(today);
        prompt.push_str(knowledge_cutoff_clause(model));
        if mode == ChatType::Document {
            prompt.push('\n');
            prompt.push_str(DOCUMENT_INSTRUCTIONS);
        }
        prompt
    }

    /// system, history, `{input}`
    pub fn conversation_template(&self, model: &str, today: NaiveDate) -> ChatTemplate {
        ChatTemplate::new(vec![
            TemplatePart::System(self.build_system_prompt(model, ChatType::Simple, today)),
            TemplatePart::History,
            TemplatePart::Human(format!("{{{}}}", INPUT_VAR)),
        ])
    }

    /// system with `{summaries}`, then `{question}`
    pub fn combine_template(&self, model: &str, today: NaiveDate) -> ChatTemplate {
        ChatTemplate::new(vec![
            TemplatePart::System(self.build_system_prompt(model, ChatType::Document, today)),
            TemplatePart::Human(format!("{{{}}}", QUESTION_VAR)),
        ])
    }

    /// Per-chunk extraction prompt for the map step.
    pub fn map_template(&self) -> ChatTemplate {
        ChatTemplate::new(vec![
            TemplatePart::System(MAP_INSTRUCTIONS.to_string()),
            TemplatePart::Human(format!("{{{}}}", QUESTION_VAR)),
        ])
    }
}
