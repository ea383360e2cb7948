//! Prompt templates and sampling presets.
//!
//! Two styles are supported. `Chat` renders a ChatML conversation and
//! `Instruct` renders `### Input` / `### Response` turns under an instruction
//! block that asks the model to answer in JSON with an optional
//! `function_call`.

use crate::backend::CompletionParams;
use crate::functions::function_definitions;
use crate::message::{Author, Message};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumString,
    AsRefStr,
    Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PromptStyle {
    /// ChatML turns.
    Chat,
    /// Instruction/response turns with JSON function calls.
    #[default]
    Instruct,
}

impl PromptStyle {
    pub fn system_prompt(&self) -> String {
        let definitions = function_definitions();
        match self {
            PromptStyle::Chat => format!(
                "You are a helpful assistant with access to the following functions. \
                 Use them when a users question is related to them -\n{:#}\n",
                definitions
            ),
            PromptStyle::Instruct => format!(
                "###\nInstruction:\n\nYou are a helpful assistant with access to the following functions. \
                 Use them if required - {} \nRespond In JSON {{message: '', function_call: None}}\n",
                definitions
            ),
        }
    }

    /// Text appended after the conversation to cue the model's reply.
    pub fn reply_suffix(&self) -> &'static str {
        match self {
            PromptStyle::Chat => "\n <|im_start|>assistant \n",
            PromptStyle::Instruct => "\n ### Response: \n",
        }
    }

    pub fn render_turn(&self, message: &Message) -> String {
        let text = &message.text;
        match (self, message.author) {
            (PromptStyle::Chat, Author::Assistant) => {
                format!("<|im_start|>assistant\n {} <|im_end|>\n", text)
            }
            (PromptStyle::Chat, Author::User) => {
                format!("<|im_end|>\n<|im_start|>user\n\n {} <|im_end|>\n", text)
            }
            (PromptStyle::Chat, Author::Function) => format!(
                "<|im_end|>\n<|im_start|>user\n\n Function Response: {} <|im_end|>\n",
                text
            ),
            (PromptStyle::Instruct, Author::Assistant) => format!("### Response\n {}\n", text),
            (PromptStyle::Instruct, Author::User) => format!("### Input\n\n {} \n", text),
            (PromptStyle::Instruct, Author::Function) => format!(
                "###\nInstruction:\n\nHere is the response from the function\n {}\n",
                text
            ),
        }
    }

    /// Sampling preset, with an empty prompt.
    pub fn sampling(&self) -> CompletionParams {
        let mut stop = vec!["</s>".to_string()];
        if *self == PromptStyle::Instruct {
            stop.push("###".to_string());
        }
        stop.extend(["<|im_end|>", "assistant:", "User:"].map(String::from));

        CompletionParams {
            prompt: String::new(),
            n_predict: match self {
                PromptStyle::Chat => -1,
                PromptStyle::Instruct => 256,
            },
            temperature: match self {
                PromptStyle::Chat => 0.3,
                PromptStyle::Instruct => 0.7,
            },
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            repeat_penalty: 1.1,
            stop,
        }
    }

    pub fn function_calls_by_default(&self) -> bool {
        matches!(self, PromptStyle::Instruct)
    }
}

/// Render the conversation `conversation_id` on context `context_id`.
///
/// Notices and messages from other conversations or contexts are left out.
/// Turns are joined with a newline after the system prompt.
pub fn generate_prompt(
    style: PromptStyle,
    context_id: Option<&str>,
    conversation_id: &str,
    messages: &[Message],
) -> String {
    let turns: Vec<String> = messages
        .iter()
        .filter(|m| {
            !m.is_notice()
                && m.metadata.conversation_id.as_deref() == Some(conversation_id)
                && m.metadata.context_id.as_deref() == context_id
        })
        .map(|m| style.render_turn(m))
        .collect();
    format!("{}{}", style.system_prompt(), turns.join("\n"))
}

/// [`generate_prompt`] followed by the style's reply cue.
pub fn build_prompt(
    style: PromptStyle,
    context_id: Option<&str>,
    conversation_id: &str,
    messages: &[Message],
) -> String {
    let mut prompt = generate_prompt(style, context_id, conversation_id, messages);
    prompt.push_str(style.reply_suffix());
    prompt
}
