//! Prompt templates for response generation, backchannel inference, and
//! timeout re-prompting.
//!
//! Each template is parameterized by `{history}` and `{user_draft}`. The
//! built-in templates can be overridden per file from a configured prompt
//! directory.

use std::path::Path;

use crate::error::{RemdisError, Result};

const RESPONSE_TEMPLATE: &str = "\
You are a spoken dialogue agent in a live voice conversation. Reply to the \
user's latest utterance in one or two short spoken sentences. Do not use \
markdown, lists, or emoji. Keep the register casual and warm.

Conversation so far:
{history}

The user is saying (possibly still mid-utterance):
{user_draft}

Your reply:";

const BACKCHANNEL_TEMPLATE: &str = "\
You observe a user speaking to a dialogue agent. Based on the partial \
utterance below, report the agent's momentary reaction. Answer with exactly \
four lines in this format, nothing else:
analysis: <one short clause about what the user is conveying>
emotion: <one of neutral, joy, surprise, sadness, anger>:<intensity 1-9>
action: <one of nod, tilt, lean, none>
concept: <the single central noun phrase of the utterance>

Conversation so far:
{history}

Partial user utterance:
{user_draft}";

const TIMEOUT_TEMPLATE: &str = "\
You are a spoken dialogue agent. The user has been silent for a while. Say \
one short, friendly sentence to invite them back into the conversation, \
picking up from where it left off if possible. Do not apologize.

Conversation so far:
{history}

Your prompt to the user:";

/// A single template with `{history}` / `{user_draft}` slots.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    text: String,
}

impl PromptTemplate {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Substitute both parameters.
    pub fn render(&self, history: &str, user_draft: &str) -> String {
        self.text
            .replace("{history}", history)
            .replace("{user_draft}", user_draft)
    }
}

/// The three templates the dialogue system uses.
#[derive(Debug, Clone)]
pub struct PromptSet {
    pub response: PromptTemplate,
    pub backchannel: PromptTemplate,
    pub timeout: PromptTemplate,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            response: PromptTemplate::new(RESPONSE_TEMPLATE),
            backchannel: PromptTemplate::new(BACKCHANNEL_TEMPLATE),
            timeout: PromptTemplate::new(TIMEOUT_TEMPLATE),
        }
    }
}

impl PromptSet {
    /// Load templates, taking per-file overrides from `dir` when present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` if an override file exists but cannot be read.
    pub fn load(dir: Option<&Path>) -> Result<Self> {
        let mut set = Self::default();
        let Some(dir) = dir else {
            return Ok(set);
        };
        for (name, slot) in [
            ("response.txt", &mut set.response),
            ("backchannel.txt", &mut set.backchannel),
            ("timeout.txt", &mut set.timeout),
        ] {
            let path = dir.join(name);
            if path.exists() {
                let text = std::fs::read_to_string(&path).map_err(|e| {
                    RemdisError::ConfigInvalid(format!("prompt {}: {e}", path.display()))
                })?;
                *slot = PromptTemplate::new(text);
            }
        }
        Ok(set)
    }
}
