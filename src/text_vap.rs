//! Text-VAP: LLM-driven backchannel and concept inference.
//!
//! Watches user ASR partials and, every few revisions, asks the LLM for the
//! agent's momentary reaction: an emotion code with intensity, an action
//! code, and the central concept of the utterance. The reply is parsed
//! strictly; anything malformed is discarded without a retry. At most one
//! inference call is in flight; invocations while one is pending are
//! dropped, which bounds the request rate to the partial stream.

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::bus::topics;
use crate::config::SystemConfig;
use crate::error::Result;
use crate::iu::{ChainTracker, IncrementalUnit, IuPayload, Observation, UpdateType};
use crate::llm::{GenerationRequest, ResponseGenerator, collect_response};
use crate::module::{IncrementalModule, ModuleContext, TopicIu};
use crate::prompts::PromptSet;
use tokio_util::sync::CancellationToken;

const PRODUCER: &str = "text_vap";

/// Intensity at or above which the reaction is voiced aloud.
const VERBAL_INTENSITY: u8 = 5;

/// Structured reaction parsed from the LLM reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReaction {
    pub emotion: String,
    pub intensity: u8,
    pub action: String,
    pub concept: String,
}

/// Parse the four-line labeled reply format:
///
/// ```text
/// analysis: <ignored>
/// emotion: <name>:<1-9>
/// action: <code>
/// concept: <phrase>
/// ```
///
/// Returns `None` on any deviation; the caller emits nothing in that case.
pub fn parse_reaction(reply: &str) -> Option<ParsedReaction> {
    let mut lines = reply.lines().map(str::trim).filter(|l| !l.is_empty());

    fn labeled<'a>(line: &'a str, label: &str) -> Option<&'a str> {
        let (head, rest) = line.split_once(':')?;
        if head.trim().eq_ignore_ascii_case(label) {
            Some(rest.trim())
        } else {
            None
        }
    }

    let _analysis = labeled(lines.next()?, "analysis")?;
    let emotion_field = labeled(lines.next()?, "emotion")?;
    let action = labeled(lines.next()?, "action")?;
    let concept = labeled(lines.next()?, "concept")?;

    let (emotion, intensity) = emotion_field.split_once(':')?;
    let emotion = emotion.trim();
    let intensity: u8 = intensity.trim().parse().ok()?;
    if emotion.is_empty() || action.is_empty() || concept.is_empty() {
        return None;
    }
    if !(1..=9).contains(&intensity) {
        return None;
    }
    Some(ParsedReaction {
        emotion: emotion.to_owned(),
        intensity,
        action: action.to_owned(),
        concept: concept.to_owned(),
    })
}

/// Outcome of one inference call.
#[derive(Debug)]
pub enum TextVapEvent {
    Inferred(Option<ParsedReaction>),
}

/// The Text-VAP module.
pub struct TextVapModule {
    config: SystemConfig,
    prompts: PromptSet,
    generator: Arc<dyn ResponseGenerator>,
    chains: ChainTracker,
    partial_count: u32,
    in_flight: bool,
    next_generation_id: u64,
}

impl TextVapModule {
    pub fn new(
        config: SystemConfig,
        prompts: PromptSet,
        generator: Arc<dyn ResponseGenerator>,
    ) -> Self {
        Self {
            config,
            prompts,
            generator,
            chains: ChainTracker::new(),
            partial_count: 0,
            in_flight: false,
            next_generation_id: 0,
        }
    }

    fn pick_phrase(&self) -> Option<String> {
        let list = &self.config.dialogue.backchannels;
        if list.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..list.len());
        Some(list[idx].clone())
    }
}

#[async_trait]
impl IncrementalModule for TextVapModule {
    type Event = TextVapEvent;

    fn name(&self) -> &'static str {
        PRODUCER
    }

    fn subscriptions(&self) -> &'static [&'static str] {
        &[topics::ASR_PARTIAL]
    }

    async fn on_iu(&mut self, input: TopicIu, ctx: &ModuleContext<TextVapEvent>) -> Result<()> {
        let iu = input.iu;
        match self.chains.observe(&iu) {
            Ok(Observation::Fresh) => {}
            Ok(Observation::Duplicate) => return Ok(()),
            Err(violation) => {
                warn!("dropping unit: {violation}");
                return Ok(());
            }
        }
        let (UpdateType::Add, IuPayload::AsrToken { text, .. }) = (iu.update_type, &iu.payload)
        else {
            return Ok(());
        };

        self.partial_count += 1;
        if self.partial_count % self.config.text_vap.text_vap_interval != 0 {
            return Ok(());
        }
        if self.in_flight {
            debug!("inference already pending, dropping invocation");
            return Ok(());
        }
        self.in_flight = true;

        self.next_generation_id += 1;
        let request = GenerationRequest {
            prompt: self.prompts.backchannel.render("", text),
            generation_id: self.next_generation_id,
            cancel: CancellationToken::new(),
            first_token_timeout: self.config.dialogue.response_generation_timeout(),
            max_tokens: self.config.chatgpt.max_tokens,
            temperature: self.config.chatgpt.temperature,
        };
        let generator = Arc::clone(&self.generator);
        let events = ctx.events();
        tokio::spawn(async move {
            let parsed = match collect_response(generator, request).await {
                Ok(reply) => parse_reaction(&reply),
                Err(e) => {
                    debug!("backchannel inference failed: {e}");
                    None
                }
            };
            let _ = events.send(TextVapEvent::Inferred(parsed));
        });
        Ok(())
    }

    async fn on_event(
        &mut self,
        event: TextVapEvent,
        ctx: &ModuleContext<TextVapEvent>,
    ) -> Result<()> {
        let TextVapEvent::Inferred(parsed) = event;
        self.in_flight = false;
        let Some(reaction) = parsed else {
            // Malformed replies are rejected silently.
            return Ok(());
        };

        let phrase = if reaction.intensity >= VERBAL_INTENSITY {
            self.pick_phrase()
        } else {
            None
        };
        debug!(
            emotion = %reaction.emotion,
            intensity = reaction.intensity,
            concept = %reaction.concept,
            verbal = phrase.is_some(),
            "backchannel suggestion"
        );
        let iu = IncrementalUnit::new_add(
            PRODUCER,
            IuPayload::Backchannel {
                intensity: reaction.intensity,
                expression: reaction.emotion,
                action: reaction.action,
                concept: reaction.concept,
                phrase,
            },
        );
        ctx.bus().publish(topics::BC_SUGGEST, iu).await;
        Ok(())
    }
}
