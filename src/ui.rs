//! UI protocol: event-oriented messages for the web client / avatar bridge.
//!
//! The bridge module watches the bus and translates units into [`UiEvent`]s
//! the client renders; inbound [`UiCommand`]s become ASR-surface units so
//! typed input flows through the same path as speech.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::bus::{MessageBus, topics};
use crate::error::Result;
use crate::iu::{ChainTracker, IncrementalUnit, IuPayload, Observation, UpdateType};
use crate::module::{IncrementalModule, ModuleContext, TopicIu};

/// System-to-client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    NewText {
        role: String,
        text: String,
    },
    AsrToken {
        text: String,
        stability: f32,
    },
    PartialUser {
        text: String,
    },
    UserFinishedSpeaking,
    AsrRevoked,
    SystemState {
        expression: String,
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        concept: Option<String>,
    },
    SystemFinishedSpeaking,
}

/// Client-to-system commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiCommand {
    UserInput { text: String, is_final: bool },
}

/// Publishes typed user input as ASR-surface units, keeping partials on one
/// hypothesis chain until the turn is finalized.
pub struct UserInputPublisher {
    bus: MessageBus,
    last_partial: Option<IncrementalUnit>,
}

impl UserInputPublisher {
    pub fn new(bus: MessageBus) -> Self {
        Self {
            bus,
            last_partial: None,
        }
    }

    /// Publish one command. Typed text is fully stable by definition.
    pub async fn publish(&mut self, command: UiCommand) {
        let UiCommand::UserInput { text, is_final } = command;
        let payload = IuPayload::AsrToken {
            text: text.clone(),
            stability: 1.0,
        };
        let partial = match &self.last_partial {
            None => IncrementalUnit::new_add("ui", payload),
            Some(prev) => IncrementalUnit::new_revision(prev, payload),
        };
        self.bus.publish(topics::ASR_PARTIAL, partial.clone()).await;

        if is_final {
            let seal = IncrementalUnit::new_commit(&partial);
            self.bus.publish(topics::ASR_PARTIAL, seal).await;
            self.last_partial = None;

            let commit = IncrementalUnit::new_add("ui", IuPayload::AsrCommit { text });
            self.bus.publish(topics::ASR_COMMIT, commit).await;
        } else {
            self.last_partial = Some(partial);
        }
    }
}

/// Bridge module: bus units in, [`UiEvent`]s out.
pub struct UiBridge {
    out: mpsc::UnboundedSender<UiEvent>,
    chains: ChainTracker,
}

impl UiBridge {
    pub fn new(out: mpsc::UnboundedSender<UiEvent>) -> Self {
        Self {
            out,
            chains: ChainTracker::new(),
        }
    }

    fn emit(&self, event: UiEvent) {
        let _ = self.out.send(event);
    }
}

#[async_trait]
impl IncrementalModule for UiBridge {
    type Event = ();

    fn name(&self) -> &'static str {
        "ui_bridge"
    }

    fn subscriptions(&self) -> &'static [&'static str] {
        &[
            topics::ASR_PARTIAL,
            topics::ASR_COMMIT,
            topics::DIALOGUE_TEXT,
            topics::SYSTEM_STATE,
            topics::TTS_AUDIO,
        ]
    }

    async fn on_iu(&mut self, input: TopicIu, _ctx: &ModuleContext<()>) -> Result<()> {
        let iu = input.iu;
        match self.chains.observe(&iu) {
            Ok(Observation::Fresh) => {}
            Ok(Observation::Duplicate) => return Ok(()),
            Err(violation) => {
                warn!(topic = input.topic, "dropping unit: {violation}");
                return Ok(());
            }
        }

        match (input.topic, iu.update_type, iu.payload) {
            (topics::ASR_PARTIAL, UpdateType::Add, IuPayload::AsrToken { text, stability }) => {
                self.emit(UiEvent::AsrToken {
                    text: text.clone(),
                    stability,
                });
                self.emit(UiEvent::PartialUser { text });
            }
            (topics::ASR_PARTIAL, UpdateType::Revoke, _) => {
                self.emit(UiEvent::AsrRevoked);
            }
            (topics::ASR_COMMIT, _, IuPayload::AsrCommit { text }) => {
                self.emit(UiEvent::UserFinishedSpeaking);
                self.emit(UiEvent::NewText {
                    role: "user".to_owned(),
                    text,
                });
            }
            (topics::DIALOGUE_TEXT, UpdateType::Add, IuPayload::Text { text }) => {
                self.emit(UiEvent::NewText {
                    role: "system".to_owned(),
                    text,
                });
            }
            (
                topics::SYSTEM_STATE,
                _,
                IuPayload::SystemState {
                    expression,
                    action,
                    progress,
                    current_text,
                    concept,
                },
            ) => {
                self.emit(UiEvent::SystemState {
                    expression,
                    action,
                    progress,
                    current_text,
                    concept,
                });
            }
            // A revoked TTS chain means synthesis gave up mid-utterance; the
            // client still needs the end-of-speech signal.
            (topics::TTS_AUDIO, UpdateType::Commit | UpdateType::Revoke, _) => {
                self.emit(UiEvent::SystemFinishedSpeaking);
            }
            _ => {}
        }
        Ok(())
    }
}
