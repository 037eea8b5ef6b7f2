//! Incremental Units and the revision/commit protocol.
//!
//! Every message exchanged between modules is an [`IncrementalUnit`]: an
//! immutable record carrying a typed payload plus revision metadata. Units
//! link into *chains* through `previous_id`; a chain is extended by ADDs,
//! revised by ADDs that reference an earlier unit, and closed by exactly one
//! COMMIT or REVOKE. [`ChainTracker`] is the consumer-side enforcement point
//! for the chain grammar.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::RemdisError;

/// How a unit updates the stream it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateType {
    /// New content appended to a chain (a revision is an ADD whose
    /// `previous_id` points at the unit it supersedes).
    Add,
    /// Retracts the chain containing `previous_id`; consumers undo its effects.
    Revoke,
    /// Marks the chain containing `previous_id` as final.
    Commit,
}

/// Discriminant of a payload, used for per-(producer, data type) ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    Audio,
    AsrToken,
    AsrCommit,
    Vap,
    Text,
    TtsAudio,
    SystemState,
    Backchannel,
    Intent,
}

/// Typed payload, tagged on the wire by `data_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "data_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IuPayload {
    /// Raw audio frames from capture or for playback.
    Audio { samples: Vec<f32>, sample_rate: u32 },
    /// A partial recognition hypothesis for the current user turn.
    ///
    /// `text` is the full hypothesis so far; a revision replaces the previous
    /// hypothesis wholesale. `stability` is the recognizer's confidence that
    /// this prefix will survive further revisions, in `[0, 1]`.
    AsrToken { text: String, stability: f32 },
    /// The final recognition result for a user turn.
    AsrCommit { text: String },
    /// Turn-taking probability from the voice-activity-projection model.
    Vap { probability: f32 },
    /// A chunk of system speech text bound for TTS.
    Text { text: String },
    /// Synthesized audio produced by TTS.
    TtsAudio { samples: Vec<f32>, sample_rate: u32 },
    /// Agent state for the avatar / UI.
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
    /// A backchannel suggestion from the Text-VAP adapter.
    Backchannel {
        /// Strength of the reaction, `1..=9`.
        intensity: u8,
        expression: String,
        action: String,
        concept: String,
        /// Short verbal acknowledgment to route through TTS, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phrase: Option<String>,
    },
    /// Silence-timeout signal from the intention watchdog.
    Intent { silence_secs: f64 },
}

impl IuPayload {
    /// The wire discriminant for this payload.
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Audio { .. } => DataType::Audio,
            Self::AsrToken { .. } => DataType::AsrToken,
            Self::AsrCommit { .. } => DataType::AsrCommit,
            Self::Vap { .. } => DataType::Vap,
            Self::Text { .. } => DataType::Text,
            Self::TtsAudio { .. } => DataType::TtsAudio,
            Self::SystemState { .. } => DataType::SystemState,
            Self::Backchannel { .. } => DataType::Backchannel,
            Self::Intent { .. } => DataType::Intent,
        }
    }
}

/// The atomic message exchanged between modules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncrementalUnit {
    /// Globally unique identifier.
    pub id: Uuid,
    /// Module name of origin.
    pub producer: String,
    /// Wall clock at creation.
    pub timestamp: DateTime<Utc>,
    /// Unit this one revises, extends, commits, or revokes.
    pub previous_id: Option<Uuid>,
    pub update_type: UpdateType,
    #[serde(flatten)]
    pub payload: IuPayload,
}

impl IncrementalUnit {
    /// A fresh ADD opening a new chain.
    pub fn new_add(producer: impl Into<String>, payload: IuPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            producer: producer.into(),
            timestamp: Utc::now(),
            previous_id: None,
            update_type: UpdateType::Add,
            payload,
        }
    }

    /// An ADD extending or revising `prev` on the same chain.
    pub fn new_revision(prev: &IncrementalUnit, payload: IuPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            producer: prev.producer.clone(),
            timestamp: Utc::now(),
            previous_id: Some(prev.id),
            update_type: UpdateType::Add,
            payload,
        }
    }

    /// A COMMIT closing the chain containing `prev`.
    pub fn new_commit(prev: &IncrementalUnit) -> Self {
        Self {
            id: Uuid::new_v4(),
            producer: prev.producer.clone(),
            timestamp: Utc::now(),
            previous_id: Some(prev.id),
            update_type: UpdateType::Commit,
            payload: prev.payload.clone(),
        }
    }

    /// A REVOKE retracting the chain containing `prev`.
    pub fn new_revoke(prev: &IncrementalUnit) -> Self {
        Self {
            id: Uuid::new_v4(),
            producer: prev.producer.clone(),
            timestamp: Utc::now(),
            previous_id: Some(prev.id),
            update_type: UpdateType::Revoke,
            payload: prev.payload.clone(),
        }
    }

    /// The wire discriminant of this unit's payload.
    pub fn data_type(&self) -> DataType {
        self.payload.data_type()
    }
}

/// Lifecycle of a chain as seen by one consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainState {
    Open,
    Committed,
    Revoked,
}

/// What `ChainTracker::observe` concluded about a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First delivery of this unit; apply its effects.
    Fresh,
    /// Redelivery of an already-seen id; consumers must treat as a no-op.
    Duplicate,
}

/// Consumer-side enforcement of the chain grammar
/// `ADD (ADD|REV)* (REVOKE|COMMIT)?`.
///
/// Violations are returned as errors so callers can log and drop the unit
/// without blocking; they are never fatal.
#[derive(Debug, Default)]
pub struct ChainTracker {
    /// Every observed unit id, mapped to the head id of its chain.
    member_chain: HashMap<Uuid, Uuid>,
    /// Chain head id -> lifecycle state.
    chains: HashMap<Uuid, ChainState>,
}

impl ChainTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one delivered unit, validating it against the chain grammar.
    ///
    /// # Errors
    ///
    /// `CausalityViolation` when `previous_id` was never observed,
    /// `ProtocolViolation` when the chain is already committed or revoked.
    /// In both cases the tracker is unchanged and the unit must be dropped.
    pub fn observe(&mut self, iu: &IncrementalUnit) -> Result<Observation, RemdisError> {
        if self.member_chain.contains_key(&iu.id) {
            return Ok(Observation::Duplicate);
        }

        let update = match iu.update_type {
            UpdateType::Add => "ADD",
            UpdateType::Revoke => "REVOKE",
            UpdateType::Commit => "COMMIT",
        };

        let chain = match iu.previous_id {
            None => {
                // Only an ADD may open a chain.
                if iu.update_type != UpdateType::Add {
                    return Err(RemdisError::CausalityViolation {
                        id: iu.id,
                        ancestor: Uuid::nil(),
                        update,
                    });
                }
                self.chains.insert(iu.id, ChainState::Open);
                self.member_chain.insert(iu.id, iu.id);
                return Ok(Observation::Fresh);
            }
            Some(prev) => match self.member_chain.get(&prev) {
                Some(chain) => *chain,
                None => {
                    return Err(RemdisError::CausalityViolation {
                        id: iu.id,
                        ancestor: prev,
                        update,
                    });
                }
            },
        };

        let state = self.chains.get_mut(&chain).expect("chain state exists");
        if *state != ChainState::Open {
            return Err(RemdisError::ProtocolViolation {
                id: iu.id,
                chain,
                update,
            });
        }

        match iu.update_type {
            UpdateType::Add => {}
            UpdateType::Commit => *state = ChainState::Committed,
            UpdateType::Revoke => *state = ChainState::Revoked,
        }
        self.member_chain.insert(iu.id, chain);
        Ok(Observation::Fresh)
    }

    /// Head id of the chain containing `id`, if observed.
    pub fn chain_of(&self, id: Uuid) -> Option<Uuid> {
        self.member_chain.get(&id).copied()
    }

    /// Whether the chain with head `chain` has been committed.
    pub fn is_committed(&self, chain: Uuid) -> bool {
        self.chains.get(&chain) == Some(&ChainState::Committed)
    }

    /// Whether the chain with head `chain` has been revoked.
    pub fn is_revoked(&self, chain: Uuid) -> bool {
        self.chains.get(&chain) == Some(&ChainState::Revoked)
    }
}
