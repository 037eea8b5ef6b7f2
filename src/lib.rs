//! Remdis: real-time incremental spoken-dialogue system.
//!
//! Asynchronous modules exchange *incremental units* (IUs) over a shared
//! message bus and cooperate to hold a spoken conversation:
//! ASR partials stream in, a voice-activity-projection model predicts turn
//! boundaries, and the dialogue controller speculatively generates LLM
//! responses it can cancel, revoke, and restart as the user's utterance
//! evolves.
//!
//! # Architecture
//!
//! - **IU model**: immutable records with an ADD/REVOKE/COMMIT revision
//!   protocol, linked into chains ([`iu`])
//! - **Bus**: topic-addressed pub/sub with per-subscriber bounded queues
//!   ([`bus`])
//! - **Module runtime**: one task per module, sequential dispatch,
//!   bounded-drain shutdown ([`module`])
//! - **Dialogue controller**: the turn-taking state machine ([`dialogue`])
//! - **Adapters**: streaming LLM ([`llm`]), backchannel inference
//!   ([`text_vap`]), silence watchdog ([`intention`]), UI bridge ([`ui`])

pub mod bus;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod intention;
pub mod iu;
pub mod llm;
pub mod module;
pub mod prompts;
pub mod text_vap;
pub mod ui;

pub use config::SystemConfig;
pub use dialogue::{DialogueController, DialogueState};
pub use error::{RemdisError, Result};
pub use iu::{IncrementalUnit, IuPayload, UpdateType};
