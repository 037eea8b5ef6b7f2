//! The dialogue turn-taking controller and its supporting state.

pub mod chunker;
pub mod controller;
pub mod history;

pub use controller::{DialogueController, DialogueEvent, DialogueState};
pub use history::{DialogueHistory, DialogueTurn, Role};
