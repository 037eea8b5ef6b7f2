//! Dialogue history: the ordered record of completed turns.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
        }
    }
}

/// One completed turn.
#[derive(Debug, Clone)]
pub struct DialogueTurn {
    pub role: Role,
    pub text: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// True when the turn was cut short by a barge-in.
    pub interrupted: bool,
}

/// Ordered sequence of turns, trimmed to the most recent `capacity`.
/// Mutated only by the dialogue controller.
#[derive(Debug)]
pub struct DialogueHistory {
    turns: VecDeque<DialogueTurn>,
    capacity: usize,
}

impl DialogueHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a turn, evicting the oldest beyond capacity.
    pub fn push(&mut self, turn: DialogueTurn) {
        if self.turns.len() == self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
    }

    /// Mark the most recent system turn as interrupted.
    pub fn mark_last_system_interrupted(&mut self) {
        if let Some(turn) = self
            .turns
            .iter_mut()
            .rev()
            .find(|t| t.role == Role::System)
        {
            turn.interrupted = true;
        }
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn turns(&self) -> impl Iterator<Item = &DialogueTurn> {
        self.turns.iter()
    }

    /// Render the last `max_turns` turns as prompt context, one
    /// `role: text` line per turn.
    pub fn render(&self, max_turns: usize) -> String {
        let skip = self.turns.len().saturating_sub(max_turns);
        let mut out = String::new();
        for turn in self.turns.iter().skip(skip) {
            out.push_str(turn.role.as_str());
            out.push_str(": ");
            out.push_str(&turn.text);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(role: Role, text: &str) -> DialogueTurn {
        let now = Utc::now();
        DialogueTurn {
            role,
            text: text.to_owned(),
            started_at: now,
            ended_at: now,
            interrupted: false,
        }
    }

    #[test]
    fn trims_to_capacity() {
        let mut history = DialogueHistory::new(3);
        for i in 0..5 {
            history.push(turn(Role::User, &format!("turn {i}")));
        }
        assert_eq!(history.len(), 3);
        let texts: Vec<_> = history.turns().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["turn 2", "turn 3", "turn 4"]);
    }

    #[test]
    fn render_limits_context_and_labels_roles() {
        let mut history = DialogueHistory::new(5);
        history.push(turn(Role::User, "hi"));
        history.push(turn(Role::System, "hello there"));
        history.push(turn(Role::User, "tell me a joke"));

        let rendered = history.render(2);
        assert_eq!(rendered, "system: hello there\nuser: tell me a joke\n");
    }

    #[test]
    fn marks_last_system_turn_interrupted() {
        let mut history = DialogueHistory::new(5);
        history.push(turn(Role::System, "first"));
        history.push(turn(Role::User, "wait"));
        history.push(turn(Role::System, "second"));
        history.mark_last_system_interrupted();

        let flags: Vec<_> = history.turns().map(|t| t.interrupted).collect();
        assert_eq!(flags, vec![false, false, true]);
    }
}
