//! Conversation memory
//!
//! Keeps the last few user/assistant exchanges so a conversation can be
//! re-seeded after the session is rebuilt on a fresh connection. Only the
//! text is kept; ids from the old session mean nothing to the new one.

use std::collections::VecDeque;

use crate::protocol::ConversationItem;

/// Conversation memory settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryConfig {
    /// Exchanges kept (default: 3)
    pub max_turns: usize,
    /// Replay remembered turns after a new handshake (default: true)
    pub replay_on_resume: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_turns: 3,
            replay_on_resume: true,
        }
    }
}

/// One user message and the assistant's reply
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Turn {
    /// What the user said
    pub user: String,
    /// What the assistant answered
    pub assistant: String,
}

/// Bounded record of recent turns
#[derive(Clone, Debug, Default)]
pub struct ConversationMemory {
    turns: VecDeque<Turn>,
    max_turns: usize,
}

impl ConversationMemory {
    /// Create an empty memory keeping at most `max_turns` exchanges
    #[must_use]
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(max_turns),
            max_turns,
        }
    }

    /// Remember an exchange, forgetting the oldest when full
    pub fn record(&mut self, user: impl Into<String>, assistant: impl Into<String>) {
        if self.max_turns == 0 {
            return;
        }
        if self.turns.len() == self.max_turns {
            self.turns.pop_front();
        }
        self.turns.push_back(Turn {
            user: user.into(),
            assistant: assistant.into(),
        });
    }

    /// Remembered turns, oldest first
    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    /// Number of remembered turns
    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Check if nothing is remembered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Items that rebuild the conversation on a new session
    #[must_use]
    pub fn replay_items(&self) -> Vec<ConversationItem> {
        self.turns
            .iter()
            .flat_map(|turn| {
                [
                    ConversationItem::user_text(turn.user.clone()),
                    ConversationItem::assistant_text(turn.assistant.clone()),
                ]
            })
            .collect()
    }
}
