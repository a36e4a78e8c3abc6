//! Conversation history
//!
//! Keeps the last few completed exchanges for the next generation request.
//! Interrupted or failed turns never reach it.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
    pub emotion: String,
}

/// Bounded record of completed exchanges. Oldest entries fall off first.
#[derive(Debug)]
pub struct ConversationHistory {
    entries: VecDeque<HistoryEntry>,
    max_turns: usize,
}

impl ConversationHistory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_turns * 2),
            max_turns,
        }
    }

    /// Record one completed exchange.
    pub fn record_turn(&mut self, user: &str, user_emotion: &str, reply: &str, reply_emotion: &str) {
        self.push(Role::User, user, user_emotion);
        self.push(Role::Assistant, reply, reply_emotion);
        while self.entries.len() > self.max_turns * 2 {
            self.entries.pop_front();
        }
    }

    fn push(&mut self, role: Role, content: &str, emotion: &str) {
        self.entries.push_back(HistoryEntry {
            role,
            content: content.to_string(),
            emotion: emotion.to_string(),
        });
    }

    /// Entries suitable for a prompt, oldest first, skipping empty content.
    pub fn context(&self) -> Vec<HistoryEntry> {
        self.entries
            .iter()
            .filter(|e| !e.content.trim().is_empty())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
