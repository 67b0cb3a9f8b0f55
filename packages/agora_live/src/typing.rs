//! Who is typing in a conversation.
//!
//! Entries expire on their own if the "stopped typing" frame never arrives.

use std::time::Duration;

use tokio::time::Instant;

use crate::models::UserId;

pub const TYPING_EXPIRY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingUser {
    pub user_id: UserId,
    pub username: String,
}

#[derive(Debug)]
struct Slot {
    user: TypingUser,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct TypingAggregator {
    // Insertion order is display order.
    slots: Vec<Slot>,
    expiry: Duration,
}

impl Default for TypingAggregator {
    fn default() -> Self {
        Self::new(TYPING_EXPIRY)
    }
}

impl TypingAggregator {
    pub fn new(expiry: Duration) -> Self {
        Self {
            slots: Vec::new(),
            expiry,
        }
    }

    /// Returns whether the visible set changed.
    pub fn set_typing(
        &mut self,
        user_id: UserId,
        username: impl Into<String>,
        is_typing: bool,
        now: Instant,
    ) -> bool {
        let existing = self.slots.iter().position(|s| s.user.user_id == user_id);
        match (existing, is_typing) {
            (Some(index), true) => {
                let slot = &mut self.slots[index];
                slot.expires_at = now + self.expiry;
                let username = username.into();
                if !username.is_empty() && slot.user.username != username {
                    slot.user.username = username;
                    return true;
                }
                false
            }
            (None, true) => {
                self.slots.push(Slot {
                    user: TypingUser {
                        user_id,
                        username: username.into(),
                    },
                    expires_at: now + self.expiry,
                });
                true
            }
            (Some(index), false) => {
                self.slots.remove(index);
                true
            }
            (None, false) => false,
        }
    }

    /// Drop entries whose expiry has passed. Returns whether any were dropped.
    pub fn expire_due(&mut self, now: Instant) -> bool {
        let before = self.slots.len();
        self.slots.retain(|s| s.expires_at > now);
        before != self.slots.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.iter().map(|s| s.expires_at).min()
    }

    pub fn users(&self) -> Vec<TypingUser> {
        self.slots.iter().map(|s| s.user.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) -> bool {
        let changed = !self.slots.is_empty();
        self.slots.clear();
        changed
    }

    /// "alice is typing…", "alice and bob are typing…", "3 people are typing…".
    pub fn summary(&self) -> Option<String> {
        let names: Vec<&str> = self.slots.iter().map(|s| s.user.username.as_str()).collect();
        match names.as_slice() {
            [] => None,
            [one] => Some(format!("{one} is typing…")),
            [a, b] => Some(format!("{a} and {b} are typing…")),
            many => Some(format!("{} people are typing…", many.len())),
        }
    }
}
