//! Online and typing indicators fed by `user:status` and `typing:*` pushes.

use std::collections::{HashMap, HashSet};

use parley_shared::types::{ConversationId, UserId};

#[derive(Debug, Default, Clone)]
pub struct PresenceTracker {
    online: HashMap<UserId, bool>,
    typing: HashSet<(Option<ConversationId>, UserId)>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a status report. Returns `true` if it changed anything.
    pub fn set_online(&mut self, user: UserId, online: bool) -> bool {
        if !online {
            self.typing.retain(|(_, u)| *u != user);
        }
        self.online.insert(user, online) != Some(online)
    }

    /// `None` until a status report or check answer has been seen.
    pub fn is_online(&self, user: &UserId) -> Option<bool> {
        self.online.get(user).copied()
    }

    pub fn set_typing(&mut self, conversation: Option<ConversationId>, user: UserId, typing: bool) {
        if typing {
            self.typing.insert((conversation, user));
        } else {
            self.typing.remove(&(conversation, user));
        }
    }

    /// Whether `user` is typing in `conversation`, or typing with no
    /// conversation context at all.
    pub fn is_typing(&self, conversation: &ConversationId, user: &UserId) -> bool {
        self.typing.contains(&(Some(conversation.clone()), user.clone()))
            || self.typing.contains(&(None, user.clone()))
    }

    pub fn clear_typing(&mut self) {
        self.typing.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_transitions() {
        let mut presence = PresenceTracker::new();
        let alice = UserId::new("alice");
        assert_eq!(presence.is_online(&alice), None);
        assert!(presence.set_online(alice.clone(), true));
        assert!(!presence.set_online(alice.clone(), true));
        assert_eq!(presence.is_online(&alice), Some(true));
    }

    #[test]
    fn test_typing_scoped_to_conversation() {
        let mut presence = PresenceTracker::new();
        let alice = UserId::new("alice");
        let c1 = ConversationId::new("c1");
        let c2 = ConversationId::new("c2");

        presence.set_typing(Some(c1.clone()), alice.clone(), true);
        assert!(presence.is_typing(&c1, &alice));
        assert!(!presence.is_typing(&c2, &alice));

        presence.set_online(alice.clone(), false);
        assert!(!presence.is_typing(&c1, &alice));
    }
}
