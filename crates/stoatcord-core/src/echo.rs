//! Detection of messages the bridge itself produced

use std::sync::{Arc, RwLock};

use dashmap::DashSet;

use crate::types::InboundMessage;

/// Identity this process posts under on one platform.
///
/// A message read on that platform is an echo when it was authored by the
/// bot account itself or posted through one of our own posting handles.
/// Both sides use the same predicate.
#[derive(Debug, Clone, Default)]
pub struct EchoGuard {
    own_user_id: Arc<RwLock<Option<String>>>,
    own_handles: Arc<DashSet<String>>,
}

impl EchoGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the bot account id once the client is connected
    pub fn set_own_user_id(&self, user_id: impl Into<String>) {
        let mut guard = match self.own_user_id.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(user_id.into());
    }

    pub fn own_user_id(&self) -> Option<String> {
        match self.own_user_id.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Record a posting handle (webhook) owned by this process
    pub fn add_handle(&self, handle_id: impl Into<String>) {
        self.own_handles.insert(handle_id.into());
    }

    pub fn handle_count(&self) -> usize {
        self.own_handles.len()
    }

    pub fn is_echo(&self, msg: &InboundMessage) -> bool {
        if self
            .own_user_id()
            .is_some_and(|own| own == msg.author_id)
        {
            return true;
        }
        msg.origin_handle_id
            .as_ref()
            .is_some_and(|handle| self.own_handles.contains(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Platform;
    use chrono::Utc;

    fn message(author_id: &str, handle: Option<&str>) -> InboundMessage {
        InboundMessage {
            platform: Platform::Discord,
            channel_id: "111".to_string(),
            author_id: author_id.to_string(),
            origin_handle_id: handle.map(str::to_string),
            author_name: "someone".to_string(),
            author_avatar_url: None,
            content: "hi".to_string(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_own_user_is_echo() {
        let guard = EchoGuard::new();
        assert!(!guard.is_echo(&message("bot", None)));
        guard.set_own_user_id("bot");
        assert!(guard.is_echo(&message("bot", None)));
        assert!(!guard.is_echo(&message("human", None)));
    }

    #[test]
    fn test_own_handle_is_echo() {
        let guard = EchoGuard::new();
        guard.add_handle("wh-1");
        assert!(guard.is_echo(&message("wh-1", Some("wh-1"))));
        assert!(!guard.is_echo(&message("other", Some("wh-2"))));
        assert_eq!(guard.handle_count(), 1);
    }

    #[test]
    fn test_clones_share_state() {
        let guard = EchoGuard::new();
        let reader = guard.clone();
        guard.set_own_user_id("bot");
        guard.add_handle("wh-1");
        assert_eq!(reader.own_user_id().as_deref(), Some("bot"));
        assert!(reader.is_echo(&message("x", Some("wh-1"))));
    }
}
