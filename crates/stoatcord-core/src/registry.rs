//! Outbound send targets, keyed by the destination platform's channel id

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::types::{OutboundMessage, Platform};

/// A live handle able to post into one destination channel with a
/// display name and avatar override.
#[async_trait]
pub trait SendTarget: Send + Sync {
    /// Post the message and wait for the platform to confirm it
    async fn send(&self, msg: &OutboundMessage) -> Result<()>;

    /// Id of the posting handle, if messages it produces carry one
    /// (a Discord webhook id). Used to recognise our own echoes.
    fn handle_id(&self) -> Option<String> {
        None
    }
}

/// Per-platform map of `channel id -> SendTarget`.
///
/// Written by that platform's setup routine, read by the opposite
/// platform's relay loop. A missing entry means "not ready yet".
#[derive(Clone)]
pub struct TargetRegistry {
    platform: Platform,
    targets: Arc<DashMap<String, Arc<dyn SendTarget>>>,
}

impl TargetRegistry {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            targets: Arc::new(DashMap::new()),
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn insert(&self, channel_id: impl Into<String>, target: Arc<dyn SendTarget>) {
        let channel_id = channel_id.into();
        debug!("{} send target ready for channel {}", self.platform(), channel_id);
        self.targets.insert(channel_id, target);
    }

    pub fn get(&self, channel_id: &str) -> Option<Arc<dyn SendTarget>> {
        self.targets.get(channel_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, channel_id: &str) -> bool {
        self.targets.contains_key(channel_id)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl std::fmt::Debug for TargetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetRegistry")
            .field("platform", &self.platform)
            .field("ready", &self.targets.len())
            .finish()
    }
}
