//! Shared types for stoatcord-core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Chat platform on one side of the bridge
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Discord,
    Stoat,
}

impl Platform {
    /// The platform on the other side of the bridge
    pub fn opposite(self) -> Self {
        match self {
            Self::Discord => Self::Stoat,
            Self::Stoat => Self::Discord,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discord => write!(f, "Discord"),
            Self::Stoat => write!(f, "Stoat"),
        }
    }
}

/// Relay direction, named by the platform messages are read from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    DiscordToStoat,
    StoatToDiscord,
}

impl Direction {
    /// Direction for messages read from `source`
    pub fn from_source(source: Platform) -> Self {
        match source {
            Platform::Discord => Self::DiscordToStoat,
            Platform::Stoat => Self::StoatToDiscord,
        }
    }

    pub fn source(self) -> Platform {
        match self {
            Self::DiscordToStoat => Platform::Discord,
            Self::StoatToDiscord => Platform::Stoat,
        }
    }

    pub fn destination(self) -> Platform {
        self.source().opposite()
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.source(), self.destination())
    }
}

/// A "message created" event as seen by a relay loop.
///
/// Adapters fill this from their platform's event payload; author fields are
/// already resolved (display name precedence and avatar fallback are the
/// adapter's job since they depend on the platform's user model).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub platform: Platform,
    pub channel_id: String,
    pub author_id: String,
    /// Id of the posting handle (e.g. a Discord webhook) that produced the message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_handle_id: Option<String>,
    pub author_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_avatar_url: Option<String>,
    pub content: String,
    pub received_at: DateTime<Utc>,
}

/// Transformed message ready to be posted on the destination platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel_id: String,
    pub content: String,
    /// Display name override
    pub username: String,
    /// Avatar image override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Length limits applied when transforming a message for its destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayLimits {
    pub max_content_chars: usize,
    pub max_name_chars: usize,
}

impl RelayLimits {
    /// Stoat caps masquerade names at 32 characters
    pub const STOAT: Self = Self {
        max_content_chars: 2000,
        max_name_chars: 32,
    };

    /// Discord caps webhook usernames at 80 characters
    pub const DISCORD: Self = Self {
        max_content_chars: 2000,
        max_name_chars: 80,
    };

    /// Default limits of the destination platform
    pub fn for_destination(platform: Platform) -> Self {
        match platform {
            Platform::Discord => Self::DISCORD,
            Platform::Stoat => Self::STOAT,
        }
    }
}
