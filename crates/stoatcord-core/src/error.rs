use std::error::Error as StdError;

use crate::types::{Direction, Platform};

/// Errors raised by the bridge core.
///
/// `Configuration` is fatal and only produced at startup. The other variants
/// are recoverable: callers log them and carry on.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{platform}: could not set up channel {channel_id}: {source}")]
    ChannelSetup {
        platform: Platform,
        channel_id: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
    #[error("{direction} (channel {channel_id}): {source}")]
    Delivery {
        direction: Direction,
        channel_id: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl BridgeError {
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    #[must_use]
    pub fn channel_setup<E>(platform: Platform, channel_id: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Self::ChannelSetup {
            platform,
            channel_id: channel_id.into(),
            source: source.into(),
        }
    }

    #[must_use]
    pub fn delivery<E>(direction: Direction, channel_id: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Self::Delivery {
            direction,
            channel_id: channel_id.into(),
            source: source.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
