//! Static Discord <-> Stoat channel pair table

use std::collections::HashMap;

use crate::error::{BridgeError, Result};
use crate::types::Direction;

/// One bridged channel pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPair {
    pub discord_id: String,
    pub stoat_id: String,
}

/// Bidirectional positional mapping between Discord and Stoat channel ids.
///
/// Built once at startup and never mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct PairTable {
    pairs: Vec<ChannelPair>,
    discord_to_stoat: HashMap<String, String>,
    stoat_to_discord: HashMap<String, String>,
}

impl PairTable {
    /// Pair `discord_ids[i]` with `stoat_ids[i]`.
    ///
    /// Fails if the lists differ in length or if an id appears twice on the
    /// same side. Nothing is built on failure.
    pub fn new(discord_ids: &[String], stoat_ids: &[String]) -> Result<Self> {
        if discord_ids.len() != stoat_ids.len() {
            return Err(BridgeError::configuration(format!(
                "channel list length mismatch: {} Discord ids vs {} Stoat ids",
                discord_ids.len(),
                stoat_ids.len()
            )));
        }

        let mut table = Self::default();
        for (discord_id, stoat_id) in discord_ids.iter().zip(stoat_ids) {
            if table.discord_to_stoat.contains_key(discord_id) {
                return Err(BridgeError::configuration(format!(
                    "Discord channel {} appears in more than one pair",
                    discord_id
                )));
            }
            if table.stoat_to_discord.contains_key(stoat_id) {
                return Err(BridgeError::configuration(format!(
                    "Stoat channel {} appears in more than one pair",
                    stoat_id
                )));
            }
            table
                .discord_to_stoat
                .insert(discord_id.clone(), stoat_id.clone());
            table
                .stoat_to_discord
                .insert(stoat_id.clone(), discord_id.clone());
            table.pairs.push(ChannelPair {
                discord_id: discord_id.clone(),
                stoat_id: stoat_id.clone(),
            });
        }
        Ok(table)
    }

    pub fn resolve_to_stoat(&self, discord_id: &str) -> Option<&str> {
        self.discord_to_stoat.get(discord_id).map(String::as_str)
    }

    pub fn resolve_to_discord(&self, stoat_id: &str) -> Option<&str> {
        self.stoat_to_discord.get(stoat_id).map(String::as_str)
    }

    /// Destination channel for a message read on `direction`'s source side
    pub fn resolve(&self, direction: Direction, source_id: &str) -> Option<&str> {
        match direction {
            Direction::DiscordToStoat => self.resolve_to_stoat(source_id),
            Direction::StoatToDiscord => self.resolve_to_discord(source_id),
        }
    }

    /// Pairs in configuration order
    pub fn pairs(&self) -> &[ChannelPair] {
        &self.pairs
    }

    pub fn discord_ids(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|p| p.discord_id.as_str())
    }

    pub fn stoat_ids(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|p| p.stoat_id.as_str())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}
