//! Platform adapters and relay wiring for stoatcord
//!
//! This crate provides the Discord (Serenity) and Stoat (REST + event
//! socket) adapters, and the bridge that connects them through the two
//! relay loops.

pub mod bus;
pub mod discord;
pub mod stoat;
pub mod stoat_api;

// Re-export main types
pub use bus::{Bridge, PlatformClient, RunningBridge};
pub use discord::DiscordChannel;
pub use stoat::StoatChannel;
pub use stoat_api::{StoatEndpoints, StoatHttp};
