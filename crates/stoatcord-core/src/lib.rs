//! stoatcord-core - platform-independent half of the Discord <-> Stoat bridge
//!
//! This crate provides:
//! - The static channel pair table
//! - Send target registries, one per platform
//! - Echo detection for messages the bridge produced itself
//! - The relay pipeline and the loop that drives it

pub mod echo;
pub mod error;
pub mod pairs;
pub mod registry;
pub mod relay;
pub mod text;
pub mod types;

// Re-export main types for convenience
pub use echo::EchoGuard;
pub use error::BridgeError;
pub use pairs::{ChannelPair, PairTable};
pub use registry::{SendTarget, TargetRegistry};
pub use relay::{DropReason, Relay, RelayOutcome, RelayStats, run_relay_loop};
pub use types::{Direction, InboundMessage, OutboundMessage, Platform, RelayLimits};
