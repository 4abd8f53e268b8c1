//! Relay pipeline: filter -> resolve -> transform -> forward
//!
//! One [`Relay`] exists per direction. It reads the pair table and the
//! destination platform's [`TargetRegistry`], and never retries: a message
//! that cannot be delivered is logged and dropped (at-most-once delivery).

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::echo::EchoGuard;
use crate::error::BridgeError;
use crate::pairs::PairTable;
use crate::registry::TargetRegistry;
use crate::text::truncate_chars;
use crate::types::{Direction, InboundMessage, OutboundMessage, RelayLimits};

/// Why a message was not forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Produced by this bridge (own bot account or own posting handle)
    Echo,
    /// Source channel is not part of any pair
    Unpaired,
    /// No text content (attachment-only messages are not relayed)
    Empty,
    /// Destination send target has not been set up
    NotReady,
}

/// Result of relaying one inbound message
#[derive(Debug)]
pub enum RelayOutcome {
    Forwarded { destination: String },
    Dropped(DropReason),
    Failed(BridgeError),
}

impl RelayOutcome {
    pub fn is_forwarded(&self) -> bool {
        matches!(self, Self::Forwarded { .. })
    }
}

/// Counters reported when a relay loop exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub forwarded: u64,
    pub dropped: u64,
    pub failed: u64,
}

impl RelayStats {
    fn record(&mut self, outcome: &RelayOutcome) {
        match outcome {
            RelayOutcome::Forwarded { .. } => self.forwarded += 1,
            RelayOutcome::Dropped(_) => self.dropped += 1,
            RelayOutcome::Failed(_) => self.failed += 1,
        }
    }
}

/// One direction of the bridge
pub struct Relay {
    direction: Direction,
    pairs: Arc<PairTable>,
    targets: TargetRegistry,
    echo: EchoGuard,
    limits: RelayLimits,
}

impl Relay {
    /// # Arguments
    /// * `targets` - send targets of the destination platform
    /// * `echo` - identity of this bridge on the source platform
    pub fn new(
        direction: Direction,
        pairs: Arc<PairTable>,
        targets: TargetRegistry,
        echo: EchoGuard,
    ) -> Self {
        Self {
            direction,
            pairs,
            targets,
            echo,
            limits: RelayLimits::for_destination(direction.destination()),
        }
    }

    pub fn with_limits(mut self, limits: RelayLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Apply destination limits to an inbound message
    pub fn transform(&self, msg: &InboundMessage, destination: &str) -> OutboundMessage {
        OutboundMessage {
            channel_id: destination.to_string(),
            content: truncate_chars(&msg.content, self.limits.max_content_chars).to_string(),
            username: truncate_chars(&msg.author_name, self.limits.max_name_chars).to_string(),
            avatar_url: msg.author_avatar_url.clone(),
        }
    }

    pub async fn handle(&self, msg: InboundMessage) -> RelayOutcome {
        if self.echo.is_echo(&msg) {
            return RelayOutcome::Dropped(DropReason::Echo);
        }

        let Some(destination) = self.pairs.resolve(self.direction, &msg.channel_id) else {
            return RelayOutcome::Dropped(DropReason::Unpaired);
        };

        if msg.content.is_empty() {
            return RelayOutcome::Dropped(DropReason::Empty);
        }

        let Some(target) = self.targets.get(destination) else {
            warn!(
                "{}: dropped message from channel {} (send target for {} channel {} not ready)",
                self.direction,
                msg.channel_id,
                self.direction.destination(),
                destination
            );
            return RelayOutcome::Dropped(DropReason::NotReady);
        };

        let outbound = self.transform(&msg, destination);
        match target.send(&outbound).await {
            Ok(()) => {
                debug!(
                    "{}: relayed message from {} ({} -> {}, {} chars, {} ms after receipt)",
                    self.direction,
                    outbound.username,
                    msg.channel_id,
                    destination,
                    outbound.content.chars().count(),
                    (chrono::Utc::now() - msg.received_at).num_milliseconds()
                );
                RelayOutcome::Forwarded {
                    destination: destination.to_string(),
                }
            }
            Err(e) => {
                let err = BridgeError::delivery(self.direction, destination, e);
                error!("{} (source channel {})", err, msg.channel_id);
                RelayOutcome::Failed(err)
            }
        }
    }
}

/// Pump one platform's inbound events through `relay`, one at a time and in
/// arrival order, until cancelled or the sender side is dropped.
///
/// Cancellation is only observed between messages, so a send that is already
/// in flight completes before the loop exits.
pub async fn run_relay_loop(
    relay: Arc<Relay>,
    mut rx: mpsc::Receiver<InboundMessage>,
    cancel: CancellationToken,
) -> RelayStats {
    let mut stats = RelayStats::default();
    info!("{} relay loop started", relay.direction());

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("{} relay loop shutting down", relay.direction());
                break;
            }
            msg = rx.recv() => {
                match msg {
                    Some(msg) => {
                        let outcome = relay.handle(msg).await;
                        stats.record(&outcome);
                    }
                    None => {
                        info!("{} event stream closed", relay.direction());
                        break;
                    }
                }
            }
        }
    }

    info!(
        "{} relay loop stopped (forwarded {}, dropped {}, failed {})",
        relay.direction(),
        stats.forwarded,
        stats.dropped,
        stats.failed
    );
    stats
}
