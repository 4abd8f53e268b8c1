//! Wiring between platform clients and the two relay loops

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stoatcord_core::{
    Direction, EchoGuard, InboundMessage, PairTable, Platform, Relay, RelayLimits, RelayStats,
    TargetRegistry, run_relay_loop,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Trait that both platform adapters implement
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Connect and start pushing "message created" events into `tx`.
    /// Implementations spawn their own long-running task and return.
    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()>;

    /// Which platform this adapter talks to
    fn platform(&self) -> Platform;

    /// Send targets this adapter populates once its client is ready
    fn targets(&self) -> TargetRegistry;

    /// Identity this adapter posts under, for echo detection
    fn echo_guard(&self) -> EchoGuard;
}

/// Owns both platform clients and builds the relay for each direction
pub struct Bridge {
    pairs: Arc<PairTable>,
    clients: HashMap<Platform, Box<dyn PlatformClient>>,
    limits: HashMap<Direction, RelayLimits>,
    buffer_size: usize,
}

impl Bridge {
    /// Create a bridge whose inbound event queues hold `buffer_size` messages
    pub fn new(pairs: Arc<PairTable>, buffer_size: usize) -> Self {
        Self {
            pairs,
            clients: HashMap::new(),
            limits: HashMap::new(),
            buffer_size,
        }
    }

    /// Register a platform client. A second client for the same platform
    /// replaces the first.
    pub fn register(&mut self, client: Box<dyn PlatformClient>) {
        let platform = client.platform();
        if self.has_client(platform) {
            warn!("Replacing registered {} client", platform);
        }
        info!("Registering {} client", platform);
        self.clients.insert(platform, client);
    }

    /// Override the destination limits for one direction
    pub fn with_limits(mut self, direction: Direction, limits: RelayLimits) -> Self {
        self.limits.insert(direction, limits);
        self
    }

    pub fn has_client(&self, platform: Platform) -> bool {
        self.clients.contains_key(&platform)
    }

    /// Spawn both relay loops, then start both clients.
    ///
    /// The loops are running before any client connects, so no event is
    /// ever pushed into a queue nobody reads.
    pub async fn start(&self, cancel: CancellationToken) -> Result<RunningBridge> {
        let discord = self.client(Platform::Discord)?;
        let stoat = self.client(Platform::Stoat)?;

        let mut loops = JoinSet::new();
        let mut senders = Vec::with_capacity(2);

        for (source, destination) in [(discord, stoat), (stoat, discord)] {
            let direction = Direction::from_source(source.platform());
            let limits = self
                .limits
                .get(&direction)
                .copied()
                .unwrap_or_else(|| RelayLimits::for_destination(direction.destination()));
            let relay = Relay::new(
                direction,
                self.pairs.clone(),
                destination.targets(),
                source.echo_guard(),
            )
            .with_limits(limits);
            debug!(
                "{} limits: {} content chars, {} name chars",
                direction, limits.max_content_chars, limits.max_name_chars
            );

            let (tx, rx) = mpsc::channel(self.buffer_size);
            loops.spawn(run_relay_loop(Arc::new(relay), rx, cancel.clone()));
            senders.push((source, tx));
        }

        for (client, tx) in senders {
            let platform = client.platform();
            if let Err(e) = client.start(tx).await {
                error!("Failed to start {} client: {}", platform, e);
                cancel.cancel();
                return Err(anyhow!("Failed to start {} client: {}", platform, e));
            }
            info!("{} client started", platform);
        }

        Ok(RunningBridge { loops, cancel })
    }

    fn client(&self, platform: Platform) -> Result<&dyn PlatformClient> {
        self.clients
            .get(&platform)
            .map(|c| c.as_ref())
            .ok_or_else(|| anyhow!("No {} client registered", platform))
    }
}

/// Handle on the running relay loops
pub struct RunningBridge {
    loops: JoinSet<RelayStats>,
    cancel: CancellationToken,
}

impl RunningBridge {
    /// Stop taking new events and wait up to `grace` for in-flight sends.
    ///
    /// Returns the combined counters of the loops that finished in time.
    pub async fn shutdown(mut self, grace: Duration) -> RelayStats {
        self.cancel.cancel();
        let mut total = RelayStats::default();

        let drain = async {
            while let Some(joined) = self.loops.join_next().await {
                match joined {
                    Ok(stats) => {
                        total.forwarded += stats.forwarded;
                        total.dropped += stats.dropped;
                        total.failed += stats.failed;
                    }
                    Err(e) => error!("Relay loop panicked: {}", e),
                }
            }
        };

        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(
                "Relay loops did not stop within {:?}, abandoning in-flight sends",
                grace
            );
            self.loops.abort_all();
        }
        total
    }
}
