pub mod mock;

#[cfg(feature = "bluez")]
pub mod bluez;

use std::time::Duration;

use async_trait::async_trait;
use tare_core::BoardAddress;
use tare_core::protocol::DEVICE_NAME;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, trace, warn};

use crate::registry::BoardRegistry;
use crate::transport::Transport;

/// A device seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub address: BoardAddress,
    /// Advertised name, when the device reported one.
    pub name: Option<String>,
}

impl Candidate {
    pub fn new(address: impl Into<BoardAddress>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: Some(name.into()),
        }
    }

    /// A candidate advertising the balance board name.
    pub fn board(address: impl Into<BoardAddress>) -> Self {
        Self::new(address, DEVICE_NAME)
    }

    pub fn is_board(&self) -> bool {
        self.name.as_deref() == Some(DEVICE_NAME)
    }
}

/// A source of nearby devices. The same device may be reported many times.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn start(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Candidate>, Self::Error>;
}

/// Connect every new balance board that discovery reports and periodically
/// drop sessions that have ended.
///
/// Runs until `cancel` fires or the discovery source closes, then waits for
/// the connects it started.
#[instrument(name = "discovery", skip_all)]
pub async fn run_discovery_consumer<T: Transport>(
    mut candidates: mpsc::Receiver<Candidate>,
    registry: BoardRegistry<T>,
    reap_interval: Duration,
    cancel: CancellationToken,
) {
    let mut reaper = interval(reap_interval);
    reaper.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let connects = TaskTracker::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            candidate = candidates.recv() => {
                let Some(candidate) = candidate else {
                    info!("Discovery source closed");
                    break;
                };

                if !candidate.is_board() {
                    trace!(
                        address = %candidate.address,
                        name = ?candidate.name,
                        "not a balance board"
                    );
                    continue;
                }
                if registry.contains(&candidate.address) {
                    continue;
                }

                info!(address = %candidate.address, "Discovered balance board");
                let registry = registry.clone();
                connects.spawn(async move {
                    let address = candidate.address;
                    if let Err(e) = registry.upsert(address.clone()).await {
                        warn!(%address, error = %e, "Could not connect board");
                    }
                });
            }

            _ = reaper.tick() => {
                let removed = registry.remove_disconnected().await;
                if removed > 0 {
                    debug!(removed, "reaped ended sessions");
                }
            }
        }
    }

    connects.close();
    if !connects.is_empty() {
        debug!(pending = connects.len(), "waiting for board connects");
    }
    connects.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionSettings;
    use crate::transport::mock::{MockTransport, SimulatedBoard};
    use tare_core::BoardStatus;

    #[test]
    fn only_the_board_name_matches() {
        assert!(Candidate::board("AA").is_board());
        assert!(!Candidate::new("AA", "Nintendo RVL-CNT-01").is_board());
        assert!(
            !Candidate {
                address: "AA".into(),
                name: None
            }
            .is_board()
        );
    }

    #[tokio::test]
    async fn connects_boards_once_and_ignores_others() {
        let transport = MockTransport::simulated([SimulatedBoard::new("AA", [1.0; 4])]);
        let registry = BoardRegistry::new(transport, SessionSettings::default());
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(8);

        let consumer = tokio::spawn(run_discovery_consumer(
            rx,
            registry.clone(),
            Duration::from_secs(60),
            cancel.clone(),
        ));

        tx.send(Candidate::board("AA")).await.unwrap();
        tx.send(Candidate::new("BB", "Nintendo RVL-CNT-01")).await.unwrap();
        tx.send(Candidate::board("AA")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while registry.snapshot().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(registry.len(), 1);
        assert!(!registry.contains(&"BB".into()));
        assert_eq!(registry.transport().connect_count(), 1);

        cancel.cancel();
        consumer.await.unwrap();
        registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_waits_for_started_connects() {
        let transport = MockTransport::simulated([SimulatedBoard::new("AA", [1.0; 4])]);
        let registry = BoardRegistry::new(transport, SessionSettings::default());
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(8);

        let consumer = tokio::spawn(run_discovery_consumer(
            rx,
            registry.clone(),
            Duration::from_secs(60),
            cancel.clone(),
        ));

        tx.send(Candidate::board("AA")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !registry.contains(&"AA".into()) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        consumer.await.unwrap();

        // the upsert finished before the consumer returned
        let session = registry.get(&"AA".into()).unwrap();
        assert_ne!(session.status(), BoardStatus::Connecting);

        registry.shutdown().await;
        assert_eq!(session.status(), BoardStatus::Disconnected);
    }
}
