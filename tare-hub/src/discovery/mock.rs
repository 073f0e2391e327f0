use std::convert::Infallible;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Candidate, Discovery};

/// Reports a fixed set of devices on every poll, the way a repeated inquiry
/// scan keeps seeing the same neighbours.
pub struct MockDiscovery {
    candidates: Vec<Candidate>,
    poll_interval: Duration,
}

impl MockDiscovery {
    pub fn new(candidates: impl IntoIterator<Item = Candidate>, poll_interval: Duration) -> Self {
        Self {
            candidates: candidates.into_iter().collect(),
            poll_interval,
        }
    }
}

#[async_trait]
impl Discovery for MockDiscovery {
    type Error = Infallible;

    async fn start(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Candidate>, Infallible> {
        let (tx, rx) = mpsc::channel(self.candidates.len().max(1));
        let candidates = self.candidates.clone();
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            loop {
                for candidate in &candidates {
                    if tx.send(candidate.clone()).await.is_err() {
                        return;
                    }
                }
                debug!(devices = candidates.len(), "mock scan finished");

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        });

        Ok(rx)
    }
}
