//! Device discovery through the BlueZ daemon.

use std::time::Duration;

use async_trait::async_trait;
use bluer::{Adapter, AdapterEvent, Address};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Candidate, Discovery};

const CANDIDATE_BUFFER: usize = 32;

pub struct BluezDiscovery {
    adapter: Option<String>,
    /// How often devices already known to the adapter are offered again.
    rescan_interval: Duration,
}

impl BluezDiscovery {
    pub fn new(adapter: Option<String>, rescan_interval: Duration) -> Self {
        Self {
            adapter,
            rescan_interval,
        }
    }
}

async fn candidate(adapter: &Adapter, address: Address) -> Candidate {
    let name = match adapter.device(address) {
        Ok(device) => device.name().await.ok().flatten(),
        Err(_) => None,
    };
    Candidate {
        address: address.to_string().into(),
        name,
    }
}

#[async_trait]
impl Discovery for BluezDiscovery {
    type Error = bluer::Error;

    async fn start(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Candidate>, bluer::Error> {
        let session = bluer::Session::new().await?;
        let adapter = match &self.adapter {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        adapter.set_powered(true).await?;
        info!(adapter = adapter.name(), "Scanning for balance boards");

        let events = adapter.discover_devices().await?;
        let rescan_interval = self.rescan_interval;
        let (tx, rx) = mpsc::channel(CANDIDATE_BUFFER);

        tokio::spawn(async move {
            // the session must outlive the scan
            let _session = session;
            let mut events = Box::pin(events);
            let mut rescan = tokio::time::interval(rescan_interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,

                    event = events.next() => match event {
                        Some(AdapterEvent::DeviceAdded(address)) => {
                            if tx.send(candidate(&adapter, address).await).await.is_err() {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => {
                            warn!("Adapter stopped reporting devices");
                            break;
                        }
                    },

                    _ = rescan.tick() => {
                        let known = match adapter.device_addresses().await {
                            Ok(known) => known,
                            Err(e) => {
                                warn!(error = %e, "Could not list known devices");
                                continue;
                            }
                        };
                        for address in known {
                            if tx.send(candidate(&adapter, address).await).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}
