//! L2CAP transport through BlueZ.

use std::io;
use std::net::Shutdown;

use async_trait::async_trait;
use bluer::l2cap::{SeqPacket, SocketAddr};
use bluer::{Address, AddressType};
use tare_core::BoardAddress;
use tare_core::protocol::{CONTROL_PSM, REPORT_PSM};
use tracing::{debug, warn};

use super::{Channel, ChannelPair, Transport, TransportError};

pub struct BluezChannel {
    socket: SeqPacket,
}

#[async_trait]
impl Channel for BluezChannel {
    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        self.socket.send(frame).await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        Ok(self.socket.recv(buf).await?)
    }

    async fn close(&self) -> Result<(), TransportError> {
        match self.socket.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Default)]
pub struct BluezTransport;

impl BluezTransport {
    pub fn new() -> Self {
        Self
    }
}

async fn open(
    address: &BoardAddress,
    target: Address,
    psm: u16,
    channel: &'static str,
) -> Result<BluezChannel, TransportError> {
    let socket = SeqPacket::connect(SocketAddr::new(target, AddressType::BrEdr, psm))
        .await
        .map_err(|source| TransportError::Connect {
            address: address.clone(),
            channel,
            source,
        })?;
    debug!(%address, psm, channel, "l2cap channel open");
    Ok(BluezChannel { socket })
}

#[async_trait]
impl Transport for BluezTransport {
    type Channel = BluezChannel;

    async fn connect(
        &self,
        address: &BoardAddress,
    ) -> Result<ChannelPair<BluezChannel>, TransportError> {
        let target: Address = address
            .as_str()
            .parse()
            .map_err(|_| TransportError::InvalidAddress(address.clone()))?;

        let control = open(address, target, CONTROL_PSM, "control").await?;
        let report = match open(address, target, REPORT_PSM, "report").await {
            Ok(report) => report,
            Err(e) => {
                if let Err(close) = control.close().await {
                    warn!(%address, error = %close, "Could not close control channel");
                }
                return Err(e);
            }
        };

        Ok(ChannelPair { control, report })
    }
}
