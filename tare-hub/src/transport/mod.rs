pub mod mock;

#[cfg(feature = "bluez")]
pub mod bluez;

use async_trait::async_trait;
use tare_core::BoardAddress;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to open {channel} channel to {address}: {source}")]
    Connect {
        address: BoardAddress,
        channel: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid board address '{0}'")]
    InvalidAddress(BoardAddress),

    #[error("channel closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One direction of the link to a board. Frames are message oriented: each
/// `send` is one frame and each `recv` yields at most one frame.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    async fn send(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Receive the next frame into `buf`, truncating it if `buf` is shorter.
    ///
    /// Returns `Ok(0)` once the board has closed the channel.
    async fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Close the channel. Closing twice is not an error.
    async fn close(&self) -> Result<(), TransportError>;
}

/// The two channels every board connection consists of.
pub struct ChannelPair<C> {
    /// Host -> board commands.
    pub control: C,
    /// Board -> host reports.
    pub report: C,
}

/// Opens connections to boards by address.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Channel: Channel;

    async fn connect(
        &self,
        address: &BoardAddress,
    ) -> Result<ChannelPair<Self::Channel>, TransportError>;
}
