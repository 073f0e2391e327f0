pub mod calibration;
pub mod mass;
pub mod protocol;

use std::fmt;

use serde::{Deserialize, Serialize};

use protocol::SENSOR_COUNT;

type BoxStr = Box<str>;

/// Transport address of a board, e.g. `00:1F:C5:12:34:56`.
///
/// Ordering is plain string ordering; feeds list boards in that order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoardAddress(BoxStr);

impl BoardAddress {
    pub fn new(address: impl Into<BoxStr>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BoardAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BoardAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for BoardAddress {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Lifecycle of a board session. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoardStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// One board's entry in the live feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardMass {
    pub addr: BoardAddress,
    pub mass: f64,
}

/// A single frame of the live feed: every connected board and their sum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedFrame {
    pub total: f64,
    pub boards: Vec<BoardMass>,
}

impl FeedFrame {
    /// Build a frame from `(address, total mass)` pairs. Boards end up sorted
    /// by address and `total` is the sum of their masses.
    pub fn from_snapshot(snapshot: impl IntoIterator<Item = (BoardAddress, f64)>) -> Self {
        let mut boards: Vec<BoardMass> = snapshot
            .into_iter()
            .map(|(addr, mass)| BoardMass { addr, mass })
            .collect();
        boards.sort_by(|a, b| a.addr.cmp(&b.addr));

        Self {
            total: boards.iter().fold(0.0, |sum, b| sum + b.mass),
            boards,
        }
    }
}

/// Everything known about one board, as exposed by the HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardDetails {
    pub address: BoardAddress,
    pub status: BoardStatus,
    /// Whether the full calibration block has been received.
    pub calibrated: bool,
    /// Calibration bytes received so far.
    pub calibration_received: usize,
    /// Latest raw sensor readings.
    pub sensors: [u16; SENSOR_COUNT],
    /// Latest per-sensor mass in kilograms.
    pub mass: [f64; SENSOR_COUNT],
    pub total_mass: f64,
    /// Raw battery level from the last status report.
    pub battery: Option<u8>,
    pub connected_at: Option<jiff::Timestamp>,
    pub last_report_at: Option<jiff::Timestamp>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_frame_serialises_sorted_with_total() {
        let frame = FeedFrame::from_snapshot(vec![
            (BoardAddress::from("BB"), 10.0),
            (BoardAddress::from("AA"), 34.0),
        ]);

        assert_eq!(frame.total, 44.0);
        assert_eq!(
            serde_json::to_string(&frame).unwrap(),
            r#"{"total":44.0,"boards":[{"addr":"AA","mass":34.0},{"addr":"BB","mass":10.0}]}"#
        );
    }

    #[test]
    fn empty_feed_frame() {
        let frame = FeedFrame::from_snapshot(Vec::new());
        assert_eq!(
            serde_json::to_string(&frame).unwrap(),
            r#"{"total":0.0,"boards":[]}"#
        );
    }

    #[test]
    fn addresses_order_as_strings() {
        let mut addrs = vec![
            BoardAddress::from("00:1F:C5:00:00:02"),
            BoardAddress::from("00:1F:C5:00:00:01"),
            BoardAddress::from("00:1E:35:FF:00:00"),
        ];
        addrs.sort();
        assert_eq!(addrs[0].as_str(), "00:1E:35:FF:00:00");
        assert_eq!(addrs[2].to_string(), "00:1F:C5:00:00:02");
    }

    #[test]
    fn status_serialises_lowercase() {
        assert_eq!(
            serde_json::to_string(&BoardStatus::Connected).unwrap(),
            r#""connected""#
        );
    }
}
