//! Calibration block read from the board at connection time.
//!
//! The block holds, for each of the four sensors, the raw reading at 0 kg,
//! 17 kg and 34 kg. It arrives in chunks, so every byte carries a
//! "still pending" bit; the block is only usable once all bits are clear.

use thiserror::Error;

use crate::protocol::{CALIBRATION_BASE, CALIBRATION_LEN, SENSOR_COUNT};

const ALL_PENDING: u32 = (1 << CALIBRATION_LEN) - 1;

// byte offsets of each load point group inside the block
const ZERO_OFFSET: usize = 0;
const HALF_OFFSET: usize = 2 * SENSOR_COUNT;
const FULL_OFFSET: usize = 4 * SENSOR_COUNT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CalibrationError {
    #[error("chunk at {address:#06x} (+{length}) lies outside the calibration block")]
    OutOfRange { address: u16, length: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Calibration {
    data: [u8; CALIBRATION_LEN],
    pending: u32,
}

impl Calibration {
    pub fn new() -> Self {
        Self {
            data: [0; CALIBRATION_LEN],
            pending: ALL_PENDING,
        }
    }

    /// A fully received block.
    pub fn from_bytes(data: [u8; CALIBRATION_LEN]) -> Self {
        Self { data, pending: 0 }
    }

    /// Copy a read acknowledgement into the block and clear its pending bits.
    ///
    /// The whole chunk has to fall inside the block; anything else is
    /// rejected without touching the store.
    pub fn apply_chunk(&mut self, address: u16, payload: &[u8]) -> Result<(), CalibrationError> {
        let out_of_range = CalibrationError::OutOfRange {
            address,
            length: payload.len(),
        };

        let offset = address
            .checked_sub(CALIBRATION_BASE)
            .ok_or(out_of_range)? as usize;
        if offset + payload.len() > CALIBRATION_LEN {
            return Err(out_of_range);
        }

        self.data[offset..offset + payload.len()].copy_from_slice(payload);
        for i in offset..offset + payload.len() {
            self.pending &= !(1 << i);
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.pending == 0
    }

    /// Number of bytes received so far.
    pub fn received(&self) -> usize {
        CALIBRATION_LEN - self.pending.count_ones() as usize
    }

    /// The decoded load points, once the block is complete.
    pub fn points(&self) -> Option<CalibrationPoints> {
        if !self.is_complete() {
            return None;
        }

        let word = |at: usize| u16::from_be_bytes([self.data[at], self.data[at + 1]]);
        let axes = std::array::from_fn(|i| AxisPoints {
            zero: word(ZERO_OFFSET + 2 * i),
            half: word(HALF_OFFSET + 2 * i),
            full: word(FULL_OFFSET + 2 * i),
        });

        Some(CalibrationPoints { axes })
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self::new()
    }
}

/// Raw sensor readings at the three reference loads of one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisPoints {
    pub zero: u16,
    pub half: u16,
    pub full: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationPoints {
    pub axes: [AxisPoints; SENSOR_COUNT],
}

impl CalibrationPoints {
    /// Lay the points out the way the board stores them.
    pub fn to_bytes(&self) -> [u8; CALIBRATION_LEN] {
        let mut data = [0u8; CALIBRATION_LEN];
        for (i, axis) in self.axes.iter().enumerate() {
            data[ZERO_OFFSET + 2 * i..][..2].copy_from_slice(&axis.zero.to_be_bytes());
            data[HALF_OFFSET + 2 * i..][..2].copy_from_slice(&axis.half.to_be_bytes());
            data[FULL_OFFSET + 2 * i..][..2].copy_from_slice(&axis.full.to_be_bytes());
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_points() -> CalibrationPoints {
        CalibrationPoints {
            axes: [
                AxisPoints { zero: 100, half: 200, full: 300 },
                AxisPoints { zero: 1000, half: 2700, full: 4400 },
                AxisPoints { zero: 0x1234, half: 0x2345, full: 0x3456 },
                AxisPoints { zero: 7, half: 8, full: 9 },
            ],
        }
    }

    #[test]
    fn new_block_is_pending() {
        let cal = Calibration::new();
        assert!(!cal.is_complete());
        assert_eq!(cal.received(), 0);
        assert!(cal.points().is_none());
    }

    #[test]
    fn two_chunks_complete_the_block() {
        let bytes = sample_points().to_bytes();
        let mut cal = Calibration::new();

        cal.apply_chunk(CALIBRATION_BASE, &bytes[..16]).unwrap();
        assert!(!cal.is_complete());
        assert_eq!(cal.received(), 16);

        cal.apply_chunk(CALIBRATION_BASE + 16, &bytes[16..]).unwrap();
        assert!(cal.is_complete());
        assert_eq!(cal.points(), Some(sample_points()));
    }

    #[test]
    fn chunk_order_does_not_matter() {
        let bytes = sample_points().to_bytes();
        let mut cal = Calibration::new();
        cal.apply_chunk(CALIBRATION_BASE + 16, &bytes[16..]).unwrap();
        cal.apply_chunk(CALIBRATION_BASE, &bytes[..16]).unwrap();
        assert_eq!(cal, Calibration::from_bytes(bytes));
    }

    #[test]
    fn applying_a_chunk_twice_is_idempotent() {
        let bytes = sample_points().to_bytes();
        let mut once = Calibration::new();
        once.apply_chunk(CALIBRATION_BASE + 4, &bytes[4..12]).unwrap();

        let mut twice = once.clone();
        twice.apply_chunk(CALIBRATION_BASE + 4, &bytes[4..12]).unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.received(), 8);
    }

    #[test]
    fn out_of_range_chunks_are_rejected() {
        let mut cal = Calibration::new();

        assert_eq!(
            cal.apply_chunk(CALIBRATION_BASE - 1, &[0; 4]),
            Err(CalibrationError::OutOfRange {
                address: CALIBRATION_BASE - 1,
                length: 4
            })
        );
        assert!(cal.apply_chunk(CALIBRATION_BASE + 16, &[0; 9]).is_err());
        assert!(cal.apply_chunk(0x0000, &[0; 16]).is_err());
        assert!(cal.apply_chunk(0xFFF0, &[0; 16]).is_err());
        assert_eq!(cal, Calibration::new());
    }

    #[test]
    fn axis_layout_matches_board_memory() {
        let bytes = sample_points().to_bytes();
        // zero point of axis 1 at bytes 2..4, half of axis 0 at 8..10, full of axis 3 at 22..24
        assert_eq!(&bytes[2..4], &1000u16.to_be_bytes());
        assert_eq!(&bytes[8..10], &200u16.to_be_bytes());
        assert_eq!(&bytes[22..24], &9u16.to_be_bytes());
    }
}
