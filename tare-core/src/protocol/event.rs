use super::{
    MAX_CHUNK_LEN, ParseResult, ProtocolError, READ_RETURN, REPORT_BALANCE, REPORT_BUTTONS,
    SENSOR_COUNT, STATUS,
};

/// A decoded device -> host frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The board re-announced itself. It drops back to its default report
    /// mode when it does, so the host has to request reports again.
    Status { buttons: u16, flags: u8, battery: u8 },
    Buttons { buttons: u16 },
    /// Acknowledgement of a memory read, carrying up to 16 bytes.
    CalibrationChunk(ReadChunk),
    /// Raw readings of the four load sensors, in board order
    /// (top right, bottom right, top left, bottom left).
    Report { sensors: [u16; SENSOR_COUNT] },
    Unknown { type_byte: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadChunk {
    /// Low 16 bits of the memory address of the first byte.
    pub address: u16,
    /// Number of valid bytes in `data`, 1..=16.
    pub length: u8,
    /// Error nibble reported by the board; zero on success.
    pub error: u8,
    data: [u8; MAX_CHUNK_LEN],
}

impl ReadChunk {
    pub fn new(address: u16, payload: &[u8]) -> ParseResult<Self> {
        if payload.is_empty() {
            return Err(ProtocolError::EmptyPayload);
        }
        if payload.len() > MAX_CHUNK_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_CHUNK_LEN,
            });
        }

        let mut data = [0u8; MAX_CHUNK_LEN];
        data[..payload.len()].copy_from_slice(payload);

        Ok(Self {
            address,
            length: payload.len() as u8,
            error: 0,
            data,
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.length as usize]
    }
}

fn require(bytes: &[u8], needed: usize) -> ParseResult<()> {
    if bytes.len() < needed {
        return Err(ProtocolError::InsufficientData {
            needed,
            available: bytes.len(),
        });
    }
    Ok(())
}

/// Decode one frame read from the report channel.
///
/// The packet type lives in the second byte. Unrecognised types decode to
/// [`Event::Unknown`]; only frames too short for their own layout fail.
pub fn parse_frame(bytes: &[u8]) -> ParseResult<Event> {
    require(bytes, 2)?;

    match bytes[1] {
        STATUS => {
            require(bytes, 8)?;
            Ok(Event::Status {
                buttons: u16::from_be_bytes([bytes[2], bytes[3]]),
                flags: bytes[4],
                battery: bytes[7],
            })
        }
        REPORT_BUTTONS => {
            require(bytes, 4)?;
            Ok(Event::Buttons {
                buttons: u16::from_be_bytes([bytes[2], bytes[3]]),
            })
        }
        READ_RETURN => {
            require(bytes, 7)?;
            let length = (bytes[4] >> 4) + 1;
            require(bytes, 7 + length as usize)?;

            let mut data = [0u8; MAX_CHUNK_LEN];
            data[..length as usize].copy_from_slice(&bytes[7..7 + length as usize]);

            Ok(Event::CalibrationChunk(ReadChunk {
                address: u16::from_be_bytes([bytes[5], bytes[6]]),
                length,
                error: bytes[4] & 0x0F,
                data,
            }))
        }
        REPORT_BALANCE => {
            require(bytes, 4 + 2 * SENSOR_COUNT)?;
            let mut sensors = [0u16; SENSOR_COUNT];
            for (i, sensor) in sensors.iter_mut().enumerate() {
                let at = 4 + 2 * i;
                *sensor = u16::from_be_bytes([bytes[at], bytes[at + 1]]);
            }
            Ok(Event::Report { sensors })
        }
        other => Ok(Event::Unknown { type_byte: other }),
    }
}
