use super::{
    LIGHT_ON, MAX_WRITE_LEN, OUTPUT, ParseResult, ProtocolError, READ_MEMORY, REPORT_CONTINUOUS,
    SET_LIGHT, SET_REPORT_MODE, WRITE_MEMORY,
};

/// Request `length` bytes of device memory starting at `location`.
///
/// The board answers with one read acknowledgement per 16 bytes.
pub fn build_read(location: [u8; 4], length: u16) -> [u8; 8] {
    let mut frame = [0u8; 8];
    frame[0] = OUTPUT;
    frame[1] = READ_MEMORY;
    frame[2..6].copy_from_slice(&location);
    frame[6..8].copy_from_slice(&length.to_be_bytes());
    frame
}

/// Write `payload` to device memory at `location`.
pub fn build_write(location: [u8; 4], payload: &[u8]) -> ParseResult<Vec<u8>> {
    if payload.len() > MAX_WRITE_LEN {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_WRITE_LEN,
        });
    }

    let mut frame = Vec::with_capacity(7 + payload.len());
    frame.extend_from_slice(&[OUTPUT, WRITE_MEMORY]);
    frame.extend_from_slice(&location);
    frame.push(payload.len() as u8);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Select the report type the board sends, and whether it streams it
/// continuously or only on change.
pub fn build_set_report_mode(continuous: bool, mode: u8) -> [u8; 4] {
    let flags = if continuous { REPORT_CONTINUOUS } else { 0x00 };
    [OUTPUT, SET_REPORT_MODE, flags, mode]
}

pub fn build_set_light(on: bool) -> [u8; 3] {
    let state = if on { LIGHT_ON } else { 0x00 };
    [OUTPUT, SET_LIGHT, state]
}
