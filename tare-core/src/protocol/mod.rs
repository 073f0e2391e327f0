//! Wire protocol spoken by the balance board.
//!
//! Every frame starts with a direction marker followed by a packet type
//! byte. Outgoing frames are built by the `build_*` functions, incoming
//! frames are decoded by [`parse_frame`].

mod command;
mod error;
mod event;

pub use command::{build_read, build_set_light, build_set_report_mode, build_write};
pub use error::{ParseResult, ProtocolError};
pub use event::{Event, ReadChunk, parse_frame};

/// Marker prefixed to every host -> device frame.
pub const OUTPUT: u8 = 0xA2;
/// Marker prefixed to every device -> host frame.
pub const INPUT: u8 = 0xA1;

// host -> device packet types
pub const SET_LIGHT: u8 = 0x11;
pub const SET_REPORT_MODE: u8 = 0x12;
pub const WRITE_MEMORY: u8 = 0x16;
pub const READ_MEMORY: u8 = 0x17;

// device -> host packet types
pub const STATUS: u8 = 0x20;
pub const READ_RETURN: u8 = 0x21;
pub const REPORT_BUTTONS: u8 = 0x30;
/// Core buttons plus eight extension bytes; carries the four load sensors.
pub const REPORT_BALANCE: u8 = 0x32;

pub const LIGHT_ON: u8 = 0x10;
pub const REPORT_CONTINUOUS: u8 = 0x04;

/// Device memory location of the calibration block (register space flag + 24-bit address).
pub const CALIBRATION_LOCATION: [u8; 4] = [0x04, 0xA4, 0x00, 0x24];
/// Size of the calibration block in bytes: three load points, four axes, two bytes each.
pub const CALIBRATION_LEN: usize = 24;
/// Address of the first calibration byte as reported by read acknowledgements.
pub const CALIBRATION_BASE: u16 =
    u16::from_be_bytes([CALIBRATION_LOCATION[2], CALIBRATION_LOCATION[3]]);

/// Largest payload a single read acknowledgement carries.
pub const MAX_CHUNK_LEN: usize = 16;
/// Largest frame the board ever sends.
pub const MAX_FRAME_LEN: usize = 25;
/// Largest payload accepted by [`build_write`].
pub const MAX_WRITE_LEN: usize = u8::MAX as usize;

/// L2CAP PSM of the control (host -> device) channel.
pub const CONTROL_PSM: u16 = 0x11;
/// L2CAP PSM of the report (device -> host) channel.
pub const REPORT_PSM: u16 = 0x13;

/// Name the board advertises during discovery.
pub const DEVICE_NAME: &str = "Nintendo RVL-WBC-01";

/// Number of load sensors on a board.
pub const SENSOR_COUNT: usize = 4;
