use thiserror::Error;

pub type ParseResult<T> = core::result::Result<T, ProtocolError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame too short: needed {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("empty payload")]
    EmptyPayload,
}
