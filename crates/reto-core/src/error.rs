//! Error types for the reto core

use thiserror::Error;

/// Errors produced while decoding a wire frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame ends before the field is complete")]
    TruncatedFrame,

    #[error("unexpected packet type {0:#010x}")]
    UnexpectedType(u32),

    #[error("invalid field: {0}")]
    InvalidField(&'static str),
}
