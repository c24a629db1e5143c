//! # Error Types
//!
//! Error handling for the encrypted channel.
//!
//! This module defines all error variants that can occur during channel
//! operations, from low-level I/O failures to handshake protocol violations.
//!
//! ## Error Categories
//! - **I/O Errors**: Socket read/write failures, timeouts, underflows
//! - **Protocol Errors**: Malformed frames, handshake mismatches, rekey failures
//! - **Cryptographic Errors**: Asymmetric wrap/unwrap and key-material failures
//! - **Usage Errors**: Operations attempted on a closed connection
//!
//! All errors implement `std::error::Error` for interoperability.

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
/// Static strings are borrowed, avoiding heap allocations for common cases.
pub mod constants {
    /// Frame codec errors
    pub const ERR_FRAME_UNDERFLOW: &str = "Stream ended before frame was complete";
    pub const ERR_LINE_TOO_LONG: &str = "Handshake line exceeds maximum length";

    /// Handshake errors
    pub const ERR_HANDSHAKE_FAILED: &str = "Handshake failed";
    pub const ERR_UNEXPECTED_PACKET: &str = "Unexpected packet type during handshake";
    pub const ERR_KEY_BLOB_MALFORMED: &str = "Peer public key blob is malformed";
    pub const ERR_KEY_MATERIAL_MALFORMED: &str = "Session key material is malformed";
    pub const ERR_REKEY_TIMED_OUT: &str = "Peer failed to complete requested rekey in time";

    /// Connection errors
    pub const ERR_NOT_CONNECTED: &str = "Connection is not established";
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_TOO_MANY_READ_ERRORS: &str = "Too many sequential read errors";
}

/// The primary error type for all channel operations.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Stream ended before frame was complete: got {got} of {expected} bytes")]
    FrameUnderflow { got: usize, expected: usize },

    #[error("Packet decode error: {0}")]
    PacketDecode(#[from] prost::DecodeError),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Unexpected packet type 0x{0:08X} during handshake")]
    UnexpectedPacket(u32),

    #[error("Peer public key blob is malformed: {0}")]
    MalformedKeyBlob(String),

    #[error("Session key material is malformed")]
    MalformedKeyMaterial,

    #[error("Asymmetric operation failed: {0}")]
    Asymmetric(String),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Connection is not established")]
    NotConnected,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Operation timed out")]
    Timeout,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ChannelError {
    /// Whether this error maps to a transient read timeout rather than a
    /// broken stream. The reader loop treats these as another iteration.
    pub fn is_timeout(&self) -> bool {
        match self {
            ChannelError::Timeout => true,
            ChannelError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// Type alias for Results using ChannelError
pub type Result<T> = std::result::Result<T, ChannelError>;
