//! # secure-channel
//!
//! An encrypted point-to-point packet channel over TCP.
//!
//! The channel wraps an already-connected socket, performs a mutually
//! authenticated ephemeral key exchange (RSA-wrapped ChaCha20 session
//! keys), and then exchanges discrete length-prefixed packets encrypted in
//! sequence. Session keys age out and are renegotiated in place — a full
//! rekey regenerates both directions, a partial rekey rotates one — with a
//! deterministic tie-break when both ends start at once.
//!
//! ## Quick start
//!
//! ```no_run
//! use secure_channel::{Connection, ConfigFlag, Packet};
//!
//! # fn main() -> secure_channel::Result<()> {
//! let conn = Connection::connect_to("127.0.0.1:9000")?;
//! conn.set_flag(ConfigFlag::ManualRead);
//!
//! conn.send_packet(&Packet::new(1000, vec![1, 2, 3]))?;
//! let (reply, wire_bytes) = conn.read_packet()?;
//! println!("got packet {} ({wire_bytes} wire bytes)", reply.type_id);
//! conn.close();
//! # Ok(())
//! # }
//! ```
//!
//! Delivery is either pulled (`ConfigFlag::ManualRead` + [`Connection::read_packet`])
//! or pushed to a callback registered with
//! [`Connection::set_packet_received_callback`]; both paths are backed by
//! bounded queues whose backpressure stalls the reader thread and, through
//! it, the socket.
//!
//! ## Wire format
//!
//! ```text
//! [Length: LE32(4)] [Ciphertext(N)]     — one frame per packet
//! ```
//!
//! The plaintext of each frame is a tag-numbered binary [`Packet`]
//! `{type_id, data}`. Handshake traffic additionally uses plaintext
//! length-prefixed public-key blobs and base64 lines for the RSA envelopes.

pub mod config;
pub mod core;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod utils;

pub use crate::config::ConnectionConfig;
pub use crate::core::packet::{control, Packet};
pub use crate::crypto::asymmetric::AsymmetricHelper;
pub use crate::crypto::symmetric::SymmetricProvider;
pub use crate::error::{ChannelError, Result};
pub use crate::protocol::{
    ConfigFlag, Connection, ConnectionRole, DeliveryExecutor, DisconnectReason, InlineExecutor,
};
pub use crate::utils::metrics::ConnectionMetrics;
