//! # Core Protocol Components
//!
//! Low-level packet handling and wire framing.
//!
//! This module provides the foundation for the channel: the packet envelope,
//! its binary wire form, and the length-prefixed frame codec used on the
//! socket.
//!
//! ## Components
//! - **Packet**: Typed envelope `{type_id, data}` with a tag-based binary form
//! - **Codec**: Blocking frame reader/writer over any byte stream
//!
//! ## Wire Format
//! ```text
//! [Length: LE32(4)] [Ciphertext(N)]
//! ```
//! The plaintext of each frame is a serialized [`packet::Packet`].

pub mod codec;
pub mod packet;
