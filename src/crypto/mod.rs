//! # Cryptographic Providers
//!
//! Symmetric and asymmetric primitives behind the channel.
//!
//! ## Components
//! - **Symmetric**: ChaCha20 keystream state for frame encryption. Length
//!   preserving, stateful, resettable — the session key of one direction.
//! - **Asymmetric**: RSA-OAEP keypair used only during handshakes to wrap
//!   symmetric key material; transported as base64 text.
//!
//! ## Security
//! - Cryptographically secure RNG (`OsRng`) for all key generation
//! - Key bytes zeroed on drop (`zeroize`)
//! - Frames carry no authentication tag; corruption surfaces as packets
//!   that fail to decode, which the connection counts toward its error cap

pub mod asymmetric;
pub mod symmetric;
