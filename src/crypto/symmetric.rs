//! Stateful symmetric stream cipher for one direction of traffic.
//!
//! Each direction of a connection owns one [`SymmetricProvider`]; every byte
//! encrypted or decrypted advances its keystream, so both ends must process
//! exactly the same byte sequence in the same order. [`reset`] rewinds to
//! the state set at installation. Key and nonce travel between peers only
//! inside asymmetric envelopes, as a [`KeyMaterial`] message.
//!
//! [`reset`]: SymmetricProvider::reset

use std::fmt;

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use prost::Message;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::{ChannelError, Result};

/// Key length in bytes.
pub const KEY_BYTES: usize = 32;

/// Nonce length in bytes.
pub const NONCE_BYTES: usize = 12;

/// Serializable key + nonce of one provider.
///
/// Only ever transmitted inside an asymmetric envelope during a handshake.
#[derive(Clone, PartialEq, Message)]
pub struct KeyMaterial {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub nonce: Vec<u8>,
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.key.zeroize();
        self.nonce.zeroize();
    }
}

/// The two directions exchanged during a full handshake.
#[derive(Clone, PartialEq, Message)]
pub struct KeyMaterialPair {
    /// The sender's outbound direction.
    #[prost(message, optional, tag = "1")]
    pub outbound: Option<KeyMaterial>,
    /// The sender's inbound direction.
    #[prost(message, optional, tag = "2")]
    pub inbound: Option<KeyMaterial>,
}

/// One direction's session key: a ChaCha20 keystream plus the material to
/// rebuild it.
pub struct SymmetricProvider {
    key: [u8; KEY_BYTES],
    nonce: [u8; NONCE_BYTES],
    cipher: ChaCha20,
}

impl SymmetricProvider {
    /// Create a provider with fresh random key material.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_BYTES];
        let mut nonce = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut nonce);
        Self::from_parts(key, nonce)
    }

    /// Rebuild a provider from transmitted key material.
    ///
    /// # Errors
    /// Returns `ChannelError::MalformedKeyMaterial` when the lengths are
    /// wrong.
    pub fn from_material(material: &KeyMaterial) -> Result<Self> {
        let key: [u8; KEY_BYTES] = material
            .key
            .as_slice()
            .try_into()
            .map_err(|_| ChannelError::MalformedKeyMaterial)?;
        let nonce: [u8; NONCE_BYTES] = material
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| ChannelError::MalformedKeyMaterial)?;
        Ok(Self::from_parts(key, nonce))
    }

    fn from_parts(key: [u8; KEY_BYTES], nonce: [u8; NONCE_BYTES]) -> Self {
        let cipher = ChaCha20::new(&key.into(), &nonce.into());
        Self { key, nonce, cipher }
    }

    /// Export key + nonce for transport inside an asymmetric envelope.
    pub fn key_material(&self) -> KeyMaterial {
        KeyMaterial {
            key: self.key.to_vec(),
            nonce: self.nonce.to_vec(),
        }
    }

    /// Encrypt, advancing the keystream. Output length equals input length.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let mut buf = plaintext.to_vec();
        self.cipher.apply_keystream(&mut buf);
        buf
    }

    /// Decrypt, advancing the keystream. Output length equals input length.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Vec<u8> {
        let mut buf = ciphertext.to_vec();
        self.cipher.apply_keystream(&mut buf);
        buf
    }

    /// Rewind the keystream to the state set at installation.
    pub fn reset(&mut self) {
        self.cipher = ChaCha20::new(&self.key.into(), &self.nonce.into());
    }
}

impl Drop for SymmetricProvider {
    fn drop(&mut self) {
        self.key.zeroize();
        self.nonce.zeroize();
    }
}

impl fmt::Debug for SymmetricProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricProvider").finish_non_exhaustive()
    }
}
