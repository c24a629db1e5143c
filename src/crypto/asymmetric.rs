//! Ephemeral RSA keypair used to wrap session keys during handshakes.
//!
//! Each handshake generates a fresh keypair; no key ever outlives the
//! handshake it served, so there is no identity to validate beyond holding
//! the private key. Public keys cross the wire as PKCS#1 DER blobs;
//! wrapped key material crosses as a base64 line.
//!
//! Generation is the expensive step, so it happens once up front and never
//! inside a locked region.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::error::{ChannelError, Result};

/// Default modulus size in bits.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// An imported peer public key, usable for [`AsymmetricHelper::encrypt_to_peer`].
pub struct PeerPublicKey(RsaPublicKey);

/// A fresh RSA keypair plus the operations the handshake needs from it.
pub struct AsymmetricHelper {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl AsymmetricHelper {
    /// Generate a new keypair. Expensive; done once per handshake.
    ///
    /// # Errors
    /// Fails only when the RNG or prime search fails, which indicates a
    /// broken environment.
    pub fn generate(bits: usize) -> Result<Self> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| ChannelError::Asymmetric(format!("key generation failed: {e}")))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    /// Export the public key as a PKCS#1 DER blob for the peer.
    pub fn public_key_blob(&self) -> Result<Vec<u8>> {
        let doc = self
            .public
            .to_pkcs1_der()
            .map_err(|e| ChannelError::Asymmetric(format!("public key export failed: {e}")))?;
        Ok(doc.as_bytes().to_vec())
    }

    /// Import a peer's public key blob.
    ///
    /// # Errors
    /// Returns `ChannelError::MalformedKeyBlob` when the blob is not valid
    /// PKCS#1 DER.
    pub fn import_peer(blob: &[u8]) -> Result<PeerPublicKey> {
        let key = RsaPublicKey::from_pkcs1_der(blob)
            .map_err(|e| ChannelError::MalformedKeyBlob(e.to_string()))?;
        Ok(PeerPublicKey(key))
    }

    /// Encrypt a short plaintext to the peer's public key, returning base64.
    ///
    /// # Errors
    /// Fails when the plaintext exceeds what the peer's modulus can carry
    /// under OAEP.
    pub fn encrypt_to_peer(peer: &PeerPublicKey, plaintext: &[u8]) -> Result<String> {
        let ciphertext = peer
            .0
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
            .map_err(|e| ChannelError::Asymmetric(format!("encrypt failed: {e}")))?;
        Ok(BASE64.encode(ciphertext))
    }

    /// Decrypt a base64 envelope with the private key.
    ///
    /// # Errors
    /// Fails on invalid base64 or when the ciphertext was not produced for
    /// this keypair.
    pub fn decrypt_from_base64(&self, line: &str) -> Result<Vec<u8>> {
        let ciphertext = BASE64.decode(line.trim())?;
        self.private
            .decrypt(Oaep::new::<Sha256>(), &ciphertext)
            .map_err(|e| ChannelError::Asymmetric(format!("decrypt failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Small modulus keeps test keygen fast; production sizes are configured
    // through ConnectionConfig.
    const TEST_BITS: usize = 1024;

    #[test]
    fn test_wrap_unwrap_round_trip() {
        let alice = AsymmetricHelper::generate(TEST_BITS).unwrap();
        let bob = AsymmetricHelper::generate(TEST_BITS).unwrap();

        let bob_for_alice = AsymmetricHelper::import_peer(&bob.public_key_blob().unwrap()).unwrap();
        let secret = b"forty-four secret bytes of key material.....";
        let line = AsymmetricHelper::encrypt_to_peer(&bob_for_alice, secret).unwrap();

        // Only bob can open it.
        assert_eq!(bob.decrypt_from_base64(&line).unwrap(), secret);
        assert!(alice.decrypt_from_base64(&line).is_err());
    }

    #[test]
    fn test_malformed_blob_rejected() {
        assert!(matches!(
            AsymmetricHelper::import_peer(&[0x00, 0x01, 0x02]),
            Err(ChannelError::MalformedKeyBlob(_))
        ));
    }

    #[test]
    fn test_oversize_plaintext_rejected() {
        let helper = AsymmetricHelper::generate(TEST_BITS).unwrap();
        let peer = AsymmetricHelper::import_peer(&helper.public_key_blob().unwrap()).unwrap();
        // 1024-bit OAEP-SHA256 carries at most 62 bytes.
        let oversize = vec![0u8; 512];
        assert!(AsymmetricHelper::encrypt_to_peer(&peer, &oversize).is_err());
    }

    #[test]
    fn test_bad_base64_rejected() {
        let helper = AsymmetricHelper::generate(TEST_BITS).unwrap();
        assert!(helper.decrypt_from_base64("not-base64!!!").is_err());
    }

    #[test]
    fn test_crlf_trimmed() {
        let a = AsymmetricHelper::generate(TEST_BITS).unwrap();
        let peer = AsymmetricHelper::import_peer(&a.public_key_blob().unwrap()).unwrap();
        let line = AsymmetricHelper::encrypt_to_peer(&peer, b"x").unwrap();
        assert_eq!(a.decrypt_from_base64(&format!("{line}\r")).unwrap(), b"x");
    }
}
