//! Full and partial key-exchange protocols.
//!
//! Both protocols produce fresh [`SymmetricProvider`] state and leave the
//! byte stream positioned at a frame boundary. They are driven by the
//! connection while it holds the connection lock with `IsBlocking` set; this
//! module only speaks the wire protocol.
//!
//! ## Full handshake
//!
//! Used for the initial connection and full rekeys. Public-key blobs cross
//! in plaintext (length-prefixed, initiator first); key material crosses
//! only inside RSA envelopes encoded as base64 lines. Key installation
//! follows one rule on both sides, so the ends always agree:
//!
//! - the side that SENDS a pair installs `encryptor ← own outbound`,
//!   `decryptor ← own inbound`;
//! - the side that RECEIVES a pair installs `decryptor ← peer outbound`,
//!   `encryptor ← peer inbound`.
//!
//! The initiator sends its pair first and the responder mirrors, so the
//! responder's pair is the one both ends finish on.
//!
//! ## Partial handshake
//!
//! Fast rekey rotating only the initiator's inbound direction. Fresh
//! ephemeral keypairs are exchanged, then the responder wraps a single new
//! provider under the initiator's public key. Confirmation frames
//! (`END_PARTIAL_HANDSHAKE`) are exchanged by the connection under the
//! symmetric keys.

use std::io::{Read, Write};
use std::time::Instant;

use prost::Message;
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::core::codec::{FrameReader, FrameWriter, LENGTH_PREFIX_BYTES};
use crate::core::packet::{control, Packet};
use crate::crypto::asymmetric::{AsymmetricHelper, PeerPublicKey};
use crate::crypto::symmetric::{KeyMaterial, KeyMaterialPair, SymmetricProvider};
use crate::error::{ChannelError, Result};

/// Which end of the protocol this side plays.
///
/// The initial handshake predates any exchanged connection ids, so the role
/// is chosen by the caller: dialing out makes an initiator, wrapping an
/// accepted socket makes a responder. Rekeys derive the role from the
/// tie-break order instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Initiator,
    Responder,
}

/// Freshly installed per-direction session keys.
#[derive(Debug)]
pub struct SessionKeys {
    pub encryptor: SymmetricProvider,
    pub decryptor: SymmetricProvider,
}

/// Pre-rekey traffic that can still arrive at the start of a full rekey.
///
/// When a full handshake runs on a live connection, user frames the peer
/// sent before it learned of the rekey may reach the initiator's plaintext
/// blob read. With the outgoing session's decryptor at hand those frames
/// are decrypted, parsed, and stashed for delivery after the new keys are
/// installed; anything else remains a protocol mismatch.
pub struct LegacyTraffic<'a> {
    pub decryptor: &'a mut SymmetricProvider,
    pub stash: Vec<(Packet, usize)>,
}

/// Run the full key exchange.
///
/// On return both providers have been `reset()` and the stream sits at a
/// frame boundary. The caller records `last_handshake` and installs the
/// keys under its locks.
///
/// # Errors
/// Any I/O failure, malformed blob, or unexpected packet type aborts the
/// protocol; the caller must treat the connection as unusable.
pub fn full<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    role: ConnectionRole,
    config: &ConnectionConfig,
    mut legacy: Option<&mut LegacyTraffic<'_>>,
) -> Result<SessionKeys> {
    let deadline = Instant::now() + config.handshake_timeout;
    let asym = AsymmetricHelper::generate(config.rsa_bits)?;

    let peer = exchange_public_keys(reader, writer, &asym, role, deadline, &mut legacy)?;

    let mut keys = match role {
        ConnectionRole::Initiator => {
            // Our proposal; superseded by the responder's mirror below.
            let outbound = SymmetricProvider::generate();
            let inbound = SymmetricProvider::generate();
            send_pair(writer, &peer, &outbound, &inbound)?;

            let pair = receive_pair(reader, &asym, deadline)?;
            SessionKeys {
                encryptor: provider_from(pair.inbound)?,
                decryptor: provider_from(pair.outbound)?,
            }
        }
        ConnectionRole::Responder => {
            let _ = receive_pair(reader, &asym, deadline)?;

            // Mirror with our own pair; both ends finish on it.
            let outbound = SymmetricProvider::generate();
            let inbound = SymmetricProvider::generate();
            send_pair(writer, &peer, &outbound, &inbound)?;
            SessionKeys {
                encryptor: outbound,
                decryptor: inbound,
            }
        }
    };

    keys.encryptor.reset();
    keys.decryptor.reset();
    debug!(role = ?role, "full handshake complete");
    Ok(keys)
}

/// Initiator half of the partial rekey: receive a freshly wrapped provider
/// and return it as the new decryptor.
pub fn partial_initiator<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    config: &ConnectionConfig,
) -> Result<SymmetricProvider> {
    let deadline = Instant::now() + config.handshake_timeout;
    let asym = AsymmetricHelper::generate(config.rsa_bits)?;
    let _peer =
        exchange_public_keys(reader, writer, &asym, ConnectionRole::Initiator, deadline, &mut None)?;

    let line = with_deadline(deadline, || reader.read_line())?;
    let plaintext = asym.decrypt_from_base64(as_utf8(&line)?)?;
    let packet = Packet::from_bytes(&plaintext)?;
    if packet.type_id != control::INIT_PARTIAL_HANDSHAKE {
        return Err(ChannelError::UnexpectedPacket(packet.type_id));
    }
    let material = KeyMaterial::decode(packet.data.as_slice())?;
    let mut decryptor = SymmetricProvider::from_material(&material)?;
    decryptor.reset();
    debug!("partial handshake complete (initiator)");
    Ok(decryptor)
}

/// Responder half of the partial rekey: generate, wrap, and send a fresh
/// provider, returning it as the new encryptor.
pub fn partial_responder<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    config: &ConnectionConfig,
) -> Result<SymmetricProvider> {
    let deadline = Instant::now() + config.handshake_timeout;
    let asym = AsymmetricHelper::generate(config.rsa_bits)?;
    let peer =
        exchange_public_keys(reader, writer, &asym, ConnectionRole::Responder, deadline, &mut None)?;

    let mut encryptor = SymmetricProvider::generate();
    let packet = Packet::new(
        control::INIT_PARTIAL_HANDSHAKE,
        encryptor.key_material().encode_to_vec(),
    );
    let line = AsymmetricHelper::encrypt_to_peer(&peer, &packet.to_bytes())?;
    writer.write_line(&line)?;

    encryptor.reset();
    debug!("partial handshake complete (responder)");
    Ok(encryptor)
}

// Plaintext public-key blob exchange; the initiator writes first. An
// initiator rekeying a live connection may receive pre-rekey encrypted
// frames ahead of the peer's blob; with `legacy` present those are stashed
// instead of failing the protocol.
fn exchange_public_keys<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    asym: &AsymmetricHelper,
    role: ConnectionRole,
    deadline: Instant,
    legacy: &mut Option<&mut LegacyTraffic<'_>>,
) -> Result<PeerPublicKey> {
    let own_blob = asym.public_key_blob()?;
    match role {
        ConnectionRole::Initiator => {
            writer.write_frame(&own_blob)?;
            loop {
                let frame = with_deadline(deadline, || reader.read_frame())?;
                match AsymmetricHelper::import_peer(&frame) {
                    Ok(peer) => return Ok(peer),
                    Err(import_err) => {
                        let Some(traffic) = legacy.as_deref_mut() else {
                            return Err(import_err);
                        };
                        let wire = LENGTH_PREFIX_BYTES + frame.len();
                        let plaintext = traffic.decryptor.decrypt(&frame);
                        let packet =
                            Packet::from_bytes(&plaintext).map_err(|_| import_err)?;
                        if packet.is_control() {
                            return Err(ChannelError::UnexpectedPacket(packet.type_id));
                        }
                        traffic.stash.push((packet, wire));
                    }
                }
            }
        }
        ConnectionRole::Responder => {
            let blob = with_deadline(deadline, || reader.read_frame())?;
            writer.write_frame(&own_blob)?;
            AsymmetricHelper::import_peer(&blob)
        }
    }
}

fn send_pair<W: Write>(
    writer: &mut FrameWriter<W>,
    peer: &PeerPublicKey,
    outbound: &SymmetricProvider,
    inbound: &SymmetricProvider,
) -> Result<()> {
    let pair = KeyMaterialPair {
        outbound: Some(outbound.key_material()),
        inbound: Some(inbound.key_material()),
    };
    let packet = Packet::new(control::INIT_HANDSHAKE, pair.encode_to_vec());
    let line = AsymmetricHelper::encrypt_to_peer(peer, &packet.to_bytes())?;
    writer.write_line(&line)?;
    Ok(())
}

fn receive_pair<R: Read>(
    reader: &mut FrameReader<R>,
    asym: &AsymmetricHelper,
    deadline: Instant,
) -> Result<KeyMaterialPair> {
    let line = with_deadline(deadline, || reader.read_line())?;
    let plaintext = asym.decrypt_from_base64(as_utf8(&line)?)?;
    let packet = Packet::from_bytes(&plaintext)?;
    if packet.type_id != control::INIT_HANDSHAKE {
        return Err(ChannelError::UnexpectedPacket(packet.type_id));
    }
    Ok(KeyMaterialPair::decode(packet.data.as_slice())?)
}

fn provider_from(material: Option<KeyMaterial>) -> Result<SymmetricProvider> {
    SymmetricProvider::from_material(&material.ok_or(ChannelError::MalformedKeyMaterial)?)
}

fn as_utf8(line: &[u8]) -> Result<&str> {
    std::str::from_utf8(line)
        .map_err(|_| ChannelError::Handshake("handshake line is not valid UTF-8".into()))
}

// Retry transient timeouts until the protocol deadline; the peer may still
// be generating its keypair.
pub(crate) fn with_deadline<T>(deadline: Instant, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    loop {
        match op() {
            Err(e) if e.is_timeout() => {
                if Instant::now() >= deadline {
                    return Err(ChannelError::Handshake(
                        crate::error::constants::ERR_HANDSHAKE_FAILED.into(),
                    ));
                }
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn test_config() -> ConnectionConfig {
        ConnectionConfig::default_with_overrides(|c| {
            c.rsa_bits = 1536;
        })
    }

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn halves(stream: TcpStream) -> (FrameReader<TcpStream>, FrameWriter<TcpStream>) {
        let write = stream.try_clone().unwrap();
        (FrameReader::new(stream), FrameWriter::new(write))
    }

    #[test]
    fn test_full_handshake_keys_agree() {
        let (a, b) = socket_pair();
        let config = test_config();
        let config2 = config.clone();

        let responder = thread::spawn(move || {
            let (mut r, mut w) = halves(b);
            full(&mut r, &mut w, ConnectionRole::Responder, &config2, None).unwrap()
        });

        let (mut r, mut w) = halves(a);
        let mut init_keys = full(&mut r, &mut w, ConnectionRole::Initiator, &config, None).unwrap();
        let mut resp_keys = responder.join().unwrap();

        // Initiator -> responder direction.
        let ct = init_keys.encryptor.encrypt(b"one way");
        assert_ne!(ct, b"one way");
        assert_eq!(resp_keys.decryptor.decrypt(&ct), b"one way");

        // Responder -> initiator direction, independent state.
        let ct = resp_keys.encryptor.encrypt(b"the other");
        assert_eq!(init_keys.decryptor.decrypt(&ct), b"the other");
    }

    #[test]
    fn test_full_handshake_directions_differ() {
        let (a, b) = socket_pair();
        let config = test_config();
        let config2 = config.clone();

        let responder = thread::spawn(move || {
            let (mut r, mut w) = halves(b);
            full(&mut r, &mut w, ConnectionRole::Responder, &config2, None).unwrap()
        });

        let (mut r, mut w) = halves(a);
        let mut init_keys = full(&mut r, &mut w, ConnectionRole::Initiator, &config, None).unwrap();
        let mut resp_keys = responder.join().unwrap();

        let plain = b"same plaintext";
        assert_ne!(
            init_keys.encryptor.encrypt(plain),
            resp_keys.encryptor.encrypt(plain)
        );
    }

    #[test]
    fn test_partial_rotates_one_direction() {
        let (a, b) = socket_pair();
        let config = test_config();
        let config2 = config.clone();

        let responder = thread::spawn(move || {
            let (mut r, mut w) = halves(b);
            partial_responder(&mut r, &mut w, &config2).unwrap()
        });

        let (mut r, mut w) = halves(a);
        let mut new_decryptor = partial_initiator(&mut r, &mut w, &config).unwrap();
        let mut new_encryptor = responder.join().unwrap();

        let ct = new_encryptor.encrypt(b"rotated");
        assert_eq!(new_decryptor.decrypt(&ct), b"rotated");
    }
}
