//! Connection lifecycle: graceful close, error teardown on undecodable
//! frames, and disconnect reporting.

mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use secure_channel::core::codec::{FrameReader, FrameWriter};
use secure_channel::protocol::handshake;
use secure_channel::{
    ChannelError, ConfigFlag, Connection, ConnectionRole, DisconnectReason, Packet,
};

#[test]
fn close_notifies_peer_gracefully() {
    let (a, b) = common::pair(common::test_config());

    let reason = Arc::new(Mutex::new(None));
    let sink = reason.clone();
    b.set_disconnected_callback(move |r| {
        *sink.lock().unwrap() = Some(r);
    });

    a.close();
    assert!(!a.connected());

    assert!(common::wait_for(Duration::from_secs(2), || {
        reason.lock().unwrap().is_some()
    }));
    assert_eq!(*reason.lock().unwrap(), Some(DisconnectReason::Graceful));
    assert!(common::wait_for(Duration::from_secs(2), || !b.connected()));
}

#[test]
fn local_close_fires_own_callback() {
    let (a, b) = common::pair(common::test_config());

    let reason = Arc::new(Mutex::new(None));
    let sink = reason.clone();
    a.set_disconnected_callback(move |r| {
        *sink.lock().unwrap() = Some(r);
    });

    a.close();
    assert_eq!(*reason.lock().unwrap(), Some(DisconnectReason::Graceful));
    drop(b);
}

#[test]
fn close_is_idempotent() {
    let (a, b) = common::pair(common::test_config());
    a.close();
    a.close();
    assert!(!a.connected());
    drop(b);
}

#[test]
fn queued_packets_survive_peer_close() {
    let (a, b) = common::pair(common::test_config());
    b.set_flag(ConfigFlag::ManualRead);

    a.send_packet(&Packet::new(1, b"parting".to_vec())).expect("send");
    assert!(common::wait_for(Duration::from_secs(2), || {
        b.metrics().packets_received.load(Ordering::Relaxed) >= 2
    }));
    a.close();
    assert!(common::wait_for(Duration::from_secs(2), || !b.connected()));

    // The packet queued before the close is still readable; afterwards the
    // drained, disconnected queue reports closure.
    let (packet, _) = b.read_packet().expect("read queued");
    assert_eq!(packet.data, b"parting");
    assert!(matches!(
        b.read_packet(),
        Err(ChannelError::ConnectionClosed)
    ));
}

// A fake peer that speaks the real handshake, then floods undecodable
// frames: the victim counts null packets and tears down with reason Error.
#[test]
fn undecodable_frames_close_with_error() {
    let config = common::test_config();
    let (accept, addr) = common::raw_listener();

    let peer_config = config.clone();
    let fake_peer = thread::spawn(move || {
        let socket = accept.join().expect("accept thread");
        socket
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let write = socket.try_clone().unwrap();
        let mut reader = FrameReader::new(socket);
        let mut writer = FrameWriter::new(write);
        let mut keys = handshake::full(
            &mut reader,
            &mut writer,
            ConnectionRole::Responder,
            &peer_config,
            None,
        )
        .expect("fake peer handshake");

        // Wait for the victim's go-ahead so its disconnect callback is in
        // place before the flood. Everything before it (the id exchange)
        // is decrypted and discarded.
        loop {
            match reader.read_frame() {
                Ok(ciphertext) => {
                    let plain = keys.decryptor.decrypt(&ciphertext);
                    if matches!(Packet::from_bytes(&plain), Ok(p) if p.type_id == 42) {
                        break;
                    }
                }
                Err(e) if e.is_timeout() => continue,
                Err(e) => panic!("fake peer read failed: {e}"),
            }
        }

        // Valid frames whose plaintext is not a packet (0xFF declares an
        // invalid field tag). Six of them keep the socket readable through
        // the fifth failure.
        for _ in 0..6 {
            let junk = keys.encryptor.encrypt(&[0xFF; 16]);
            writer.write_frame(&junk).expect("write junk");
        }

        // Stay alive until the victim gives up.
        thread::sleep(Duration::from_secs(3));
    });

    let victim = Connection::connect_to_with(
        addr,
        config,
        Arc::new(secure_channel::InlineExecutor),
    )
    .expect("connect");

    let reason = Arc::new(Mutex::new(None));
    let sink = reason.clone();
    victim.set_disconnected_callback(move |r| {
        *sink.lock().unwrap() = Some(r);
    });
    victim
        .send_packet(&Packet::new(42, Vec::new()))
        .expect("go-ahead");

    assert!(common::wait_for(Duration::from_secs(5), || {
        reason.lock().unwrap().is_some()
    }));
    assert_eq!(*reason.lock().unwrap(), Some(DisconnectReason::Error));
    assert!(!victim.connected());
    assert!(victim.metrics().read_errors.load(Ordering::Relaxed) >= 5);

    fake_peer.join().expect("fake peer thread");
}
