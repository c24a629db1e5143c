//! The encrypted point-to-point connection.
//!
//! A [`Connection`] owns an already-connected TCP socket, the two symmetric
//! providers, and one background reader thread. `wrap` performs the initial
//! full handshake before the reader starts; from then on every frame on the
//! wire is symmetric-encrypted.
//!
//! ## Locks
//!
//! - `conn_lock` — run/configuration flag changes, queue migration, and
//!   handshake orchestration;
//! - `write_half` — the socket write handle plus the `encryptor`;
//! - `read_half` — the socket read handle plus the `decryptor`.
//!
//! Lock order is always `conn_lock` → (`write_half` | `read_half`). A
//! handshake orchestrator holds `conn_lock` for the whole protocol and both
//! halves for the wire steps, so concurrent `send_packet` callers queue up
//! behind the rekey instead of interleaving frames into it.
//!
//! While the reader orchestrates a handshake it is also the thread reading
//! the socket; consumer delivery halts for the handshake duration. This is
//! intentional — there is exactly one reader, so there is no reordering
//! hazard. User packets that were already in flight when a partial rekey
//! started are stashed and delivered once the keys are installed.
//!
//! ## Callbacks
//!
//! Delivery and disconnect callbacks may run on the reader thread or on the
//! executor captured at wrap time. They must not reconfigure the connection
//! (`set_flag`, callback registration) from inside the callback body; those
//! entry points take the connection lock the drain already holds.

use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ConnectionConfig, MAX_READ_ERRORS};
use crate::core::codec::{FrameReader, FrameWriter, LENGTH_PREFIX_BYTES};
use crate::core::packet::{control, Packet};
use crate::crypto::symmetric::SymmetricProvider;
use crate::error::{ChannelError, Result};
use crate::protocol::delivery::{Delivery, DeliveryExecutor, DeliveryQueues, InlineExecutor};
use crate::protocol::flags::{ConfigFlag, FlagRegister, RunFlag};
use crate::protocol::handshake::{self, ConnectionRole};
use crate::utils::metrics::ConnectionMetrics;

/// Sleep while a delivery queue is at capacity; stalling the reader is the
/// intended choke signal.
const BACKPRESSURE_SLEEP: Duration = Duration::from_millis(10);

/// Poll interval for `read_packet` and the readability select.
const READ_POLL: Duration = Duration::from_millis(1);

/// Errors tolerated while draining after a disconnect notification.
const DRAIN_ERROR_BUDGET: u32 = 5;

/// Why the connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer announced the close, or we closed locally.
    Graceful,
    /// The connection was torn down by a protocol or I/O failure.
    Error,
}

type PacketCallback = Arc<dyn Fn(Packet) + Send + Sync>;
type DisconnectCallback = Arc<dyn Fn(DisconnectReason) + Send + Sync>;

#[derive(Default)]
struct CallbackSlots {
    on_packet: Option<PacketCallback>,
    on_disconnect: Option<DisconnectCallback>,
}

struct ReadHalf {
    frames: FrameReader<TcpStream>,
    decryptor: Option<SymmetricProvider>,
}

struct WriteHalf {
    frames: FrameWriter<TcpStream>,
    encryptor: Option<SymmetricProvider>,
}

struct Shared {
    config: ConnectionConfig,
    conn_lock: Mutex<()>,
    read_half: Mutex<ReadHalf>,
    write_half: Mutex<WriteHalf>,
    /// Extra handle for shutdown and the readability select.
    socket: TcpStream,
    run_flags: FlagRegister,
    config_flags: FlagRegister,
    connection_id: Mutex<[u8; 16]>,
    remote_id: Mutex<Option<[u8; 16]>>,
    last_handshake: Mutex<Instant>,
    queues: Mutex<DeliveryQueues>,
    callbacks: Mutex<CallbackSlots>,
    executor: Arc<dyn DeliveryExecutor>,
    metrics: Arc<ConnectionMetrics>,
    disconnect_notified: AtomicBool,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

// Poisoning recovery: a panic inside a callback must not wedge the
// connection, so locks are re-entered through the poisoned guard.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An encrypted packet channel over one TCP socket.
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Wrap an already-connected socket with default configuration and the
    /// inline delivery executor.
    pub fn wrap(socket: TcpStream, role: ConnectionRole) -> Result<Self> {
        Self::wrap_with(
            socket,
            role,
            ConnectionConfig::default(),
            Arc::new(InlineExecutor),
        )
    }

    /// Wrap an already-connected socket.
    ///
    /// Performs the full handshake synchronously; on success the reader
    /// thread is started and an initial connection-id exchange is sent. On
    /// failure the socket is shut down and the error propagates — no reader
    /// thread exists at that point.
    ///
    /// The executor is captured for the lifetime of the connection and used
    /// to trampoline delivery callbacks onto the consumer's preferred
    /// context.
    pub fn wrap_with(
        socket: TcpStream,
        role: ConnectionRole,
        config: ConnectionConfig,
        executor: Arc<dyn DeliveryExecutor>,
    ) -> Result<Self> {
        socket.set_nodelay(true).ok();
        socket.set_read_timeout(Some(config.read_timeout))?;
        socket.set_write_timeout(Some(config.write_timeout))?;
        let local_addr = socket.local_addr()?;
        let peer_addr = socket.peer_addr()?;

        let read_stream = socket.try_clone()?;
        let write_stream = socket.try_clone()?;

        let shared = Arc::new(Shared {
            read_half: Mutex::new(ReadHalf {
                frames: FrameReader::new(read_stream),
                decryptor: None,
            }),
            write_half: Mutex::new(WriteHalf {
                frames: FrameWriter::new(write_stream),
                encryptor: None,
            }),
            socket,
            conn_lock: Mutex::new(()),
            run_flags: FlagRegister::default(),
            config_flags: FlagRegister::default(),
            connection_id: Mutex::new(Uuid::new_v4().into_bytes()),
            remote_id: Mutex::new(None),
            last_handshake: Mutex::new(Instant::now()),
            queues: Mutex::new(DeliveryQueues::new(config.queue_capacity)),
            callbacks: Mutex::new(CallbackSlots::default()),
            executor,
            metrics: Arc::new(ConnectionMetrics::new()),
            disconnect_notified: AtomicBool::new(false),
            local_addr,
            peer_addr,
            config,
        });

        // Initial handshake, before the reader exists.
        {
            let _guard = lock(&shared.conn_lock);
            shared.run_flags.set(RunFlag::IsBlocking as u32);
            let result = shared.run_full_handshake(role, false);
            shared.run_flags.clear(RunFlag::IsBlocking as u32);
            if let Err(e) = result {
                shared.metrics.handshake_failed();
                shared.socket.shutdown(Shutdown::Both).ok();
                return Err(e);
            }
        }
        shared
            .run_flags
            .set(RunFlag::Run as u32 | RunFlag::IsConnected as u32);
        info!(peer = %peer_addr, role = ?role, "connection established");

        let reader_shared = shared.clone();
        thread::Builder::new()
            .name("secure-channel-reader".into())
            .spawn(move || reader_thread(reader_shared))?;

        let id = *lock(&shared.connection_id);
        let connection = Self { shared };
        connection
            .shared
            .send(&Packet::new(control::CONNECTION_ID_EXCHANGE, id.to_vec()))?;
        Ok(connection)
    }

    /// Connect to an endpoint and wrap the socket as the initiator.
    pub fn connect_to<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        Self::connect_to_with(addr, ConnectionConfig::default(), Arc::new(InlineExecutor))
    }

    /// Connect to an endpoint with explicit configuration and executor.
    pub fn connect_to_with<A: ToSocketAddrs>(
        addr: A,
        config: ConnectionConfig,
        executor: Arc<dyn DeliveryExecutor>,
    ) -> Result<Self> {
        let socket = TcpStream::connect(addr)?;
        Self::wrap_with(socket, ConnectionRole::Initiator, config, executor)
    }

    /// Encrypt and send one packet.
    ///
    /// Returns the number of bytes put on the wire (length prefix
    /// included). Safe to call from any number of threads; writes are
    /// serialized by the write lock.
    ///
    /// # Errors
    /// Fails immediately with `ChannelError::NotConnected` when the
    /// connection is down; write errors propagate to the caller.
    pub fn send_packet(&self, packet: &Packet) -> Result<usize> {
        if !self.shared.run_flags.test(RunFlag::IsConnected as u32) {
            return Err(ChannelError::NotConnected);
        }
        self.shared.send(packet)
    }

    /// Pull the next packet and its wire size. Only meaningful while
    /// `ConfigFlag::ManualRead` is set.
    ///
    /// Blocks on a 1 ms poll until a packet is queued. Packets already
    /// queued remain readable after disconnect; once the queue is empty and
    /// the connection is down this returns `ChannelError::ConnectionClosed`.
    pub fn read_packet(&self) -> Result<(Packet, usize)> {
        loop {
            if let Some(delivery) = lock(&self.shared.queues).pop_manual() {
                return Ok(delivery);
            }
            if !self.shared.run_flags.test(RunFlag::IsConnected as u32) {
                return Err(ChannelError::ConnectionClosed);
            }
            thread::sleep(READ_POLL);
        }
    }

    /// Register the packet delivery callback.
    ///
    /// Any packets that accumulated while no callback was registered are
    /// drained to it synchronously, in arrival order, before this returns.
    pub fn set_packet_received_callback<F>(&self, callback: F)
    where
        F: Fn(Packet) + Send + Sync + 'static,
    {
        let _guard = lock(&self.shared.conn_lock);
        let callback: PacketCallback = Arc::new(callback);
        lock(&self.shared.callbacks).on_packet = Some(callback.clone());
        let drained = lock(&self.shared.queues).drain_pending();
        for (packet, _) in drained {
            callback(packet);
        }
    }

    /// Register the disconnect callback.
    pub fn set_disconnected_callback<F>(&self, callback: F)
    where
        F: Fn(DisconnectReason) + Send + Sync + 'static,
    {
        let _guard = lock(&self.shared.conn_lock);
        lock(&self.shared.callbacks).on_disconnect = Some(Arc::new(callback));
    }

    /// Set a configuration flag. Toggling `ManualRead` migrates queued
    /// packets to the matching queue, FIFO preserved.
    pub fn set_flag(&self, flag: ConfigFlag) {
        let _guard = lock(&self.shared.conn_lock);
        self.shared.config_flags.set(flag as u32);
        if flag == ConfigFlag::ManualRead {
            lock(&self.shared.queues).migrate(true);
        }
    }

    /// Clear a configuration flag, migrating queues like `set_flag`.
    pub fn unset_flag(&self, flag: ConfigFlag) {
        let _guard = lock(&self.shared.conn_lock);
        self.shared.config_flags.clear(flag as u32);
        if flag == ConfigFlag::ManualRead {
            lock(&self.shared.queues).migrate(false);
        }
    }

    /// Whether the connection is up.
    pub fn connected(&self) -> bool {
        self.shared.run_flags.test(RunFlag::IsConnected as u32)
    }

    /// This side's 16-byte connection id (regenerated on collision).
    pub fn connection_id(&self) -> [u8; 16] {
        *lock(&self.shared.connection_id)
    }

    /// The peer's connection id, once learned.
    pub fn remote_id(&self) -> Option<[u8; 16]> {
        *lock(&self.shared.remote_id)
    }

    pub fn local_endpoint(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn remote_endpoint(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    /// When the session keys were last (re)installed.
    pub fn last_handshake(&self) -> Instant {
        *lock(&self.shared.last_handshake)
    }

    pub fn max_key_age(&self) -> Duration {
        self.shared.config.max_key_age
    }

    pub fn max_age_skew(&self) -> Duration {
        self.shared.config.max_age_skew
    }

    pub fn metrics(&self) -> Arc<ConnectionMetrics> {
        self.shared.metrics.clone()
    }

    /// Close the connection.
    ///
    /// Sends a disconnect notification if still connected, performs a
    /// receive-side shutdown so the reader unblocks, and fires the
    /// disconnect callback with reason `Graceful`. Idempotent.
    pub fn close(&self) {
        {
            let _guard = lock(&self.shared.conn_lock);
            if self.shared.run_flags.test(RunFlag::IsConnected as u32) {
                let _ = self
                    .shared
                    .send(&Packet::control(control::DISCONNECT_NOTIFICATION));
            }
            self.shared
                .run_flags
                .set(RunFlag::DontThrowOnAborted as u32);
            self.shared
                .run_flags
                .clear(RunFlag::Run as u32 | RunFlag::IsConnected as u32);
            self.shared.socket.shutdown(Shutdown::Read).ok();
        }
        self.shared.notify_disconnect(DisconnectReason::Graceful);
        debug!("connection closed locally");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.connected() {
            self.close();
        }
    }
}

impl Shared {
    fn send(&self, packet: &Packet) -> Result<usize> {
        let mut half = lock(&self.write_half);
        let wire = write_encrypted(&mut half, packet)?;
        self.metrics.packet_sent(wire as u64);
        Ok(wire)
    }

    // Full handshake over both halves, held for the whole protocol. Caller
    // holds conn_lock and has set IsBlocking. With `announce`, the
    // INIT_HANDSHAKE marker goes out under the same write lock so no other
    // frame can interleave before the plaintext phase. Returns user packets
    // that were in flight when the rekey started.
    fn run_full_handshake(&self, role: ConnectionRole, announce: bool) -> Result<Vec<Delivery>> {
        self.metrics.handshake_attempt();
        let mut write = lock(&self.write_half);
        let mut read = lock(&self.read_half);
        if announce {
            write_encrypted(&mut write, &Packet::control(control::INIT_HANDSHAKE))?;
        }

        let ReadHalf { frames, decryptor } = &mut *read;
        let mut legacy = if announce {
            decryptor.as_mut().map(|d| handshake::LegacyTraffic {
                decryptor: d,
                stash: Vec::new(),
            })
        } else {
            None
        };
        let keys = handshake::full(
            frames,
            &mut write.frames,
            role,
            &self.config,
            legacy.as_mut(),
        )?;
        let in_flight = legacy.map(|l| l.stash).unwrap_or_default();

        write.encryptor = Some(keys.encryptor);
        *decryptor = Some(keys.decryptor);
        *lock(&self.last_handshake) = Instant::now();
        self.metrics.handshake_success();
        Ok(in_flight)
    }

    // Partial handshake as the requesting side. Caller holds conn_lock and
    // has set IsBlocking. Returns user packets that were in flight when the
    // rekey started; the caller delivers them after clearing IsBlocking.
    fn run_partial_as_initiator(&self) -> Result<Vec<Delivery>> {
        self.metrics.handshake_attempt();
        let deadline = Instant::now() + self.config.handshake_timeout;
        let mut write = lock(&self.write_half);
        let mut read = lock(&self.read_half);
        let mut in_flight = Vec::new();

        write_encrypted(&mut write, &Packet::control(control::INIT_PARTIAL_HANDSHAKE))?;

        // Wait for the echo; user packets the peer sent before it saw our
        // marker may still arrive first.
        loop {
            let (packet, wire) = read_encrypted(&mut read, deadline)?;
            if packet.type_id == control::INIT_PARTIAL_HANDSHAKE {
                break;
            }
            if packet.is_control() {
                return Err(ChannelError::UnexpectedPacket(packet.type_id));
            }
            in_flight.push((packet, wire));
        }

        let decryptor =
            handshake::partial_initiator(&mut read.frames, &mut write.frames, &self.config)?;
        read.decryptor = Some(decryptor);

        // Confirm under the still-current outbound keys; any frame back
        // (under the fresh inbound keys) completes the exchange.
        write_encrypted(&mut write, &Packet::control(control::END_PARTIAL_HANDSHAKE))?;
        let (confirm, wire) = read_encrypted(&mut read, deadline)?;
        if !confirm.is_control() {
            in_flight.push((confirm, wire));
        } else if confirm.type_id != control::END_PARTIAL_HANDSHAKE {
            return Err(ChannelError::UnexpectedPacket(confirm.type_id));
        }

        *lock(&self.last_handshake) = Instant::now();
        self.metrics.handshake_success();
        self.metrics.partial_rekey();
        Ok(in_flight)
    }

    // Partial handshake as the side that received INIT_PARTIAL_HANDSHAKE.
    // Caller holds conn_lock and has set IsBlocking.
    fn run_partial_as_responder(&self) -> Result<()> {
        self.metrics.handshake_attempt();
        let deadline = Instant::now() + self.config.handshake_timeout;
        let mut write = lock(&self.write_half);
        let mut read = lock(&self.read_half);

        write_encrypted(&mut write, &Packet::control(control::INIT_PARTIAL_HANDSHAKE))?;
        let encryptor =
            handshake::partial_responder(&mut read.frames, &mut write.frames, &self.config)?;

        // The requester confirms under its unchanged outbound keys, then we
        // switch to the fresh key before echoing.
        let (confirm, _) = read_encrypted(&mut read, deadline)?;
        if confirm.type_id != control::END_PARTIAL_HANDSHAKE {
            return Err(ChannelError::UnexpectedPacket(confirm.type_id));
        }
        write.encryptor = Some(encryptor);
        write_encrypted(&mut write, &Packet::control(control::END_PARTIAL_HANDSHAKE))?;

        *lock(&self.last_handshake) = Instant::now();
        self.run_flags
            .clear(RunFlag::LocalHandshakeRequested as u32);
        self.metrics.handshake_success();
        self.metrics.partial_rekey();
        Ok(())
    }

    // Whether this side wins a simultaneous-rekey tie-break: byte-wise
    // comparison over the 16-byte ids, first differing byte decides, the
    // smaller id defers.
    fn wins_tie_break(&self) -> bool {
        let local = *lock(&self.connection_id);
        let remote = lock(&self.remote_id).unwrap_or([0u8; 16]);
        local > remote
    }

    fn notify_disconnect(&self, reason: DisconnectReason) {
        if self.disconnect_notified.swap(true, Ordering::SeqCst) {
            return;
        }
        let callback = lock(&self.callbacks).on_disconnect.clone();
        if let Some(callback) = callback {
            self.executor.execute(Box::new(move || callback(reason)));
        }
    }

    // Tear down after a fatal error. Never called while holding conn_lock.
    fn fatal_close(&self, why: &ChannelError) {
        error!(error = %why, "closing connection");
        {
            let _guard = lock(&self.conn_lock);
            self.run_flags
                .clear(RunFlag::Run as u32 | RunFlag::IsConnected as u32);
            self.socket.shutdown(Shutdown::Both).ok();
        }
        self.notify_disconnect(DisconnectReason::Error);
    }

    // 1 ms read-select on the socket.
    fn readable_within_poll(&self) -> bool {
        let mut probe = [0u8; 1];
        self.socket.set_read_timeout(Some(READ_POLL)).ok();
        let result = self.socket.peek(&mut probe);
        self.socket
            .set_read_timeout(Some(self.config.read_timeout))
            .ok();
        matches!(result, Ok(n) if n > 0)
    }
}

fn write_encrypted(half: &mut WriteHalf, packet: &Packet) -> Result<usize> {
    let plaintext = packet.to_bytes();
    let encryptor = half.encryptor.as_mut().ok_or(ChannelError::NotConnected)?;
    let ciphertext = encryptor.encrypt(&plaintext);
    half.frames.write_frame(&ciphertext)
}

fn read_encrypted(half: &mut ReadHalf, deadline: Instant) -> Result<(Packet, usize)> {
    let ciphertext = handshake::with_deadline(deadline, || half.frames.read_frame())?;
    let wire = LENGTH_PREFIX_BYTES + ciphertext.len();
    let decryptor = half.decryptor.as_mut().ok_or(ChannelError::NotConnected)?;
    let plaintext = decryptor.decrypt(&ciphertext);
    Ok((Packet::from_bytes(&plaintext)?, wire))
}

// ---------------------------------------------------------------------------
// Reader thread
// ---------------------------------------------------------------------------

fn reader_thread(shared: Arc<Shared>) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| reader_loop(&shared)));
    if let Err(payload) = result {
        if shared.run_flags.test(RunFlag::DontThrowOnAborted as u32) {
            warn!("reader thread aborted during teardown; suppressed");
        } else {
            panic::resume_unwind(payload);
        }
    }
}

enum ReadOutcome {
    Frame(Vec<u8>, usize),
    Timeout,
    Closed,
    Failed(ChannelError),
}

fn reader_loop(shared: &Arc<Shared>) {
    let mut read_errors: u32 = 0;

    while shared.run_flags.test(RunFlag::Run as u32)
        && read_errors < MAX_READ_ERRORS
        && shared.run_flags.test(RunFlag::IsConnected as u32)
    {
        let outcome = {
            let mut half = lock(&shared.read_half);
            match half.frames.read_frame() {
                Ok(ciphertext) => {
                    let wire = LENGTH_PREFIX_BYTES + ciphertext.len();
                    match half.decryptor.as_mut() {
                        Some(decryptor) => ReadOutcome::Frame(decryptor.decrypt(&ciphertext), wire),
                        None => ReadOutcome::Failed(ChannelError::NotConnected),
                    }
                }
                Err(e) if e.is_timeout() => ReadOutcome::Timeout,
                Err(ChannelError::ConnectionClosed) => ReadOutcome::Closed,
                Err(e) => ReadOutcome::Failed(e),
            }
        };

        match outcome {
            ReadOutcome::Timeout => {}
            ReadOutcome::Closed => {
                if shared.run_flags.test(RunFlag::Run as u32) {
                    shared.fatal_close(&ChannelError::ConnectionClosed);
                }
                return;
            }
            ReadOutcome::Failed(e) => {
                shared.fatal_close(&e);
                return;
            }
            ReadOutcome::Frame(plaintext, wire) => match Packet::from_bytes(&plaintext) {
                Ok(packet) => {
                    read_errors = 0;
                    shared.metrics.packet_received(wire as u64);
                    if !dispatch(shared, packet, wire) {
                        return;
                    }
                }
                Err(_) => {
                    // Null packet: distinguish junk-on-a-live-socket from a
                    // vanished peer with a 1 ms read-select.
                    shared.metrics.read_error();
                    if shared.readable_within_poll() {
                        read_errors += 1;
                        warn!(read_errors, "frame did not decode to a packet");
                    } else {
                        shared.fatal_close(&ChannelError::ConnectionClosed);
                        return;
                    }
                }
            },
        }

        if !check_session_key_expiry(shared) {
            return;
        }
    }

    if read_errors >= MAX_READ_ERRORS {
        shared.fatal_close(&ChannelError::Handshake(
            crate::error::constants::ERR_TOO_MANY_READ_ERRORS.into(),
        ));
    }
}

// Returns false when the connection died inside a handler.
fn dispatch(shared: &Arc<Shared>, packet: Packet, wire: usize) -> bool {
    let handled: Option<Result<()>> = match packet.type_id {
        control::HANDSHAKE_REQUEST => Some(handle_handshake_request(shared)),
        control::INIT_HANDSHAKE => Some(handle_init_handshake(shared)),
        control::INIT_PARTIAL_HANDSHAKE => Some(handle_init_partial(shared)),
        control::DISCONNECT_NOTIFICATION => Some(handle_disconnect(shared)),
        control::CONNECTION_ID_EXCHANGE => Some(handle_id_exchange(shared, &packet.data)),
        control::CANCEL_HANDSHAKE => {
            debug!("cancel-handshake received; dropped");
            Some(Ok(()))
        }
        _ => None,
    };

    match handled {
        Some(Err(e)) => {
            shared.fatal_close(&e);
            false
        }
        Some(Ok(())) => {
            let alive = shared.run_flags.test(RunFlag::Run as u32);
            if alive && shared.config_flags.test(ConfigFlag::PassOn as u32) {
                deliver(shared, packet, wire);
            }
            alive
        }
        None => {
            deliver(shared, packet, wire);
            true
        }
    }
}

// Hand one packet to the consumer via the active discipline, stalling on a
// full queue.
fn deliver(shared: &Arc<Shared>, packet: Packet, wire: usize) {
    loop {
        {
            let guard = lock(&shared.conn_lock);
            let manual = shared.config_flags.test(ConfigFlag::ManualRead as u32);
            if !manual {
                let callback = lock(&shared.callbacks).on_packet.clone();
                if let Some(callback) = callback {
                    drop(guard);
                    shared.executor.execute(Box::new(move || callback(packet)));
                    return;
                }
            }
            let mut queues = lock(&shared.queues);
            if queues.has_room(manual) {
                queues.push(manual, (packet, wire));
                return;
            }
        }
        if !shared.run_flags.test(RunFlag::Run as u32) {
            return;
        }
        thread::sleep(BACKPRESSURE_SLEEP);
    }
}

// Like `deliver`, for packets stashed during a handshake; the caller
// already holds conn_lock.
fn deliver_in_flight(shared: &Shared, packets: Vec<Delivery>) {
    for (packet, wire) in packets {
        loop {
            let manual = shared.config_flags.test(ConfigFlag::ManualRead as u32);
            if !manual {
                let callback = lock(&shared.callbacks).on_packet.clone();
                if let Some(callback) = callback {
                    shared.executor.execute(Box::new(move || callback(packet)));
                    break;
                }
            }
            {
                let mut queues = lock(&shared.queues);
                if queues.has_room(manual) {
                    queues.push(manual, (packet, wire));
                    break;
                }
            }
            if !shared.run_flags.test(RunFlag::Run as u32) {
                return;
            }
            thread::sleep(BACKPRESSURE_SLEEP);
        }
    }
}

// Evaluate session-key aging; returns false when the connection was closed.
fn check_session_key_expiry(shared: &Arc<Shared>) -> bool {
    let age = lock(&shared.last_handshake).elapsed();
    if age < shared.config.max_key_age {
        return true;
    }

    if shared
        .run_flags
        .test(RunFlag::LocalHandshakeRequested as u32)
    {
        if age >= shared.config.max_key_age + shared.config.max_age_skew {
            shared.fatal_close(&ChannelError::Handshake(
                crate::error::constants::ERR_REKEY_TIMED_OUT.into(),
            ));
            return false;
        }
        return true;
    }

    let _guard = lock(&shared.conn_lock);
    if !shared
        .run_flags
        .test(RunFlag::LocalHandshakeRequested as u32)
    {
        shared
            .run_flags
            .set(RunFlag::LocalHandshakeRequested as u32);
        debug!(
            age_secs = age.as_secs(),
            "session keys expired; requesting renegotiation"
        );
        if let Err(e) = shared.send(&Packet::control(control::HANDSHAKE_REQUEST)) {
            warn!(error = %e, "failed to send handshake request");
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Built-in handlers (reader thread; none hold locks on entry)
// ---------------------------------------------------------------------------

fn handle_handshake_request(shared: &Arc<Shared>) -> Result<()> {
    let _guard = lock(&shared.conn_lock);
    let age = lock(&shared.last_handshake).elapsed();
    let locally_requested = shared
        .run_flags
        .test(RunFlag::LocalHandshakeRequested as u32);
    let keys_fresh = age + shared.config.max_age_skew < shared.config.max_key_age;

    if keys_fresh && !locally_requested {
        // The peer wants fresh keys but ours are young: rotate just the
        // peer-to-us direction.
        debug!("peer requested rekey; responding with partial handshake");
        shared.run_flags.set(RunFlag::IsBlocking as u32);
        let result = shared.run_partial_as_initiator();
        shared.run_flags.clear(RunFlag::IsBlocking as u32);
        return match result {
            Ok(in_flight) => {
                deliver_in_flight(shared, in_flight);
                Ok(())
            }
            Err(e) => {
                shared.metrics.handshake_failed();
                Err(e)
            }
        };
    }

    if locally_requested {
        // Simultaneous requests: the smaller id loses initiative. The
        // request stays outstanding so the expiry scheduler does not raise
        // another one while the winner drives; the grace timer still bounds
        // the wait.
        if shared.wins_tie_break() {
            debug!("simultaneous rekey; tie-break won, driving full handshake");
            drive_full_handshake(shared)
        } else {
            debug!("simultaneous rekey; tie-break lost, waiting to be driven");
            Ok(())
        }
    } else if shared.wins_tie_break() {
        debug!("peer requested rekey on aged keys; driving full handshake");
        drive_full_handshake(shared)
    } else {
        // Level-triggered: at most one outstanding local request.
        shared
            .run_flags
            .set(RunFlag::LocalHandshakeRequested as u32);
        shared.send(&Packet::control(control::HANDSHAKE_REQUEST))?;
        Ok(())
    }
}

// Caller holds conn_lock.
fn drive_full_handshake(shared: &Shared) -> Result<()> {
    shared.run_flags.set(RunFlag::IsBlocking as u32);
    let result = shared.run_full_handshake(ConnectionRole::Initiator, true);
    shared.run_flags.clear(RunFlag::IsBlocking as u32);
    shared
        .run_flags
        .clear(RunFlag::LocalHandshakeRequested as u32);
    match result {
        Ok(in_flight) => {
            deliver_in_flight(shared, in_flight);
            Ok(())
        }
        Err(e) => {
            shared.metrics.handshake_failed();
            Err(e)
        }
    }
}

fn handle_init_handshake(shared: &Arc<Shared>) -> Result<()> {
    let _guard = lock(&shared.conn_lock);
    debug!("peer is driving a full rekey");
    shared.run_flags.set(RunFlag::IsBlocking as u32);
    let result = shared.run_full_handshake(ConnectionRole::Responder, false);
    shared.run_flags.clear(RunFlag::IsBlocking as u32);
    shared
        .run_flags
        .clear(RunFlag::LocalHandshakeRequested as u32);
    match result {
        Ok(_) => Ok(()),
        Err(e) => {
            shared.metrics.handshake_failed();
            Err(e)
        }
    }
}

fn handle_init_partial(shared: &Arc<Shared>) -> Result<()> {
    let _guard = lock(&shared.conn_lock);
    debug!("peer initiated a partial rekey");
    shared.run_flags.set(RunFlag::IsBlocking as u32);
    let result = shared.run_partial_as_responder();
    shared.run_flags.clear(RunFlag::IsBlocking as u32);
    if result.is_err() {
        shared.metrics.handshake_failed();
    }
    result
}

fn handle_disconnect(shared: &Arc<Shared>) -> Result<()> {
    info!("peer announced disconnect");
    {
        let _guard = lock(&shared.conn_lock);
        shared.run_flags.set(RunFlag::DisconnectReceived as u32);

        // Drain whatever is still readable, tolerating a few errors.
        let mut errors = 0;
        {
            let mut read = lock(&shared.read_half);
            while errors < DRAIN_ERROR_BUDGET && shared.readable_within_poll() {
                if read.frames.read_frame().is_err() {
                    errors += 1;
                }
            }
        }

        shared
            .run_flags
            .clear(RunFlag::Run as u32 | RunFlag::IsConnected as u32);
        shared.socket.shutdown(Shutdown::Both).ok();
    }
    shared.notify_disconnect(DisconnectReason::Graceful);
    Ok(())
}

fn handle_id_exchange(shared: &Arc<Shared>, data: &[u8]) -> Result<()> {
    let Ok(peer_id) = <[u8; 16]>::try_from(data) else {
        // Malformed id payload is a no-op, matching the regeneration
        // tolerance rule.
        warn!(len = data.len(), "malformed connection id payload; ignored");
        return Ok(());
    };

    let _guard = lock(&shared.conn_lock);
    let collided = *lock(&shared.connection_id) == peer_id;
    if collided {
        let fresh = Uuid::new_v4().into_bytes();
        *lock(&shared.connection_id) = fresh;
        debug!("connection id collision; regenerated and re-advertised");
        shared.send(&Packet::new(control::CONNECTION_ID_EXCHANGE, fresh.to_vec()))?;
    } else {
        *lock(&shared.remote_id) = Some(peer_id);
        debug!("recorded remote connection id");
    }
    Ok(())
}
