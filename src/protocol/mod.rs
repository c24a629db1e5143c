//! # Connection Protocol
//!
//! The encrypted connection and everything that drives it.
//!
//! ## Components
//! - **Connection**: Socket ownership, reader thread, delivery, lifecycle
//! - **Handshake**: Full and partial key-exchange engines
//! - **Flags**: Atomic run-state and configuration registers
//! - **Delivery**: Executor trampoline and bounded delivery queues

pub mod connection;
pub mod delivery;
pub mod flags;
pub mod handshake;

pub use connection::{Connection, DisconnectReason};
pub use delivery::{DeliveryExecutor, InlineExecutor};
pub use flags::{ConfigFlag, RunFlag};
pub use handshake::ConnectionRole;
