//! Run-state and configuration flag registers.
//!
//! Both registers are small atomic bitsets. Mutation happens under the
//! connection lock; unlocked reads are allowed for progress checks (the
//! flags are monotone within a protocol phase, or the reader thread itself
//! is the only writer). This keeps the `send_packet` connectivity pre-check
//! down to a single relaxed load.

use std::sync::atomic::{AtomicU32, Ordering};

/// Run-state bits of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RunFlag {
    /// Reader loop keeps iterating while set.
    Run = 0x01,
    /// Handshake completed and the socket is live.
    IsConnected = 0x02,
    /// A local rekey request is outstanding (level-triggered; at most one).
    LocalHandshakeRequested = 0x04,
    /// A handshake is in progress; consumer delivery is suspended.
    IsBlocking = 0x08,
    /// Swallow reader-thread panics during teardown instead of re-raising.
    DontThrowOnAborted = 0x10,
    /// Peer announced a graceful disconnect.
    DisconnectReceived = 0x20,
}

/// User-settable behavior bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ConfigFlag {
    /// Internally handled packets are also surfaced to the consumer.
    PassOn = 0x01,
    /// Packets are pulled via `read_packet` instead of pushed to a callback.
    ManualRead = 0x02,
}

/// An atomic bitset register.
#[derive(Debug, Default)]
pub struct FlagRegister {
    bits: AtomicU32,
}

impl FlagRegister {
    pub fn new(initial: u32) -> Self {
        Self {
            bits: AtomicU32::new(initial),
        }
    }

    pub fn set(&self, flag: u32) {
        self.bits.fetch_or(flag, Ordering::SeqCst);
    }

    pub fn clear(&self, flag: u32) {
        self.bits.fetch_and(!flag, Ordering::SeqCst);
    }

    pub fn test(&self, flag: u32) -> bool {
        self.bits.load(Ordering::Relaxed) & flag != 0
    }

    pub fn load(&self) -> u32 {
        self.bits.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear_test() {
        let reg = FlagRegister::default();
        assert!(!reg.test(RunFlag::Run as u32));

        reg.set(RunFlag::Run as u32 | RunFlag::IsConnected as u32);
        assert!(reg.test(RunFlag::Run as u32));
        assert!(reg.test(RunFlag::IsConnected as u32));
        assert!(!reg.test(RunFlag::IsBlocking as u32));

        reg.clear(RunFlag::Run as u32);
        assert!(!reg.test(RunFlag::Run as u32));
        assert!(reg.test(RunFlag::IsConnected as u32));
    }

    #[test]
    fn test_bits_are_distinct() {
        let all = [
            RunFlag::Run as u32,
            RunFlag::IsConnected as u32,
            RunFlag::LocalHandshakeRequested as u32,
            RunFlag::IsBlocking as u32,
            RunFlag::DontThrowOnAborted as u32,
            RunFlag::DisconnectReceived as u32,
        ];
        let mut seen = 0u32;
        for bit in all {
            assert_eq!(bit.count_ones(), 1);
            assert_eq!(seen & bit, 0, "flag bits must not collide");
            seen |= bit;
        }
    }
}
