//! Cross-thread signal flags observed by the connection driver at loop boundaries.
//!
//! A single `AtomicU32` bitset rather than a pile of `AtomicBool`s, so that callers who
//! only ever need to set/clear/test a named bit don't pay for eight separate cache lines.

use std::sync::atomic::{AtomicU32, Ordering};

const TERMINATE: u32 = 1 << 0;
const RESTART: u32 = 1 << 1;
const TRIGGER_FRAMEBUFFER_UPDATE: u32 = 1 << 2;
const SCALED_DIRTY: u32 = 1 << 3;
const SERVER_REACHABLE: u32 = 1 << 4;
const SKIP_HOST_PING: u32 = 1 << 5;
const REQUIRES_MANUAL_UPDATE_RATE_CONTROL: u32 = 1 << 6;
const DELETE_AFTER_FINISHED: u32 = 1 << 7;

/// Atomic bitset of the signals a [`crate::driver::ConnectionDriver`] observes at loop
/// boundaries. Safe to share across threads via `Arc`; every accessor is a single atomic op.
#[derive(Debug, Default)]
pub struct ControlFlags(AtomicU32);

impl ControlFlags {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    fn set_bit(&self, bit: u32, value: bool) {
        if value {
            self.0.fetch_or(bit, Ordering::AcqRel);
        } else {
            self.0.fetch_and(!bit, Ordering::AcqRel);
        }
    }

    fn test_bit(&self, bit: u32) -> bool {
        self.0.load(Ordering::Acquire) & bit != 0
    }

    /// Monotonic for the lifetime of a driver run: never cleared once set.
    pub fn set_terminate(&self) {
        self.0.fetch_or(TERMINATE, Ordering::AcqRel);
    }

    pub fn terminate(&self) -> bool {
        self.test_bit(TERMINATE)
    }

    pub fn set_restart(&self, value: bool) {
        self.set_bit(RESTART, value);
    }

    pub fn restart(&self) -> bool {
        self.test_bit(RESTART)
    }

    pub fn set_trigger_framebuffer_update(&self, value: bool) {
        self.set_bit(TRIGGER_FRAMEBUFFER_UPDATE, value);
    }

    /// Clears the flag and returns whether it had been set (test-and-clear).
    pub fn take_trigger_framebuffer_update(&self) -> bool {
        self.0.fetch_and(!TRIGGER_FRAMEBUFFER_UPDATE, Ordering::AcqRel) & TRIGGER_FRAMEBUFFER_UPDATE != 0
    }

    pub fn set_scaled_dirty(&self, value: bool) {
        self.set_bit(SCALED_DIRTY, value);
    }

    pub fn scaled_dirty(&self) -> bool {
        self.test_bit(SCALED_DIRTY)
    }

    pub fn set_server_reachable(&self, value: bool) {
        self.set_bit(SERVER_REACHABLE, value);
    }

    pub fn server_reachable(&self) -> bool {
        self.test_bit(SERVER_REACHABLE)
    }

    pub fn set_skip_host_ping(&self, value: bool) {
        self.set_bit(SKIP_HOST_PING, value);
    }

    pub fn skip_host_ping(&self) -> bool {
        self.test_bit(SKIP_HOST_PING)
    }

    pub fn set_requires_manual_update_rate_control(&self, value: bool) {
        self.set_bit(REQUIRES_MANUAL_UPDATE_RATE_CONTROL, value);
    }

    pub fn requires_manual_update_rate_control(&self) -> bool {
        self.test_bit(REQUIRES_MANUAL_UPDATE_RATE_CONTROL)
    }

    pub fn set_delete_after_finished(&self, value: bool) {
        self.set_bit(DELETE_AFTER_FINISHED, value);
    }

    pub fn delete_after_finished(&self) -> bool {
        self.test_bit(DELETE_AFTER_FINISHED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminate_is_sticky() {
        let flags = ControlFlags::new();
        assert!(!flags.terminate());
        flags.set_terminate();
        assert!(flags.terminate());
    }

    #[test]
    fn trigger_update_test_and_clear() {
        let flags = ControlFlags::new();
        assert!(!flags.take_trigger_framebuffer_update());
        flags.set_trigger_framebuffer_update(true);
        assert!(flags.take_trigger_framebuffer_update());
        assert!(!flags.take_trigger_framebuffer_update());
    }

    #[test]
    fn bits_are_independent() {
        let flags = ControlFlags::new();
        flags.set_restart(true);
        flags.set_skip_host_ping(true);
        assert!(flags.restart());
        assert!(flags.skip_host_ping());
        assert!(!flags.server_reachable());
        assert!(!flags.terminate());
    }
}
