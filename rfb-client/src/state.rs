//! Connection and framebuffer state machines.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a single connection attempt, stored atomically so any thread can
/// read it without taking a lock. Transitions to the same value are suppressed by the
/// driver before it notifies observers; this type itself does not enforce that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    HostOffline = 3,
    ServerNotRunning = 4,
    AuthenticationFailed = 5,
    ConnectionFailed = 6,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Disconnected,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::HostOffline,
            4 => Self::ServerNotRunning,
            5 => Self::AuthenticationFailed,
            _ => Self::ConnectionFailed,
        }
    }
}

/// Atomic holder for [`ConnectionState`], with `set_if_changed` implementing the
/// "transition to the same value is suppressed" invariant.
#[derive(Debug)]
pub struct ConnectionStateCell(AtomicU8);

impl ConnectionStateCell {
    pub fn new(initial: ConnectionState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Stores `next` and returns `Some(next)` if it differs from the current value,
    /// `None` if the transition would be a no-op.
    pub fn set_if_changed(&self, next: ConnectionState) -> Option<ConnectionState> {
        let prev = self.0.swap(next as u8, Ordering::AcqRel);
        if prev == next as u8 {
            None
        } else {
            Some(next)
        }
    }
}

impl Default for ConnectionStateCell {
    fn default() -> Self {
        Self::new(ConnectionState::Disconnected)
    }
}

/// Lifecycle of the pixel backing store. `Invalid` on construction and after teardown;
/// `Initialized` once allocation succeeds and the pixel format is negotiated; `Valid`
/// after the first complete framebuffer update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum FramebufferState {
    Invalid = 0,
    Initialized = 1,
    Valid = 2,
}

impl FramebufferState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Invalid,
            1 => Self::Initialized,
            _ => Self::Valid,
        }
    }
}

/// Atomic holder for [`FramebufferState`], so the driver thread can publish a
/// transition and any reader thread can observe it without taking the pixel lock.
#[derive(Debug)]
pub struct FramebufferStateCell(AtomicU8);

impl FramebufferStateCell {
    pub fn new(initial: FramebufferState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub fn get(&self) -> FramebufferState {
        FramebufferState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, next: FramebufferState) {
        self.0.store(next as u8, Ordering::Release);
    }
}

impl Default for FramebufferStateCell {
    fn default() -> Self {
        Self::new(FramebufferState::Invalid)
    }
}
