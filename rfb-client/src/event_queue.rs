//! Outbound event FIFO drained by the connection driver.
//!
//! A `Mutex`-guarded `VecDeque` plus a `tokio::sync::Notify` standing in for the
//! condition variable: `push` never blocks, and `pop`/`pop_async` release the lock
//! before a consumer processes the event, so a slow network write never blocks a
//! producer thread.

use std::collections::VecDeque;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// A single queued, outbound input event. Each variant carries its own payload and is
/// consumed at most once.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    PointerMove { x: u16, y: u16, button_mask: u8 },
    Key { keysym: u32, pressed: bool },
    ClientCut { text: String },
    RefreshFormatAndEncodings,
}

/// Thread-safe FIFO of [`OutboundEvent`]s, with async wakeup for a single consumer.
#[derive(Debug, Default)]
pub struct EventQueue {
    queue: Mutex<VecDeque<OutboundEvent>>,
    notify: Notify,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Enqueues an event and wakes a waiting consumer. Never blocks.
    pub fn push(&self, event: OutboundEvent) {
        self.queue.lock().push_back(event);
        self.notify.notify_one();
    }

    /// Removes and returns the oldest event, if any, without waiting.
    pub fn try_pop(&self) -> Option<OutboundEvent> {
        self.queue.lock().pop_front()
    }

    /// Removes and returns all currently-queued events in FIFO order, without waiting.
    pub fn drain(&self) -> Vec<OutboundEvent> {
        self.queue.lock().drain(..).collect()
    }

    /// Waits until at least one event is available, then returns the oldest one.
    pub async fn pop(&self) -> OutboundEvent {
        loop {
            // Register interest before checking, so a push between the check and the
            // wait can't be missed.
            let notified = self.notify.notified();
            if let Some(event) = self.try_pop() {
                return event;
            }
            notified.await;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Wakes any consumer currently waiting in [`EventQueue::pop`] without enqueuing
    /// anything, e.g. so the driver can re-check its termination flags promptly.
    pub fn wake(&self) {
        self.notify.notify_one();
    }
}
