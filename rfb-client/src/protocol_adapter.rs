//! Translates codec-observed protocol events into `Framebuffer` state and outward
//! `ServerEvent`s.
//!
//! The adapter never owns driver state directly. It holds a [`DriverOwnerSlot`], a
//! mutex-guarded `Weak<DriverInner>` the driver publishes once it is running and
//! clears on `stop()`. Every callback upgrades the weak reference and is a no-op
//! if the owner is gone or never set: this is the shutdown-race shield, realised
//! without any raw pointer.

use crate::control_flags::ControlFlags;
use crate::errors::RfbClientError;
use crate::framebuffer::Framebuffer;
use crate::messages::{CursorShape, ServerEvent};
use parking_lot::Mutex;
use rfb_common::Rect;
use rfb_protocol::messages::types::PixelFormat;
use std::sync::{Arc, Weak};

/// The driver-owned state a [`ProtocolAdapter`] needs to act on a callback.
/// Lives exactly as long as the `Arc` the driver holds; the adapter only ever
/// sees it through an upgraded `Weak`.
pub struct DriverInner {
    framebuffer: Arc<Framebuffer>,
    flags: Arc<ControlFlags>,
    events: flume::Sender<ServerEvent>,
}

impl DriverInner {
    pub fn new(
        framebuffer: Arc<Framebuffer>,
        flags: Arc<ControlFlags>,
        events: flume::Sender<ServerEvent>,
    ) -> Self {
        Self { framebuffer, flags, events }
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.events.try_send(event);
    }
}

/// Slot the driver publishes its `Weak<DriverInner>` through. `None` both
/// before the driver starts and after `stop()` clears it.
pub type DriverOwnerSlot = Arc<Mutex<Option<Weak<DriverInner>>>>;

/// Callback surface driven by [`crate::codec::RfbCodecClient`] as it parses the
/// wire protocol, translating what it observes into `Framebuffer` writes and
/// `ServerEvent`s for the application.
pub struct ProtocolAdapter {
    owner: DriverOwnerSlot,
}

impl ProtocolAdapter {
    pub fn new(owner: DriverOwnerSlot) -> Self {
        Self { owner }
    }

    /// Upgrades the current owner, if any. `None` means either the driver
    /// hasn't published itself yet or has since torn down, both cases a no-op.
    fn owner(&self) -> Option<Arc<DriverInner>> {
        self.owner.lock().as_ref()?.upgrade()
    }

    /// Connection has a live codec and is about to begin the handshake.
    pub fn on_connection_prepared(&self) {
        if let Some(inner) = self.owner() {
            inner.emit(ServerEvent::ConnectionPrepared);
        }
    }

    /// init framebuffer callback: allocates the backing store at the server's
    /// negotiated size and pixel format (rejecting anything that isn't 32-bit,
    /// via [`Framebuffer::allocate`]), then announces the new connection and the
    /// initial framebuffer-size-changed signal (spec §4.2/§6): observers that
    /// only subscribe to size changes, not `Connected`, still learn the initial
    /// dimensions rather than waiting for a later server-driven `DesktopSize`.
    pub fn on_init_framebuffer(
        &self,
        width: u16,
        height: u16,
        pixel_format: PixelFormat,
        name: String,
    ) -> Result<(), RfbClientError> {
        let Some(inner) = self.owner() else { return Ok(()) };
        inner.framebuffer.allocate(width, height, pixel_format.clone())?;
        inner.emit(ServerEvent::Connected { width, height, name, pixel_format });
        inner.emit(ServerEvent::DesktopResized { width, height });
        Ok(())
    }

    /// update region callback: forwards a single damaged rectangle. Unused in the
    /// current codec, which instead batches a whole update's damage through
    /// [`ProtocolAdapter::on_finish_update`]; kept for parity with callback-driven
    /// codecs that report damage rectangle-by-rectangle as they decode.
    pub fn on_update_region(&self, x: u16, y: u16, width: u16, height: u16) {
        if let Some(inner) = self.owner() {
            inner.emit(ServerEvent::FramebufferUpdated {
                damage: vec![Rect::new(x as i32, y as i32, width as u32, height as u32)],
            });
        }
    }

    /// finish update callback: marks the scaled view dirty and announces the
    /// complete set of damaged regions for this update.
    pub fn on_finish_update(&self, damage: Vec<Rect>) {
        if let Some(inner) = self.owner() {
            inner.flags.set_scaled_dirty(true);
            inner.emit(ServerEvent::FramebufferUpdated { damage });
        }
    }

    /// Desktop dimensions changed (server-driven `DesktopSize` pseudo-rectangle).
    pub fn on_desktop_resized(&self, width: u16, height: u16) {
        if let Some(inner) = self.owner() {
            inner.emit(ServerEvent::DesktopResized { width, height });
        }
    }

    /// The on-screen size a viewer should render at changed, independent of the
    /// underlying framebuffer dimensions (e.g. after `setScaledSize`).
    pub fn on_size_hint_changed(&self, width: u32, height: u32) {
        if let Some(inner) = self.owner() {
            inner.emit(ServerEvent::SizeHintChanged { width, height });
        }
    }

    /// cursor position callback.
    pub fn on_cursor_pos(&self, x: u16, y: u16) {
        if let Some(inner) = self.owner() {
            inner.emit(ServerEvent::CursorPosChanged { x, y });
        }
    }

    /// cursor shape callback. The codec has already rejected unsupported pixel
    /// depths before a shape ever reaches here.
    pub fn on_cursor_shape(&self, shape: CursorShape) {
        if let Some(inner) = self.owner() {
            inner.emit(ServerEvent::CursorShapeUpdated(shape));
        }
    }

    /// server cut text callback: empty clipboard payloads are not forwarded.
    pub fn on_server_cut_text(&self, text: String) {
        if text.is_empty() {
            return;
        }
        if let Some(inner) = self.owner() {
            inner.emit(ServerEvent::ServerCutText { text });
        }
    }

    pub fn on_bell(&self) {
        if let Some(inner) = self.owner() {
            inner.emit(ServerEvent::Bell);
        }
    }

    pub fn on_connection_closed(&self) {
        if let Some(inner) = self.owner() {
            inner.emit(ServerEvent::ConnectionClosed);
        }
    }

    /// log callback: routed through `tracing`, silenced by default (the usual
    /// `RUST_LOG`/`EnvFilter` configuration governs visibility).
    pub fn on_log(&self, message: &str) {
        tracing::debug!(target: "rfb_client::codec", "{message}");
    }

    pub fn on_error(&self, message: String) {
        if let Some(inner) = self.owner() {
            inner.emit(ServerEvent::Error { message });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FramebufferState;

    fn adapter() -> (ProtocolAdapter, Arc<DriverInner>, flume::Receiver<ServerEvent>) {
        let framebuffer = Arc::new(Framebuffer::new());
        let flags = Arc::new(ControlFlags::new());
        let (tx, rx) = flume::unbounded();
        let inner = Arc::new(DriverInner::new(framebuffer, flags, tx));
        let owner: DriverOwnerSlot = Arc::new(Mutex::new(Some(Arc::downgrade(&inner))));
        (ProtocolAdapter::new(owner), inner, rx)
    }

    fn format_32bpp() -> PixelFormat {
        PixelFormat {
            bits_per_pixel: 32,
            depth: 24,
            big_endian: 0,
            true_color: 1,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
        }
    }

    #[test]
    fn init_framebuffer_allocates_and_emits_connected() {
        let (adapter, inner, rx) = adapter();
        adapter
            .on_init_framebuffer(100, 80, format_32bpp(), "test".to_string())
            .unwrap();
        assert_eq!(inner.framebuffer.state(), FramebufferState::Initialized);
        match rx.try_recv().unwrap() {
            ServerEvent::Connected { width, height, .. } => {
                assert_eq!((width, height), (100, 80));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn init_framebuffer_also_emits_initial_size_changed() {
        let (adapter, _inner, rx) = adapter();
        adapter
            .on_init_framebuffer(100, 80, format_32bpp(), "test".to_string())
            .unwrap();
        // Connected is emitted first; the size-changed signal follows immediately.
        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::Connected { .. }));
        match rx.try_recv().unwrap() {
            ServerEvent::DesktopResized { width, height } => {
                assert_eq!((width, height), (100, 80));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn init_framebuffer_rejects_non_32_bit_and_emits_nothing() {
        let (adapter, inner, rx) = adapter();
        let mut pf = format_32bpp();
        pf.bits_per_pixel = 16;
        assert!(adapter.on_init_framebuffer(10, 10, pf, "x".to_string()).is_err());
        assert_eq!(inner.framebuffer.state(), FramebufferState::Invalid);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn empty_cut_text_is_not_forwarded() {
        let (adapter, _inner, rx) = adapter();
        adapter.on_server_cut_text(String::new());
        assert!(rx.try_recv().is_err());
        adapter.on_server_cut_text("hi".to_string());
        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::ServerCutText { .. }));
    }

    #[test]
    fn finish_update_marks_scaled_dirty() {
        let (adapter, inner, rx) = adapter();
        adapter.on_finish_update(vec![Rect::new(0, 0, 4, 4)]);
        assert!(inner.flags.scaled_dirty());
        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::FramebufferUpdated { .. }));
    }

    #[test]
    fn callback_after_owner_dropped_is_a_silent_no_op() {
        let framebuffer = Arc::new(Framebuffer::new());
        let flags = Arc::new(ControlFlags::new());
        let (tx, rx) = flume::unbounded();
        let inner = Arc::new(DriverInner::new(framebuffer, flags, tx));
        let owner: DriverOwnerSlot = Arc::new(Mutex::new(Some(Arc::downgrade(&inner))));
        let adapter = ProtocolAdapter::new(owner);

        drop(inner);
        adapter.on_bell();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn callback_before_owner_published_is_a_silent_no_op() {
        let owner: DriverOwnerSlot = Arc::new(Mutex::new(None));
        let adapter = ProtocolAdapter::new(owner);
        adapter.on_bell();
    }
}
