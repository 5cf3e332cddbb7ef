//! Framebuffer state management and decoder registry.
//!
//! Owns the client's pixel backing store and a registry
//! of encoding decoders that turn server `FramebufferUpdate` rectangles into writes
//! against it. Snapshots are reference-counted copies handed to readers under a brief
//! read lock, so a reader never blocks the driver thread's next decode and a
//! reallocation never invalidates memory a reader is still holding.

use crate::control_flags::ControlFlags;
use crate::errors::RfbClientError;
use crate::messages::CursorShape;
use crate::state::{FramebufferState, FramebufferStateCell};
use image::imageops::FilterType;
use image::{ImageBuffer, Rgba};
use parking_lot::{Mutex, RwLock};
use rfb_common::Rect;
use rfb_encodings as enc;
use rfb_encodings::{Decoder, MutablePixelBuffer, RfbInStream};
use rfb_pixelbuffer::{ManagedPixelBuffer, PixelBuffer as _, PixelFormat as LocalPixelFormat};
use rfb_protocol::messages::types::{PixelFormat as ServerPixelFormat, Rectangle};
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Cursor pseudo-encoding (RFB value -239). No decoder for it is registered in
/// `rfb-encodings`; its payload (hotspot + pixmap + bitmask) is decoded inline by
/// [`Framebuffer::apply_rectangle`] and staged for the codec to forward to the
/// adapter, since `Framebuffer` has no route to `ProtocolAdapter` of its own.
const ENCODING_PSEUDO_CURSOR: i32 = -239;
/// PointerPos pseudo-encoding (RFB value -232): no payload, the rectangle's x/y
/// fields carry the new cursor position directly.
const ENCODING_PSEUDO_POINTER_POS: i32 = -232;

/// Registry of decoders keyed by encoding type, owned once per connection so the
/// Tight and ZRLE decoders' internal zlib streams stay continuous across every
/// rectangle of every update for the life of the connection.
struct DecoderRegistry {
    raw: enc::RawDecoder,
    copy_rect: enc::CopyRectDecoder,
    rre: enc::RREDecoder,
    hextile: enc::HextileDecoder,
    tight: enc::TightDecoder,
    zrle: enc::ZRLEDecoder,
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self {
            raw: enc::RawDecoder,
            copy_rect: enc::CopyRectDecoder,
            rre: enc::RREDecoder,
            hextile: enc::HextileDecoder,
            tight: enc::TightDecoder::default(),
            zrle: enc::ZRLEDecoder::default(),
        }
    }
}

impl DecoderRegistry {
    async fn decode<R: AsyncRead + Unpin>(
        &self,
        encoding: i32,
        stream: &mut RfbInStream<R>,
        rect: &Rectangle,
        pixel_format: &ServerPixelFormat,
        buffer: &mut dyn MutablePixelBuffer,
    ) -> anyhow::Result<()> {
        match encoding {
            enc::ENCODING_RAW => self.raw.decode(stream, rect, pixel_format, buffer).await,
            enc::ENCODING_COPY_RECT => {
                self.copy_rect.decode(stream, rect, pixel_format, buffer).await
            }
            enc::ENCODING_RRE => self.rre.decode(stream, rect, pixel_format, buffer).await,
            enc::ENCODING_HEXTILE => {
                self.hextile.decode(stream, rect, pixel_format, buffer).await
            }
            enc::ENCODING_TIGHT => self.tight.decode(stream, rect, pixel_format, buffer).await,
            enc::ENCODING_ZRLE => self.zrle.decode(stream, rect, pixel_format, buffer).await,
            other => anyhow::bail!("no decoder registered for encoding {other}"),
        }
    }
}

/// An immutable, reference-counted copy of the framebuffer's pixels at the moment it
/// was taken. Cheap to clone and safe to hold across subsequent driver reallocations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferSnapshot {
    pub width: u32,
    pub height: u32,
    /// Row-major, 4 bytes per pixel, R/G/B at byte offsets 2/1/0 (little-endian
    /// 0x00RRGGBB), the 4th byte unused.
    pub data: Arc<Vec<u8>>,
}

impl FramebufferSnapshot {
    pub(crate) fn empty() -> Self {
        Self {
            width: 0,
            height: 0,
            data: Arc::new(Vec::new()),
        }
    }
}

/// Owns the pixel backing store, the decoder registry, and the framebuffer lifecycle
/// state. Single-writer (the connection driver thread); many readers via `snapshot`.
pub struct Framebuffer {
    buffer: RwLock<ManagedPixelBuffer>,
    server_pixel_format: RwLock<ServerPixelFormat>,
    registry: DecoderRegistry,
    state: FramebufferStateCell,
    scaled_cache: Mutex<Option<((u32, u32), FramebufferSnapshot)>>,
    pending_cursor: Mutex<Option<CursorShape>>,
    pending_cursor_pos: Mutex<Option<(u16, u16)>>,
}

impl Default for Framebuffer {
    fn default() -> Self {
        Self {
            buffer: RwLock::new(ManagedPixelBuffer::new(0, 0, LocalPixelFormat::rgb888())),
            server_pixel_format: RwLock::new(ServerPixelFormat {
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
            }),
            registry: DecoderRegistry::default(),
            state: FramebufferStateCell::default(),
            scaled_cache: Mutex::new(None),
            pending_cursor: Mutex::new(None),
            pending_cursor_pos: Mutex::new(None),
        }
    }
}

impl Framebuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> FramebufferState {
        self.state.get()
    }

    /// Allocates a fresh, zeroed backing store of `width x height` local-format
    /// pixels, publishes the server's negotiated pixel format for decoders to read
    /// against, and marks the framebuffer `Initialized`. Rejects server pixel
    /// formats that are not 4 bytes per pixel.
    pub fn allocate(
        &self,
        width: u16,
        height: u16,
        server_pixel_format: ServerPixelFormat,
    ) -> Result<(), RfbClientError> {
        if server_pixel_format.bytes_per_pixel() != 4 {
            return Err(RfbClientError::Protocol(format!(
                "unsupported server pixel depth: {} bits per pixel",
                server_pixel_format.bits_per_pixel
            )));
        }
        let local_format = LocalPixelFormat::rgb888();
        *self.buffer.write() = ManagedPixelBuffer::new(width as u32, height as u32, local_format);
        *self.server_pixel_format.write() = server_pixel_format;
        *self.scaled_cache.lock() = None;
        self.state.set(FramebufferState::Initialized);
        Ok(())
    }

    /// Resizes the backing store in place (server-driven `DesktopSize` pseudo-rect).
    pub fn resize(&self, width: u16, height: u16) {
        self.buffer.write().resize(width as u32, height as u32);
        *self.scaled_cache.lock() = None;
    }

    /// Returns a reference-counted copy of the current pixel contents. Safe to hold
    /// across subsequent reallocations or decodes.
    #[must_use]
    pub fn snapshot(&self) -> FramebufferSnapshot {
        if self.state.get() == FramebufferState::Invalid {
            return FramebufferSnapshot::empty();
        }
        let buffer = self.buffer.read();
        let (width, height) = buffer.dimensions();
        FramebufferSnapshot {
            width,
            height,
            data: Arc::new(buffer.data().to_vec()),
        }
    }

    /// Produces (or returns the cached) scaled copy of the framebuffer at `size`,
    /// using smooth resampling with aspect ratio ignored.
    /// No-op (returns the prior cached image, or `None`) unless `flags.scaled_dirty()`
    /// is set, a valid framebuffer exists, and `size` is non-empty.
    pub fn rescale_to(
        &self,
        flags: &ControlFlags,
        size: (u32, u32),
    ) -> Option<FramebufferSnapshot> {
        if self.state.get() != FramebufferState::Valid {
            return None;
        }
        if size.0 == 0 || size.1 == 0 {
            return None;
        }
        if !flags.scaled_dirty() {
            return self.scaled_cache.lock().as_ref().map(|(_, snap)| snap.clone());
        }

        let resized = {
            let buffer = self.buffer.read();
            let (width, height) = buffer.dimensions();
            let source: ImageBuffer<Rgba<u8>, Vec<u8>> =
                ImageBuffer::from_raw(width, height, buffer.data().to_vec())
                    .expect("framebuffer data length must match width*height*4");
            image::imageops::resize(&source, size.0, size.1, FilterType::Triangle)
        };
        let snapshot = FramebufferSnapshot {
            width: size.0,
            height: size.1,
            data: Arc::new(resized.into_raw()),
        };
        *self.scaled_cache.lock() = Some((size, snapshot.clone()));
        flags.set_scaled_dirty(false);
        Some(snapshot)
    }

    /// Applies a single decoded rectangle from the server.
    pub async fn apply_rectangle<R: AsyncRead + Unpin>(
        &self,
        stream: &mut RfbInStream<R>,
        rect: &Rectangle,
    ) -> Result<(), RfbClientError> {
        match rect.encoding {
            enc::ENCODING_LAST_RECT => Ok(()),
            enc::ENCODING_DESKTOP_SIZE => {
                self.resize(rect.width, rect.height);
                Ok(())
            }
            ENCODING_PSEUDO_POINTER_POS => {
                *self.pending_cursor_pos.lock() = Some((rect.x, rect.y));
                Ok(())
            }
            ENCODING_PSEUDO_CURSOR => self.apply_cursor_rectangle(stream, rect).await,
            other => {
                let pf = self.server_pixel_format.read().clone();
                let mut buffer = self.buffer.write();
                let target: &mut dyn MutablePixelBuffer = &mut *buffer;
                self.registry
                    .decode(other, stream, rect, &pf, target)
                    .await
                    .map_err(RfbClientError::Encoding)
            }
        }
    }

    /// Decodes a Cursor pseudo-encoding rectangle: `width * height` pixels in the
    /// negotiated pixel format, followed by a `ceil(width/8) * height` byte
    /// row-major bitmask. Rejects pixel formats that are not 4 bytes per pixel
    /// rather than guessing at a conversion.
    async fn apply_cursor_rectangle<R: AsyncRead + Unpin>(
        &self,
        stream: &mut RfbInStream<R>,
        rect: &Rectangle,
    ) -> Result<(), RfbClientError> {
        let bytes_per_pixel = self.server_pixel_format.read().bytes_per_pixel();
        if bytes_per_pixel != 4 {
            tracing::warn!(
                target: "rfb_client::framing",
                "ignoring cursor shape with unsupported {bytes_per_pixel}-byte pixel format"
            );
            let pixel_len = rect.width as usize * rect.height as usize * bytes_per_pixel as usize;
            let mask_len = ((rect.width as usize + 7) / 8) * rect.height as usize;
            stream.skip(pixel_len + mask_len).await.map_err(|e| {
                RfbClientError::Protocol(format!("failed to skip unsupported cursor payload: {e}"))
            })?;
            return Ok(());
        }

        let pixel_len = rect.width as usize * rect.height as usize * 4;
        let mut pixels = vec![0u8; pixel_len];
        stream.read_bytes(&mut pixels).await.map_err(|e| {
            RfbClientError::Protocol(format!("failed to read cursor pixel data: {e}"))
        })?;

        let mask_len = ((rect.width as usize + 7) / 8) * rect.height as usize;
        let mut mask = vec![0u8; mask_len];
        stream.read_bytes(&mut mask).await.map_err(|e| {
            RfbClientError::Protocol(format!("failed to read cursor mask data: {e}"))
        })?;

        *self.pending_cursor.lock() = Some(CursorShape {
            pixels,
            mask,
            width: rect.width,
            height: rect.height,
            hotspot_x: rect.x,
            hotspot_y: rect.y,
        });
        Ok(())
    }

    /// Removes and returns a cursor shape decoded since the last call, if any.
    pub fn take_pending_cursor(&self) -> Option<CursorShape> {
        self.pending_cursor.lock().take()
    }

    /// Removes and returns a server-reported cursor position, if any arrived
    /// since the last call.
    pub fn take_pending_cursor_pos(&self) -> Option<(u16, u16)> {
        self.pending_cursor_pos.lock().take()
    }

    /// Reads a `FramebufferUpdate` header and decodes every rectangle it announces,
    /// returning the damaged regions for repaint. Handles both the normal
    /// fixed-count form and the `0xFFFF`-count/`LastRect`-terminated form.
    pub async fn apply_update_stream<R: AsyncRead + Unpin>(
        &self,
        stream: &mut RfbInStream<R>,
    ) -> Result<Vec<Rect>, RfbClientError> {
        stream.skip(1).await.map_err(|e| {
            RfbClientError::Protocol(format!("failed to read FramebufferUpdate padding: {e}"))
        })?;
        let num_raw = stream.read_u16().await.map_err(|e| {
            RfbClientError::Protocol(format!("failed to read FramebufferUpdate rect count: {e}"))
        })?;

        tracing::debug!(
            target: "rfb_client::framing",
            "FBU start: declared_rects={}, available_buffer_bytes={}",
            num_raw,
            stream.available()
        );

        let mut damage = Vec::new();
        let mut rects_decoded = 0usize;
        let unknown_count = num_raw == 0xFFFF;

        loop {
            if !unknown_count && rects_decoded == num_raw as usize {
                break;
            }
            let rect = Rectangle::read_from(stream).await.map_err(|e| {
                RfbClientError::Protocol(format!("failed to read Rectangle header: {e}"))
            })?;
            tracing::debug!(
                target: "rfb_client::framing",
                "FBU rect {}: enc={} rect=[{},{} {}x{}]",
                rects_decoded, rect.encoding, rect.x, rect.y, rect.width, rect.height,
            );
            if unknown_count && rect.encoding == enc::ENCODING_LAST_RECT {
                break;
            }
            self.apply_rectangle(stream, &rect).await?;
            rects_decoded += 1;
            if rect.encoding >= 0 {
                damage.push(Rect::new(
                    rect.x as i32,
                    rect.y as i32,
                    rect.width as u32,
                    rect.height as u32,
                ));
            }
        }

        if !unknown_count && rects_decoded != num_raw as usize {
            tracing::warn!(
                target: "rfb_client::framing",
                "FBU end: MISMATCH! declared_rects={} decoded_rects={}",
                num_raw, rects_decoded
            );
        }

        self.state.set(FramebufferState::Valid);
        Ok(damage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format_32bpp() -> ServerPixelFormat {
        ServerPixelFormat {
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

    fn format_16bpp() -> ServerPixelFormat {
        ServerPixelFormat {
            bits_per_pixel: 16,
            depth: 16,
            big_endian: 0,
            true_color: 1,
            red_max: 31,
            green_max: 63,
            blue_max: 31,
            red_shift: 11,
            green_shift: 5,
            blue_shift: 0,
        }
    }

    #[test]
    fn allocate_rejects_non_32_bit_pixel_format() {
        let fb = Framebuffer::new();
        let err = fb.allocate(100, 100, format_16bpp()).unwrap_err();
        assert!(matches!(err, RfbClientError::Protocol(_)));
        assert_eq!(fb.state(), FramebufferState::Invalid);
    }

    #[test]
    fn allocate_marks_initialized_and_snapshot_is_zeroed() {
        let fb = Framebuffer::new();
        fb.allocate(4, 4, format_32bpp()).unwrap();
        assert_eq!(fb.state(), FramebufferState::Initialized);
        let snap = fb.snapshot();
        assert_eq!(snap.width, 4);
        assert_eq!(snap.height, 4);
        assert_eq!(snap.data.len(), 4 * 4 * 4);
        assert!(snap.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn snapshot_before_allocate_is_empty() {
        let fb = Framebuffer::new();
        let snap = fb.snapshot();
        assert_eq!(snap.width, 0);
        assert_eq!(snap.height, 0);
        assert!(snap.data.is_empty());
    }

    #[test]
    fn rescale_is_noop_without_valid_framebuffer() {
        let fb = Framebuffer::new();
        let flags = ControlFlags::new();
        flags.set_scaled_dirty(true);
        fb.allocate(4, 4, format_32bpp()).unwrap();
        // Still only Initialized, not Valid (no update applied yet).
        assert!(fb.rescale_to(&flags, (2, 2)).is_none());
    }

    #[test]
    fn rescale_is_noop_for_empty_target_size() {
        let fb = Framebuffer::new();
        let flags = ControlFlags::new();
        flags.set_scaled_dirty(true);
        fb.allocate(4, 4, format_32bpp()).unwrap();
        fb.state.set(FramebufferState::Valid);
        assert!(fb.rescale_to(&flags, (0, 4)).is_none());
    }

    #[test]
    fn rescale_produces_requested_size_and_clears_dirty() {
        let fb = Framebuffer::new();
        let flags = ControlFlags::new();
        flags.set_scaled_dirty(true);
        fb.allocate(8, 8, format_32bpp()).unwrap();
        fb.state.set(FramebufferState::Valid);

        let snap = fb.rescale_to(&flags, (4, 4)).expect("valid rescale request");
        assert_eq!((snap.width, snap.height), (4, 4));
        assert_eq!(snap.data.len(), 4 * 4 * 4);
        assert!(!flags.scaled_dirty());
    }

    #[test]
    fn rescale_without_dirty_flag_returns_previous_cache() {
        let fb = Framebuffer::new();
        let flags = ControlFlags::new();
        flags.set_scaled_dirty(true);
        fb.allocate(8, 8, format_32bpp()).unwrap();
        fb.state.set(FramebufferState::Valid);

        let first = fb.rescale_to(&flags, (4, 4)).unwrap();
        assert!(!flags.scaled_dirty());
        let second = fb.rescale_to(&flags, (4, 4)).unwrap();
        assert_eq!(first, second);
    }
}
