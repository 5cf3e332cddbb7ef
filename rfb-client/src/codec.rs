//! Binds the RFB wire protocol to the `Framebuffer` and `ProtocolAdapter`.
//!
//! [`CodecClient`] mirrors the narrow boundary a codec library would expose to a
//! connection driver: connect-and-handshake, wait for a message, dispatch
//! exactly one, and the handful of outbound requests the driver issues
//! directly rather than via the event queue. [`RfbCodecClient`] is the only
//! implementation, wrapping a live TCP connection over the `rfb-protocol` and
//! `rfb-encodings` stack; the trait exists so the driver can be pointed at a
//! different implementation without being rewritten.

use crate::control_flags::ControlFlags;
use crate::errors::RfbClientError;
use crate::framebuffer::Framebuffer;
use crate::platform;
use crate::protocol_adapter::ProtocolAdapter;
use rfb_protocol::handshake;
use rfb_protocol::io::{RfbInStream, RfbOutStream};
use rfb_protocol::messages::client::{
    ClientCutText, FramebufferUpdateRequest, KeyEvent, PointerEvent, SetEncodings, SetPixelFormat,
};
use rfb_protocol::messages::server::{Bell, ServerCutText, SetColorMapEntries};
use rfb_protocol::messages::types::PixelFormat;
use rfb_protocol::socket::TcpSocket;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{split, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Cursor pseudo-encoding (RFB value -239): requested whenever remote-cursor
/// rendering is enabled, decoded inline by [`Framebuffer::apply_rectangle`].
pub const PSEUDO_ENCODING_CURSOR: i32 = -239;
/// PointerPos pseudo-encoding (RFB value -232): server takes over cursor
/// positioning; no payload, the rectangle's x/y carry the new position.
pub const PSEUDO_ENCODING_POINTER_POS: i32 = -232;

/// Local pixel format requested of every server: 32bpp true-color RGB888, R/G/B
/// at byte shifts 16/8/0.
fn local_pixel_format() -> PixelFormat {
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

/// Parameters needed to establish one connection attempt. Cheap to clone; the
/// driver rebuilds this (and a fresh [`RfbCodecClient`]) on every `establish`.
#[derive(Debug, Clone)]
pub struct CodecParams {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub keepalive_idle: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_count: u32,
    pub encodings: Vec<i32>,
    pub use_remote_cursor: bool,
}

/// Mirrors the boundary a codec/FFI binding exposes to the connection driver.
/// Implementors own the live connection; the driver never touches a socket or
/// `RfbInStream`/`RfbOutStream` directly.
pub trait CodecClient: Send {
    /// Connects, completes the RFB handshake, and drives the adapter's
    /// init-framebuffer callback. On success the codec is ready for
    /// `wait_for_message`; also applies TCP keepalive tuning from the
    /// connection's configured tunables.
    async fn init_client(&mut self) -> Result<(), RfbClientError>;

    /// Waits up to `wait` for the next server message to become available.
    /// `Ok(true)` means `handle_server_message` should be called next;
    /// `Ok(false)` means the wait timed out with nothing pending.
    async fn wait_for_message(&mut self, wait: Duration) -> Result<bool, RfbClientError>;

    /// Reads and dispatches exactly one already-available server message.
    async fn handle_server_message(&mut self) -> Result<(), RfbClientError>;

    /// Requests an update of the entire framebuffer surface.
    async fn send_framebuffer_update_request(&mut self, incremental: bool) -> Result<(), RfbClientError>;

    /// Requests an incremental update of the entire framebuffer surface.
    async fn send_incremental_framebuffer_update_request(&mut self) -> Result<(), RfbClientError> {
        self.send_framebuffer_update_request(true).await
    }

    async fn send_pointer_event(&mut self, x: u16, y: u16, button_mask: u8) -> Result<(), RfbClientError>;
    async fn send_key_event(&mut self, keysym: u32, down: bool) -> Result<(), RfbClientError>;
    async fn send_client_cut_text(&mut self, text: &str) -> Result<(), RfbClientError>;

    /// Re-sends `SetPixelFormat`/`SetEncodings` after a quality or remote-cursor
    /// preference change (driven by a drained `RefreshFormatAndEncodings` event).
    async fn refresh_format_and_encodings(&mut self, encodings: &[i32], use_remote_cursor: bool) -> Result<(), RfbClientError>;

    /// Releases codec resources. Idempotent.
    fn client_cleanup(&mut self);
}

/// Live connection over the in-workspace `rfb-protocol`/`rfb-encodings` stack.
pub struct RfbCodecClient {
    params: CodecParams,
    flags: Arc<ControlFlags>,
    framebuffer: Arc<Framebuffer>,
    adapter: Arc<ProtocolAdapter>,
    framebuffer_dimensions: (u16, u16),
    instream: Option<RfbInStream<ReadHalf<TcpStream>>>,
    outstream: Option<RfbOutStream<WriteHalf<TcpStream>>>,
    pending_message_type: Option<u8>,
}

impl RfbCodecClient {
    pub fn new(params: CodecParams, flags: Arc<ControlFlags>, framebuffer: Arc<Framebuffer>, adapter: Arc<ProtocolAdapter>) -> Self {
        Self {
            params,
            flags,
            framebuffer,
            adapter,
            framebuffer_dimensions: (0, 0),
            instream: None,
            outstream: None,
            pending_message_type: None,
        }
    }

    fn instream(&mut self) -> Result<&mut RfbInStream<ReadHalf<TcpStream>>, RfbClientError> {
        self.instream.as_mut().ok_or(RfbClientError::ConnectionClosed)
    }

    fn outstream(&mut self) -> Result<&mut RfbOutStream<WriteHalf<TcpStream>>, RfbClientError> {
        self.outstream.as_mut().ok_or(RfbClientError::ConnectionClosed)
    }

    fn encodings_with_pseudo(&self) -> Vec<i32> {
        let mut encodings = self.params.encodings.clone();
        if self.params.use_remote_cursor {
            encodings.push(PSEUDO_ENCODING_CURSOR);
            encodings.push(PSEUDO_ENCODING_POINTER_POS);
        }
        encodings
    }

    async fn send_set_pixel_format_and_encodings(&mut self, encodings: Vec<i32>) -> Result<(), RfbClientError> {
        let format = local_pixel_format();
        let outstream = self.outstream()?;
        SetPixelFormat { pixel_format: format }
            .write_to(outstream)
            .map_err(RfbClientError::Transport)?;
        SetEncodings { encodings }.write_to(outstream);
        outstream.flush().await.map_err(RfbClientError::Transport)?;
        Ok(())
    }

    fn surface_damage_announced(&self, damage: Vec<rfb_common::Rect>) {
        self.adapter.on_finish_update(damage);
        if let Some(pos) = self.framebuffer.take_pending_cursor_pos() {
            self.adapter.on_cursor_pos(pos.0, pos.1);
        }
        if let Some(shape) = self.framebuffer.take_pending_cursor() {
            self.adapter.on_cursor_shape(shape);
        }
    }
}

impl CodecClient for RfbCodecClient {
    async fn init_client(&mut self) -> Result<(), RfbClientError> {
        let connect = TcpSocket::connect(&self.params.host, self.params.port);
        let socket = timeout(self.params.connect_timeout, connect)
            .await
            .map_err(|_| RfbClientError::Timeout(self.params.connect_timeout))?
            .map_err(|e| RfbClientError::Unreachable(e.to_string()))?;

        self.flags.set_server_reachable(true);
        let stream = socket.into_inner();
        platform::configure_socket_keepalive(
            &stream,
            self.params.keepalive_idle,
            self.params.keepalive_interval,
            self.params.keepalive_count,
        )
        .map_err(RfbClientError::Transport)?;

        let (read_half, write_half) = split(stream);
        let mut instream = RfbInStream::new(read_half);
        let mut outstream = RfbOutStream::new(write_half);

        self.adapter.on_connection_prepared();

        let negotiated = handshake::negotiate_version(&mut instream, &mut outstream)
            .await
            .map_err(|e| RfbClientError::ServerNotRunning(e.to_string()))?;
        handshake::negotiate_security(&mut instream, &mut outstream, negotiated)
            .await
            .map_err(|e| RfbClientError::Security(e.to_string()))?;
        handshake::send_client_init(&mut outstream, true)
            .await
            .map_err(|e| RfbClientError::Handshake(e.to_string()))?;
        let server_init = handshake::recv_server_init(&mut instream)
            .await
            .map_err(|e| RfbClientError::Handshake(e.to_string()))?;

        self.framebuffer_dimensions = (server_init.framebuffer_width, server_init.framebuffer_height);
        self.adapter.on_init_framebuffer(
            server_init.framebuffer_width,
            server_init.framebuffer_height,
            server_init.pixel_format,
            server_init.name,
        )?;

        self.instream = Some(instream);
        self.outstream = Some(outstream);

        let encodings = self.encodings_with_pseudo();
        self.send_set_pixel_format_and_encodings(encodings).await?;
        self.send_framebuffer_update_request(false).await
    }

    async fn wait_for_message(&mut self, wait: Duration) -> Result<bool, RfbClientError> {
        if self.pending_message_type.is_some() {
            return Ok(true);
        }
        let instream = self.instream()?;
        match timeout(wait, instream.read_u8()).await {
            Ok(Ok(byte)) => {
                self.pending_message_type = Some(byte);
                Ok(true)
            }
            Ok(Err(e)) => Err(RfbClientError::Transport(e)),
            Err(_) => Ok(false),
        }
    }

    async fn handle_server_message(&mut self) -> Result<(), RfbClientError> {
        let msg_type = match self.pending_message_type.take() {
            Some(t) => t,
            None => self.instream()?.read_u8().await.map_err(RfbClientError::Transport)?,
        };

        match msg_type {
            0 => {
                let damage = self
                    .framebuffer
                    .apply_update_stream(self.instream()?)
                    .await?;
                self.surface_damage_announced(damage);
                Ok(())
            }
            1 => {
                SetColorMapEntries::read_from(self.instream()?)
                    .await
                    .map_err(RfbClientError::Transport)?;
                Ok(())
            }
            2 => {
                Bell::read_from(self.instream()?).await.map_err(RfbClientError::Transport)?;
                self.adapter.on_bell();
                Ok(())
            }
            3 => {
                let cut = ServerCutText::read_from(self.instream()?)
                    .await
                    .map_err(RfbClientError::Transport)?;
                self.adapter.on_server_cut_text(cut.text);
                Ok(())
            }
            other => Err(RfbClientError::UnexpectedMessage(format!(
                "unknown server message type {other}"
            ))),
        }
    }

    async fn send_framebuffer_update_request(&mut self, incremental: bool) -> Result<(), RfbClientError> {
        let (width, height) = self.framebuffer_dimensions;
        let outstream = self.outstream()?;
        FramebufferUpdateRequest {
            incremental,
            x: 0,
            y: 0,
            width,
            height,
        }
        .write_to(outstream);
        outstream.flush().await.map_err(RfbClientError::Transport)
    }

    async fn send_pointer_event(&mut self, x: u16, y: u16, button_mask: u8) -> Result<(), RfbClientError> {
        let outstream = self.outstream()?;
        PointerEvent { button_mask, x, y }.write_to(outstream);
        outstream.flush().await.map_err(RfbClientError::Transport)
    }

    async fn send_key_event(&mut self, keysym: u32, down: bool) -> Result<(), RfbClientError> {
        let outstream = self.outstream()?;
        KeyEvent { down, key: keysym }.write_to(outstream);
        outstream.flush().await.map_err(RfbClientError::Transport)
    }

    async fn send_client_cut_text(&mut self, text: &str) -> Result<(), RfbClientError> {
        let outstream = self.outstream()?;
        ClientCutText { text: text.to_string() }.write_to(outstream);
        outstream.flush().await.map_err(RfbClientError::Transport)
    }

    async fn refresh_format_and_encodings(&mut self, encodings: &[i32], use_remote_cursor: bool) -> Result<(), RfbClientError> {
        self.params.encodings = encodings.to_vec();
        self.params.use_remote_cursor = use_remote_cursor;
        let encodings = self.encodings_with_pseudo();
        self.send_set_pixel_format_and_encodings(encodings).await
    }

    fn client_cleanup(&mut self) {
        self.instream = None;
        self.outstream = None;
        self.pending_message_type = None;
        self.adapter.on_connection_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pseudo_encodings_match_rfb_assigned_values() {
        assert_eq!(PSEUDO_ENCODING_CURSOR, -239);
        assert_eq!(PSEUDO_ENCODING_POINTER_POS, -232);
    }

    #[test]
    fn local_pixel_format_is_32_bit_true_color() {
        let pf = local_pixel_format();
        assert_eq!(pf.bytes_per_pixel(), 4);
        assert_eq!(pf.true_color, 1);
        assert_eq!((pf.red_shift, pf.green_shift, pf.blue_shift), (16, 8, 0));
    }

    #[test]
    fn encodings_with_pseudo_appends_cursor_support_only_when_requested() {
        use crate::protocol_adapter::DriverInner;
        use parking_lot::Mutex;

        let flags = Arc::new(ControlFlags::new());
        let framebuffer = Arc::new(Framebuffer::new());
        let (tx, _rx) = flume::unbounded();
        let inner = Arc::new(DriverInner::new(framebuffer.clone(), flags.clone(), tx));
        let owner = Arc::new(Mutex::new(Some(Arc::downgrade(&inner))));
        let adapter = Arc::new(ProtocolAdapter::new(owner));
        let params = CodecParams {
            host: "localhost".to_string(),
            port: 5900,
            connect_timeout: Duration::from_secs(1),
            keepalive_idle: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(3),
            keepalive_count: 3,
            encodings: vec![0, 1],
            use_remote_cursor: true,
        };
        let client = RfbCodecClient::new(params.clone(), flags.clone(), framebuffer.clone(), adapter.clone());
        let with_cursor = client.encodings_with_pseudo();
        assert!(with_cursor.contains(&PSEUDO_ENCODING_CURSOR));
        assert!(with_cursor.contains(&PSEUDO_ENCODING_POINTER_POS));

        let mut params_no_cursor = params;
        params_no_cursor.use_remote_cursor = false;
        let client = RfbCodecClient::new(params_no_cursor, flags, framebuffer, adapter);
        let without_cursor = client.encodings_with_pseudo();
        assert!(!without_cursor.contains(&PSEUDO_ENCODING_CURSOR));
    }
}
