//! Application-facing message types for communication between the client and application.

use rfb_common::Rect;
use rfb_protocol::messages::PixelFormat;

/// A decoded cursor shape, published by the adapter's cursor-shape callback.
///
/// The server-sent pixmap is preserved in whatever 4-bytes-per-pixel layout the
/// decoder produced it in; no format conversion is attempted.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorShape {
    /// RGBA (or equivalent 4-byte) pixel data, `width * height * 4` bytes.
    pub pixels: Vec<u8>,
    /// 1-bit-per-pixel visibility mask, row-major, each row padded to a byte boundary.
    pub mask: Vec<u8>,
    pub width: u16,
    pub height: u16,
    /// Hotspot X offset within the cursor image.
    pub hotspot_x: u16,
    /// Hotspot Y offset within the cursor image.
    pub hotspot_y: u16,
}

/// Events sent from the VNC client to the application.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// The connection has reached a point where the driver has a live codec client
    /// and is about to begin the protocol handshake. Fired once per connection
    /// attempt, before `Connected`.
    ConnectionPrepared,

    /// The connection lifecycle state changed. Fired for
    /// every transition the driver makes, including into the failure states
    /// (`HostOffline`/`ServerNotRunning`/`AuthenticationFailed`/`ConnectionFailed`)
    /// as well as `Connecting`/`Connected`/`Disconnected`. A transition to the same
    /// state is never published, see `ConnectionStateCell::set_if_changed`.
    StateChanged {
        /// The state the driver just transitioned into.
        state: crate::state::ConnectionState,
    },

    /// Successfully connected to the server.
    Connected {
        /// Framebuffer width in pixels.
        width: u16,
        /// Framebuffer height in pixels.
        height: u16,
        /// Server name/description.
        name: String,
        /// Negotiated pixel format.
        pixel_format: PixelFormat,
    },

    /// Framebuffer has been updated.
    ///
    /// The `damage` vector contains all rectangles that were updated.
    /// The application should redraw these regions.
    FramebufferUpdated {
        /// List of rectangles that were updated.
        damage: Vec<Rect>,
    },

    /// Desktop size changed.
    ///
    /// This can happen if the server's screen resolution changes.
    DesktopResized {
        /// New width in pixels.
        width: u16,
        /// New height in pixels.
        height: u16,
    },

    /// The on-screen size a viewer should render at changed (independent of the
    /// underlying framebuffer dimensions, e.g. after `setScaledSize`).
    SizeHintChanged {
        width: u32,
        height: u32,
    },

    /// Server reported a new cursor position (only sent when the server tracks the
    /// cursor itself rather than leaving positioning to the client).
    CursorPosChanged {
        x: u16,
        y: u16,
    },

    /// Server pushed a new cursor shape to render locally.
    CursorShapeUpdated(CursorShape),

    /// Server sent a bell notification.
    Bell,

    /// Server sent clipboard/cut text data.
    ServerCutText {
        /// Clipboard data, already decoded as UTF-8 by the wire layer.
        text: String,
    },

    /// Connection has been closed (gracefully or due to error).
    ConnectionClosed,

    /// An error occurred.
    ///
    /// After this event, the client may attempt to reconnect (if configured)
    /// or shut down.
    Error {
        /// The error message.
        message: String,
    },
}

/// Commands sent from the application to the VNC client.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    /// Request a framebuffer update.
    RequestUpdate {
        /// If true, only send updates for changed regions.
        /// If false, send the entire specified rectangle.
        incremental: bool,
        /// Rectangle to update. If None, update the entire screen.
        rect: Option<Rect>,
    },

    /// Send pointer (mouse) event.
    Pointer {
        /// X coordinate in pixels.
        x: u16,
        /// Y coordinate in pixels.
        y: u16,
        /// Button mask (bit 0 = left, bit 1 = middle, bit 2 = right).
        buttons: u8,
    },

    /// Send keyboard event.
    Key {
        /// X11 keysym value.
        key: u32,
        /// True if key was pressed, false if released.
        down: bool,
    },

    /// Send clipboard/cut text to server.
    ClientCutText {
        /// Text data to send (UTF-8).
        text: String,
    },

    /// Change the server hostname/address used on the *next* connection attempt.
    /// Takes effect only after the current connection is restarted or re-established.
    SetHost { host: String },

    /// Change the server port used on the next connection attempt.
    SetPort { port: u16 },

    /// Change the quality level; enqueues a format/encodings refresh for the next
    /// handle-loop iteration while connected.
    SetQuality { quality: crate::quality::Quality },

    /// Enable or disable requesting the server-rendered cursor shape.
    SetUseRemoteCursor { enabled: bool },

    /// Set the target size for the lazily-rescaled framebuffer view.
    SetScaledSize { width: u32, height: u32 },

    /// Change the proactive incremental-update polling interval.
    SetFramebufferUpdateInterval { interval_ms: i64 },

    /// Tell the driver the host has been externally confirmed reachable (skips the
    /// next establish-phase ping).
    SetServerReachable,

    /// Ask the driver to cleanly exit the handle loop and re-run `establish`.
    Restart,

    /// Close the connection.
    Close,
}
