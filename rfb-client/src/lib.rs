//! High-level VNC client connection engine.
//!
//! This crate provides the connection-management core of a VNC client: RFB
//! handshake, framebuffer decoding, reconnection, and input/clipboard plumbing.
//! Rendering, platform input capture, and any GUI toolkit are deliberately left
//! to an embedding application; this crate hands it pixel snapshots and a
//! stream of [`ServerEvent`]s, and accepts [`ClientCommand`]s or the equivalent
//! [`ClientHandle`] methods in return.
//!
//! # Features
//!
//! - **Dedicated connection thread**: each [`Client`] owns one OS thread running
//!   a single-threaded `tokio` runtime; no shared thread pool, no surprise
//!   cross-connection contention.
//! - **All standard encodings**: Raw, CopyRect, RRE, Hextile, Tight, ZRLE.
//! - **Automatic reconnection**: the driver re-enters `establish` after every
//!   disconnect until explicitly stopped.
//! - **Runtime-tunable quality/cursor/scaling**: changeable mid-connection via
//!   [`ClientHandle`] without tearing down the socket.
//! - **Type-safe API**: strongly-typed messages and events, no stringly-typed
//!   protocol surface leaking out of the crate.
//!
//! # Quick Start
//!
//! ```no_run
//! use rfb_client::{Config, ClientBuilder, ServerEvent};
//! use anyhow::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::builder()
//!         .host("localhost")
//!         .port(5900)
//!         .build()?;
//!
//!     let client = ClientBuilder::new(config).build().await?;
//!     let handle = client.handle();
//!
//!     while let Ok(event) = handle.events().recv_async().await {
//!         match event {
//!             ServerEvent::Connected { width, height, .. } => {
//!                 println!("Connected: {width}x{height}");
//!             }
//!             ServerEvent::FramebufferUpdated { .. } => {
//!                 let _image = handle.image();
//!             }
//!             _ => {}
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! A [`Client`] spawns exactly one dedicated OS thread (see [`driver`]), which
//! hosts a current-thread `tokio` runtime for the lifetime of the connection.
//! That thread alone performs socket I/O and pixel-buffer writes; every other
//! thread only ever touches atomics, a mutex-guarded parameter block, and
//! reference-counted framebuffer snapshots.
//!
//! # Error Handling
//!
//! This crate follows a **fail-fast policy**: errors are reported immediately
//! with clear, actionable messages via [`ServerEvent::Error`] and the
//! connection-state machine's failure states. There are no silent fallbacks.
//!
//! # Safety
//!
//! This crate is `#![forbid(unsafe_code)]` and uses only safe Rust.

#![forbid(unsafe_code)]
#![deny(
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::cargo
)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)] // TODO: Remove once docs are complete

// Public modules
pub mod config;
pub mod control_flags;
pub mod errors;
pub mod event_queue;
pub mod host_address;
pub mod messages;
pub mod platform;
pub mod quality;
pub mod state;

// Private implementation modules
mod codec;
mod driver;
mod framebuffer;
mod protocol_adapter;

// Optional CLI support
#[cfg(feature = "cli")]
pub mod args;

// Re-exports
pub use config::Config;
pub use errors::RfbClientError;
pub use framebuffer::FramebufferSnapshot;
pub use messages::{ClientCommand, CursorShape, ServerEvent};
pub use quality::Quality;
pub use state::ConnectionState;

use driver::FinishedHook;
use std::sync::Arc;
use std::time::Duration;

/// Builder for creating a VNC client.
///
/// # Examples
///
/// ```no_run
/// use rfb_client::{Config, ClientBuilder};
/// # use anyhow::Result;
///
/// # async fn example() -> Result<()> {
/// let config = Config::builder()
///     .host("localhost")
///     .port(5900)
///     .build()?;
///
/// let client = ClientBuilder::new(config).build().await?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    config: Config,
    finished_hook: Option<FinishedHook>,
}

impl ClientBuilder {
    /// Creates a new client builder with the given configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config, finished_hook: None }
    }

    /// Registers a hook invoked on the driver thread once its loop exits, but
    /// only when [`Client::stop_and_delete_later`] armed the `DeleteAfterFinished`
    /// flag. Stands in for "the driver schedules its own destruction on the
    /// owning thread" in embedders that have such a thread (e.g. posting a UI
    /// event that drops the last `ClientHandle`).
    #[must_use]
    pub fn with_finished_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.finished_hook = Some(Box::new(hook));
        self
    }

    /// Validates the configuration and spawns the connection driver thread.
    ///
    /// Returns immediately; the driver performs its first connection attempt
    /// asynchronously and reports progress through [`ClientHandle::events`].
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub async fn build(self) -> Result<Client, RfbClientError> {
        self.config.validate()?;

        let (cmd_tx, cmd_rx) = flume::bounded(32);
        let (event_tx, event_rx) = flume::bounded(256);
        let thread_termination_timeout =
            Duration::from_millis(self.config.connection.thread_termination_timeout_ms);

        let (shared, join) = driver::start(self.config, event_tx, cmd_rx, self.finished_hook);

        Ok(Client {
            handle: ClientHandle { shared, commands: cmd_tx, events: event_rx },
            join: Some(join),
            thread_termination_timeout,
        })
    }
}

/// Handle for interacting with a running VNC client.
///
/// Cheap to clone and safe to share across threads. Commands queued via
/// [`ClientHandle::send`] (or the typed convenience methods) are applied on the
/// driver thread; [`ClientHandle::image`]/[`ClientHandle::scaled_framebuffer`]
/// read the shared framebuffer directly without crossing the driver thread at
/// all.
#[derive(Clone)]
pub struct ClientHandle {
    shared: Arc<driver::Shared>,
    commands: flume::Sender<ClientCommand>,
    events: flume::Receiver<ServerEvent>,
}

impl ClientHandle {
    /// Sends a command to the connection driver.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver thread has already exited.
    pub fn send(&self, cmd: ClientCommand) -> Result<(), RfbClientError> {
        self.commands.send(cmd).map_err(|_| RfbClientError::ConnectionClosed)
    }

    /// Returns a reference to the event receiver.
    ///
    /// Events can be received using `recv()`, `recv_async()`, `try_recv()`, or
    /// by iterating over the receiver.
    #[must_use]
    pub fn events(&self) -> &flume::Receiver<ServerEvent> {
        &self.events
    }

    /// Returns the driver's current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Returns a reference-counted snapshot of the current framebuffer contents.
    /// Empty (zero-sized) before the first complete update has been decoded.
    #[must_use]
    pub fn image(&self) -> FramebufferSnapshot {
        self.shared.framebuffer.snapshot()
    }

    /// Returns the framebuffer rescaled to the size set by
    /// [`ClientHandle::set_scaled_size`]. Empty if no size has been set, the
    /// target size is empty, or no valid framebuffer exists yet. The scaled
    /// copy is cached and only recomputed after a scaling-relevant change
    /// (framebuffer update, resize, or a new target size).
    #[must_use]
    pub fn scaled_framebuffer(&self) -> FramebufferSnapshot {
        let size = self.shared.params.lock().scaled_size;
        self.shared
            .framebuffer
            .rescale_to(&self.shared.flags, size)
            .unwrap_or_else(FramebufferSnapshot::empty)
    }

    /// Sends a pointer (mouse) event. Dropped silently if not currently connected.
    pub fn mouse_event(&self, x: u16, y: u16, button_mask: u8) -> Result<(), RfbClientError> {
        self.send(ClientCommand::Pointer { x, y, buttons: button_mask })
    }

    /// Sends a key press/release event. Dropped silently if not currently connected.
    pub fn key_event(&self, keysym: u32, pressed: bool) -> Result<(), RfbClientError> {
        self.send(ClientCommand::Key { key: keysym, down: pressed })
    }

    /// Sends clipboard text to the server. Dropped silently if not currently connected.
    pub fn client_cut(&self, text: impl Into<String>) -> Result<(), RfbClientError> {
        self.send(ClientCommand::ClientCutText { text: text.into() })
    }

    /// Changes the server hostname used on the next connection attempt.
    pub fn set_host(&self, host: impl Into<String>) -> Result<(), RfbClientError> {
        self.send(ClientCommand::SetHost { host: host.into() })
    }

    /// Changes the server port used on the next connection attempt.
    pub fn set_port(&self, port: u16) -> Result<(), RfbClientError> {
        self.send(ClientCommand::SetPort { port })
    }

    /// Changes the encoding quality level. Takes effect on the current
    /// connection via a format/encodings refresh if already connected.
    pub fn set_quality(&self, quality: Quality) -> Result<(), RfbClientError> {
        self.send(ClientCommand::SetQuality { quality })
    }

    /// Enables or disables requesting the server-rendered remote cursor.
    pub fn set_use_remote_cursor(&self, enabled: bool) -> Result<(), RfbClientError> {
        self.send(ClientCommand::SetUseRemoteCursor { enabled })
    }

    /// Sets the target size for [`ClientHandle::scaled_framebuffer`].
    pub fn set_scaled_size(&self, width: u32, height: u32) -> Result<(), RfbClientError> {
        self.send(ClientCommand::SetScaledSize { width, height })
    }

    /// Changes the proactive incremental-update polling interval, in
    /// milliseconds. Zero or negative disables proactive polling.
    pub fn set_framebuffer_update_interval(&self, interval_ms: i64) -> Result<(), RfbClientError> {
        self.send(ClientCommand::SetFramebufferUpdateInterval { interval_ms })
    }

    /// Tells the driver the host has been externally confirmed reachable,
    /// skipping the next establish-phase ping on a failure classification.
    pub fn set_server_reachable(&self) -> Result<(), RfbClientError> {
        self.send(ClientCommand::SetServerReachable)
    }

    /// Asks the driver to cleanly tear down the current connection and
    /// immediately re-run `establish`.
    pub fn restart(&self) -> Result<(), RfbClientError> {
        self.send(ClientCommand::Restart)
    }
}

/// A running VNC client connection.
///
/// Use [`Client::handle`] to get a [`ClientHandle`] for sending commands and
/// receiving events from any thread. The underlying driver thread keeps running
/// (and reconnecting) until [`Client::stop`] is called or the `Client` is
/// dropped.
pub struct Client {
    handle: ClientHandle,
    join: Option<std::thread::JoinHandle<()>>,
    thread_termination_timeout: Duration,
}

impl Client {
    /// Returns a handle for interacting with the client.
    ///
    /// The handle can be cloned and used from multiple threads.
    #[must_use]
    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// Signals the driver to terminate and waits (up to the configured
    /// `thread-termination-timeout`) for its thread to exit. If the thread
    /// hasn't exited by then, it is abandoned with a warning rather than
    /// force-killed.
    pub fn stop(mut self) {
        self.handle.shared.flags.set_terminate();
        self.handle.shared.wake.notify_one();
        if let Some(join) = self.join.take() {
            driver::join_with_timeout(join, self.thread_termination_timeout);
        }
    }

    /// Signals the driver to terminate and arms `DeleteAfterFinished`, then
    /// returns immediately without waiting for the thread to exit. Any
    /// [`ClientBuilder::with_finished_hook`] hook runs on the driver thread once
    /// its loop exits. Use this from contexts where blocking for
    /// `thread-termination-timeout` (as [`Client::stop`] may) isn't acceptable.
    pub fn stop_and_delete_later(mut self) {
        self.handle.shared.flags.set_delete_after_finished(true);
        self.handle.shared.flags.set_terminate();
        self.handle.shared.wake.notify_one();
        self.join = None;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.handle.shared.flags.set_terminate();
        self.handle.shared.wake.notify_one();
        if let Some(join) = self.join.take() {
            driver::join_with_timeout(join, self.thread_termination_timeout);
        }
    }
}
