//! `ConnectionDriver`: the dedicated-thread state machine that owns a single RFB
//! connection's lifecycle.
//!
//! Every `Client` spawns exactly one [`std::thread`] running a current-thread
//! `tokio` runtime. That thread, and only that thread, ever touches the live
//! `CodecClient`; everything it shares with the outside world (`ControlFlags`,
//! `Framebuffer`, `EventQueue`, and the mutex-guarded connection parameters) is
//! reachable from any thread via [`Shared`], cheaply cloned as an `Arc`.
//!
//! The outer loop is `establish -> handle -> close`, repeated until
//! `ControlFlags::terminate` is observed.

use crate::codec::{CodecClient, CodecParams, RfbCodecClient};
use crate::config::{encodings_for_quality, Config};
use crate::control_flags::ControlFlags;
use crate::event_queue::{EventQueue, OutboundEvent};
use crate::framebuffer::Framebuffer;
use crate::messages::{ClientCommand, ServerEvent};
use crate::protocol_adapter::{DriverInner, DriverOwnerSlot, ProtocolAdapter};
use crate::quality::Quality;
use crate::state::{ConnectionState, ConnectionStateCell};
use parking_lot::Mutex as PLMutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cross-thread connection parameters the driver re-reads at the top of every
/// `establish` attempt and while deciding how to behave inside `handle`. Every
/// field here can change mid-connection via a [`ClientCommand`]; none of them
/// require tearing down and rebuilding `Shared` itself.
#[derive(Debug, Clone)]
pub(crate) struct ConnParams {
    pub host: String,
    pub port: u16,
    pub quality: Quality,
    pub use_remote_cursor: bool,
    pub scaled_size: (u32, u32),
    pub fast_update_interval_ms: i64,
}

/// Everything a driver thread shares with every [`crate::ClientHandle`] cloned
/// from the `Client` that owns it. One `Shared` per connection (not per attempt);
/// `ConnectionDriver` rebuilds its [`DriverInner`]/[`ProtocolAdapter`] pair fresh
/// on every `establish`, but `Shared`'s own fields persist across reconnects.
pub(crate) struct Shared {
    pub flags: Arc<ControlFlags>,
    pub state: Arc<ConnectionStateCell>,
    pub framebuffer: Arc<Framebuffer>,
    pub event_queue: Arc<EventQueue>,
    pub params: PLMutex<ConnParams>,
    pub owner_slot: DriverOwnerSlot,
    /// General-purpose wakeup, distinct from `event_queue`'s own `Notify`: used by
    /// `ClientHandle` methods that mutate `params`/`flags` directly rather than
    /// pushing an `OutboundEvent`, so the driver's sleeps and waits notice the
    /// change promptly instead of waiting out their full timeout.
    pub wake: tokio::sync::Notify,
}

impl Shared {
    fn new(params: ConnParams) -> Self {
        Self {
            flags: Arc::new(ControlFlags::new()),
            state: Arc::new(ConnectionStateCell::default()),
            framebuffer: Arc::new(Framebuffer::new()),
            event_queue: Arc::new(EventQueue::new()),
            params: PLMutex::new(params),
            owner_slot: Arc::new(PLMutex::new(None)),
            wake: tokio::sync::Notify::new(),
        }
    }

    /// Enqueues an outbound event, but only while connected: events enqueued
    /// outside `Connected` are silently dropped rather than queued for a future
    /// connection that may never negotiate the same state.
    pub fn enqueue(&self, event: OutboundEvent) {
        if self.state.get() == ConnectionState::Connected {
            self.event_queue.push(event);
        }
    }
}

/// Hook invoked on the driver thread immediately after its loop exits, only when
/// `DeleteAfterFinished` was armed (`Client::stop_and_delete_later`). Stands in for
/// "the driver schedules its own destruction on the owning thread"; an embedder
/// wires this to whatever that means in its own executor (e.g. posting a UI event).
pub(crate) type FinishedHook = Box<dyn FnOnce() + Send + 'static>;

/// Builds the shared state for a new connection and spawns its driver thread.
/// Returns immediately; the thread performs its own first `establish` attempt
/// asynchronously, publishing `ServerEvent::StateChanged` as it goes.
pub(crate) fn start(
    config: Config,
    events: flume::Sender<ServerEvent>,
    commands: flume::Receiver<ClientCommand>,
    finished_hook: Option<FinishedHook>,
) -> (Arc<Shared>, std::thread::JoinHandle<()>) {
    let params = ConnParams {
        host: config.connection.host.clone(),
        port: config.connection.port,
        quality: Quality::from(config.display.quality),
        use_remote_cursor: config.display.use_remote_cursor,
        scaled_size: (0, 0),
        fast_update_interval_ms: config.connection.fast_framebuffer_update_interval_ms,
    };
    let shared = Arc::new(Shared::new(params));
    let driver_shared = shared.clone();
    let join = std::thread::Builder::new()
        .name("rfb-client-driver".into())
        .spawn(move || run(config, driver_shared, events, commands, finished_hook))
        .expect("failed to spawn connection driver thread");
    (shared, join)
}

fn run(
    config: Config,
    shared: Arc<Shared>,
    events: flume::Sender<ServerEvent>,
    commands: flume::Receiver<ClientCommand>,
    finished_hook: Option<FinishedHook>,
) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build connection driver runtime");
    runtime.block_on(drive(config, shared.clone(), events, commands));

    shared.owner_slot.lock().take();
    if shared.flags.delete_after_finished() {
        if let Some(hook) = finished_hook {
            hook();
        }
    }
}

fn publish_state(shared: &Shared, events: &flume::Sender<ServerEvent>, next: ConnectionState) {
    if let Some(state) = shared.state.set_if_changed(next) {
        let _ = events.try_send(ServerEvent::StateChanged { state });
    }
}

/// Applies one inbound command. Pointer/keyboard/clipboard commands are realised
/// as [`OutboundEvent`]s through the existing `Shared::enqueue` gate; the rest
/// mutate `params`/`flags` directly since they take effect on the *next* connection
/// attempt (or immediately, for flags the handle loop polls).
fn apply_command(shared: &Shared, cmd: ClientCommand) {
    match cmd {
        ClientCommand::RequestUpdate { .. } => {
            shared.flags.set_trigger_framebuffer_update(true);
        }
        ClientCommand::Pointer { x, y, buttons } => {
            shared.enqueue(OutboundEvent::PointerMove { x, y, button_mask: buttons });
        }
        ClientCommand::Key { key, down } => {
            shared.enqueue(OutboundEvent::Key { keysym: key, pressed: down });
        }
        ClientCommand::ClientCutText { text } => {
            shared.enqueue(OutboundEvent::ClientCut { text });
        }
        ClientCommand::SetHost { host } => {
            shared.params.lock().host = host;
        }
        ClientCommand::SetPort { port } => {
            shared.params.lock().port = port;
        }
        ClientCommand::SetQuality { quality } => {
            shared.params.lock().quality = quality;
            shared.enqueue(OutboundEvent::RefreshFormatAndEncodings);
        }
        ClientCommand::SetUseRemoteCursor { enabled } => {
            shared.params.lock().use_remote_cursor = enabled;
            shared.enqueue(OutboundEvent::RefreshFormatAndEncodings);
        }
        ClientCommand::SetScaledSize { width, height } => {
            shared.params.lock().scaled_size = (width, height);
            shared.flags.set_scaled_dirty(true);
        }
        ClientCommand::SetFramebufferUpdateInterval { interval_ms } => {
            shared.params.lock().fast_update_interval_ms = interval_ms;
        }
        ClientCommand::SetServerReachable => {
            shared.flags.set_server_reachable(true);
        }
        ClientCommand::Restart => {
            shared.flags.set_restart(true);
        }
        ClientCommand::Close => {
            shared.flags.set_terminate();
        }
    }
    shared.wake.notify_one();
}

/// Drains every command currently queued, without waiting. Called at the top of
/// every outer-loop iteration so `setHost`/`SetPort`/`Restart`/`Close` take effect
/// even while the driver is asleep between retries.
fn drain_commands(shared: &Shared, commands: &flume::Receiver<ClientCommand>) {
    while let Ok(cmd) = commands.try_recv() {
        apply_command(shared, cmd);
    }
}

async fn drive(
    config: Config,
    shared: Arc<Shared>,
    events: flume::Sender<ServerEvent>,
    commands: flume::Receiver<ClientCommand>,
) {
    loop {
        drain_commands(&shared, &commands);
        if shared.flags.terminate() {
            break;
        }

        shared.flags.set_restart(false);
        shared.flags.set_server_reachable(false);
        publish_state(&shared, &events, ConnectionState::Connecting);

        match establish(&config, &shared, &events).await {
            Ok((mut codec, inner)) => {
                publish_state(&shared, &events, ConnectionState::Connected);
                handle(&config, &shared, &mut codec, &commands).await;
                codec.client_cleanup();
                drop(inner);
                shared.owner_slot.lock().take();
                publish_state(&shared, &events, ConnectionState::Disconnected);
            }
            Err(failure_state) => {
                publish_state(&shared, &events, failure_state);
                backoff_sleep(&shared, &config).await;
            }
        }
    }
}

/// Attempts one connection. On success, returns the live codec plus the
/// [`DriverInner`] the caller must keep alive for exactly as long as `codec` runs.
/// `ProtocolAdapter` only ever reaches it through a `Weak`, published into
/// `shared.owner_slot` here and cleared by the caller once the connection ends.
async fn establish(
    config: &Config,
    shared: &Arc<Shared>,
    events: &flume::Sender<ServerEvent>,
) -> Result<(RfbCodecClient, Arc<DriverInner>), ConnectionState> {
    let params = shared.params.lock().clone();

    let inner = Arc::new(DriverInner::new(
        shared.framebuffer.clone(),
        shared.flags.clone(),
        events.clone(),
    ));
    *shared.owner_slot.lock() = Some(Arc::downgrade(&inner));
    let adapter = Arc::new(ProtocolAdapter::new(shared.owner_slot.clone()));

    let codec_params = CodecParams {
        host: params.host.clone(),
        port: params.port,
        connect_timeout: config.connect_timeout(),
        keepalive_idle: Duration::from_millis(config.connection.socket_keepalive_idle_ms),
        keepalive_interval: Duration::from_millis(config.connection.socket_keepalive_interval_ms),
        keepalive_count: config.connection.socket_keepalive_count,
        encodings: encodings_for_quality(params.quality),
        use_remote_cursor: params.use_remote_cursor,
    };

    let mut codec = RfbCodecClient::new(
        codec_params,
        shared.flags.clone(),
        shared.framebuffer.clone(),
        adapter,
    );

    match codec.init_client().await {
        Ok(()) => Ok((codec, inner)),
        Err(_err) => {
            shared.owner_slot.lock().take();
            Err(classify_failure_state(shared, config, &params).await)
        }
    }
}

/// Maps a failed `establish` attempt onto one of the driver's failure states:
///
/// - Reachability never confirmed, and either host-pinging is skipped or the
///   host itself doesn't answer a TCP probe → `HostOffline`.
/// - Reachability never confirmed but the host does answer a probe → the RFB
///   server on it never responded → `ServerNotRunning`.
/// - Reachability was confirmed but the framebuffer never got past its initial
///   (pre-handshake-completion) state → `AuthenticationFailed`.
/// - Anything else → `ConnectionFailed`.
async fn classify_failure_state(
    shared: &Shared,
    config: &Config,
    params: &ConnParams,
) -> ConnectionState {
    if !shared.flags.server_reachable() {
        let host_responds = if shared.flags.skip_host_ping() {
            true
        } else {
            crate::platform::ping(&params.host, params.port, config.connect_timeout()).await
        };
        if !host_responds {
            return ConnectionState::HostOffline;
        }
        return ConnectionState::ServerNotRunning;
    }
    if shared.framebuffer.state() == crate::state::FramebufferState::Invalid {
        return ConnectionState::AuthenticationFailed;
    }
    ConnectionState::ConnectionFailed
}

/// Sleeps the backoff interval between failed establish attempts: the configured
/// proactive update interval if positive, else the connection-retry interval.
/// Wakeable early by `shared.wake` so a `SetHost`/`Restart`/`Close` during backoff
/// doesn't have to wait out the whole interval.
async fn backoff_sleep(shared: &Shared, config: &Config) {
    let fast_interval_ms = shared.params.lock().fast_update_interval_ms;
    let duration = if fast_interval_ms > 0 {
        Duration::from_millis(fast_interval_ms as u64)
    } else {
        if fast_interval_ms < 0 {
            tracing::warn!(
                target: "rfb_client::driver",
                "framebuffer-update-interval <= 0 during backoff, using connection-retry-interval instead"
            );
        }
        config.connection_retry_interval()
    };
    tokio::select! {
        () = tokio::time::sleep(duration) => {}
        () = shared.wake.notified() => {}
    }
}

/// Runs the connected phase: repeatedly waits for and dispatches server messages,
/// issues proactive/watchdog update requests, and drains the outbound event queue,
/// until `terminate`/`restart` is observed or the codec reports a fatal error.
async fn handle(
    config: &Config,
    shared: &Arc<Shared>,
    codec: &mut RfbCodecClient,
    commands: &flume::Receiver<ClientCommand>,
) {
    let watchdog_timeout = Duration::from_millis(config.connection.framebuffer_update_watchdog_timeout_ms);
    let mut last_update = Instant::now();

    loop {
        drain_commands(shared, commands);
        if shared.flags.terminate() || shared.flags.restart() {
            return;
        }

        let params = shared.params.lock().clone();
        let periodic_active = params.fast_update_interval_ms > 0;

        // The watchdog/periodic bound the handle loop must re-check against at
        // least this often, or the hard-bound and periodic-incremental branches
        // below can't fire on schedule (spec §4.1 steps 4/5).
        let hard_bound = std::cmp::max(
            Duration::from_millis((2 * params.fast_update_interval_ms.max(0)) as u64),
            watchdog_timeout,
        );

        let loop_start = Instant::now();
        let wait_multiplier = if periodic_active { 100 } else { 1 };
        let raw_wait = Duration::from_millis(config.connection.message_wait_timeout_ms * wait_multiplier);
        // Cap the periodic-mode wait (spec §4.1 step 2's `message-wait-timeout x 100`)
        // at the polling interval itself, not just the watchdog bound: the
        // periodic-incremental branch below only gets checked once per wait, so
        // the wait has to be at least as fine-grained as the interval it's meant
        // to honor, or that branch fires on the wait's cadence instead of the
        // interval's. `hard_bound` is always >= 2x the interval, so this is the
        // tighter of the two and a misconfigured `message_wait_timeout_ms` still
        // can't push either check past its deadline.
        let wait_timeout = if periodic_active {
            let interval = Duration::from_millis(params.fast_update_interval_ms as u64);
            std::cmp::min(raw_wait, std::cmp::min(interval, hard_bound))
        } else {
            raw_wait
        };

        let has_message = tokio::select! {
            res = codec.wait_for_message(wait_timeout) => match res {
                Ok(v) => v,
                Err(_) => return,
            },
            () = shared.wake.notified() => false,
        };

        if has_message {
            loop {
                if codec.handle_server_message().await.is_err() {
                    return;
                }
                last_update = Instant::now();
                match codec.wait_for_message(Duration::from_millis(0)).await {
                    Ok(true) => continue,
                    _ => break,
                }
            }
        } else {
            let elapsed = loop_start.duration_since(last_update);
            if elapsed >= hard_bound {
                if codec.send_framebuffer_update_request(false).await.is_err() {
                    return;
                }
                last_update = Instant::now();
            } else if periodic_active
                && elapsed >= Duration::from_millis(params.fast_update_interval_ms as u64)
            {
                if codec.send_incremental_framebuffer_update_request().await.is_err() {
                    return;
                }
                last_update = Instant::now();
            } else if shared.flags.take_trigger_framebuffer_update()
                && codec.send_incremental_framebuffer_update_request().await.is_err()
            {
                return;
            }
        }

        if periodic_active && shared.flags.requires_manual_update_rate_control() {
            let remaining = Duration::from_millis(params.fast_update_interval_ms as u64)
                .saturating_sub(loop_start.elapsed());
            if !remaining.is_zero() {
                tokio::select! {
                    () = tokio::time::sleep(remaining) => {}
                    () = shared.wake.notified() => {}
                }
            }
        }

        if drain_event_queue(shared, codec, &params).await.is_err() {
            return;
        }
    }
}

/// Drains every event queued since the last pass and forwards it to the codec.
/// Stops (and propagates the error to the caller, which treats it as fatal) the
/// moment the codec reports a transport failure.
async fn drain_event_queue(
    shared: &Shared,
    codec: &mut RfbCodecClient,
    params: &ConnParams,
) -> Result<(), crate::errors::RfbClientError> {
    while let Some(event) = shared.event_queue.try_pop() {
        match event {
            OutboundEvent::PointerMove { x, y, button_mask } => {
                codec.send_pointer_event(x, y, button_mask).await?;
            }
            OutboundEvent::Key { keysym, pressed } => {
                codec.send_key_event(keysym, pressed).await?;
            }
            OutboundEvent::ClientCut { text } => {
                codec.send_client_cut_text(&text).await?;
            }
            OutboundEvent::RefreshFormatAndEncodings => {
                let encodings = encodings_for_quality(params.quality);
                codec
                    .refresh_format_and_encodings(&encodings, params.use_remote_cursor)
                    .await?;
            }
        }
    }
    Ok(())
}

/// Polls `join` until it finishes or `timeout` elapses, logging a warning and
/// leaking the thread in the latter case: the thread is never force-killed,
/// only ever waited-for-then-abandoned.
pub(crate) fn join_with_timeout(join: std::thread::JoinHandle<()>, timeout: Duration) {
    let start = Instant::now();
    while !join.is_finished() {
        if start.elapsed() >= timeout {
            tracing::warn!(
                target: "rfb_client::driver",
                "connection driver thread did not exit within {timeout:?}; leaking it"
            );
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    let _ = join.join();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config(host: &str, port: u16) -> Config {
        let mut config = Config::builder().host(host).port(port).build().unwrap();
        config.connection.connect_timeout_ms = 200;
        config.connection.message_wait_timeout_ms = 20;
        config.connection.connection_retry_interval_ms = 20;
        config
    }

    #[tokio::test]
    async fn establish_against_a_closed_port_classifies_as_host_offline_or_server_not_running() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = test_config("127.0.0.1", addr.port());
        let (tx, _rx) = flume::unbounded();
        let params = ConnParams {
            host: config.connection.host.clone(),
            port: config.connection.port,
            quality: Quality::High,
            use_remote_cursor: true,
            scaled_size: (0, 0),
            fast_update_interval_ms: 0,
        };
        let shared = Arc::new(Shared::new(params));
        let result = establish(&config, &shared, &tx).await;
        assert!(result.is_err());
    }

    #[test]
    fn apply_command_set_host_updates_params_and_wakes() {
        let params = ConnParams {
            host: "old".into(),
            port: 1,
            quality: Quality::High,
            use_remote_cursor: true,
            scaled_size: (0, 0),
            fast_update_interval_ms: 0,
        };
        let shared = Shared::new(params);
        apply_command(&shared, ClientCommand::SetHost { host: "new".into() });
        assert_eq!(shared.params.lock().host, "new");
    }

    #[test]
    fn enqueue_drops_events_while_not_connected() {
        let params = ConnParams {
            host: "h".into(),
            port: 1,
            quality: Quality::High,
            use_remote_cursor: true,
            scaled_size: (0, 0),
            fast_update_interval_ms: 0,
        };
        let shared = Shared::new(params);
        shared.enqueue(OutboundEvent::RefreshFormatAndEncodings);
        assert!(shared.event_queue.is_empty());
        shared.state.set_if_changed(ConnectionState::Connected);
        shared.enqueue(OutboundEvent::RefreshFormatAndEncodings);
        assert!(!shared.event_queue.is_empty());
    }

    #[test]
    fn apply_command_restart_sets_flag() {
        let params = ConnParams {
            host: "h".into(),
            port: 1,
            quality: Quality::High,
            use_remote_cursor: true,
            scaled_size: (0, 0),
            fast_update_interval_ms: 0,
        };
        let shared = Shared::new(params);
        apply_command(&shared, ClientCommand::Restart);
        assert!(shared.flags.restart());
    }
}
