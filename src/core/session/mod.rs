//! Session: the consent-gated connection state machine.
//!
//! A session owns at most one data channel. The peer that dials becomes the
//! **controller**; the peer that accepts becomes the **host** and shares its
//! screen. No application message is processed on an inbound channel until
//! the local user has accepted it.
//!
//! ```text
//! Idle ─connect_to─▶ Connecting ─open─▶ AwaitingAcceptance ─connection-accepted─▶ Connected
//!  │                                                                               ▲
//!  └─inbound channel─▶ AwaitingConsent ─accept_pending───────────────────────────┘
//! ```
//!
//! Every teardown path (remote close, channel error, timeout, local
//! disconnect) funnels into one idempotent routine that returns to `Idle`.
//!
//! The session is single-writer: it is driven by one task (see
//! [`PeerNode`](crate::core::node::PeerNode)) that feeds it transport
//! events, user commands and clock ticks.

pub mod input;
pub mod media;

use crate::core::config::SessionConfig;
use crate::core::connection::{Channel, ChannelId, Transport, TransportEvent};
use crate::core::error::{Result, SessionError};
use crate::core::events::{EventSink, SessionEvent};
use crate::core::identity::{IdentityProvider, PeerId};
use crate::core::protocol::{WireMessage, frame};
use crate::core::transfer::file::OutgoingFile;
use crate::core::transfer::TransferEngine;
use bytes::Bytes;
use input::{InputEvent, InputExecutor, LoggingInputExecutor};
use media::{MediaState, MediaStream, NoCapture, ScreenCapture};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Our role in the current connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// No channel is open.
    Unbound,
    /// We accepted the connection and share our screen.
    Host,
    /// We dialed and view/control the host.
    Controller,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// A remote peer asked to connect; waiting for the local user.
    AwaitingConsent,
    /// Channel requested, not yet open.
    Connecting,
    /// Channel open, waiting for the host's `connection-accepted`.
    AwaitingAcceptance,
    Connected,
}

/// An inbound channel that has not been accepted yet.
#[derive(Debug)]
struct PendingConnectionRequest {
    channel: Arc<dyn Channel>,
    open: bool,
    deadline: Instant,
}

pub struct Session {
    identity: IdentityProvider,
    local_id: Option<PeerId>,
    transport: Arc<dyn Transport>,
    capture: Arc<dyn ScreenCapture>,
    input: Box<dyn InputExecutor>,
    events: EventSink,
    config: SessionConfig,

    state: SessionState,
    role: Role,
    /// We dialed the current channel.
    initiator: bool,
    channel: Option<Arc<dyn Channel>>,
    pending: Option<PendingConnectionRequest>,
    /// Deadline for `Connecting`/`AwaitingAcceptance`.
    connect_deadline: Option<Instant>,

    local_stream: Option<Box<dyn MediaStream>>,
    remote_stream: Option<Box<dyn MediaStream>>,
    pointer_focus: bool,

    transfers: TransferEngine,
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>, events: EventSink, config: SessionConfig) -> Self {
        Self {
            identity: IdentityProvider::ephemeral(),
            local_id: None,
            transport,
            capture: Arc::new(NoCapture),
            input: Box::new(LoggingInputExecutor::default()),
            transfers: TransferEngine::new(config.clone(), events.clone()),
            events,
            config,
            state: SessionState::Idle,
            role: Role::Unbound,
            initiator: false,
            channel: None,
            pending: None,
            connect_deadline: None,
            local_stream: None,
            remote_stream: None,
            pointer_focus: false,
        }
    }

    pub fn with_identity(mut self, identity: IdentityProvider) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_capture(mut self, capture: Arc<dyn ScreenCapture>) -> Self {
        self.capture = capture;
        self
    }

    pub fn with_input_executor(mut self, input: Box<dyn InputExecutor>) -> Self {
        self.input = input;
        self
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_id(&self) -> Option<&PeerId> {
        self.local_id.as_ref()
    }

    /// Remote peer of the active channel.
    pub fn remote_id(&self) -> Option<&PeerId> {
        self.channel.as_ref().map(|ch| ch.remote())
    }

    /// Remote peer of the request awaiting consent.
    pub fn pending_remote(&self) -> Option<&PeerId> {
        self.pending.as_ref().map(|p| p.channel.remote())
    }

    pub fn media_state(&self) -> MediaState {
        MediaState::derive(self.local_stream.is_some(), self.remote_stream.is_some())
    }

    pub fn transfers(&self) -> &TransferEngine {
        &self.transfers
    }

    /// Input is forwarded only by a connected controller whose pointer is
    /// over the remote view.
    pub fn is_controlling(&self) -> bool {
        self.role == Role::Controller && self.state == SessionState::Connected && self.pointer_focus
    }

    // ── Identity ─────────────────────────────────────────────────────────────

    /// Load or create our id and register it with the transport.
    ///
    /// [`SessionEvent::Ready`] follows once the transport confirms.
    pub fn initialize(&mut self) -> Result<PeerId> {
        let id = self.identity.load_or_create();
        self.local_id = Some(id.clone());
        self.transport.register(&id)?;
        Ok(id)
    }

    /// Drop any connection and re-register under a fresh id.
    pub fn refresh_identity(&mut self) -> Result<PeerId> {
        self.disconnect();
        let id = self.identity.regenerate(self.local_id.as_ref());
        info!(event = "peer_id_refreshed", %id, "Registering new peer id");
        self.local_id = Some(id.clone());
        self.transport.register(&id)?;
        Ok(id)
    }

    fn on_identity_unavailable(&mut self, taken: PeerId) {
        if self.local_id.as_ref() != Some(&taken) {
            return;
        }
        let id = self.identity.regenerate(Some(&taken));
        let collision = SessionError::IdentityCollision(taken.to_string());
        warn!(
            event = "peer_id_collision",
            error = %collision,
            replacement = %id,
            "Retrying registration"
        );
        self.local_id = Some(id.clone());
        if let Err(e) = self.transport.register(&id) {
            error!(event = "peer_id_register_failure", %id, error = %e);
            self.events.notify(SessionEvent::Error(e.to_string()));
        }
    }

    // ── Connection lifecycle ─────────────────────────────────────────────────

    /// Dial `remote`. Validation happens before the transport is touched.
    pub fn connect_to(&mut self, remote: &str, now: Instant) -> Result<()> {
        let remote: PeerId = remote.trim().parse()?;
        if self.channel.is_some() || self.pending.is_some() {
            return Err(SessionError::SessionBusy);
        }
        if self.local_id.as_ref() == Some(&remote) {
            return Err(SessionError::SelfConnection(remote.to_string()));
        }

        let channel = self.transport.connect(&remote)?;
        info!(
            event = "connect_initiated",
            remote = %remote,
            channel = channel.id(),
            "Dialing peer"
        );
        self.channel = Some(channel);
        self.initiator = true;
        self.state = SessionState::Connecting;
        self.connect_deadline = Some(now + self.config.connect_timeout());
        self.events.notify(SessionEvent::Connecting { remote_id: remote });
        Ok(())
    }

    /// Grant the pending request: we become the host and start sharing.
    pub fn accept_pending(&mut self, now: Instant) -> Result<()> {
        let request = self.pending.take().ok_or(SessionError::NoPendingRequest)?;
        info!(
            event = "connection_accepted",
            remote = %request.channel.remote(),
            "Connection request accepted"
        );

        self.channel = Some(request.channel);
        self.role = Role::Host;
        self.initiator = false;
        if request.open {
            self.complete_host_accept()
        } else {
            self.state = SessionState::Connecting;
            self.connect_deadline = Some(now + self.config.connect_timeout());
            Ok(())
        }
    }

    /// Decline the pending request and close its channel.
    pub fn reject_pending(&mut self) -> Result<()> {
        let request = self.pending.take().ok_or(SessionError::NoPendingRequest)?;
        info!(
            event = "connection_rejected",
            remote = %request.channel.remote(),
            "Connection request rejected"
        );
        request.channel.close();
        self.state = SessionState::Idle;
        Ok(())
    }

    /// Close everything: pending request, channel, streams and transfers.
    pub fn disconnect(&mut self) {
        if let Some(request) = self.pending.take() {
            request.channel.close();
        }
        self.close_session(Some("closed locally".into()));
    }

    fn complete_host_accept(&mut self) -> Result<()> {
        let Some(channel) = self.channel.clone() else {
            return Err(SessionError::NotConnected);
        };
        if let Err(e) = channel.send_message(&WireMessage::ConnectionAccepted) {
            self.close_session(Some(e.to_string()));
            return Err(e);
        }

        self.state = SessionState::Connected;
        self.connect_deadline = None;
        info!(event = "session_connected", remote = %channel.remote(), role = "host");
        self.events.notify(SessionEvent::Connected {
            remote_id: channel.remote().clone(),
            role: Role::Host,
        });

        if let Err(e) = self.start_sharing() {
            warn!(event = "host_share_failure", error = %e, "Connected without screen share");
        }
        Ok(())
    }

    fn on_incoming_channel(&mut self, channel: Arc<dyn Channel>, now: Instant) {
        if self.channel.is_some() || self.pending.is_some() {
            warn!(
                event = "incoming_while_busy",
                remote = %channel.remote(),
                "Closing inbound channel, session busy"
            );
            channel.close();
            return;
        }

        let remote_id = channel.remote().clone();
        info!(event = "connection_request", remote = %remote_id, "Peer requests a connection");
        self.pending = Some(PendingConnectionRequest {
            channel,
            open: false,
            deadline: now + self.config.consent_timeout(),
        });
        self.state = SessionState::AwaitingConsent;
        self.events.notify(SessionEvent::IncomingConnection { remote_id });
    }

    fn on_channel_open(&mut self, id: ChannelId) {
        if let Some(request) = self.pending.as_mut().filter(|p| p.channel.id() == id) {
            request.open = true;
            return;
        }
        if !self.is_active_channel(id) || self.state != SessionState::Connecting {
            debug!(event = "stale_channel_open", channel = id);
            return;
        }

        if self.initiator {
            self.role = Role::Controller;
            self.state = SessionState::AwaitingAcceptance;
            debug!(event = "awaiting_acceptance", channel = id);
        } else if let Err(e) = self.complete_host_accept() {
            error!(event = "host_accept_failure", error = %e);
        }
    }

    fn on_channel_closed(&mut self, id: ChannelId) {
        if self.pending.as_ref().is_some_and(|p| p.channel.id() == id) {
            if let Some(request) = self.pending.take() {
                info!(event = "connection_request_withdrawn", remote = %request.channel.remote());
                self.state = SessionState::Idle;
                self.events.notify(SessionEvent::ConsentExpired {
                    remote_id: request.channel.remote().clone(),
                });
            }
            return;
        }
        if self.is_active_channel(id) {
            self.close_session(Some("remote closed the channel".into()));
        }
    }

    fn on_channel_error(&mut self, id: ChannelId, error: String) {
        if self.pending.as_ref().is_some_and(|p| p.channel.id() == id) {
            warn!(event = "pending_channel_error", channel = id, %error);
            if let Some(request) = self.pending.take() {
                request.channel.close();
            }
            self.state = SessionState::Idle;
            return;
        }
        if self.is_active_channel(id) {
            error!(event = "channel_error", channel = id, %error);
            let reported = SessionError::ChannelError(error.clone());
            self.events.notify(SessionEvent::Error(reported.to_string()));
            self.close_session(Some(error));
        }
    }

    /// Return to `Idle`, releasing the channel, both streams and any transfer.
    ///
    /// Safe to call in any state and any number of times; `Disconnected` is
    /// only reported when a channel was actually torn down.
    fn close_session(&mut self, reason: Option<String>) {
        let channel = self.channel.take();
        if let Some(channel) = &channel {
            channel.close();
        }
        if let Some(mut stream) = self.local_stream.take() {
            stream.stop();
        }
        if let Some(mut stream) = self.remote_stream.take() {
            stream.stop();
        }
        self.transfers.reset();

        self.role = Role::Unbound;
        self.initiator = false;
        self.pointer_focus = false;
        self.connect_deadline = None;
        self.state = if self.pending.is_some() {
            SessionState::AwaitingConsent
        } else {
            SessionState::Idle
        };

        if let Some(channel) = channel {
            info!(
                event = "session_closed",
                remote = %channel.remote(),
                reason = reason.as_deref().unwrap_or("none")
            );
            self.events.notify(SessionEvent::Disconnected { reason });
        }
    }

    fn is_active_channel(&self, id: ChannelId) -> bool {
        self.channel.as_ref().is_some_and(|ch| ch.id() == id)
    }

    // ── Transport events ─────────────────────────────────────────────────────

    pub fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Registered(id) => {
                if self.local_id.as_ref() == Some(&id) {
                    info!(event = "peer_id_registered", %id, "Ready for connections");
                    self.events.notify(SessionEvent::Ready { local_id: id });
                }
            }
            TransportEvent::IdentityUnavailable(id) => self.on_identity_unavailable(id),
            TransportEvent::IncomingChannel(channel) => self.on_incoming_channel(channel, now),
            TransportEvent::ChannelOpen(id) => self.on_channel_open(id),
            TransportEvent::ChannelData { channel, frame } => {
                self.on_channel_data(channel, frame, now)
            }
            TransportEvent::ChannelClosed(id) => self.on_channel_closed(id),
            TransportEvent::ChannelError { channel, error } => {
                self.on_channel_error(channel, error)
            }
            TransportEvent::IncomingCall { from, stream } => self.on_incoming_call(from, stream),
        }
    }

    fn on_channel_data(&mut self, id: ChannelId, frame: Bytes, now: Instant) {
        if !self.is_active_channel(id) {
            if self.pending.as_ref().is_some_and(|p| p.channel.id() == id) {
                warn!(event = "protocol_violation", channel = id, "Data before consent, dropped");
            }
            return;
        }

        let result = frame::decode(&frame).and_then(|msg| {
            debug!(event = "message_received", kind = msg.kind());
            self.dispatch(msg, now)
        });
        match result {
            Ok(()) => {}
            Err(SessionError::ProtocolViolation(reason)) => {
                warn!(event = "protocol_violation", channel = id, %reason, "Message dropped");
            }
            Err(e) => {
                error!(event = "message_failure", channel = id, error = %e);
                self.events.notify(SessionEvent::Error(e.to_string()));
            }
        }
    }

    fn dispatch(&mut self, msg: WireMessage, now: Instant) -> Result<()> {
        match msg {
            WireMessage::ConnectionAccepted => self.on_connection_accepted(),
            WireMessage::RequestScreen => self.on_request_screen(),
            WireMessage::ScreenShareStopped => {
                self.on_remote_share_stopped();
                Ok(())
            }
            msg @ (WireMessage::FileRequest { .. }
            | WireMessage::FileAccepted
            | WireMessage::FileRejected
            | WireMessage::FileChunk { .. }) => {
                if self.state != SessionState::Connected {
                    return Err(SessionError::ProtocolViolation(format!(
                        "{} before the session is connected",
                        msg.kind()
                    )));
                }
                let Some(channel) = &self.channel else {
                    return Err(SessionError::NotConnected);
                };
                self.transfers.handle_message(channel.as_ref(), msg, now)
            }
            msg @ (WireMessage::MouseMove { .. }
            | WireMessage::MouseClick { .. }
            | WireMessage::KeyPress { .. }) => self.on_remote_input(msg),
        }
    }

    fn on_connection_accepted(&mut self) -> Result<()> {
        let awaiting = matches!(
            self.state,
            SessionState::Connecting | SessionState::AwaitingAcceptance
        );
        if !self.initiator || !awaiting {
            return Err(SessionError::ProtocolViolation(
                "unexpected connection-accepted".into(),
            ));
        }
        let Some(channel) = self.channel.clone() else {
            return Err(SessionError::NotConnected);
        };

        self.role = Role::Controller;
        self.state = SessionState::Connected;
        self.connect_deadline = None;
        info!(event = "session_connected", remote = %channel.remote(), role = "controller");
        self.events.notify(SessionEvent::Connected {
            remote_id: channel.remote().clone(),
            role: Role::Controller,
        });

        if self.remote_stream.is_none() {
            channel.send_message(&WireMessage::RequestScreen)?;
        }
        Ok(())
    }

    fn on_request_screen(&mut self) -> Result<()> {
        if self.state != SessionState::Connected || self.role != Role::Host {
            return Err(SessionError::ProtocolViolation(
                "requestScreen is only honored by a connected host".into(),
            ));
        }
        if let Err(e) = self.start_sharing() {
            warn!(event = "requested_share_failure", error = %e);
        }
        Ok(())
    }

    // ── Screen share ─────────────────────────────────────────────────────────

    /// Start sharing the local screen with the connected peer.
    pub fn share_screen(&mut self) -> Result<()> {
        if self.state != SessionState::Connected {
            return Err(SessionError::NotConnected);
        }
        self.start_sharing()
    }

    /// Stop the local share and tell the peer. No-op when not sharing.
    pub fn stop_sharing(&mut self) {
        let Some(mut stream) = self.local_stream.take() else {
            return;
        };
        stream.stop();
        info!(event = "share_stopped", stream = stream.id());
        self.events.notify(SessionEvent::SharingStopped);

        if let Some(channel) = &self.channel {
            if let Err(e) = channel.send_message(&WireMessage::ScreenShareStopped) {
                warn!(event = "share_stop_notify_failure", error = %e);
            }
        }
    }

    /// The platform ended the local capture (e.g. the user clicked "stop
    /// sharing" in the OS picker).
    pub fn on_local_stream_ended(&mut self) {
        self.stop_sharing();
    }

    /// Capture the screen and call the peer. Already sharing is a no-op.
    fn start_sharing(&mut self) -> Result<()> {
        if self.local_stream.is_some() {
            debug!(event = "share_already_active");
            return Ok(());
        }
        let Some(channel) = self.channel.clone() else {
            return Err(SessionError::NotConnected);
        };

        let mut stream = match self.capture.capture() {
            Ok(stream) => stream,
            Err(e) => {
                self.events.notify(SessionEvent::MediaError(e.to_string()));
                return Err(e);
            }
        };
        if let Err(e) = self.transport.call(channel.remote(), stream.as_ref()) {
            stream.stop();
            self.events.notify(SessionEvent::MediaError(e.to_string()));
            return Err(e);
        }

        info!(event = "share_started", stream = stream.id(), remote = %channel.remote());
        self.local_stream = Some(stream);
        self.events.notify(SessionEvent::SharingStarted);
        Ok(())
    }

    fn on_remote_share_stopped(&mut self) {
        if let Some(mut stream) = self.remote_stream.take() {
            stream.stop();
            info!(event = "remote_share_stopped", stream = stream.id());
            self.events.notify(SessionEvent::RemoteShareStopped);
        }
    }

    fn on_incoming_call(&mut self, from: PeerId, mut stream: Box<dyn MediaStream>) {
        // The call travels outside the data channel and may overtake
        // `connection-accepted`.
        let live = matches!(
            self.state,
            SessionState::Connecting | SessionState::AwaitingAcceptance | SessionState::Connected
        );
        if !live || self.remote_id() != Some(&from) {
            warn!(
                event = "unexpected_call",
                %from,
                "Rejecting media call from outside the session"
            );
            stream.stop();
            return;
        }

        if let Some(mut previous) = self.remote_stream.take() {
            previous.stop();
        }
        let stream_id = stream.id().to_string();
        info!(event = "remote_stream_started", %from, stream = %stream_id);
        self.remote_stream = Some(stream);
        self.events.notify(SessionEvent::RemoteStreamStarted { stream_id });
    }

    // ── Remote input ─────────────────────────────────────────────────────────

    /// Track whether the pointer is over the remote view.
    pub fn set_pointer_focus(&mut self, focused: bool) {
        self.pointer_focus = focused;
    }

    /// Forward one input event to the host.
    pub fn send_input(&mut self, event: InputEvent) -> Result<()> {
        if !self.is_controlling() {
            return Err(SessionError::NotControlling);
        }
        event.validate()?;
        let Some(channel) = &self.channel else {
            return Err(SessionError::NotConnected);
        };
        channel.send_message(&event.to_wire())
    }

    fn on_remote_input(&mut self, msg: WireMessage) -> Result<()> {
        if self.role != Role::Host || self.state != SessionState::Connected {
            return Err(SessionError::ProtocolViolation(format!(
                "{} is only executed by a connected host",
                msg.kind()
            )));
        }
        let Some(event) = InputEvent::from_wire(msg) else {
            return Ok(());
        };
        event.validate()?;
        input::execute(self.input.as_mut(), &event);
        Ok(())
    }

    // ── File transfer ────────────────────────────────────────────────────────

    pub fn offer_file(&mut self, file: OutgoingFile, now: Instant) -> Result<()> {
        let channel = self.connected_channel()?;
        self.transfers.offer_file(channel.as_ref(), file, now)
    }

    pub fn accept_incoming_file(&mut self, now: Instant) -> Result<()> {
        let channel = self.connected_channel()?;
        self.transfers.accept_incoming(channel.as_ref(), now)
    }

    pub fn reject_incoming_file(&mut self) -> Result<()> {
        let channel = self.connected_channel()?;
        self.transfers.reject_incoming(channel.as_ref())
    }

    pub fn has_pending_chunks(&self) -> bool {
        self.channel.is_some() && self.transfers.has_pending_chunks()
    }

    /// Send one outbound chunk. Returns whether more remain.
    pub fn pump_transfer(&mut self) -> bool {
        let Some(channel) = self.channel.clone() else {
            return false;
        };
        match self.transfers.pump(channel.as_ref()) {
            Ok(more) => more,
            Err(e) => {
                error!(event = "chunk_send_failure", error = %e);
                false
            }
        }
    }

    fn connected_channel(&self) -> Result<Arc<dyn Channel>> {
        match &self.channel {
            Some(channel) if self.state == SessionState::Connected => Ok(channel.clone()),
            _ => Err(SessionError::NotConnected),
        }
    }

    // ── Clock ────────────────────────────────────────────────────────────────

    /// Enforce consent, connect and transfer deadlines.
    pub fn tick(&mut self, now: Instant) {
        if self.pending.as_ref().is_some_and(|p| now >= p.deadline) {
            if let Some(request) = self.pending.take() {
                let remote_id = request.channel.remote().clone();
                info!(
                    event = "consent_expired",
                    remote = %remote_id,
                    "Connection request timed out"
                );
                request.channel.close();
                if self.channel.is_none() {
                    self.state = SessionState::Idle;
                }
                self.events.notify(SessionEvent::ConsentExpired { remote_id });
            }
        }

        if self.connect_deadline.is_some_and(|deadline| now >= deadline) {
            warn!(event = "connect_timeout", state = ?self.state, "Connection attempt timed out");
            let reported = SessionError::ConnectTimeout.to_string();
            self.events.notify(SessionEvent::Error(reported.clone()));
            self.close_session(Some(reported));
        }

        let channel = self.channel.clone();
        self.transfers.expire(channel.as_deref(), now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PEER_ID_FILE;
    use crate::core::connection::memory::{
        MemoryCapture, MemoryNetwork, MemoryStream, MemoryTransport,
    };
    use crate::core::events::CompletedFile;
    use crate::core::transfer::TransferDirection;
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedReceiver;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl InputExecutor for Recorder {
        fn screen_size(&self) -> (u32, u32) {
            (1920, 1080)
        }

        fn mouse_move(&mut self, x: u32, y: u32) {
            self.0.lock().unwrap().push(format!("move {x} {y}"));
        }

        fn mouse_click(&mut self, x: u32, y: u32) {
            self.0.lock().unwrap().push(format!("click {x} {y}"));
        }

        fn key_press(&mut self, key: &str) {
            self.0.lock().unwrap().push(format!("key {key}"));
        }
    }

    struct Peer {
        session: Session,
        rx: UnboundedReceiver<TransportEvent>,
        events: UnboundedReceiver<SessionEvent>,
        transport: Arc<MemoryTransport>,
        capture: Arc<MemoryCapture>,
        input: Recorder,
        _dir: tempfile::TempDir,
    }

    impl Peer {
        fn new(net: &MemoryNetwork, id: &str) -> Self {
            Self::with_capture(net, id, MemoryCapture::new())
        }

        fn with_capture(net: &MemoryNetwork, id: &str, capture: MemoryCapture) -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join(PEER_ID_FILE), id).unwrap();

            let (transport, rx) = net.transport();
            let transport = Arc::new(transport);
            let capture = Arc::new(capture);
            let input = Recorder::default();
            let (sink, events) = EventSink::channel();
            let mut session = Session::new(transport.clone(), sink, SessionConfig::default())
                .with_identity(IdentityProvider::in_data_dir(dir.path()))
                .with_capture(capture.clone())
                .with_input_executor(Box::new(input.clone()));
            session.initialize().unwrap();

            let mut peer = Self {
                session,
                rx,
                events,
                transport,
                capture,
                input,
                _dir: dir,
            };
            peer.poll(Instant::now());
            peer.events();
            peer
        }

        /// Handle queued transport events and flush outbound chunks.
        fn poll(&mut self, now: Instant) -> bool {
            let mut progressed = false;
            while let Ok(event) = self.rx.try_recv() {
                progressed = true;
                self.session.handle_transport_event(event, now);
            }
            while self.session.has_pending_chunks() {
                progressed = true;
                self.session.pump_transfer();
            }
            progressed
        }

        fn events(&mut self) -> Vec<SessionEvent> {
            std::iter::from_fn(|| self.events.try_recv().ok()).collect()
        }

        fn raw_send(&self, msg: &WireMessage) {
            let channel = self
                .session
                .channel
                .clone()
                .or_else(|| self.session.pending.as_ref().map(|p| p.channel.clone()))
                .unwrap();
            channel.send_message(msg).unwrap();
        }
    }

    fn settle(peers: &mut [&mut Peer], now: Instant) {
        loop {
            let mut progressed = false;
            for peer in peers.iter_mut() {
                progressed |= peer.poll(now);
            }
            if !progressed {
                return;
            }
        }
    }

    /// A (654321) dials B (123456) and B accepts.
    fn connected_pair(net: &MemoryNetwork, now: Instant) -> (Peer, Peer) {
        let mut a = Peer::new(net, "654321");
        let mut b = Peer::new(net, "123456");
        a.session.connect_to("123456", now).unwrap();
        settle(&mut [&mut a, &mut b], now);
        b.session.accept_pending(now).unwrap();
        settle(&mut [&mut a, &mut b], now);
        a.events();
        b.events();
        (a, b)
    }

    fn id(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    #[test]
    fn test_initialize_reports_ready() {
        let net = MemoryNetwork::new();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PEER_ID_FILE), "123456").unwrap();
        let (transport, mut rx) = net.transport();
        let (sink, mut events) = EventSink::channel();
        let mut session = Session::new(Arc::new(transport), sink, SessionConfig::default())
            .with_identity(IdentityProvider::in_data_dir(dir.path()));

        assert_eq!(session.initialize().unwrap(), id("123456"));
        while let Ok(event) = rx.try_recv() {
            session.handle_transport_event(event, Instant::now());
        }
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Ready {
                local_id: id("123456")
            }
        );
    }

    #[test]
    fn test_connect_requires_consent_then_shares() {
        let now = Instant::now();
        let net = MemoryNetwork::new();
        let mut a = Peer::new(&net, "654321");
        let mut b = Peer::new(&net, "123456");

        a.session.connect_to("123456", now).unwrap();
        assert_eq!(a.session.state(), SessionState::Connecting);
        settle(&mut [&mut a, &mut b], now);

        assert_eq!(a.session.state(), SessionState::AwaitingAcceptance);
        assert_eq!(a.session.role(), Role::Controller);
        assert_eq!(b.session.state(), SessionState::AwaitingConsent);
        assert_eq!(b.session.pending_remote(), Some(&id("654321")));
        assert_eq!(
            b.events(),
            [SessionEvent::IncomingConnection {
                remote_id: id("654321")
            }]
        );
        assert_eq!(b.capture.capture_count(), 0);

        b.session.accept_pending(now).unwrap();
        settle(&mut [&mut a, &mut b], now);

        assert_eq!(a.session.state(), SessionState::Connected);
        assert_eq!(a.session.role(), Role::Controller);
        assert_eq!(a.session.media_state(), MediaState::Receiving);
        assert_eq!(b.session.state(), SessionState::Connected);
        assert_eq!(b.session.role(), Role::Host);
        assert_eq!(b.session.media_state(), MediaState::Sharing);
        assert_eq!(b.capture.capture_count(), 1);
        assert_eq!(b.session.remote_id(), Some(&id("654321")));

        assert!(a.events().contains(&SessionEvent::Connected {
            remote_id: id("123456"),
            role: Role::Controller,
        }));
        assert!(b.events().contains(&SessionEvent::SharingStarted));
    }

    #[test]
    fn test_reject_returns_both_to_idle() {
        let now = Instant::now();
        let net = MemoryNetwork::new();
        let mut a = Peer::new(&net, "654321");
        let mut b = Peer::new(&net, "123456");

        a.session.connect_to("123456", now).unwrap();
        settle(&mut [&mut a, &mut b], now);
        b.session.reject_pending().unwrap();
        settle(&mut [&mut a, &mut b], now);

        assert_eq!(a.session.state(), SessionState::Idle);
        assert_eq!(b.session.state(), SessionState::Idle);
        assert!(matches!(
            a.events().last(),
            Some(SessionEvent::Disconnected { .. })
        ));
        assert!(matches!(
            b.session.reject_pending(),
            Err(SessionError::NoPendingRequest)
        ));
    }

    #[test]
    fn test_invalid_remote_id_never_reaches_transport() {
        let net = MemoryNetwork::new();
        let mut a = Peer::new(&net, "654321");

        for bad in ["12345", "1234567", "12a456", ""] {
            assert!(matches!(
                a.session.connect_to(bad, Instant::now()),
                Err(SessionError::InvalidRemoteIdFormat(_))
            ));
        }
        assert!(matches!(
            a.session.connect_to("654321", Instant::now()),
            Err(SessionError::SelfConnection(_))
        ));
        assert_eq!(a.transport.connect_count(), 0);
        assert_eq!(a.session.state(), SessionState::Idle);
    }

    #[test]
    fn test_busy_session_refuses_second_connection() {
        let now = Instant::now();
        let net = MemoryNetwork::new();
        let (mut a, mut b) = connected_pair(&net, now);
        let mut c = Peer::new(&net, "111111");

        assert!(matches!(
            a.session.connect_to("111111", now),
            Err(SessionError::SessionBusy)
        ));

        c.session.connect_to("123456", now).unwrap();
        settle(&mut [&mut a, &mut b, &mut c], now);

        assert_eq!(c.session.state(), SessionState::Idle);
        assert!(b.events().is_empty());
        assert_eq!(b.session.state(), SessionState::Connected);
        assert_eq!(b.session.remote_id(), Some(&id("654321")));
    }

    #[test]
    fn test_file_transfer_between_sessions() {
        let now = Instant::now();
        let net = MemoryNetwork::new();
        let (mut a, mut b) = connected_pair(&net, now);
        let data: Bytes = (0..40_000u32).map(|i| i as u8).collect::<Vec<u8>>().into();

        b.session
            .offer_file(OutgoingFile::from_bytes("report.pdf", data.clone()), now)
            .unwrap();
        settle(&mut [&mut a, &mut b], now);
        assert_eq!(
            a.events(),
            [SessionEvent::IncomingFileOffer {
                name: "report.pdf".into(),
                size: 40_000,
                mime_type: "application/pdf".into(),
            }]
        );

        a.session.accept_incoming_file(now).unwrap();
        settle(&mut [&mut a, &mut b], now);

        let complete = a.events().into_iter().find_map(|e| match e {
            SessionEvent::FileComplete {
                direction: TransferDirection::Inbound,
                file,
            } => Some(file),
            _ => None,
        });
        assert_eq!(
            complete,
            Some(CompletedFile {
                file_name: "report.pdf".into(),
                mime_type: "application/pdf".into(),
                size: 40_000,
                bytes: Some(data),
            })
        );
        assert!(b.events().iter().any(|e| matches!(
            e,
            SessionEvent::FileComplete {
                direction: TransferDirection::Outbound,
                ..
            }
        )));
    }

    #[test]
    fn test_file_actions_require_connection() {
        let net = MemoryNetwork::new();
        let mut a = Peer::new(&net, "654321");
        assert!(matches!(
            a.session
                .offer_file(OutgoingFile::from_bytes("a", Bytes::new()), Instant::now()),
            Err(SessionError::NotConnected)
        ));
        assert!(matches!(
            a.session.accept_incoming_file(Instant::now()),
            Err(SessionError::NotConnected)
        ));
        assert!(matches!(
            a.session.share_screen(),
            Err(SessionError::NotConnected)
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let now = Instant::now();
        let net = MemoryNetwork::new();
        let (mut a, mut b) = connected_pair(&net, now);

        b.session.disconnect();
        settle(&mut [&mut a, &mut b], now);
        b.session.disconnect();
        a.session.disconnect();
        settle(&mut [&mut a, &mut b], now);

        for peer in [&mut a, &mut b] {
            assert_eq!(peer.session.state(), SessionState::Idle);
            assert_eq!(peer.session.role(), Role::Unbound);
            assert_eq!(peer.session.media_state(), MediaState::Idle);
            assert!(peer.session.remote_id().is_none());
            let disconnects = peer
                .events()
                .iter()
                .filter(|e| matches!(e, SessionEvent::Disconnected { .. }))
                .count();
            assert_eq!(disconnects, 1);
        }
    }

    #[test]
    fn test_consent_times_out() {
        let now = Instant::now();
        let net = MemoryNetwork::new();
        let mut a = Peer::new(&net, "654321");
        let mut b = Peer::new(&net, "123456");

        a.session.connect_to("123456", now).unwrap();
        settle(&mut [&mut a, &mut b], now);
        b.events();

        let timeout = SessionConfig::default().consent_timeout();
        b.session.tick(now + timeout - std::time::Duration::from_secs(1));
        assert_eq!(b.session.state(), SessionState::AwaitingConsent);

        b.session.tick(now + timeout);
        settle(&mut [&mut a, &mut b], now);
        assert_eq!(b.session.state(), SessionState::Idle);
        assert_eq!(
            b.events(),
            [SessionEvent::ConsentExpired {
                remote_id: id("654321")
            }]
        );
        assert_eq!(a.session.state(), SessionState::Idle);
    }

    #[test]
    fn test_connect_times_out_without_acceptance() {
        let now = Instant::now();
        let net = MemoryNetwork::new();
        let mut a = Peer::new(&net, "654321");
        let mut b = Peer::new(&net, "123456");

        a.session.connect_to("123456", now).unwrap();
        settle(&mut [&mut a, &mut b], now);
        a.events();
        b.events();

        a.session.tick(now + SessionConfig::default().connect_timeout());
        settle(&mut [&mut a, &mut b], now);

        assert_eq!(a.session.state(), SessionState::Idle);
        assert!(a.events().contains(&SessionEvent::Error(
            SessionError::ConnectTimeout.to_string()
        )));
        assert_eq!(b.session.state(), SessionState::Idle);
        assert!(matches!(
            &b.events()[..],
            [SessionEvent::ConsentExpired { .. }]
        ));
    }

    #[test]
    fn test_unreachable_peer_reports_error() {
        let now = Instant::now();
        let net = MemoryNetwork::new();
        let mut a = Peer::new(&net, "654321");
        a.events();

        a.session.connect_to("999999", now).unwrap();
        settle(&mut [&mut a], now);

        assert_eq!(a.session.state(), SessionState::Idle);
        assert!(a
            .events()
            .iter()
            .any(|e| matches!(e, SessionEvent::Error(msg) if msg.contains("peer-unavailable"))));
    }

    #[test]
    fn test_input_flows_only_from_focused_controller() {
        let now = Instant::now();
        let net = MemoryNetwork::new();
        let (mut a, mut b) = connected_pair(&net, now);
        let click = InputEvent::MouseClick { x: 0.5, y: 0.5 };

        assert!(matches!(
            a.session.send_input(click.clone()),
            Err(SessionError::NotControlling)
        ));
        a.session.set_pointer_focus(true);
        assert!(a.session.is_controlling());
        a.session.send_input(click.clone()).unwrap();
        a.session
            .send_input(InputEvent::KeyPress { key: "Enter".into() })
            .unwrap();
        assert!(matches!(
            a.session.send_input(InputEvent::MouseMove { x: 1.5, y: 0.0 }),
            Err(SessionError::ProtocolViolation(_))
        ));

        b.session.set_pointer_focus(true);
        assert!(matches!(
            b.session.send_input(click),
            Err(SessionError::NotControlling)
        ));
        settle(&mut [&mut a, &mut b], now);

        assert_eq!(b.input.calls(), ["click 960 540", "key Enter"]);
    }

    #[test]
    fn test_controller_ignores_injected_input() {
        let now = Instant::now();
        let net = MemoryNetwork::new();
        let (mut a, mut b) = connected_pair(&net, now);

        b.raw_send(&WireMessage::MouseMove { x: 0.1, y: 0.1 });
        a.raw_send(&WireMessage::MouseMove { x: -3.0, y: 0.1 });
        settle(&mut [&mut a, &mut b], now);

        assert!(a.input.calls().is_empty());
        assert!(b.input.calls().is_empty());
        assert_eq!(a.session.state(), SessionState::Connected);
    }

    #[test]
    fn test_data_before_consent_is_dropped() {
        let now = Instant::now();
        let net = MemoryNetwork::new();
        let mut a = Peer::new(&net, "654321");
        let mut b = Peer::new(&net, "123456");

        a.session.connect_to("123456", now).unwrap();
        settle(&mut [&mut a, &mut b], now);
        a.raw_send(&WireMessage::FileRequest {
            name: "x".into(),
            size: 1,
            mime_type: "text/plain".into(),
        });
        a.raw_send(&WireMessage::KeyPress { key: "a".into() });
        settle(&mut [&mut a, &mut b], now);

        assert_eq!(b.session.state(), SessionState::AwaitingConsent);
        assert!(b.session.transfers().pending_offer().is_none());
        assert!(b.input.calls().is_empty());
    }

    #[test]
    fn test_denied_capture_keeps_connection() {
        let now = Instant::now();
        let net = MemoryNetwork::new();
        let mut a = Peer::new(&net, "654321");
        let mut b = Peer::with_capture(&net, "123456", MemoryCapture::denied());

        a.session.connect_to("123456", now).unwrap();
        settle(&mut [&mut a, &mut b], now);
        b.session.accept_pending(now).unwrap();
        settle(&mut [&mut a, &mut b], now);

        assert_eq!(b.session.state(), SessionState::Connected);
        assert_eq!(b.session.media_state(), MediaState::Idle);
        assert!(b
            .events()
            .iter()
            .any(|e| matches!(e, SessionEvent::MediaError(_))));
        assert_eq!(a.session.media_state(), MediaState::Idle);
    }

    #[test]
    fn test_stop_sharing_notifies_peer() {
        let now = Instant::now();
        let net = MemoryNetwork::new();
        let (mut a, mut b) = connected_pair(&net, now);

        b.session.stop_sharing();
        b.session.on_local_stream_ended();
        settle(&mut [&mut a, &mut b], now);

        assert_eq!(b.events(), [SessionEvent::SharingStopped]);
        assert_eq!(a.events(), [SessionEvent::RemoteShareStopped]);
        assert_eq!(a.session.media_state(), MediaState::Idle);

        b.session.share_screen().unwrap();
        settle(&mut [&mut a, &mut b], now);
        assert_eq!(a.session.media_state(), MediaState::Receiving);
        assert_eq!(b.capture.capture_count(), 2);
    }

    #[test]
    fn test_request_screen_restarts_host_share() {
        let now = Instant::now();
        let net = MemoryNetwork::new();
        let (mut a, mut b) = connected_pair(&net, now);

        b.session.stop_sharing();
        settle(&mut [&mut a, &mut b], now);
        a.events();
        b.events();
        assert_eq!(a.session.media_state(), MediaState::Idle);

        a.raw_send(&WireMessage::RequestScreen);
        settle(&mut [&mut a, &mut b], now);
        assert_eq!(b.capture.capture_count(), 2);
        assert_eq!(b.events(), [SessionEvent::SharingStarted]);
        assert_eq!(b.session.media_state(), MediaState::Sharing);
        assert_eq!(a.session.media_state(), MediaState::Receiving);

        // Already sharing: nothing new is captured.
        a.raw_send(&WireMessage::RequestScreen);
        settle(&mut [&mut a, &mut b], now);
        assert_eq!(b.capture.capture_count(), 2);
        assert!(b.events().is_empty());

        // The controller never shares on request.
        b.raw_send(&WireMessage::RequestScreen);
        settle(&mut [&mut a, &mut b], now);
        assert_eq!(a.capture.capture_count(), 0);
        assert_eq!(a.session.media_state(), MediaState::Receiving);
    }

    #[test]
    fn test_call_overtaking_acceptance_is_kept() {
        let now = Instant::now();
        let net = MemoryNetwork::new();
        let mut a = Peer::new(&net, "654321");
        let mut b = Peer::new(&net, "123456");
        a.session.connect_to("123456", now).unwrap();
        settle(&mut [&mut a, &mut b], now);
        assert_eq!(a.session.state(), SessionState::AwaitingAcceptance);

        b.session.accept_pending(now).unwrap();
        let mut queued: Vec<TransportEvent> =
            std::iter::from_fn(|| a.rx.try_recv().ok()).collect();
        queued.sort_by_key(|e| !matches!(e, TransportEvent::IncomingCall { .. }));
        for event in queued {
            a.session.handle_transport_event(event, now);
        }
        settle(&mut [&mut a, &mut b], now);

        assert_eq!(a.session.state(), SessionState::Connected);
        assert_eq!(a.session.media_state(), MediaState::Receiving);
        assert!(matches!(
            &a.events()[..],
            [
                SessionEvent::Connecting { .. },
                SessionEvent::RemoteStreamStarted { .. },
                SessionEvent::Connected { .. }
            ]
        ));
        // No requestScreen went out, so the host captured once.
        assert_eq!(b.capture.capture_count(), 1);
        assert_eq!(b.session.media_state(), MediaState::Sharing);
    }

    #[test]
    fn test_call_from_outside_session_is_ignored() {
        let now = Instant::now();
        let net = MemoryNetwork::new();
        let (mut a, mut b) = connected_pair(&net, now);
        let mut c = Peer::new(&net, "111111");

        c.transport.call(&id("654321"), &MemoryStream::new()).unwrap();
        settle(&mut [&mut a, &mut b, &mut c], now);

        assert!(a.events().is_empty());
        assert_eq!(a.session.media_state(), MediaState::Receiving);
    }

    #[test]
    fn test_identity_collision_regenerates() {
        let now = Instant::now();
        let net = MemoryNetwork::new();
        let mut b = Peer::new(&net, "123456");
        let mut c = Peer::new(&net, "123456");

        let local = c.session.local_id().cloned().unwrap();
        assert_ne!(local, id("123456"));

        b.session.connect_to(local.as_str(), now).unwrap();
        settle(&mut [&mut b, &mut c], now);
        assert_eq!(c.session.state(), SessionState::AwaitingConsent);
    }

    #[test]
    fn test_refresh_identity_drops_connection() {
        let now = Instant::now();
        let net = MemoryNetwork::new();
        let (mut a, mut b) = connected_pair(&net, now);

        let fresh = a.session.refresh_identity().unwrap();
        settle(&mut [&mut a, &mut b], now);

        assert_ne!(fresh, id("654321"));
        assert_eq!(a.session.state(), SessionState::Idle);
        assert_eq!(b.session.state(), SessionState::Idle);
        assert!(a.events().contains(&SessionEvent::Ready { local_id: fresh }));
    }
}
