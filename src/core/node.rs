//! PeerNode: the task that owns a [`Session`].
//!
//! Transport events, user commands and clock ticks are multiplexed onto one
//! `select!` loop, so session state is only ever touched from this task.
//! Commands arrive through a cloneable [`NodeHandle`] and are answered on a
//! oneshot. Outbound file chunks are sent one per loop turn, yielding in
//! between, so a large transfer never starves incoming events.

use crate::core::config::TICK_INTERVAL;
use crate::core::connection::TransportEvent;
use crate::core::error::{Result, SessionError};
use crate::core::identity::PeerId;
use crate::core::session::Session;
use crate::core::session::input::InputEvent;
use crate::core::transfer::file::OutgoingFile;
use crate::utils::sos::SignalOfStop;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// A user action for the session.
#[derive(Debug)]
pub enum Command {
    Connect(String),
    AcceptConnection,
    RejectConnection,
    Disconnect,
    RefreshIdentity,
    ShareScreen,
    StopSharing,
    LocalStreamEnded,
    SetPointerFocus(bool),
    SendInput(InputEvent),
    OfferFile(OutgoingFile),
    AcceptFile,
    RejectFile,
}

type Request = (Command, oneshot::Sender<Result<()>>);

/// Cloneable front door to a running [`PeerNode`].
#[derive(Debug, Clone)]
pub struct NodeHandle {
    tx: mpsc::UnboundedSender<Request>,
}

impl NodeHandle {
    /// Submit a command and wait for the session's answer.
    pub async fn send(&self, command: Command) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((command, reply_tx))
            .map_err(|_| SessionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| SessionError::ChannelClosed)?
    }

    pub async fn connect(&self, remote: impl Into<String>) -> Result<()> {
        self.send(Command::Connect(remote.into())).await
    }

    pub async fn accept_connection(&self) -> Result<()> {
        self.send(Command::AcceptConnection).await
    }

    pub async fn reject_connection(&self) -> Result<()> {
        self.send(Command::RejectConnection).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.send(Command::Disconnect).await
    }

    pub async fn offer_file(&self, file: OutgoingFile) -> Result<()> {
        self.send(Command::OfferFile(file)).await
    }

    pub async fn accept_file(&self) -> Result<()> {
        self.send(Command::AcceptFile).await
    }

    pub async fn reject_file(&self) -> Result<()> {
        self.send(Command::RejectFile).await
    }
}

pub struct PeerNode {
    session: Session,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedReceiver<Request>,
    sos: SignalOfStop,
}

impl PeerNode {
    pub fn new(
        session: Session,
        transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        sos: SignalOfStop,
    ) -> (Self, NodeHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let node = Self {
            session,
            transport_rx,
            commands,
            sos,
        };
        (node, NodeHandle { tx })
    }

    /// Register our id and serve until stopped, the transport goes away, or
    /// every handle is dropped. The session is disconnected on the way out.
    pub async fn run(self) -> Result<PeerId> {
        let PeerNode {
            mut session,
            mut transport_rx,
            mut commands,
            sos,
        } = self;

        let local_id = session.initialize()?;
        info!(event = "node_started", %local_id);
        let mut ticker = tokio::time::interval(TICK_INTERVAL);

        loop {
            tokio::select! {
                biased;

                _ = sos.wait() => {
                    info!(event = "node_stop_requested");
                    break;
                }
                event = transport_rx.recv() => match event {
                    Some(event) => session.handle_transport_event(event, Instant::now()),
                    None => {
                        warn!(event = "transport_gone", "Transport event queue closed");
                        break;
                    }
                },
                request = commands.recv() => match request {
                    Some((command, reply)) => {
                        let result = execute(&mut session, command);
                        if let Err(e) = &result {
                            debug!(event = "command_failed", error = %e);
                        }
                        let _ = reply.send(result);
                    }
                    None => {
                        debug!(event = "handles_dropped");
                        break;
                    }
                },
                _ = ticker.tick() => session.tick(Instant::now()),
                _ = std::future::ready(()), if session.has_pending_chunks() => {
                    session.pump_transfer();
                    tokio::task::yield_now().await;
                }
            }
        }

        session.disconnect();
        let local_id = session.local_id().cloned().unwrap_or(local_id);
        info!(event = "node_stopped", %local_id);
        Ok(local_id)
    }
}

fn execute(session: &mut Session, command: Command) -> Result<()> {
    let now = Instant::now();
    match command {
        Command::Connect(remote) => session.connect_to(&remote, now),
        Command::AcceptConnection => session.accept_pending(now),
        Command::RejectConnection => session.reject_pending(),
        Command::Disconnect => {
            session.disconnect();
            Ok(())
        }
        Command::RefreshIdentity => session.refresh_identity().map(|_| ()),
        Command::ShareScreen => session.share_screen(),
        Command::StopSharing => {
            session.stop_sharing();
            Ok(())
        }
        Command::LocalStreamEnded => {
            session.on_local_stream_ended();
            Ok(())
        }
        Command::SetPointerFocus(focused) => {
            session.set_pointer_focus(focused);
            Ok(())
        }
        Command::SendInput(event) => session.send_input(event),
        Command::OfferFile(file) => session.offer_file(file, now),
        Command::AcceptFile => session.accept_incoming_file(now),
        Command::RejectFile => session.reject_incoming_file(),
    }
}
