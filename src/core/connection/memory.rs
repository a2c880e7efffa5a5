//! In-process transport: every peer lives in the same address space.
//!
//! [`MemoryNetwork`] plays the rendezvous service. Each transport handed out
//! by [`MemoryNetwork::transport`] gets its own event queue, and channel
//! frames are delivered by pushing [`TransportEvent`]s onto the remote
//! peer's queue. Used by the demo command and throughout the tests.

use super::{Channel, ChannelId, Transport, TransportEvent};
use crate::core::error::{Result, SessionError};
use crate::core::identity::PeerId;
use crate::core::session::media::{MediaStream, ScreenCapture};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Shared rendezvous state for a set of in-process peers.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

#[derive(Debug, Default)]
struct NetworkState {
    peers: HashMap<PeerId, EventSender>,
    channels: HashMap<ChannelId, ChannelEnd>,
    next_channel: ChannelId,
}

#[derive(Debug)]
struct ChannelEnd {
    owner: EventSender,
    /// `None` while dialing a peer that does not exist.
    peer_end: Option<ChannelId>,
}

impl NetworkState {
    fn allocate(&mut self) -> ChannelId {
        self.next_channel += 1;
        self.next_channel
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new transport attached to this network, plus its event queue.
    pub fn transport(&self) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = MemoryTransport {
            network: self.clone(),
            events: tx,
            local_id: Mutex::new(None),
            connects: AtomicUsize::new(0),
        };
        (transport, rx)
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    events: EventSender,
    local_id: Mutex<Option<PeerId>>,
    connects: AtomicUsize,
}

impl MemoryTransport {
    /// Number of [`Transport::connect`] calls made so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }

    fn local_id(&self) -> Option<PeerId> {
        self.local_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn emit(&self, event: TransportEvent) {
        // The receiver only disappears when the owning node shut down.
        let _ = self.events.send(event);
    }
}

impl Transport for MemoryTransport {
    fn register(&self, id: &PeerId) -> Result<()> {
        let mut state = self.network.lock();

        if let Some(owner) = state.peers.get(id) {
            if !owner.same_channel(&self.events) {
                debug!(event = "memory_register_taken", %id);
                self.emit(TransportEvent::IdentityUnavailable(id.clone()));
                return Ok(());
            }
        }

        let previous = self
            .local_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(id.clone());
        if let Some(previous) = previous {
            if previous != *id {
                state.peers.remove(&previous);
            }
        }
        state.peers.insert(id.clone(), self.events.clone());
        self.emit(TransportEvent::Registered(id.clone()));
        Ok(())
    }

    fn connect(&self, remote: &PeerId) -> Result<Arc<dyn Channel>> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        let local = self
            .local_id()
            .ok_or_else(|| SessionError::ChannelError("transport is not registered".into()))?;

        let mut state = self.network.lock();
        let local_end = state.allocate();

        match state.peers.get(remote).cloned() {
            None => {
                state.channels.insert(
                    local_end,
                    ChannelEnd {
                        owner: self.events.clone(),
                        peer_end: None,
                    },
                );
                self.emit(TransportEvent::ChannelError {
                    channel: local_end,
                    error: format!("peer-unavailable: {remote}"),
                });
            }
            Some(remote_owner) => {
                let remote_end = state.allocate();
                state.channels.insert(
                    local_end,
                    ChannelEnd {
                        owner: self.events.clone(),
                        peer_end: Some(remote_end),
                    },
                );
                state.channels.insert(
                    remote_end,
                    ChannelEnd {
                        owner: remote_owner.clone(),
                        peer_end: Some(local_end),
                    },
                );

                let inbound: Arc<dyn Channel> = Arc::new(MemoryChannel {
                    id: remote_end,
                    remote: local,
                    network: self.network.clone(),
                });
                let _ = remote_owner.send(TransportEvent::IncomingChannel(inbound));
                let _ = remote_owner.send(TransportEvent::ChannelOpen(remote_end));
                self.emit(TransportEvent::ChannelOpen(local_end));
            }
        }

        Ok(Arc::new(MemoryChannel {
            id: local_end,
            remote: remote.clone(),
            network: self.network.clone(),
        }))
    }

    fn call(&self, remote: &PeerId, stream: &dyn MediaStream) -> Result<()> {
        let from = self
            .local_id()
            .ok_or_else(|| SessionError::ChannelError("transport is not registered".into()))?;
        let state = self.network.lock();
        let owner = state
            .peers
            .get(remote)
            .ok_or_else(|| SessionError::ChannelError(format!("peer-unavailable: {remote}")))?;

        owner
            .send(TransportEvent::IncomingCall {
                from,
                stream: Box::new(MemoryStream::with_id(stream.id())),
            })
            .map_err(|_| SessionError::ChannelError(format!("peer-unavailable: {remote}")))
    }
}

#[derive(Debug)]
pub struct MemoryChannel {
    id: ChannelId,
    remote: PeerId,
    network: MemoryNetwork,
}

impl Channel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn remote(&self) -> &PeerId {
        &self.remote
    }

    fn send(&self, frame: Bytes) -> Result<()> {
        let state = self.network.lock();
        let peer_end = state
            .channels
            .get(&self.id)
            .and_then(|end| end.peer_end)
            .ok_or(SessionError::ChannelClosed)?;
        let peer = state
            .channels
            .get(&peer_end)
            .ok_or(SessionError::ChannelClosed)?;

        peer.owner
            .send(TransportEvent::ChannelData {
                channel: peer_end,
                frame,
            })
            .map_err(|_| SessionError::ChannelClosed)
    }

    fn close(&self) {
        let mut state = self.network.lock();
        let Some(end) = state.channels.remove(&self.id) else {
            return;
        };
        let _ = end.owner.send(TransportEvent::ChannelClosed(self.id));

        if let Some(peer_end) = end.peer_end {
            if let Some(peer) = state.channels.remove(&peer_end) {
                let _ = peer.owner.send(TransportEvent::ChannelClosed(peer_end));
            }
        }
    }
}

/// A stand-in media stream with a stable id.
#[derive(Debug)]
pub struct MemoryStream {
    id: String,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::with_id(&Uuid::new_v4().to_string())
    }

    fn with_id(id: &str) -> Self {
        Self {
            id: id.to_string(),
        }
    }
}

impl Default for MemoryStream {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaStream for MemoryStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn stop(&mut self) {
        debug!(event = "memory_stream_stopped", stream = %self.id);
    }
}

/// Screen capture that hands out [`MemoryStream`]s, or refuses when `denied`.
#[derive(Debug, Default)]
pub struct MemoryCapture {
    denied: bool,
    captures: AtomicUsize,
}

impl MemoryCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// A capture source whose user always declines the prompt.
    pub fn denied() -> Self {
        Self {
            denied: true,
            ..Self::default()
        }
    }

    /// Number of capture prompts shown so far.
    pub fn capture_count(&self) -> usize {
        self.captures.load(Ordering::Relaxed)
    }
}

impl ScreenCapture for MemoryCapture {
    fn capture(&self) -> Result<Box<dyn MediaStream>> {
        self.captures.fetch_add(1, Ordering::Relaxed);
        if self.denied {
            return Err(SessionError::MediaCaptureDenied(
                "permission denied by user".into(),
            ));
        }
        Ok(Box::new(MemoryStream::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_register_rejects_taken_id() {
        let net = MemoryNetwork::new();
        let (a, mut a_rx) = net.transport();
        let (b, mut b_rx) = net.transport();

        a.register(&id("111111")).unwrap();
        b.register(&id("111111")).unwrap();

        assert!(matches!(&drain(&mut a_rx)[..], [TransportEvent::Registered(_)]));
        assert!(matches!(
            &drain(&mut b_rx)[..],
            [TransportEvent::IdentityUnavailable(_)]
        ));
    }

    #[test]
    fn test_reregister_releases_previous_id() {
        let net = MemoryNetwork::new();
        let (a, _a_rx) = net.transport();
        let (b, mut b_rx) = net.transport();

        a.register(&id("111111")).unwrap();
        a.register(&id("222222")).unwrap();
        b.register(&id("111111")).unwrap();

        assert!(matches!(&drain(&mut b_rx)[..], [TransportEvent::Registered(_)]));
    }

    #[test]
    fn test_connect_delivers_frames_and_close() {
        let net = MemoryNetwork::new();
        let (a, mut a_rx) = net.transport();
        let (b, mut b_rx) = net.transport();
        a.register(&id("111111")).unwrap();
        b.register(&id("222222")).unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        let a_end = a.connect(&id("222222")).unwrap();
        assert!(matches!(&drain(&mut a_rx)[..], [TransportEvent::ChannelOpen(_)]));

        let events = drain(&mut b_rx);
        let b_end = match &events[..] {
            [TransportEvent::IncomingChannel(ch), TransportEvent::ChannelOpen(open)] => {
                assert_eq!(ch.id(), *open);
                assert_eq!(ch.remote(), &id("111111"));
                ch.clone()
            }
            other => panic!("unexpected {other:?}"),
        };

        a_end.send(Bytes::from_static(b"hi")).unwrap();
        match &drain(&mut b_rx)[..] {
            [TransportEvent::ChannelData { channel, frame }] => {
                assert_eq!(*channel, b_end.id());
                assert_eq!(&frame[..], b"hi");
            }
            other => panic!("unexpected {other:?}"),
        }

        b_end.close();
        b_end.close();
        assert!(matches!(&drain(&mut a_rx)[..], [TransportEvent::ChannelClosed(_)]));
        assert!(matches!(&drain(&mut b_rx)[..], [TransportEvent::ChannelClosed(_)]));
        assert!(matches!(
            a_end.send(Bytes::new()),
            Err(SessionError::ChannelClosed)
        ));
    }

    #[test]
    fn test_connect_to_unknown_peer_errors_channel() {
        let net = MemoryNetwork::new();
        let (a, mut a_rx) = net.transport();
        a.register(&id("111111")).unwrap();
        drain(&mut a_rx);

        let ch = a.connect(&id("999999")).unwrap();
        match &drain(&mut a_rx)[..] {
            [TransportEvent::ChannelError { channel, error }] => {
                assert_eq!(*channel, ch.id());
                assert!(error.contains("peer-unavailable"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(a.connect_count(), 1);
    }

    #[test]
    fn test_call_forwards_stream_id() {
        let net = MemoryNetwork::new();
        let (a, _a_rx) = net.transport();
        let (b, mut b_rx) = net.transport();
        a.register(&id("111111")).unwrap();
        b.register(&id("222222")).unwrap();
        drain(&mut b_rx);

        let stream = MemoryStream::new();
        a.call(&id("222222"), &stream).unwrap();
        match &drain(&mut b_rx)[..] {
            [TransportEvent::IncomingCall { from, stream: remote }] => {
                assert_eq!(from, &id("111111"));
                assert_eq!(remote.id(), stream.id());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_capture_counts_prompts() {
        let capture = MemoryCapture::denied();
        assert!(matches!(
            capture.capture(),
            Err(SessionError::MediaCaptureDenied(_))
        ));
        assert_eq!(capture.capture_count(), 1);
    }
}
