//! In-process demo: a host and a controller on one [`MemoryNetwork`].
//!
//! Plays the part of both users. The host accepts the controller, offers the
//! chosen file once connected, and the controller accepts it and writes the
//! reassembled copy to the output directory.

use crate::core::config::SessionConfig;
use crate::core::connection::memory::{MemoryCapture, MemoryNetwork};
use crate::core::events::{EventSink, SessionEvent};
use crate::core::identity::{IdentityProvider, PeerId};
use crate::core::node::{NodeHandle, PeerNode};
use crate::core::session::Session;
use crate::core::transfer::TransferDirection;
use crate::core::transfer::file::OutgoingFile;
use crate::utils::atomic_write::atomic_write;
use crate::utils::formatters::format_file_size;
use crate::utils::sos::SignalOfStop;
use anyhow::{Context, Result, anyhow, bail};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::info;

struct DemoPeer {
    handle: NodeHandle,
    events: UnboundedReceiver<SessionEvent>,
    task: JoinHandle<crate::core::error::Result<PeerId>>,
}

fn spawn_peer(net: &MemoryNetwork, config: &SessionConfig, sos: &SignalOfStop) -> DemoPeer {
    let (transport, transport_rx) = net.transport();
    let (sink, events) = EventSink::channel();
    let session = Session::new(Arc::new(transport), sink, config.clone())
        .with_identity(IdentityProvider::ephemeral())
        .with_capture(Arc::new(MemoryCapture::new()));
    let (node, handle) = PeerNode::new(session, transport_rx, sos.clone());
    DemoPeer {
        handle,
        events,
        task: tokio::spawn(node.run()),
    }
}

async fn next_event(peer: &mut DemoPeer) -> Result<SessionEvent> {
    peer.events
        .recv()
        .await
        .ok_or_else(|| anyhow!("peer stopped unexpectedly"))
}

async fn wait_ready(peer: &mut DemoPeer) -> Result<PeerId> {
    loop {
        if let SessionEvent::Ready { local_id } = next_event(peer).await? {
            return Ok(local_id);
        }
    }
}

/// Send `file` from an in-process host to an in-process controller and
/// return where the received copy was written.
pub async fn run(
    file: &Path,
    out: &Path,
    config: SessionConfig,
    sos: SignalOfStop,
) -> Result<PathBuf> {
    let outgoing = OutgoingFile::open(file).with_context(|| format!("opening {}", file.display()))?;
    info!(
        event = "demo_start",
        file = %file.display(),
        size = %format_file_size(outgoing.size()),
        mime_type = outgoing.mime_type()
    );

    let net = MemoryNetwork::new();
    let mut host = spawn_peer(&net, &config, &sos);
    let mut controller = spawn_peer(&net, &config, &sos);

    let host_id = wait_ready(&mut host).await?;
    wait_ready(&mut controller).await?;
    controller.handle.connect(host_id.as_str()).await?;

    let mut outgoing = Some(outgoing);
    let result = loop {
        tokio::select! {
            _ = sos.wait() => break Err(anyhow!("interrupted")),
            event = next_event(&mut host) => match event? {
                SessionEvent::IncomingConnection { remote_id } => {
                    info!(event = "demo_host_accepts", %remote_id);
                    host.handle.accept_connection().await?;
                }
                SessionEvent::Connected { .. } => {
                    if let Some(file) = outgoing.take() {
                        host.handle.offer_file(file).await?;
                    }
                }
                SessionEvent::FileRejected { name } => break Err(anyhow!("{name} was rejected")),
                SessionEvent::TransferFailed { name, reason, .. } => {
                    break Err(anyhow!("sending {name} failed: {reason}"));
                }
                _ => {}
            },
            event = next_event(&mut controller) => match event? {
                SessionEvent::IncomingFileOffer { name, size, mime_type } => {
                    info!(event = "demo_offer", %name, size = %format_file_size(size), %mime_type);
                    controller.handle.accept_file().await?;
                }
                SessionEvent::FileProgress { direction: TransferDirection::Inbound, percent } => {
                    info!(event = "demo_progress", percent);
                }
                SessionEvent::FileComplete { direction: TransferDirection::Inbound, file } => {
                    let bytes = file.bytes.unwrap_or_default();
                    break save(out, &file.file_name, &bytes);
                }
                SessionEvent::Disconnected { reason } => {
                    break Err(anyhow!("disconnected: {}", reason.unwrap_or_default()));
                }
                _ => {}
            },
        }
    };

    sos.cancel();
    for peer in [host, controller] {
        peer.task.await??;
    }
    result
}

/// Write a received file into `out`, keeping only the final path component
/// of the peer-supplied name.
fn save(out: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let Some(file_name) = Path::new(name).file_name() else {
        bail!("refusing to write file with name {name:?}");
    };
    std::fs::create_dir_all(out).with_context(|| format!("creating {}", out.display()))?;
    let path = out.join(file_name);
    atomic_write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
    info!(
        event = "demo_saved",
        path = %path.display(),
        size = %format_file_size(bytes.len() as u64)
    );
    Ok(path)
}
