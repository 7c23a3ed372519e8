// Shared per-connection plumbing: length-delimited frames in, an unbounded
// envelope queue out, so protocol handlers never block on a slow peer.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, warn};

use super::adapter::{NetAdapter, PeerSender};
use super::wire::Envelope;

pub(crate) fn spawn_writer(
    write_half: OwnedWriteHalf,
) -> (PeerSender, JoinHandle<()>) {
    let mut framed = FramedWrite::new(write_half, LengthDelimitedCodec::new());
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            match envelope.encode() {
                Ok(bytes) => {
                    if framed.send(bytes.into()).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!("a message could not be serialized: {}", err),
            }
        }
    });
    (tx, task)
}

/// Reads frames until the peer goes away or the adapter refuses traffic.
pub(crate) async fn read_loop(
    mut framed: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    adapter: Arc<NetAdapter>,
    conn_tx: PeerSender,
    mut peer_id: Option<String>,
) {
    while let Some(frame) = framed.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                if adapter.note_malformed(&format!("frame error: {}", err)) {
                    break;
                }
                continue;
            }
        };
        let envelope = match Envelope::decode(&frame) {
            Ok(envelope) => envelope,
            Err(_) => {
                if adapter.note_malformed("message is not in wire format") {
                    break;
                }
                continue;
            }
        };
        if let Err(err) = adapter
            .clone()
            .handle_envelope(envelope, &conn_tx, &mut peer_id)
            .await
        {
            warn!("dropping connection: {}", err);
            break;
        }
        if adapter.is_refused() {
            break;
        }
    }
    if let Some(peer) = peer_id {
        debug!("connection to {} closed", peer);
        adapter.remove_peer(&peer);
    }
}
