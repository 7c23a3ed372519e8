// Outbound end of the mesh: one connection to one server, addressable back
// by this node's identity.

use std::sync::Arc;

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tracing::{error, info};

use super::adapter::{LinkHandle, NetAdapter};
use super::auth::AuthKeys;
use super::conn::{read_loop, spawn_writer};
use super::wire::{Envelope, HeaderFlags, PROTOCOL_VERSION};
use crate::errors::{PlexusError, PlexusResult};
use crate::executor::Engine;
use crate::system::SystemInner;

pub struct ClientHandle {
    /// Node id of the server this client is attached to.
    pub server_id: String,
    pub adapter: Arc<NetAdapter>,
    read_task: JoinHandle<()>,
}

impl ClientHandle {
    pub fn stop(&self) {
        self.read_task.abort();
    }
}

/// Connects, announces our exportable plugins, and merges the server's.
pub async fn connect_client(
    system: &Arc<SystemInner>,
    engine: Arc<Engine>,
    address: &str,
    port: u16,
    use_auth: bool,
) -> PlexusResult<ClientHandle> {
    let auth = if use_auth {
        Some(AuthKeys::load(&system.settings.auth_key_dir)?)
    } else {
        None
    };
    let adapter = NetAdapter::new(system, engine, false, auth);

    let stream = TcpStream::connect((address, port)).await?;
    let (read_half, write_half) = stream.into_split();
    let (conn_tx, writer_task) = spawn_writer(write_half);
    let mut framed_read = FramedRead::new(read_half, LengthDelimitedCodec::new());

    let mut hello = Envelope::new(HeaderFlags::ACKNOWLEDGE | HeaderFlags::CLIENT);
    hello.node_id = Some(system.node_id().to_string());
    hello.version = Some(PROTOCOL_VERSION.to_string());
    hello.request_signatures = Some(true);
    hello.plugin_signatures = Some(system.registry.exportable_plugins(
        None,
        &[],
        system.settings.allow_network_relay,
    ));
    if let Some(auth) = &adapter.auth {
        auth.sign_hello(&mut hello);
    }
    conn_tx
        .send(hello)
        .map_err(|_| PlexusError::Handshake("connection closed before hello".to_string()))?;

    let reply = tokio::time::timeout(system.settings.ack_timeout(), framed_read.next())
        .await
        .map_err(|_| {
            PlexusError::Handshake(format!("no handshake reply from {}:{}", address, port))
        })?
        .ok_or_else(|| {
            PlexusError::Handshake(format!("failed to connect to {}:{}", address, port))
        })?
        .map_err(PlexusError::Io)?;
    let reply = Envelope::decode(&reply)?;
    if !reply.head.contains(HeaderFlags::ACKNOWLEDGE) {
        return Err(PlexusError::Handshake(
            "connection established but no acknowledge message arrived".to_string(),
        ));
    }
    if let Some(auth) = &adapter.auth {
        auth.verify_hello(&reply)?;
    }
    if reply.version.as_deref() != Some(PROTOCOL_VERSION) {
        error!(
            "protocol version mismatch (server: {:?}, client: {}). \
             Do not report bugs using this configuration!",
            reply.version, PROTOCOL_VERSION
        );
    }
    let server_id = reply
        .node_id
        .clone()
        .ok_or_else(|| PlexusError::Handshake("server sent no node id".to_string()))?;

    adapter.register_peer(&server_id, conn_tx.clone());
    if let Some(signatures) = reply.plugin_signatures {
        let link = LinkHandle {
            peer: server_id.clone(),
            adapter: adapter.clone(),
        };
        system
            .registry
            .merge_remote_plugins(signatures, &server_id, link, false, None);
    }
    info!("connection to {}:{} established", address, port);

    let loop_adapter = adapter.clone();
    let loop_peer = server_id.clone();
    let read_task = tokio::spawn(async move {
        read_loop(framed_read, loop_adapter, conn_tx, Some(loop_peer)).await;
        writer_task.abort();
    });

    Ok(ClientHandle {
        server_id,
        adapter,
        read_task,
    })
}
