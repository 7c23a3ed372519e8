// Listening end of the mesh: accepts many identified peers.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tracing::{info, warn};

use super::adapter::NetAdapter;
use super::auth::AuthKeys;
use super::conn::{read_loop, spawn_writer};
use crate::discovery;
use crate::errors::PlexusResult;
use crate::executor::Engine;
use crate::system::SystemInner;

pub struct ServerHandle {
    pub port: u16,
    pub adapter: Arc<NetAdapter>,
    accept_task: JoinHandle<()>,
}

impl ServerHandle {
    pub async fn wait_first_connection(&self) {
        self.adapter.wait_first_connection().await;
    }

    pub fn stop(&self) {
        self.accept_task.abort();
    }
}

/// Binds the plugin server. Port 0 picks an ephemeral port; the bound port
/// is in the returned handle either way.
pub async fn start_server(
    system: &Arc<SystemInner>,
    engine: Arc<Engine>,
    port: u16,
    use_auth: bool,
) -> PlexusResult<ServerHandle> {
    let auth = if use_auth {
        Some(AuthKeys::load(&system.settings.auth_key_dir)?)
    } else {
        warn!("Allowing any connection to the server. Disable for production!");
        None
    };
    let adapter = NetAdapter::new(system, engine, true, auth);

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let bound_port = listener.local_addr()?.port();
    info!("server started at 0.0.0.0:{}", bound_port);

    discovery::make_discoverable(
        &system.settings.discovery_path,
        system.node_id(),
        "localhost",
        bound_port,
        system.registry.plugin_names(),
    );

    let accept_adapter = adapter.clone();
    let accept_task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    if accept_adapter.is_refused() {
                        warn!("refusing connection from {}", addr);
                        continue;
                    }
                    let (read_half, write_half) = stream.into_split();
                    let framed = FramedRead::new(read_half, LengthDelimitedCodec::new());
                    let (conn_tx, writer_task) = spawn_writer(write_half);
                    let adapter = accept_adapter.clone();
                    tokio::spawn(async move {
                        read_loop(framed, adapter, conn_tx, None).await;
                        writer_task.abort();
                    });
                }
                Err(err) => {
                    warn!("accept failed: {}", err);
                    break;
                }
            }
        }
    });

    Ok(ServerHandle {
        port: bound_port,
        adapter,
        accept_task,
    })
}
