// Peer link state and protocol handling, shared by server and client ends.
//
// An adapter owns the pending-request and acknowledgement tables for its
// connections, the per-request context table that absorbs late side-effect
// callbacks, and the malformed-traffic escalation counter. Incoming traffic
// is dispatched here regardless of which end accepted the connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use callscript::Value;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, warn};

use super::auth::AuthKeys;
use super::wire::{Envelope, HeaderFlags, PROTOCOL_VERSION};
use crate::config::Settings;
use crate::context::{CallContext, Effects};
use crate::errors::{PlexusError, PlexusResult};
use crate::executor::Engine;
use crate::identity::request_id;
use crate::registry::{FunctionEntry, PluginRegistry};
use crate::system::SystemInner;

pub type PeerSender = mpsc::UnboundedSender<Envelope>;

/// How a remote function entry reaches its owning peer.
#[derive(Clone)]
pub struct LinkHandle {
    pub peer: String,
    pub adapter: Arc<NetAdapter>,
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle").field("peer", &self.peer).finish()
    }
}

pub struct NetAdapter {
    pub(crate) is_server: bool,
    settings: Settings,
    node_id: String,
    registry: Arc<PluginRegistry>,
    engine: Arc<Engine>,
    system: Weak<SystemInner>,
    pub(crate) auth: Option<AuthKeys>,
    /// Request id -> eventual result, absent for oneway calls.
    pending: Mutex<HashMap<String, oneshot::Sender<PlexusResult<Value>>>>,
    /// Request id -> acknowledgement (time estimate or early failure).
    acks: Mutex<HashMap<String, oneshot::Sender<PlexusResult<Option<f64>>>>>,
    /// Request id -> originating context, retained for a grace period after
    /// the result so racing API callbacks still find their target. Shared
    /// with the eviction tasks.
    contexts: Arc<Mutex<HashMap<String, Arc<CallContext>>>>,
    peers: Mutex<HashMap<String, PeerSender>>,
    error_count: AtomicU32,
    refused: AtomicBool,
    first_connection: Notify,
    connected_once: AtomicBool,
}

impl NetAdapter {
    pub fn new(
        system: &Arc<SystemInner>,
        engine: Arc<Engine>,
        is_server: bool,
        auth: Option<AuthKeys>,
    ) -> Arc<Self> {
        Arc::new(Self {
            is_server,
            settings: system.settings.clone(),
            node_id: system.node_id().to_string(),
            registry: system.registry.clone(),
            engine,
            system: Arc::downgrade(system),
            auth,
            pending: Mutex::new(HashMap::new()),
            acks: Mutex::new(HashMap::new()),
            contexts: Arc::new(Mutex::new(HashMap::new())),
            peers: Mutex::new(HashMap::new()),
            error_count: AtomicU32::new(0),
            refused: AtomicBool::new(false),
            first_connection: Notify::new(),
            connected_once: AtomicBool::new(false),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub(crate) fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn register_peer(&self, peer: &str, sender: PeerSender) {
        self.peers.lock().unwrap().insert(peer.to_string(), sender);
    }

    pub fn remove_peer(&self, peer: &str) {
        self.peers.lock().unwrap().remove(peer);
    }

    pub fn is_refused(&self) -> bool {
        self.refused.load(Ordering::SeqCst)
    }

    /// Blocks until some peer has completed a handshake on this adapter.
    pub async fn wait_first_connection(&self) {
        if self.connected_once.load(Ordering::SeqCst) {
            return;
        }
        self.first_connection.notified().await;
    }

    pub fn send_to(&self, peer: &str, envelope: Envelope) -> PlexusResult<()> {
        let peers = self.peers.lock().unwrap();
        let sender = peers
            .get(peer)
            .ok_or_else(|| PlexusError::Protocol(format!("no connection to peer {}", peer)))?;
        sender
            .send(envelope)
            .map_err(|_| PlexusError::Protocol(format!("connection to peer {} is closed", peer)))
    }

    /// Counts a malformed or header-less message. Escalates from warnings to
    /// refusing traffic to forcing local shutdown: serving a garbled or
    /// hostile peer is worse than going dark.
    pub fn note_malformed(&self, what: &str) -> bool {
        let count = self.error_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.settings.malformed_shutdown_threshold {
            error!(
                "erroneous messages keep coming in ({}); shutting down. \
                 Do not restart until the source is identified.",
                count
            );
            self.refused.store(true, Ordering::SeqCst);
            if let Some(system) = self.system.upgrade() {
                system.force_shutdown();
            }
        } else if count >= self.settings.malformed_refuse_threshold {
            error!(
                "incoming requests are invalid ({} so far); refusing further traffic",
                count
            );
            self.refused.store(true, Ordering::SeqCst);
        } else if count >= self.settings.malformed_warn_threshold {
            warn!("received malformed message ({}): {}", count, what);
        } else {
            debug!("received malformed message: {}", what);
        }
        self.is_refused()
    }

    /// Performs the caller's half of the function call protocol. Waits up to
    /// the ack timeout for the callee's acknowledgement; an unacknowledged
    /// call marks the target plugin not-alive and fails without retrying.
    pub async fn call_remote(
        &self,
        entry: &FunctionEntry,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
        ctx: &Arc<CallContext>,
        oneway: bool,
    ) -> PlexusResult<(Option<oneshot::Receiver<PlexusResult<Value>>>, Option<f64>)> {
        let peer = entry
            .peer
            .clone()
            .ok_or_else(|| PlexusError::Internal("remote entry without peer".to_string()))?;
        let rid = request_id(&entry.spec.name, &args, &kwargs, self.settings.debug);

        let (ack_tx, ack_rx) = oneshot::channel();
        self.acks.lock().unwrap().insert(rid.clone(), ack_tx);
        let result_rx = if oneway {
            None
        } else {
            let (tx, rx) = oneshot::channel();
            self.pending.lock().unwrap().insert(rid.clone(), tx);
            Some(rx)
        };
        self.contexts
            .lock()
            .unwrap()
            .insert(rid.clone(), ctx.clone());

        let envelope = Envelope::function_call(
            &rid,
            &entry.spec.name,
            &entry.plugin_name,
            &entry.plugin_id,
            args,
            kwargs,
            ctx.scope.clone(),
            oneway,
            ctx.hops.saturating_add(1),
        );
        if let Err(err) = self.send_to(&peer, envelope) {
            self.forget_request(&rid);
            self.registry.mark_alive(&entry.plugin_id, false);
            warn!("cannot reach peer {}: {}", peer, err);
            return Err(PlexusError::RemoteOffline(entry.plugin_name.clone()));
        }

        match tokio::time::timeout(self.settings.ack_timeout(), ack_rx).await {
            Ok(Ok(Ok(estimate))) => Ok((result_rx, estimate)),
            Ok(Ok(Err(err))) => {
                self.forget_request(&rid);
                Err(err)
            }
            Ok(Err(_)) | Err(_) => {
                self.registry.mark_alive(&entry.plugin_id, false);
                self.forget_request(&rid);
                Err(PlexusError::RemoteTimeout(format!(
                    "No acknowledgement for function call. Plugin '{}' is likely offline",
                    entry.plugin_name
                )))
            }
        }
    }

    fn forget_request(&self, rid: &str) {
        self.acks.lock().unwrap().remove(rid);
        self.pending.lock().unwrap().remove(rid);
        self.contexts.lock().unwrap().remove(rid);
    }

    /// Context table entries outlive the call's result by a short grace
    /// period: API callbacks can legally race the return message.
    fn schedule_context_eviction(&self, rid: String) {
        let contexts = self.contexts.clone();
        let grace = self.settings.context_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            contexts.lock().unwrap().remove(&rid);
        });
    }

    /// Dispatches one decoded inbound envelope. `peer_id` is the handshake
    /// identity of the sending connection, set by the hello.
    pub async fn handle_envelope(
        self: Arc<Self>,
        envelope: Envelope,
        conn_tx: &PeerSender,
        peer_id: &mut Option<String>,
    ) -> PlexusResult<()> {
        if self.is_refused() {
            return Ok(());
        }
        let head = envelope.head;
        if !head.is_known() {
            self.note_malformed("header is not a valid flag");
            return Ok(());
        }
        if let Some(hops) = envelope.node_count {
            if hops > self.settings.max_hops {
                warn!(
                    "message visited {} nodes; the call chain is likely circular. Dropping it.",
                    hops
                );
                return Ok(());
            }
        }
        debug!(
            "received {} from {}",
            head,
            peer_id.as_deref().unwrap_or("<unidentified>")
        );

        if head.contains(HeaderFlags::ACKNOWLEDGE) {
            return self.handle_hello(envelope, conn_tx, peer_id);
        }
        if head.contains(HeaderFlags::UPDATE_REMOTE_PLUGINS) {
            if let (Some(peer), Some(signatures)) = (peer_id.clone(), envelope.plugin_signatures) {
                let link = LinkHandle {
                    peer: peer.clone(),
                    adapter: self.clone(),
                };
                self.registry
                    .merge_remote_plugins(signatures, &peer, link, self.is_server, None);
            }
            return Ok(());
        }
        if head.contains(HeaderFlags::FUNCTION_CALL) {
            let peer = peer_id
                .clone()
                .ok_or_else(|| PlexusError::Protocol("call before handshake".to_string()))?;
            return self.handle_function_call(envelope, conn_tx, &peer);
        }
        if head.contains(HeaderFlags::TIME_ESTIMATE_AND_ACK) {
            let rid = required(&envelope.request_id)?;
            match self.acks.lock().unwrap().remove(&rid) {
                Some(tx) => {
                    let _ = tx.send(Ok(envelope.time_estimate));
                }
                None => warn!("received time estimate for unknown request id: {}", rid),
            }
            return Ok(());
        }
        if head.contains(HeaderFlags::FUNCTION_NOT_FOUND) {
            let rid = required(&envelope.request_id)?;
            let failure = PlexusError::FunctionNotFound(
                "remote peer does not know the requested function".to_string(),
            );
            if let Some(tx) = self.acks.lock().unwrap().remove(&rid) {
                let _ = tx.send(Err(failure));
            }
            self.pending.lock().unwrap().remove(&rid);
            self.contexts.lock().unwrap().remove(&rid);
            return Ok(());
        }
        if head.contains(HeaderFlags::FUNCTION_RETURN) {
            let rid = required(&envelope.request_id)?;
            self.schedule_context_eviction(rid.clone());
            if let Some(state) = envelope.state {
                if let Some(ctx) = self.contexts.lock().unwrap().get(&rid) {
                    ctx.replace_state(state);
                }
            }
            match self.pending.lock().unwrap().remove(&rid) {
                Some(tx) => {
                    let _ = tx.send(Ok(envelope.return_value.unwrap_or(Value::Null)));
                }
                None => warn!("received response for unknown request id: {}", rid),
            }
            return Ok(());
        }
        if head.contains(HeaderFlags::EXCEPTION_RETURN) {
            let rid = required(&envelope.request_id)?;
            self.schedule_context_eviction(rid.clone());
            if let Some(name) = &envelope.offline_plugin_name {
                warn!("indirect remote plugin '{}' is offline", name);
                self.registry.mark_alive_by_name(name, false);
            }
            let failure = PlexusError::Remote {
                kind: envelope
                    .exc_type
                    .unwrap_or_else(|| "RemoteException".to_string()),
                message: envelope.message.unwrap_or_default(),
                traceback: envelope.traceback.unwrap_or_default(),
            };
            match self.pending.lock().unwrap().remove(&rid) {
                Some(tx) => {
                    let _ = tx.send(Err(failure));
                }
                None => warn!("exception in oneway call: {}", failure),
            }
            return Ok(());
        }
        if head.contains(HeaderFlags::API_CALL) {
            let rid = required(&envelope.request_id)?;
            let ctx = self.contexts.lock().unwrap().get(&rid).cloned();
            match ctx {
                Some(ctx) => dispatch_api_call(
                    &ctx,
                    envelope.api_func_name.as_deref().unwrap_or(""),
                    envelope.args.unwrap_or_default(),
                ),
                None => warn!("api object not found for request id {}", rid),
            }
            return Ok(());
        }
        if head.contains(HeaderFlags::LOG) {
            debug!(
                "peer log: {}",
                envelope.message.unwrap_or_else(|| "<empty>".to_string())
            );
            return Ok(());
        }
        self.note_malformed("unhandled header flag");
        Ok(())
    }

    /// Handshake: merge the peer's signatures, answer with ours, and let
    /// relaying peers know the visible plugin set changed.
    fn handle_hello(
        self: Arc<Self>,
        envelope: Envelope,
        conn_tx: &PeerSender,
        peer_id: &mut Option<String>,
    ) -> PlexusResult<()> {
        if !self.is_server {
            // The client side handles its hello reply inline during connect.
            debug!("ignoring unexpected hello on client link");
            return Ok(());
        }
        if let Some(auth) = &self.auth {
            auth.verify_hello(&envelope)?;
        }
        let remote_id = envelope
            .node_id
            .clone()
            .ok_or_else(|| PlexusError::Protocol("hello without node id".to_string()))?;
        debug!("acknowledging connection from {}", remote_id);

        let announced: Vec<String> = envelope
            .plugin_signatures
            .as_ref()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        let superseded = match envelope.plugin_signatures {
            Some(signatures) => {
                let link = LinkHandle {
                    peer: remote_id.clone(),
                    adapter: self.clone(),
                };
                self.registry
                    .merge_remote_plugins(signatures, &remote_id, link, true, None)
            }
            None => None,
        };
        if let Some(old) = superseded {
            self.remove_peer(&old);
        }
        self.register_peer(&remote_id, conn_tx.clone());
        *peer_id = Some(remote_id.clone());

        let mut reply = Envelope::new(HeaderFlags::ACKNOWLEDGE | HeaderFlags::SERVER);
        reply.node_id = Some(self.node_id.clone());
        reply.version = Some(PROTOCOL_VERSION.to_string());
        if envelope.request_signatures.unwrap_or(false) {
            reply.plugin_signatures = Some(self.registry.exportable_plugins(
                Some(&remote_id),
                &announced,
                self.settings.allow_network_relay,
            ));
        }
        if let Some(auth) = &self.auth {
            auth.sign_hello(&mut reply);
        }
        conn_tx
            .send(reply)
            .map_err(|_| PlexusError::Protocol("connection closed during handshake".to_string()))?;

        self.connected_once.store(true, Ordering::SeqCst);
        self.first_connection.notify_waiters();

        // Multi-hop visibility: push the refreshed plugin set to everyone else.
        if self.settings.allow_network_relay {
            let others: Vec<(String, PeerSender)> = self
                .peers
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| id.as_str() != remote_id)
                .map(|(id, tx)| (id.clone(), tx.clone()))
                .collect();
            for (other, tx) in others {
                let signatures = self.registry.exportable_plugins(Some(&other), &[], true);
                if !signatures.is_empty() {
                    let _ = tx.send(Envelope::update_remote_plugins(&self.node_id, signatures));
                }
            }
        }
        Ok(())
    }

    /// Callee half of the call protocol: schedule execution immediately and
    /// acknowledge with a coarse time estimate.
    fn handle_function_call(
        self: Arc<Self>,
        envelope: Envelope,
        conn_tx: &PeerSender,
        peer: &str,
    ) -> PlexusResult<()> {
        let rid = required(&envelope.request_id)?;
        let func_name = required(&envelope.func_name)?;
        let plugin_id = required(&envelope.plugin_id)?;

        let entry = match self.registry.get_function(&plugin_id, &func_name) {
            Ok(entry) => entry,
            Err(_) => {
                let _ = conn_tx.send(Envelope::function_not_found(&rid));
                return Ok(());
            }
        };
        let _ = conn_tx.send(Envelope::time_estimate_ack(&rid, self.engine.time_estimate()));

        let effects = Arc::new(RemoteEffects {
            adapter: self.clone(),
            peer: peer.to_string(),
            request_id: rid.clone(),
        });
        let ctx = CallContext::new(
            rid.clone(),
            peer,
            envelope.scope.unwrap_or_default(),
            true,
            envelope.node_count.unwrap_or(0),
            HashMap::new(),
            effects,
        );
        let oneway = envelope.oneway.unwrap_or(false);
        let args = envelope.args.unwrap_or_default();
        let kwargs = envelope.kwargs.unwrap_or_default();
        let engine = self.engine.clone();
        let tx = conn_tx.clone();

        tokio::spawn(async move {
            match engine.invoke_entry(&entry, args, kwargs, ctx.clone(), None).await {
                Ok(value) => {
                    if !oneway {
                        let state = ctx.state_snapshot();
                        let state = if state.is_empty() { None } else { Some(state) };
                        let _ = tx.send(Envelope::function_return(&rid, value, state));
                    }
                }
                Err(err) => {
                    if oneway {
                        warn!("oneway call '{}' failed: {}", entry.spec.name, err);
                    }
                    let offline = match &err {
                        PlexusError::RemoteOffline(name) => Some(name.clone()),
                        _ => None,
                    };
                    let _ = tx.send(Envelope::exception_return(
                        &rid,
                        err.kind_name(),
                        err.to_string(),
                        format!("{:?}", err),
                        offline,
                    ));
                }
            }
        });
        Ok(())
    }

    /// Number of requests currently awaiting a result message. Oneway calls
    /// never appear here.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

fn required(field: &Option<String>) -> PlexusResult<String> {
    field
        .clone()
        .ok_or_else(|| PlexusError::Protocol("missing required message field".to_string()))
}

/// Side effects for a call running on behalf of a remote origin: everything
/// user-visible is relayed back as an API_CALL instead of executed here.
pub struct RemoteEffects {
    pub adapter: Arc<NetAdapter>,
    pub peer: String,
    pub request_id: String,
}

impl Effects for RemoteEffects {
    fn display(&self, payload: Value) {
        let envelope = Envelope::api_call(&self.request_id, "display", vec![payload], HashMap::new());
        if let Err(err) = self.adapter.send_to(&self.peer, envelope) {
            warn!("failed to relay display call: {}", err);
        }
    }

    fn show_message(&self, level: &str, text: &str) {
        let envelope = Envelope::api_call(
            &self.request_id,
            "show_message",
            vec![Value::Str(level.to_string()), Value::Str(text.to_string())],
            HashMap::new(),
        );
        if let Err(err) = self.adapter.send_to(&self.peer, envelope) {
            warn!("failed to relay message call: {}", err);
        }
    }
}

/// Resolves an inbound API_CALL against the originating request's context.
fn dispatch_api_call(ctx: &Arc<CallContext>, name: &str, args: Vec<Value>) {
    match name {
        "display" => {
            let payload = args.into_iter().next().unwrap_or(Value::Null);
            ctx.effects().display(payload);
        }
        "show_message" => {
            let mut args = args.into_iter();
            let level = args.next().unwrap_or(Value::Str("info".into()));
            let text = args.next().unwrap_or(Value::Null);
            ctx.effects().show_message(
                level.as_str().unwrap_or("info"),
                text.as_str().unwrap_or(""),
            );
        }
        other => warn!("unknown api function '{}'", other),
    }
}
