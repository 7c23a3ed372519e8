// The system facade.
//
// One `Plexus` value owns the registry, the chosen execution backend and
// every network endpoint. Registration happens before `start`; everything
// after that flows through `invoke`/`execute_code`. There is no global
// instance: embedders hold the handle and thread it where needed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use callscript::Value;
use tracing::{error, info};

use crate::config::Settings;
use crate::context::{CallContext, ContextHandle};
use crate::discovery;
use crate::errors::{PlexusError, PlexusResult};
use crate::executor::{
    BackendConfig, CallFuture, CountingThreadPool, Engine, Executor, ProcessPool,
};
use crate::executor::process_pool::WorkerSpawnConfig;
use crate::identity::{request_id, NodeIdentity};
use crate::network::{client, server, ClientHandle, ServerHandle};
use crate::registry::{render_menu, FunctionKind, FunctionSpec, Handler, PluginRegistry, Scope};

pub struct SystemInner {
    pub(crate) settings: Settings,
    pub(crate) identity: NodeIdentity,
    pub(crate) registry: Arc<PluginRegistry>,
    engine: OnceLock<Arc<Engine>>,
    backend_name: OnceLock<&'static str>,
    server: Mutex<Option<ServerHandle>>,
    clients: Mutex<Vec<ClientHandle>>,
    is_clean: AtomicBool,
}

impl SystemInner {
    pub(crate) fn node_id(&self) -> &str {
        self.identity.id()
    }

    pub(crate) fn engine(&self) -> PlexusResult<Arc<Engine>> {
        self.engine.get().cloned().ok_or(PlexusError::NotStarted)
    }

    /// Fail-closed teardown, reachable from protocol code when a peer keeps
    /// sending garbage. Idempotent.
    pub(crate) fn force_shutdown(self: Arc<Self>) {
        error!("force shutdown of the plugin system! This should not happen.");
        tokio::spawn(async move {
            self.shutdown_internal().await;
        });
    }

    async fn shutdown_internal(&self) {
        if self.is_clean.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(server) = self.server.lock().unwrap().take() {
            server.stop();
        }
        for client in self.clients.lock().unwrap().drain(..) {
            client.stop();
        }
        if let Some(engine) = self.engine.get() {
            engine.executor().shutdown().await;
        }
        discovery::remove_node(&self.settings.discovery_path, self.identity.id());
        info!("plugin system shut down");
    }
}

#[derive(Clone)]
pub struct Plexus {
    inner: Arc<SystemInner>,
}

impl Plexus {
    pub fn new(settings: Settings) -> Self {
        let identity = NodeIdentity::derive(settings.node_seed.as_deref());
        let registry = Arc::new(PluginRegistry::new(
            identity.clone(),
            settings.accept_remote_plugins,
        ));
        Self {
            inner: Arc::new(SystemInner {
                settings,
                identity,
                registry,
                engine: OnceLock::new(),
                backend_name: OnceLock::new(),
                server: Mutex::new(None),
                clients: Mutex::new(Vec::new()),
                is_clean: AtomicBool::new(false),
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        self.inner.node_id()
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.inner.registry
    }

    pub fn engine(&self) -> PlexusResult<Arc<crate::executor::Engine>> {
        self.inner.engine()
    }

    /// Requests awaiting a result across every outbound link.
    pub fn pending_remote_requests(&self) -> usize {
        let clients: usize = self
            .inner
            .clients
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.adapter.pending_count())
            .sum();
        let server: usize = self
            .inner
            .server
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.adapter.pending_count())
            .unwrap_or(0);
        clients + server
    }

    /// Registers one function under its owning plugin. Boot-time only.
    pub fn register(
        &self,
        plugin_name: &str,
        spec: FunctionSpec,
        handler: Handler,
        local_only: bool,
    ) -> PlexusResult<()> {
        let kind = match &handler {
            Handler::Sync(_) => FunctionKind::LocalSync,
            Handler::Async(_) => FunctionKind::LocalAsync,
        };
        self.inner
            .registry
            .register_local(plugin_name, spec, kind, local_only, handler)
    }

    pub fn register_sync<F>(&self, plugin_name: &str, spec: FunctionSpec, f: F) -> PlexusResult<()>
    where
        F: Fn(ContextHandle, Vec<Value>, HashMap<String, Value>) -> PlexusResult<Value>
            + Send
            + Sync
            + 'static,
    {
        self.register(plugin_name, spec, Handler::Sync(Arc::new(f)), false)
    }

    pub fn register_async<F>(&self, plugin_name: &str, spec: FunctionSpec, f: F) -> PlexusResult<()>
    where
        F: Fn(
                ContextHandle,
                Vec<Value>,
                HashMap<String, Value>,
            ) -> futures::future::BoxFuture<'static, PlexusResult<Value>>
            + Send
            + Sync
            + 'static,
    {
        self.register(plugin_name, spec, Handler::Async(Arc::new(f)), false)
    }

    /// Locks registration and brings up the chosen execution backend.
    pub async fn start(&self, backend: BackendConfig) -> PlexusResult<()> {
        if self.inner.engine.get().is_some() {
            return Err(PlexusError::AlreadyStarted);
        }
        let (executor, name): (Arc<dyn Executor>, &'static str) = match backend {
            BackendConfig::Thread { workers } => {
                let workers = if workers == 0 {
                    self.inner.settings.worker_count()
                } else {
                    workers
                };
                (Arc::new(CountingThreadPool::new(workers)), "thread")
            }
            BackendConfig::Process {
                program,
                args,
                workers,
            } => {
                let workers = if workers == 0 {
                    self.inner.settings.worker_count()
                } else {
                    workers
                };
                let pool =
                    ProcessPool::start(WorkerSpawnConfig { program, args }, workers).await?;
                (Arc::new(pool), "process")
            }
        };
        let engine = Arc::new(Engine::new(
            self.inner.registry.clone(),
            executor,
            self.inner.settings.clone(),
        ));
        let _ = self.inner.engine.set(engine);
        let _ = self.inner.backend_name.set(name);
        self.inner.registry.mark_started();
        info!("plugin system initialized ({} backend)", name);
        Ok(())
    }

    /// Starts the plugin server. Returns the bound port (useful with port 0).
    pub async fn start_server(&self, port: u16, use_auth: bool) -> PlexusResult<u16> {
        let engine = self.inner.engine()?;
        let mut guard = self.inner.server.lock().unwrap();
        if guard.is_some() {
            return Err(PlexusError::Internal("server already running".to_string()));
        }
        drop(guard);
        let handle = server::start_server(&self.inner, engine, port, use_auth).await?;
        let bound = handle.port;
        guard = self.inner.server.lock().unwrap();
        *guard = Some(handle);
        Ok(bound)
    }

    /// Connects to a remote server and merges its exported plugins.
    pub async fn connect_client(
        &self,
        address: &str,
        port: u16,
        use_auth: bool,
    ) -> PlexusResult<()> {
        let engine = self.inner.engine()?;
        let handle = client::connect_client(&self.inner, engine, address, port, use_auth).await?;
        self.inner.clients.lock().unwrap().push(handle);
        Ok(())
    }

    /// Blocks until some peer has completed a handshake with our server.
    pub async fn wait_first_connection(&self) -> PlexusResult<()> {
        let adapter = {
            let guard = self.inner.server.lock().unwrap();
            guard
                .as_ref()
                .map(|s| s.adapter.clone())
                .ok_or_else(|| PlexusError::Internal("server not running".to_string()))?
        };
        adapter.wait_first_connection().await;
        Ok(())
    }

    fn fresh_context(&self, name: &str, args: &[Value], kwargs: &HashMap<String, Value>) -> ContextHandle {
        let rid = request_id(name, args, kwargs, self.inner.settings.debug);
        CallContext::local(rid, self.inner.node_id())
    }

    /// Resolve a function by name and await its result.
    pub async fn invoke(
        &self,
        name: &str,
        plugin_name: Option<&str>,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
    ) -> PlexusResult<Value> {
        let engine = self.inner.engine()?;
        let ctx = self.fresh_context(name, &args, &kwargs);
        engine.invoke(name, plugin_name, args, kwargs, ctx, None).await
    }

    pub async fn invoke_with_timeout(
        &self,
        name: &str,
        plugin_name: Option<&str>,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
        timeout: Duration,
    ) -> PlexusResult<Value> {
        let engine = self.inner.engine()?;
        let ctx = self.fresh_context(name, &args, &kwargs);
        engine
            .invoke(name, plugin_name, args, kwargs, ctx, Some(timeout))
            .await
    }

    /// Dispatch without awaiting; also surfaces the callee's coarse time
    /// estimate for remote calls.
    pub async fn invoke_future(
        &self,
        name: &str,
        plugin_name: Option<&str>,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
    ) -> PlexusResult<(Option<CallFuture>, Option<f64>)> {
        let engine = self.inner.engine()?;
        let entry = self.inner.registry.resolve(name, plugin_name)?;
        let ctx = self.fresh_context(name, &args, &kwargs);
        engine
            .invoke_entry_future(&entry, args, kwargs, ctx, false)
            .await
    }

    /// Fire-and-forget: no result is awaited or expected; failures are
    /// logged by a supervising task.
    pub async fn invoke_oneway(
        &self,
        name: &str,
        plugin_name: Option<&str>,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
    ) -> PlexusResult<()> {
        let engine = self.inner.engine()?;
        let entry = self.inner.registry.resolve(name, plugin_name)?;
        let ctx = self.fresh_context(name, &args, &kwargs);
        engine.invoke_oneway(&entry, args, kwargs, ctx).await
    }

    /// Runs restricted code under the given scope.
    pub async fn execute_code(
        &self,
        source: &str,
        scope: Scope,
        timeout: Option<Duration>,
    ) -> PlexusResult<Value> {
        let engine = self.inner.engine()?;
        let rid = request_id("__code__", &[], &HashMap::new(), self.inner.settings.debug);
        let ctx = CallContext::new(
            rid,
            self.inner.node_id(),
            scope,
            false,
            0,
            HashMap::new(),
            Arc::new(crate::context::LocalEffects),
        );
        engine.execute_code(source, ctx, timeout).await
    }

    /// The function menu an interactive caller gets to see under a scope.
    pub fn functions_menu(&self, scope: &Scope) -> String {
        render_menu(&self.inner.registry.filtered_functions(scope))
    }

    pub fn set_plugin_tags(&self, plugin_name: &str, tags: Vec<String>) -> PlexusResult<()> {
        self.inner.registry.set_plugin_tags(plugin_name, tags)
    }

    /// Human-readable system summary.
    pub fn status(&self) -> String {
        let mut out = format!(
            "Mode: {}, ID: {}, Debug: {}\n",
            self.inner.backend_name.get().copied().unwrap_or("unstarted"),
            self.inner.node_id(),
            self.inner.settings.debug
        );
        if let Some(engine) = self.inner.engine.get() {
            let executor = engine.executor();
            out.push_str(&format!(
                "{}/{} tasks running\n{} additional tasks queued\n",
                executor.active_count(),
                executor.max_workers(),
                executor.queued_count()
            ));
        } else {
            out.push_str("No executor\n");
        }
        out.push('\n');
        out.push_str(&self.inner.registry.describe_plugins());
        out
    }

    pub async fn shutdown(&self) {
        self.inner.shutdown_internal().await;
    }
}
