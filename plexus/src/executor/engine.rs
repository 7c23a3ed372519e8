// Call dispatch.
//
// Single entry point for every invocation: resolve the descriptor, validate
// the call against its declared schema, then route to the local backend, the
// cooperative scheduler or the owning peer link. Restricted-code execution
// sits on top and funnels each resolved call back through here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use callscript::{CallHost, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::warn;

use super::Executor;
use crate::config::Settings;
use crate::context::ContextHandle;
use crate::errors::{PlexusError, PlexusResult};
use crate::registry::{FunctionEntry, FunctionKind, FunctionSpec, Handler, PluginRegistry};

pub struct Engine {
    registry: Arc<PluginRegistry>,
    executor: Arc<dyn Executor>,
    settings: Settings,
}

/// An in-flight invocation whose result has not been awaited yet.
pub enum CallFuture {
    Task(JoinHandle<PlexusResult<Value>>),
    Channel(oneshot::Receiver<PlexusResult<Value>>),
    Remote {
        rx: oneshot::Receiver<PlexusResult<Value>>,
        registry: Arc<PluginRegistry>,
        plugin_id: String,
    },
}

impl CallFuture {
    pub async fn wait(self) -> PlexusResult<Value> {
        match self {
            CallFuture::Task(handle) => handle
                .await
                .map_err(|e| PlexusError::Internal(format!("call task failed: {}", e)))?,
            CallFuture::Channel(rx) => rx
                .await
                .map_err(|_| PlexusError::Internal("worker dropped the call".to_string()))?,
            CallFuture::Remote {
                rx,
                registry,
                plugin_id,
            } => {
                let result = rx.await.map_err(|_| {
                    PlexusError::Internal("pending request was dropped".to_string())
                })?;
                registry.adjust_active_tasks(&plugin_id, -1);
                result
            }
        }
    }

    pub async fn wait_timeout(self, duration: Duration) -> PlexusResult<Value> {
        match tokio::time::timeout(duration, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(PlexusError::RemoteTimeout(format!(
                "function call timed out after {} seconds",
                duration.as_secs()
            ))),
        }
    }
}

impl Engine {
    pub fn new(
        registry: Arc<PluginRegistry>,
        executor: Arc<dyn Executor>,
        settings: Settings,
    ) -> Self {
        Self {
            registry,
            executor,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    /// Coarse seconds-until-start guess, sent with call acknowledgements.
    pub fn time_estimate(&self) -> f64 {
        self.executor.load() as f64
    }

    /// Resolve by name and await the result.
    pub async fn invoke(
        &self,
        name: &str,
        plugin_name: Option<&str>,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
        ctx: ContextHandle,
        timeout: Option<Duration>,
    ) -> PlexusResult<Value> {
        let entry = self.registry.resolve(name, plugin_name)?;
        self.invoke_entry(&entry, args, kwargs, ctx, timeout).await
    }

    pub async fn invoke_entry(
        &self,
        entry: &FunctionEntry,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
        ctx: ContextHandle,
        timeout: Option<Duration>,
    ) -> PlexusResult<Value> {
        let timeout = timeout.unwrap_or_else(|| self.settings.call_timeout());
        let (future, _estimate) = self
            .invoke_entry_future(entry, args, kwargs, ctx, false)
            .await?;
        match future {
            Some(future) => future.wait_timeout(timeout).await,
            None => Ok(Value::Null),
        }
    }

    /// Dispatch without awaiting. Returns the pending call plus the callee's
    /// coarse time estimate when one was produced (remote calls only).
    /// With `oneway` no result is tracked at all and failures are logged by
    /// a supervising task instead of surfacing to the caller.
    pub async fn invoke_entry_future(
        &self,
        entry: &FunctionEntry,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
        ctx: ContextHandle,
        oneway: bool,
    ) -> PlexusResult<(Option<CallFuture>, Option<f64>)> {
        validate_call(&entry.spec, &args, &kwargs)?;
        match entry.kind {
            FunctionKind::LocalSync => {
                self.check_admission(entry)?;
                let rx = self.executor.submit(entry.clone(), args, kwargs, ctx)?;
                if oneway {
                    supervise(
                        async move {
                            rx.await.map_err(|_| {
                                PlexusError::Internal("worker dropped the call".to_string())
                            })?
                        },
                        "oneway sync call",
                    );
                    Ok((None, None))
                } else {
                    Ok((Some(CallFuture::Channel(rx)), None))
                }
            }
            FunctionKind::LocalAsync => {
                let handler = match &entry.handler {
                    Some(Handler::Async(handler)) => handler.clone(),
                    _ => {
                        return Err(PlexusError::Internal(format!(
                            "'{}' is not a local async function",
                            entry.spec.name
                        )))
                    }
                };
                let future = handler(ctx, args, kwargs);
                if oneway {
                    supervise(future, "oneway async call");
                    Ok((None, None))
                } else {
                    Ok((Some(CallFuture::Task(tokio::spawn(future))), None))
                }
            }
            FunctionKind::Remote => {
                if !self.registry.is_alive(&entry.plugin_id) {
                    return Err(PlexusError::RemoteOffline(entry.plugin_name.clone()));
                }
                let link = entry.link.clone().ok_or_else(|| {
                    PlexusError::Internal(format!(
                        "remote entry '{}' has no peer link",
                        entry.spec.name
                    ))
                })?;
                self.registry.adjust_active_tasks(&entry.plugin_id, 1);
                let outcome = link
                    .adapter
                    .call_remote(entry, args, kwargs, &ctx, oneway)
                    .await;
                match outcome {
                    Ok((Some(rx), estimate)) => Ok((
                        Some(CallFuture::Remote {
                            rx,
                            registry: self.registry.clone(),
                            plugin_id: entry.plugin_id.clone(),
                        }),
                        estimate,
                    )),
                    Ok((None, estimate)) => {
                        self.registry.adjust_active_tasks(&entry.plugin_id, -1);
                        Ok((None, estimate))
                    }
                    Err(err) => {
                        self.registry.adjust_active_tasks(&entry.plugin_id, -1);
                        Err(err)
                    }
                }
            }
        }
    }

    pub async fn invoke_oneway(
        &self,
        entry: &FunctionEntry,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
        ctx: ContextHandle,
    ) -> PlexusResult<()> {
        self.invoke_entry_future(entry, args, kwargs, ctx, true)
            .await
            .map(|_| ())
    }

    /// Runs restricted code against this engine's registry, honoring the
    /// context's scope. Each resolved call is bounded individually by the
    /// per-call timeout, which is deliberately shorter than the program
    /// timeout: a single expiring call is almost certainly a broken
    /// function, not transient load.
    pub async fn execute_code(
        &self,
        source: &str,
        ctx: ContextHandle,
        timeout: Option<Duration>,
    ) -> PlexusResult<Value> {
        let program = callscript::parse_program(source)?;
        let host = ScopedHost { engine: self, ctx };
        let overall = timeout.unwrap_or_else(|| self.settings.code_timeout());
        match tokio::time::timeout(overall, callscript::run_program(&program, &host)).await {
            Ok(result) => result.map_err(PlexusError::from),
            Err(_) => Err(PlexusError::RemoteTimeout(format!(
                "code execution timed out after {} seconds",
                overall.as_secs()
            ))),
        }
    }

    fn check_admission(&self, entry: &FunctionEntry) -> PlexusResult<()> {
        if self.executor.load() >= self.settings.max_queue {
            return Err(PlexusError::QueueOverflow(format!(
                "{} has no available workers.",
                entry.plugin_name
            )));
        }
        Ok(())
    }
}

/// Host adapter wiring the restricted interpreter into the engine under the
/// caller's scope.
struct ScopedHost<'a> {
    engine: &'a Engine,
    ctx: ContextHandle,
}

#[async_trait]
impl CallHost for ScopedHost<'_> {
    type Error = PlexusError;

    async fn invoke(
        &self,
        function: &str,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
    ) -> Result<Value, PlexusError> {
        let entry = self
            .engine
            .registry
            .filtered_functions(&self.ctx.scope)
            .into_iter()
            .find(|f| f.spec.name == function)
            .ok_or_else(|| PlexusError::FunctionNotFound(format!("'{}' not found", function)))?;

        let per_call = self.engine.settings.call_timeout();
        let invocation =
            self.engine
                .invoke_entry(&entry, args, kwargs, self.ctx.clone(), Some(per_call));
        match tokio::time::timeout(per_call, invocation).await {
            Ok(result) => result,
            Err(_) => Err(PlexusError::RemoteTimeout(format!(
                "Execution of {} in {} timed out after {} seconds. \
                 The function is most likely broken; do not call it again, \
                 or you may deadlock the system.",
                entry.spec.name,
                entry.plugin_name,
                per_call.as_secs()
            ))),
        }
    }
}

fn supervise(
    future: impl std::future::Future<Output = PlexusResult<Value>> + Send + 'static,
    label: &'static str,
) {
    tokio::spawn(async move {
        if let Err(err) = future.await {
            warn!("supervised {} failed: {}", label, err);
        }
    });
}

/// Schema validation: every default-less parameter must be bound, unknown
/// keywords are rejected, and positionals cannot exceed the declared list.
pub fn validate_call(
    spec: &FunctionSpec,
    args: &[Value],
    kwargs: &HashMap<String, Value>,
) -> PlexusResult<()> {
    if args.len() > spec.params.len() {
        return Err(PlexusError::SignatureMismatch(format!(
            "too many positional arguments; expected signature is {}",
            spec.render_signature()
        )));
    }
    for key in kwargs.keys() {
        let known = spec.params.iter().any(|p| &p.name == key);
        if !known {
            return Err(PlexusError::SignatureMismatch(format!(
                "unexpected keyword argument '{}'; expected signature is {}",
                key,
                spec.render_signature()
            )));
        }
        // A parameter bound both positionally and by keyword is a caller bug.
        let position = spec.params.iter().position(|p| &p.name == key);
        if let Some(position) = position {
            if position < args.len() {
                return Err(PlexusError::SignatureMismatch(format!(
                    "argument '{}' given both positionally and by keyword",
                    key
                )));
            }
        }
    }
    for (index, param) in spec.params.iter().enumerate() {
        let bound = index < args.len() || kwargs.contains_key(&param.name);
        if !bound && param.default.is_none() {
            return Err(PlexusError::SignatureMismatch(format!(
                "missing required argument '{}'; expected signature is {}",
                param.name,
                spec.render_signature()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ParamSpec;

    fn spec() -> FunctionSpec {
        FunctionSpec::new("search")
            .param(ParamSpec::required("query"))
            .param(ParamSpec::required("limit").with_default(Value::Int(10)))
    }

    #[test]
    fn accepts_well_formed_calls() {
        let mut kwargs = HashMap::new();
        kwargs.insert("limit".to_string(), Value::Int(3));
        assert!(validate_call(&spec(), &[Value::Str("x".into())], &kwargs).is_ok());
        assert!(validate_call(&spec(), &[Value::Str("x".into())], &HashMap::new()).is_ok());
    }

    #[test]
    fn rejects_missing_required_argument() {
        let err = validate_call(&spec(), &[], &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("query"));
    }

    #[test]
    fn rejects_unknown_keyword() {
        let mut kwargs = HashMap::new();
        kwargs.insert("depth".to_string(), Value::Int(1));
        let err = validate_call(&spec(), &[Value::Str("x".into())], &kwargs).unwrap_err();
        assert!(err.to_string().contains("depth"));
    }

    #[test]
    fn rejects_double_binding() {
        let mut kwargs = HashMap::new();
        kwargs.insert("query".to_string(), Value::Str("y".into()));
        assert!(validate_call(&spec(), &[Value::Str("x".into())], &kwargs).is_err());
    }

    #[test]
    fn rejects_excess_positionals() {
        let args = vec![Value::Int(1), Value::Int(2), Value::Int(3)];
        assert!(validate_call(&spec(), &args, &HashMap::new()).is_err());
    }
}
