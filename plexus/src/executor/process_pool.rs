// Persistent worker-subprocess pool.
//
// A fixed set of long-lived child processes each serve one call at a time
// over stdin/stdout frames. The call marshals function name, arguments,
// request id and the context's state bag; the reply carries the result plus
// the (possibly mutated) bag, which replaces the caller's keys wholesale.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use callscript::Value;
use futures::{SinkExt, StreamExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{error, warn};

use super::worker::{WorkerCall, WorkerReply};
use super::Executor;
use crate::context::ContextHandle;
use crate::errors::{PlexusError, PlexusResult};
use crate::registry::FunctionEntry;

#[derive(Debug, Clone)]
pub struct WorkerSpawnConfig {
    pub program: std::path::PathBuf,
    pub args: Vec<String>,
}

struct PoolWorker {
    child: Child,
    writer: FramedWrite<ChildStdin, LengthDelimitedCodec>,
    reader: FramedRead<ChildStdout, LengthDelimitedCodec>,
}

impl PoolWorker {
    async fn spawn(config: &WorkerSpawnConfig) -> PlexusResult<Self> {
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PlexusError::Worker("worker has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PlexusError::Worker("worker has no stdout".to_string()))?;
        Ok(Self {
            child,
            writer: FramedWrite::new(stdin, LengthDelimitedCodec::new()),
            reader: FramedRead::new(stdout, LengthDelimitedCodec::new()),
        })
    }

    /// One call in, one reply out. The single-in-flight invariant is held by
    /// the pool: a worker is only reachable while checked out.
    async fn roundtrip(&mut self, call: &WorkerCall) -> PlexusResult<WorkerReply> {
        let bytes =
            rmp_serde::to_vec_named(call).map_err(|e| PlexusError::Codec(e.to_string()))?;
        self.writer.send(bytes.into()).await?;
        let frame = self
            .reader
            .next()
            .await
            .ok_or_else(|| PlexusError::Worker("worker closed its pipe".to_string()))??;
        rmp_serde::from_slice(&frame).map_err(|e| PlexusError::Codec(e.to_string()))
    }
}

struct PoolInner {
    config: WorkerSpawnConfig,
    idle_tx: mpsc::UnboundedSender<PoolWorker>,
    idle_rx: Mutex<mpsc::UnboundedReceiver<PoolWorker>>,
    queued: AtomicUsize,
    active: AtomicUsize,
    max_workers: usize,
    closing: AtomicBool,
}

impl PoolInner {
    async fn checkout(&self) -> PlexusResult<PoolWorker> {
        let mut rx = self.idle_rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| PlexusError::Worker("process pool is shut down".to_string()))
    }

    fn checkin(&self, worker: PoolWorker, healthy: bool) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        if healthy {
            let _ = self.idle_tx.send(worker);
            return;
        }
        // Replace a broken worker so capacity does not decay.
        drop(worker);
        let config = self.config.clone();
        let idle_tx = self.idle_tx.clone();
        tokio::spawn(async move {
            match PoolWorker::spawn(&config).await {
                Ok(fresh) => {
                    let _ = idle_tx.send(fresh);
                }
                Err(err) => error!("failed to respawn pool worker: {}", err),
            }
        });
    }

    async fn run_call(&self, call: WorkerCall, ctx: ContextHandle) -> PlexusResult<Value> {
        let worker = self.checkout().await;
        self.queued.fetch_sub(1, Ordering::SeqCst);
        let mut worker = worker?;
        self.active.fetch_add(1, Ordering::SeqCst);
        let outcome = worker.roundtrip(&call).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Ok(reply) => {
                self.checkin(worker, true);
                ctx.replace_state(reply.state);
                match (reply.result, reply.error) {
                    (Some(value), None) => Ok(value),
                    (_, Some(failure)) => Err(PlexusError::Worker(format!(
                        "{}: {}",
                        failure.kind, failure.message
                    ))),
                    (None, None) => Ok(Value::Null),
                }
            }
            Err(err) => {
                warn!("pool worker failed mid-call: {}", err);
                self.checkin(worker, false);
                Err(err)
            }
        }
    }
}

pub struct ProcessPool {
    inner: Arc<PoolInner>,
}

impl ProcessPool {
    pub async fn start(config: WorkerSpawnConfig, workers: usize) -> PlexusResult<Self> {
        let workers = workers.max(1);
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        for _ in 0..workers {
            let worker = PoolWorker::spawn(&config).await?;
            idle_tx
                .send(worker)
                .map_err(|_| PlexusError::Worker("pool channel closed".to_string()))?;
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                idle_tx,
                idle_rx: Mutex::new(idle_rx),
                queued: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_workers: workers,
                closing: AtomicBool::new(false),
            }),
        })
    }
}

#[async_trait]
impl Executor for ProcessPool {
    fn submit(
        &self,
        entry: FunctionEntry,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
        ctx: ContextHandle,
    ) -> PlexusResult<oneshot::Receiver<PlexusResult<Value>>> {
        if self.inner.closing.load(Ordering::SeqCst) {
            return Err(PlexusError::Worker("process pool is shut down".to_string()));
        }
        let call = WorkerCall {
            request_id: ctx.request_id.clone(),
            plugin_name: entry.plugin_name.clone(),
            function: entry.spec.name.clone(),
            args,
            kwargs,
            state: ctx.state_snapshot(),
        };
        let (tx, rx) = oneshot::channel();
        self.inner.queued.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result = inner.run_call(call, ctx).await;
            let _ = tx.send(result);
        });
        Ok(rx)
    }

    fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    fn queued_count(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }

    fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    async fn shutdown(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        let mut rx = self.inner.idle_rx.lock().await;
        while let Ok(mut worker) = rx.try_recv() {
            let _ = worker.child.start_kill();
        }
    }
}
