// Execution backends.
//
// One `Executor` interface, two concrete implementations selected once at
// startup and never constructed together: a bounded in-process thread pool
// for ordinary blocking work, or a fixed pool of persistent worker
// subprocesses for work that needs isolation.

pub mod engine;
pub mod process_pool;
pub mod thread_pool;
pub mod worker;

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use callscript::Value;

use crate::context::ContextHandle;
use crate::errors::PlexusResult;
use crate::registry::FunctionEntry;

pub use engine::{CallFuture, Engine};
pub use process_pool::ProcessPool;
pub use thread_pool::CountingThreadPool;
pub use worker::{run_worker, WorkerCall, WorkerReply};

/// How local-sync work is executed. Chosen once at startup.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    /// Shared-memory worker threads.
    Thread { workers: usize },
    /// Persistent worker subprocesses speaking the stdio frame protocol.
    /// The command must register the same plugins and then call
    /// [`run_worker`].
    Process {
        program: PathBuf,
        args: Vec<String>,
        workers: usize,
    },
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Enqueues one local-sync invocation. Submission is synchronous so the
    /// queued count is visible to admission control the moment this returns;
    /// the channel yields the eventual result.
    fn submit(
        &self,
        entry: FunctionEntry,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
        ctx: ContextHandle,
    ) -> PlexusResult<tokio::sync::oneshot::Receiver<PlexusResult<Value>>>;

    fn active_count(&self) -> usize;
    fn queued_count(&self) -> usize;
    fn max_workers(&self) -> usize;

    fn free_count(&self) -> usize {
        self.max_workers().saturating_sub(self.active_count())
    }

    /// In-flight submissions: running plus waiting. Admission control
    /// compares this against the configured queue bound.
    fn load(&self) -> usize {
        self.active_count() + self.queued_count()
    }

    async fn shutdown(&self);
}
