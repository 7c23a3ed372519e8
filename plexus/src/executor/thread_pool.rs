// Counting thread pool for local-sync functions.
//
// Fixed worker threads pull jobs from a shared channel. Active and queued
// counts are exposed so the engine can make admission and time-estimate
// decisions without asking the OS anything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use callscript::Value;
use tokio::sync::oneshot;
use tracing::debug;

use super::Executor;
use crate::context::ContextHandle;
use crate::errors::{PlexusError, PlexusResult};
use crate::registry::{FunctionEntry, Handler};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct CountingThreadPool {
    sender: Mutex<Option<crossbeam_channel::Sender<Job>>>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
    queued: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    max_workers: usize,
}

impl CountingThreadPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let mut threads = Vec::with_capacity(workers);
        for i in 0..workers {
            let receiver = receiver.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("plexus-worker-{}", i))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn worker thread"),
            );
        }
        debug!("thread pool started with {} workers", workers);
        Self {
            sender: Mutex::new(Some(sender)),
            threads: Mutex::new(threads),
            queued: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            max_workers: workers,
        }
    }
}

#[async_trait]
impl Executor for CountingThreadPool {
    fn submit(
        &self,
        entry: FunctionEntry,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
        ctx: ContextHandle,
    ) -> PlexusResult<oneshot::Receiver<PlexusResult<Value>>> {
        let handler = match &entry.handler {
            Some(Handler::Sync(handler)) => handler.clone(),
            _ => {
                return Err(PlexusError::Internal(format!(
                    "'{}' is not a local sync function",
                    entry.spec.name
                )))
            }
        };

        let (tx, rx) = oneshot::channel();
        let queued = self.queued.clone();
        let active = self.active.clone();
        queued.fetch_add(1, Ordering::SeqCst);
        let job: Job = Box::new(move || {
            queued.fetch_sub(1, Ordering::SeqCst);
            active.fetch_add(1, Ordering::SeqCst);
            let result = handler(ctx, args, kwargs);
            active.fetch_sub(1, Ordering::SeqCst);
            let _ = tx.send(result);
        });

        let submitted = {
            let guard = self.sender.lock().unwrap();
            match guard.as_ref() {
                Some(sender) => sender.send(job).is_ok(),
                None => false,
            }
        };
        if !submitted {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(PlexusError::Internal("executor is shut down".to_string()));
        }
        Ok(rx)
    }

    fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn queued_count(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    fn max_workers(&self) -> usize {
        self.max_workers
    }

    async fn shutdown(&self) {
        self.sender.lock().unwrap().take();
        let threads: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        let _ = tokio::task::spawn_blocking(move || {
            for thread in threads {
                let _ = thread.join();
            }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CallContext;
    use crate::registry::{FunctionKind, FunctionSpec, OriginFlags};
    use std::sync::Arc;

    fn sync_entry(name: &str, handler: crate::registry::SyncHandler) -> FunctionEntry {
        FunctionEntry {
            spec: FunctionSpec::new(name),
            kind: FunctionKind::LocalSync,
            local_only: false,
            tags: Vec::new(),
            origin: OriginFlags::LOCAL,
            plugin_id: "p".into(),
            plugin_name: "test".into(),
            peer: None,
            link: None,
            handler: Some(Handler::Sync(handler)),
        }
    }

    #[tokio::test]
    async fn runs_jobs_and_returns_results() {
        let pool = CountingThreadPool::new(2);
        let entry = sync_entry(
            "double",
            Arc::new(|_ctx, args, _kwargs| Ok(Value::Int(args[0].as_int().unwrap() * 2))),
        );
        let ctx = CallContext::local("r", "n");
        let rx = pool
            .submit(entry, vec![Value::Int(21)], HashMap::new(), ctx)
            .unwrap();
        assert_eq!(rx.await.unwrap().unwrap(), Value::Int(42));
        assert_eq!(pool.load(), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn load_is_visible_immediately_after_submit() {
        let pool = CountingThreadPool::new(1);
        let entry = sync_entry(
            "slow",
            Arc::new(|_ctx, _args, _kwargs| {
                std::thread::sleep(std::time::Duration::from_millis(200));
                Ok(Value::Null)
            }),
        );
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let ctx = CallContext::local("r", "n");
            receivers.push(
                pool.submit(entry.clone(), Vec::new(), HashMap::new(), ctx)
                    .unwrap(),
            );
        }
        // All three are in flight before any completes.
        assert_eq!(pool.load(), 3);
        assert!(pool.active_count() <= 1);
        for rx in receivers {
            rx.await.unwrap().unwrap();
        }
        assert_eq!(pool.load(), 0);
        assert_eq!(pool.free_count(), 1);
    }
}
