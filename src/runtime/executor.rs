use std::future::Future;
use std::io;
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio::task;
use tracing::{debug, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to initialize execution context: {0}")]
    Build(#[source] io::Error),
    #[error("failed to spawn execution context thread: {0}")]
    Thread(#[source] io::Error),
    #[error("blocking call made from inside an async runtime")]
    NestedRuntime,
    #[error("execution context has been shut down")]
    Stopped,
}

/// Background worker pool that runs every listener, probe and command
/// connection for the lifetime of its owner.
///
/// A dedicated thread owns the runtime and keeps it alive until
/// [`ExecutionContext::shutdown`] signals it; the thread is joined before
/// shutdown returns.
pub struct ExecutionContext {
    handle: Handle,
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl ExecutionContext {
    pub fn new(worker_threads: usize) -> Result<Self, RuntimeError> {
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(worker_threads.max(1))
            .thread_name("mission-host-io")
            .build()
            .map_err(RuntimeError::Build)?;
        let handle = runtime.handle().clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let join = std::thread::Builder::new()
            .name("mission-host-runtime".into())
            .spawn(move || {
                runtime.block_on(async move {
                    let _ = shutdown_rx.await;
                });
                runtime.shutdown_timeout(SHUTDOWN_GRACE);
                debug!("execution context stopped");
            })
            .map_err(RuntimeError::Thread)?;

        metrics::gauge!("runtime.worker_threads").set(worker_threads.max(1) as f64);
        Ok(Self {
            handle,
            shutdown: Some(shutdown_tx),
            join: Some(join),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }

    /// Drives `future` to completion on the context, blocking the caller.
    pub fn block_on<F>(&self, future: F) -> Result<F::Output, RuntimeError>
    where
        F: Future,
    {
        if !self.is_running() {
            return Err(RuntimeError::Stopped);
        }
        if Handle::try_current().is_ok() {
            return Err(RuntimeError::NestedRuntime);
        }
        Ok(self.handle.block_on(future))
    }

    pub fn spawn<F>(&self, future: F) -> task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Signals the owning thread and joins it. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("execution context thread panicked during shutdown");
            }
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
