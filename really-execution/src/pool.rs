//! The parent-side process pool
//!
//! A [`Pool`] binds a private socket, starts `workers_count` worker
//! processes told to dial it, and hands each dispatched payload to the next
//! worker connection.

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{MutexGuard, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use really_config::{PoolConfig, TransportKind, Validatable, WorkerEnvironment};
use really_ipc::{Endpoint, IpcError, Listener, Payload};
use really_resilience::{shutdown_signal, JobTracker};

use crate::dispatcher::{run_job, ConnectionQueue, JobHandle, JobId, JobSpec};
use crate::error::{DispatchError, ExecutionError};
use crate::process::{WorkerCommand, WorkerProcess};

const SOCKET_FILE_NAME: &str = "pool.sock";

/// A pool of worker processes. Cloning shares the same pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    endpoint: Endpoint,
    tracker: JobTracker,
    connections: Arc<ConnectionQueue>,
    workers: tokio::sync::Mutex<Vec<WorkerProcess>>,
    socket_dir: Mutex<Option<tempfile::TempDir>>,
    signal_task: Mutex<Option<JoinHandle<()>>>,
    stopped: OnceCell<()>,
}

impl Pool {
    /// Start a pool from a full configuration
    pub async fn new(config: PoolConfig) -> Result<Self, ExecutionError> {
        config.validate()?;
        config.check_script()?;

        let (listener, socket_dir) = bind_listener(&config).await?;
        let endpoint = listener.local_endpoint()?;
        let connections = Arc::new(ConnectionQueue::start(listener));
        debug!(address = %endpoint, "Pool listening");

        let command = WorkerCommand::from_config(&config);
        let mut workers = Vec::with_capacity(config.workers_count);
        for id in 0..config.workers_count {
            let environment =
                WorkerEnvironment::new(endpoint.to_string(), id as u32, config.concurrency_level)
                    .with_max_frame_bytes(config.max_frame_bytes);
            match WorkerProcess::spawn(&command, &environment) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    warn!("Failed to start worker {}, tearing the pool down: {}", id, e);
                    let grace = config.kill_grace_period;
                    join_all(workers.iter_mut().map(|w| w.kill(grace))).await;
                    connections.shutdown().await;
                    return Err(e);
                }
            }
        }

        info!(
            address = %endpoint,
            workers = config.workers_count,
            concurrency = config.concurrency_level,
            "Pool started"
        );

        let handle_signals = config.handle_signals;
        let inner = Arc::new(PoolInner {
            config,
            endpoint,
            tracker: JobTracker::new(),
            connections,
            workers: tokio::sync::Mutex::new(workers),
            socket_dir: Mutex::new(socket_dir),
            signal_task: Mutex::new(None),
            stopped: OnceCell::new(),
        });

        if handle_signals {
            let task = tokio::spawn(stop_on_signal(Arc::downgrade(&inner)));
            *inner.signal_task.lock() = Some(task);
        }

        Ok(Self { inner })
    }

    /// Start a pool for `script` with the given size, other settings at their defaults
    pub async fn with_workers(
        script: impl Into<PathBuf>,
        workers_count: usize,
        concurrency_level: usize,
    ) -> Result<Self, ExecutionError> {
        Self::new(PoolConfig {
            workers_count,
            concurrency_level,
            ..PoolConfig::new(script)
        })
        .await
    }

    /// Send a payload to the next available worker.
    ///
    /// Never fails synchronously: a closing pool, an unserializable or
    /// oversized payload and every transport problem all resolve the
    /// returned handle.
    pub fn dispatch<P: Payload>(&self, payload: P) -> JobHandle<P::Output> {
        let id = JobId::new();

        let Some(guard) = self.inner.tracker.try_begin() else {
            debug!(job = %id, "Rejecting job, pool is closing");
            return JobHandle::ready(id, Err(DispatchError::PoolClosing));
        };

        let body = match payload.encode() {
            Ok(body) => body,
            Err(e) => return JobHandle::ready(id, Err(e.into())),
        };

        let max_frame_len = self.inner.config.max_frame_bytes;
        if body.len() > max_frame_len {
            debug!(job = %id, len = body.len(), "Rejecting job, request exceeds the frame limit");
            return JobHandle::ready(
                id,
                Err(DispatchError::Ipc(IpcError::FrameTooLarge {
                    len: body.len(),
                    max: max_frame_len,
                })),
            );
        }

        let spec = JobSpec {
            id,
            body,
            max_frame_len,
            guard,
        };
        let connections = self.inner.connections.clone();
        let task = tokio::spawn(async move { run_job::<P>(&connections, spec).await });
        JobHandle::running(id, task)
    }

    /// Stop the pool.
    ///
    /// Rejects new jobs, waits for outstanding ones (bounded by
    /// `drain_timeout` when set), closes the listener and terminates every
    /// worker. Concurrent and repeated calls all wait for the same single
    /// shutdown.
    ///
    /// With `handle_signals`, the SIGINT/SIGTERM handlers stay installed for
    /// the rest of the process; callers that want a second signal to exit
    /// must listen for it themselves.
    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    /// Address workers dial
    pub fn address(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_closing(&self) -> bool {
        self.inner.tracker.is_closing()
    }

    /// Whether [`Pool::stop`] has completed
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.initialized()
    }

    /// Jobs dispatched and not yet resolved
    pub fn outstanding_jobs(&self) -> usize {
        self.inner.tracker.active_count()
    }

    /// The worker process handles, ordered by id
    pub async fn worker_processes(&self) -> MutexGuard<'_, Vec<WorkerProcess>> {
        self.inner.workers.lock().await
    }
}

impl PoolInner {
    async fn stop(&self) {
        self.stopped.get_or_init(|| self.shutdown()).await;
    }

    async fn shutdown(&self) {
        self.tracker.close();
        info!(outstanding = self.tracker.active_count(), "Stopping pool");

        if let Err(e) = self.tracker.wait_idle(self.config.drain_timeout).await {
            warn!("Abandoning outstanding jobs: {}", e);
        }

        self.connections.shutdown().await;

        let grace = self.config.kill_grace_period;
        let mut workers = self.workers.lock().await;
        let results = join_all(workers.iter_mut().map(|w| w.kill(grace))).await;
        for (worker, result) in workers.iter().zip(results) {
            if let Err(e) = result {
                warn!(worker = worker.id(), "Failed to stop worker process: {}", e);
            }
        }
        drop(workers);

        let socket_dir = self.socket_dir.lock().take();
        if let Some(dir) = socket_dir {
            if let Err(e) = dir.close() {
                warn!("Failed to remove pool socket directory: {}", e);
            }
        }

        let signal_task = self.signal_task.lock().take();
        if let Some(task) = signal_task {
            task.abort();
        }

        info!("Pool stopped");
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(task) = self.signal_task.get_mut().take() {
            task.abort();
        }
    }
}

async fn bind_listener(
    config: &PoolConfig,
) -> Result<(Listener, Option<tempfile::TempDir>), ExecutionError> {
    match config.transport {
        TransportKind::Tcp => {
            let endpoint = Endpoint::Tcp {
                host: config.tcp_host.clone(),
                port: 0,
            };
            Ok((Listener::bind(&endpoint).await?, None))
        }
        TransportKind::Unix => {
            let dir = tempfile::Builder::new().prefix("really-").tempdir()?;
            let endpoint = Endpoint::unix(dir.path().join(SOCKET_FILE_NAME));
            Ok((Listener::bind(&endpoint).await?, Some(dir)))
        }
    }
}

/// Stop the pool on SIGINT/SIGTERM; holds only a weak reference
async fn stop_on_signal(pool: Weak<PoolInner>) {
    let signal = shutdown_signal().await;
    let Some(pool) = pool.upgrade() else {
        return;
    };
    info!("Stopping pool on {}", signal);
    // Run on a separate task: stop() aborts this one
    tokio::spawn(
        async move { pool.stop().await }.instrument(tracing::info_span!("signal_stop")),
    );
}
