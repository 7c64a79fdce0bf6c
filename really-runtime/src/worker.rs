//! Worker process event loop
//!
//! A worker repeatedly dials the pool, waits for the handshake that binds the
//! connection to a job, and runs the job on its own task. The number of job
//! tasks alive at once never exceeds the worker's concurrency level.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::task::{JoinError, JoinSet};

use really_config::WorkerEnvironment;
use really_ipc::{
    Connection, Endpoint, HandlerError, IpcTransport, Payload, ResultEnvelope, SocketTransport,
    DEFAULT_MAX_FRAME_LEN,
};

use crate::error::RuntimeError;

/// Identity handed to the handler with every payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub id: u32,
    pub concurrency_level: usize,
}

/// Snapshot of a worker's job counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Jobs whose handler ran to completion, successfully or not
    pub executed: u64,
    /// Jobs answered with an exception
    pub failed: u64,
    /// Connections closed without a response
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    executed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Worker process main entry point
pub async fn worker_main<P, H, Fut>(handler: H) -> Result<(), RuntimeError>
where
    P: Payload,
    H: Fn(P, WorkerIdentity) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<P::Output, HandlerError>> + Send + 'static,
{
    let worker = Worker::create()?;
    let identity = worker.identity();
    info!(
        "Starting worker {} against {} (concurrency {})",
        identity.id, worker.server, identity.concurrency_level
    );

    worker.run(handler).await?;

    let stats = worker.stats();
    info!(
        "Worker {} shutting down: {} executed, {} failed, {} dropped",
        identity.id, stats.executed, stats.failed, stats.dropped
    );
    Ok(())
}

/// Worker process implementation
pub struct Worker {
    server: Endpoint,
    identity: WorkerIdentity,
    max_frame_len: usize,
    stats: Arc<StatsCounters>,
}

impl Worker {
    /// Build a worker from the `REALLY_*` environment variables
    pub fn create() -> Result<Self, RuntimeError> {
        let environment = WorkerEnvironment::from_env()?;
        Self::from_environment(&environment)
    }

    /// Build a worker from an already parsed environment contract
    pub fn from_environment(environment: &WorkerEnvironment) -> Result<Self, RuntimeError> {
        let server: Endpoint = environment.server.parse()?;
        Ok(Self::new(
            server,
            WorkerIdentity {
                id: environment.identifier,
                concurrency_level: environment.concurrency_level,
            },
        )
        .with_max_frame_len(environment.max_frame_bytes))
    }

    /// Create a worker for an explicit server address.
    ///
    /// A concurrency level of 0 is treated as 1.
    pub fn new(server: Endpoint, identity: WorkerIdentity) -> Self {
        Self {
            server,
            identity: WorkerIdentity {
                concurrency_level: identity.concurrency_level.max(1),
                ..identity
            },
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            stats: Arc::new(StatsCounters::default()),
        }
    }

    /// Override the largest accepted request frame
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn identity(&self) -> WorkerIdentity {
        self.identity
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    pub fn server(&self) -> &Endpoint {
        &self.server
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }

    /// Serve jobs until the pool stops accepting connections.
    ///
    /// Jobs still running when the pool goes away are allowed to finish
    /// before this returns.
    pub async fn run<P, H, Fut>(&self, handler: H) -> Result<(), RuntimeError>
    where
        P: Payload,
        H: Fn(P, WorkerIdentity) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<P::Output, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let limit = self.identity.concurrency_level;
        let mut jobs = JoinSet::new();

        loop {
            while let Some(finished) = jobs.try_join_next() {
                self.reap(finished);
            }
            while jobs.len() >= limit {
                match jobs.join_next().await {
                    Some(finished) => self.reap(finished),
                    None => break,
                }
            }

            let mut transport =
                match SocketTransport::connect(&self.server, self.max_frame_len).await {
                    Ok(transport) => transport,
                    Err(e) => {
                        info!(
                            "Worker {} cannot reach the pool at {} ({}), stopping",
                            self.identity.id, self.server, e
                        );
                        break;
                    }
                };

            if let Err(e) = transport.receive_handshake().await {
                if e.is_protocol_error() && !e.is_disconnect() {
                    warn!("Worker {} dropping connection: {}", self.identity.id, e);
                } else {
                    debug!("Worker {} connection closed before handshake: {}", self.identity.id, e);
                }
                continue;
            }

            jobs.spawn(serve_job(
                transport,
                handler.clone(),
                self.identity,
                self.stats.clone(),
            ));
        }

        if !jobs.is_empty() {
            debug!(
                "Worker {} draining {} in-flight jobs",
                self.identity.id,
                jobs.len()
            );
        }
        while let Some(finished) = jobs.join_next().await {
            self.reap(finished);
        }

        Ok(())
    }

    fn reap(&self, finished: Result<(), JoinError>) {
        if let Err(e) = finished {
            error!("Worker {} job task aborted: {}", self.identity.id, e);
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Run one job on an already handshaken connection
async fn serve_job<P, H, Fut>(
    mut transport: SocketTransport<Connection>,
    handler: Arc<H>,
    identity: WorkerIdentity,
    stats: Arc<StatsCounters>,
) where
    P: Payload,
    H: Fn(P, WorkerIdentity) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<P::Output, HandlerError>> + Send + 'static,
{
    let payload = match transport.receive_frame().await {
        Ok(body) => P::decode(&body),
        Err(e) => Err(e),
    };
    let payload = match payload {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Worker {} dropping job, unreadable payload: {}", identity.id, e);
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            let _ = transport.close().await;
            return;
        }
    };

    let outcome = AssertUnwindSafe(async { handler(payload, identity).await })
        .catch_unwind()
        .await;
    stats.executed.fetch_add(1, Ordering::Relaxed);

    let envelope = match outcome {
        Ok(Ok(value)) => ResultEnvelope::success(&value).or_else(|e| {
            ResultEnvelope::failure(&HandlerError::failed(format!(
                "result could not be serialized: {}",
                e
            )))
        }),
        Ok(Err(handler_error)) => ResultEnvelope::failure(&handler_error),
        Err(panic) => ResultEnvelope::failure(&HandlerError::panicked(panic_message(&*panic))),
    };

    let envelope = match envelope {
        Ok(envelope) => envelope,
        Err(e) => {
            error!("Worker {} could not encode a response: {}", identity.id, e);
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            let _ = transport.close().await;
            return;
        }
    };
    if envelope.is_failure() {
        stats.failed.fetch_add(1, Ordering::Relaxed);
    }

    if let Err(e) = transport.send_response(&envelope).await {
        warn!("Worker {} failed to send response: {}", identity.id, e);
    }
    let _ = transport.close().await;
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use really_ipc::{GenericPayload, Listener};
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value as JsonValue};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize)]
    struct Reverse {
        message: String,
    }

    impl Payload for Reverse {
        type Output = String;
    }

    async fn fake_pool() -> (Listener, Endpoint) {
        let listener = Listener::bind(&Endpoint::tcp_loopback()).await.unwrap();
        let endpoint = listener.local_endpoint().unwrap();
        (listener, endpoint)
    }

    /// Pool side of one job: accept, handshake, send the body, read the envelope
    async fn exchange(
        listener: &Listener,
        body: Vec<u8>,
    ) -> tokio::task::JoinHandle<Result<ResultEnvelope, really_ipc::IpcError>> {
        let connection = listener.accept().await.unwrap();
        tokio::spawn(async move {
            let mut transport = SocketTransport::new(connection);
            transport.send_handshake().await?;
            transport.send_frame(&body).await?;
            transport.receive_response().await
        })
    }

    fn identity(id: u32, concurrency_level: usize) -> WorkerIdentity {
        WorkerIdentity {
            id,
            concurrency_level,
        }
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        let (listener, endpoint) = fake_pool().await;
        let worker = Arc::new(Worker::new(endpoint, identity(0, 3)));

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let worker_task = {
            let worker = worker.clone();
            let running = running.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                worker
                    .run(move |payload: Reverse, _identity| {
                        let running = running.clone();
                        let peak = peak.clone();
                        async move {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            running.fetch_sub(1, Ordering::SeqCst);
                            Ok(payload.message.chars().rev().collect::<String>())
                        }
                    })
                    .await
            })
        };

        let mut pending = Vec::new();
        for _ in 0..9 {
            pending.push(exchange(&listener, br#"{"message":"olleh"}"#.to_vec()).await);
        }
        for job in pending {
            let envelope = job.await.unwrap().unwrap();
            let outcome: Result<String, HandlerError> = envelope.into_outcome().unwrap();
            assert_eq!(outcome.unwrap(), "holle");
        }

        drop(listener);
        worker_task.await.unwrap().unwrap();

        let peak = peak.load(Ordering::SeqCst);
        assert!((2..=3).contains(&peak), "peak concurrency was {}", peak);
        assert_eq!(worker.stats().executed, 9);
        assert_eq!(worker.stats().failed, 0);
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_are_reported() {
        let (listener, endpoint) = fake_pool().await;
        let worker = Arc::new(Worker::new(endpoint, identity(4, 2)));

        let worker_task = {
            let worker = worker.clone();
            tokio::spawn(async move {
                worker
                    .run(|payload: GenericPayload, identity: WorkerIdentity| async move {
                        match payload.get_str("action") {
                            Some("fail") => Err(HandlerError::with_details(
                                "refused",
                                json!({"worker": identity.id}),
                            )),
                            Some("panic") => panic!("handler blew up"),
                            _ => Ok(json!({"worker": identity.id})),
                        }
                    })
                    .await
            })
        };

        let failed = exchange(&listener, br#"{"action":"fail"}"#.to_vec()).await;
        let outcome: Result<JsonValue, HandlerError> =
            failed.await.unwrap().unwrap().into_outcome().unwrap();
        match outcome.unwrap_err() {
            HandlerError::Failed { message, details } => {
                assert_eq!(message, "refused");
                assert_eq!(details, Some(json!({"worker": 4})));
            }
            other => panic!("unexpected error {:?}", other),
        }

        let panicked = exchange(&listener, br#"{"action":"panic"}"#.to_vec()).await;
        let outcome: Result<JsonValue, HandlerError> =
            panicked.await.unwrap().unwrap().into_outcome().unwrap();
        assert_eq!(
            outcome.unwrap_err(),
            HandlerError::panicked("handler blew up")
        );

        // The worker keeps serving after both
        let ok = exchange(&listener, br#"{}"#.to_vec()).await;
        let outcome: Result<JsonValue, HandlerError> =
            ok.await.unwrap().unwrap().into_outcome().unwrap();
        assert_eq!(outcome.unwrap(), json!({"worker": 4}));

        drop(listener);
        worker_task.await.unwrap().unwrap();
        let stats = worker.stats();
        assert_eq!(stats.executed, 3);
        assert_eq!(stats.failed, 2);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_dropped() {
        let (listener, endpoint) = fake_pool().await;
        let worker = Arc::new(Worker::new(endpoint, identity(1, 1)));

        let worker_task = {
            let worker = worker.clone();
            tokio::spawn(async move {
                worker
                    .run(|payload: Reverse, _identity| async move { Ok(payload.message) })
                    .await
            })
        };

        let job = exchange(&listener, b"not json".to_vec()).await;
        let err = job.await.unwrap().unwrap_err();
        assert!(matches!(err, really_ipc::IpcError::EmptyResponse));

        // Still serving
        let job = exchange(&listener, br#"{"message":"ok"}"#.to_vec()).await;
        let outcome: Result<String, HandlerError> =
            job.await.unwrap().unwrap().into_outcome().unwrap();
        assert_eq!(outcome.unwrap(), "ok");

        drop(listener);
        worker_task.await.unwrap().unwrap();
        assert_eq!(worker.stats().dropped, 1);
        assert_eq!(worker.stats().executed, 1);
    }

    #[tokio::test]
    async fn test_bad_handshake_does_not_stop_worker() {
        let (listener, endpoint) = fake_pool().await;
        let worker = Arc::new(Worker::new(endpoint, identity(2, 1)));

        let worker_task = {
            let worker = worker.clone();
            tokio::spawn(async move {
                worker
                    .run(|payload: Reverse, _identity| async move { Ok(payload.message) })
                    .await
            })
        };

        {
            use tokio::io::AsyncWriteExt;
            let mut connection = listener.accept().await.unwrap();
            connection.write_all(b"pong").await.unwrap();
        }

        let job = exchange(&listener, br#"{"message":"again"}"#.to_vec()).await;
        let outcome: Result<String, HandlerError> =
            job.await.unwrap().unwrap().into_outcome().unwrap();
        assert_eq!(outcome.unwrap(), "again");

        drop(listener);
        worker_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_returns_when_pool_is_gone() {
        let (listener, endpoint) = fake_pool().await;
        drop(listener);

        let worker = Worker::new(endpoint, identity(0, 1));
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            worker.run(|payload: Reverse, _identity| async move { Ok(payload.message) }),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
        assert_eq!(worker.stats(), WorkerStats::default());
    }

    #[test]
    fn test_create_from_environment() {
        let worker = Worker::from_environment(&WorkerEnvironment::new(
            "tcp://127.0.0.1:9000",
            3,
            7,
        ))
        .unwrap();
        assert_eq!(worker.identity(), identity(3, 7));
        assert_eq!(worker.server().to_string(), "tcp://127.0.0.1:9000");
        assert_eq!(worker.max_frame_len(), DEFAULT_MAX_FRAME_LEN);

        let worker = Worker::from_environment(
            &WorkerEnvironment::new("tcp://127.0.0.1:9000", 0, 1)
                .with_max_frame_bytes(128 * 1024 * 1024),
        )
        .unwrap();
        assert_eq!(worker.max_frame_len(), 128 * 1024 * 1024);

        let err = Worker::from_environment(&WorkerEnvironment::new("nowhere", 0, 1))
            .err()
            .unwrap();
        assert!(matches!(err, RuntimeError::Ipc(_)));
    }

    #[test]
    fn test_create_requires_environment() {
        temp_env::with_vars(
            vec![
                (really_config::SERVER_VAR, None::<&str>),
                (really_config::IDENTIFIER_VAR, Some("0")),
                (really_config::CONCURRENCY_LEVEL_VAR, Some("1")),
            ],
            || {
                assert!(matches!(Worker::create(), Err(RuntimeError::Config(_))));
            },
        );
    }
}
