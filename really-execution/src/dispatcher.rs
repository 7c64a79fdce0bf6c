//! Connection hand-off and job execution on the pool side
//!
//! Workers dial the pool; a single accept loop feeds accepted connections
//! into a one-slot channel. Jobs take connections one at a time through a
//! lock around the receiver, so every connection belongs to exactly one job.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn, Instrument};
use uuid::Uuid;

use really_ipc::{Connection, IpcTransport, Listener, Payload, SocketTransport};
use really_resilience::JobGuard;

use crate::error::DispatchError;

/// Back-off after a failed accept, so a persistent error does not spin
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Identifier of one dispatched job, used in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Accepted worker connections waiting for a job
pub(crate) struct ConnectionQueue {
    receiver: AsyncMutex<mpsc::Receiver<Connection>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionQueue {
    /// Start accepting on `listener`
    pub(crate) fn start(listener: Listener) -> Self {
        let (sender, receiver) = mpsc::channel(1);
        let accept_task = tokio::spawn(accept_loop(listener, sender));
        Self {
            receiver: AsyncMutex::new(receiver),
            accept_task: Mutex::new(Some(accept_task)),
        }
    }

    /// Wait for the next worker connection; `None` once the server stopped
    pub(crate) async fn next(&self) -> Option<Connection> {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await
    }

    /// Stop accepting and drop every connection not yet taken by a job
    pub(crate) async fn shutdown(&self) {
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        let mut receiver = self.receiver.lock().await;
        receiver.close();
        let mut dropped = 0usize;
        while receiver.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!("Dropped {} idle worker connections", dropped);
        }
    }
}

impl Drop for ConnectionQueue {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.get_mut().take() {
            task.abort();
        }
    }
}

async fn accept_loop(listener: Listener, sender: mpsc::Sender<Connection>) {
    loop {
        // Only accept once a slot is free, so queued connections never pile up
        let permit = match sender.reserve().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        match listener.accept().await {
            Ok(connection) => {
                trace!("Accepted worker connection");
                permit.send(connection);
            }
            Err(e) => {
                warn!("Failed to accept worker connection: {}", e);
                drop(permit);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Everything a job task needs besides the queue
pub(crate) struct JobSpec {
    pub(crate) id: JobId,
    pub(crate) body: Vec<u8>,
    pub(crate) max_frame_len: usize,
    pub(crate) guard: JobGuard,
}

/// Run one job: take a connection, send the payload, read the result
pub(crate) async fn run_job<P: Payload>(
    queue: &ConnectionQueue,
    spec: JobSpec,
) -> Result<P::Output, DispatchError> {
    let JobSpec {
        id,
        body,
        max_frame_len,
        guard,
    } = spec;

    let result: Result<P::Output, DispatchError> = async {
        let connection = queue.next().await.ok_or(DispatchError::ServerStopped)?;
        debug!("Connection acquired");

        let mut transport = SocketTransport::with_max_frame_len(connection, max_frame_len);
        let envelope = exchange(&mut transport, &body).await;
        let _ = transport.close().await;

        envelope?.into_outcome::<P::Output>()?.map_err(DispatchError::Handler)
    }
    .instrument(tracing::debug_span!("job", %id))
    .await;

    match &result {
        Ok(_) => debug!(job = %id, "Job succeeded"),
        Err(e) => debug!(job = %id, "Job failed: {}", e),
    }
    drop(guard);
    result
}

async fn exchange(
    transport: &mut SocketTransport<Connection>,
    body: &[u8],
) -> Result<really_ipc::ResultEnvelope, DispatchError> {
    transport.send_handshake().await?;
    transport.send_frame(body).await?;
    Ok(transport.receive_response().await?)
}

/// Pending result of [`crate::Pool::dispatch`].
///
/// Resolves exactly once. Dropping the handle does not cancel the job.
pub struct JobHandle<T> {
    id: JobId,
    state: HandleState<T>,
}

enum HandleState<T> {
    Ready(Option<Result<T, DispatchError>>),
    Running(JoinHandle<Result<T, DispatchError>>),
}

impl<T> JobHandle<T> {
    pub(crate) fn ready(id: JobId, result: Result<T, DispatchError>) -> Self {
        Self {
            id,
            state: HandleState::Ready(Some(result)),
        }
    }

    pub(crate) fn running(id: JobId, task: JoinHandle<Result<T, DispatchError>>) -> Self {
        Self {
            id,
            state: HandleState::Running(task),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Check if the result is available without waiting
    pub fn is_finished(&self) -> bool {
        match &self.state {
            HandleState::Ready(_) => true,
            HandleState::Running(task) => task.is_finished(),
        }
    }
}

// The result is moved out, never pinned in place
impl<T> Unpin for JobHandle<T> {}

impl<T> Future for JobHandle<T> {
    type Output = Result<T, DispatchError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let result = match &mut this.state {
            HandleState::Ready(slot) => slot.take().unwrap_or_else(|| {
                Err(DispatchError::Aborted("job result already taken".to_string()))
            }),
            HandleState::Running(task) => match Pin::new(task).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(result)) => result,
                Poll::Ready(Err(e)) => Err(DispatchError::Aborted(e.to_string())),
            },
        };
        this.state = HandleState::Ready(None);
        Poll::Ready(result)
    }
}

impl<T> fmt::Debug for JobHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use really_ipc::{Endpoint, HandlerError, ResultEnvelope};
    use serde_json::json;

    #[tokio::test]
    async fn test_ready_handle() {
        let handle: JobHandle<u32> = JobHandle::ready(JobId::new(), Err(DispatchError::PoolClosing));
        assert!(handle.is_finished());
        assert!(matches!(handle.await, Err(DispatchError::PoolClosing)));
    }

    #[tokio::test]
    async fn test_running_handle() {
        let task = tokio::spawn(async { Ok::<_, DispatchError>(7u32) });
        let handle = JobHandle::running(JobId::new(), task);
        assert_eq!(handle.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_aborted_task() {
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, DispatchError>(0u32)
        });
        task.abort();
        let handle = JobHandle::running(JobId::new(), task);
        assert!(matches!(handle.await, Err(DispatchError::Aborted(_))));
    }

    #[tokio::test]
    async fn test_queue_hands_out_each_connection_once() {
        let listener = Listener::bind(&Endpoint::tcp_loopback()).await.unwrap();
        let endpoint = listener.local_endpoint().unwrap();
        let queue = ConnectionQueue::start(listener);

        let _first = Connection::connect(&endpoint).await.unwrap();
        let _second = Connection::connect(&endpoint).await.unwrap();

        assert!(queue.next().await.is_some());
        assert!(queue.next().await.is_some());

        queue.shutdown().await;
        assert!(queue.next().await.is_none());
    }

    #[tokio::test]
    async fn test_run_job_round_trip() {
        let listener = Listener::bind(&Endpoint::tcp_loopback()).await.unwrap();
        let endpoint = listener.local_endpoint().unwrap();
        let queue = ConnectionQueue::start(listener);
        let tracker = really_resilience::JobTracker::new();

        let worker = tokio::spawn(async move {
            let connection = Connection::connect(&endpoint).await.unwrap();
            let mut transport = SocketTransport::new(connection);
            transport.receive_handshake().await.unwrap();
            let body = transport.receive_frame().await.unwrap();
            let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
            let envelope = if payload["fail"] == json!(true) {
                ResultEnvelope::failure(&HandlerError::failed("asked to fail")).unwrap()
            } else {
                ResultEnvelope::success(&payload["n"]).unwrap()
            };
            transport.send_response(&envelope).await.unwrap();
        });

        let spec = JobSpec {
            id: JobId::new(),
            body: br#"{"n": 3}"#.to_vec(),
            max_frame_len: 1024,
            guard: tracker.try_begin().unwrap(),
        };
        let result = run_job::<really_ipc::GenericPayload>(&queue, spec).await;
        assert_eq!(result.unwrap(), json!(3));
        assert_eq!(tracker.active_count(), 0);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_job_after_shutdown() {
        let listener = Listener::bind(&Endpoint::tcp_loopback()).await.unwrap();
        let queue = ConnectionQueue::start(listener);
        queue.shutdown().await;

        let tracker = really_resilience::JobTracker::new();
        let spec = JobSpec {
            id: JobId::new(),
            body: b"{}".to_vec(),
            max_frame_len: 1024,
            guard: tracker.try_begin().unwrap(),
        };
        let result = run_job::<really_ipc::GenericPayload>(&queue, spec).await;
        assert!(matches!(result, Err(DispatchError::ServerStopped)));
        assert_eq!(tracker.active_count(), 0);
    }
}
