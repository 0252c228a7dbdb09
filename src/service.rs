//! Request/response front door to the core.
//!
//! Front-ends submit [`CoreRequest`]s through a [`CoreHandle`]; each request
//! carries its own reply channel. Every request runs on its own task, so a
//! long sync never holds up a download.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::download::{AttemptOptions, Orchestrator, Outcome};
use crate::playlist::Track;
use crate::sync::{PassOutcome, SyncEngine, SyncError, SyncReport};

/// Requests queued before senders start waiting.
pub const DEFAULT_REQUEST_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core service is not running")]
    Closed,

    #[error("core service dropped the request")]
    NoReply,
}

/// Download one track.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub track: Track,
    pub options: AttemptOptions,
}

/// Sync one playlist on demand.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub playlist_id: String,
}

#[derive(Debug)]
pub enum CoreRequest {
    Download {
        request: DownloadRequest,
        reply: oneshot::Sender<Outcome>,
    },
    Sync {
        request: SyncRequest,
        reply: oneshot::Sender<Result<SyncReport, SyncError>>,
    },
    SyncAll {
        reply: oneshot::Sender<Result<PassOutcome, SyncError>>,
    },
}

/// Cloneable sender side of the service.
#[derive(Debug, Clone)]
pub struct CoreHandle {
    tx: mpsc::Sender<CoreRequest>,
}

impl CoreHandle {
    /// Downloads `request.track` and waits for the terminal outcome.
    ///
    /// # Errors
    ///
    /// [`ServiceError`] when the service has stopped.
    pub async fn download(&self, request: DownloadRequest) -> Result<Outcome, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.submit(CoreRequest::Download { request, reply }).await?;
        rx.await.map_err(|_| ServiceError::NoReply)
    }

    /// Syncs one playlist. The outer error is the service, the inner one the sync.
    ///
    /// # Errors
    ///
    /// [`ServiceError`] when the service has stopped.
    pub async fn sync(
        &self,
        request: SyncRequest,
    ) -> Result<Result<SyncReport, SyncError>, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.submit(CoreRequest::Sync { request, reply }).await?;
        rx.await.map_err(|_| ServiceError::NoReply)
    }

    /// Runs a pass over every syncable playlist.
    ///
    /// # Errors
    ///
    /// [`ServiceError`] when the service has stopped.
    pub async fn sync_all(&self) -> Result<Result<PassOutcome, SyncError>, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.submit(CoreRequest::SyncAll { reply }).await?;
        rx.await.map_err(|_| ServiceError::NoReply)
    }

    async fn submit(&self, request: CoreRequest) -> Result<(), ServiceError> {
        self.tx.send(request).await.map_err(|_| ServiceError::Closed)
    }
}

/// Owns the orchestrator and sync engine and serves requests until cancelled.
pub struct CoreService {
    orchestrator: Arc<Orchestrator>,
    engine: Arc<SyncEngine>,
    rx: mpsc::Receiver<CoreRequest>,
    cancel: CancellationToken,
}

impl CoreService {
    /// Creates the service and its handle. Call [`CoreService::run`] (or
    /// [`CoreService::spawn`]) to start serving.
    #[must_use]
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        engine: Arc<SyncEngine>,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, CoreHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                orchestrator,
                engine,
                rx,
                cancel,
            },
            CoreHandle { tx },
        )
    }

    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Serves until cancelled or every handle is dropped. In-flight requests
    /// observe the same cancellation token.
    #[instrument(skip_all)]
    pub async fn run(mut self) {
        info!("core service started");
        loop {
            let request = tokio::select! {
                () = self.cancel.cancelled() => break,
                request = self.rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            self.dispatch(request);
        }
        info!("core service stopped");
    }

    fn dispatch(&self, request: CoreRequest) {
        let cancel = self.cancel.clone();
        match request {
            CoreRequest::Download { request, reply } => {
                let orchestrator = Arc::clone(&self.orchestrator);
                debug!(track_id = request.track.id(), "download request");
                tokio::spawn(async move {
                    let outcome = orchestrator
                        .attempt(&request.track, &request.options, &cancel)
                        .await;
                    let _ = reply.send(outcome);
                });
            }
            CoreRequest::Sync { request, reply } => {
                let engine = Arc::clone(&self.engine);
                debug!(playlist = %request.playlist_id, "sync request");
                tokio::spawn(async move {
                    let result = engine.sync_playlist(&request.playlist_id, &cancel).await;
                    let _ = reply.send(result);
                });
            }
            CoreRequest::SyncAll { reply } => {
                let engine = Arc::clone(&self.engine);
                debug!("sync-all request");
                tokio::spawn(async move {
                    let result = engine.sync_all(&cancel).await;
                    let _ = reply.send(result);
                });
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_reports_closed_service() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = CoreHandle { tx };
        let err = handle
            .sync(SyncRequest {
                playlist_id: "p".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Closed));
    }

    #[tokio::test]
    async fn test_dropped_reply_is_no_reply() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = CoreHandle { tx };
        tokio::spawn(async move {
            // receive and drop the reply sender
            let _ = rx.recv().await;
        });
        assert!(matches!(
            handle.sync_all().await.unwrap_err(),
            ServiceError::NoReply
        ));
    }
}
