use chrono::Utc;
use futures_util::StreamExt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::integrity::StreamDigest;
use crate::limiter::SpeedLimiter;
use crate::models::{DownloadState, JobId, JobStatus};
use crate::supervisor::WorkerId;
use crate::transport::{ChunkStream, Transport, TransportError};

const STATUS_MAILBOX: usize = 8;

/// Why a download stopped early. Never leaves the worker: it becomes the
/// job's error reason.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("server responded with status {0}")]
    Status(u16),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("received {received} bytes, more than the advertised {expected}")]
    Overflow { received: u64, expected: u64 },
    #[error("stream ended after {received} of {expected} bytes")]
    Truncated { received: u64, expected: u64 },
    #[error("download cancelled")]
    Cancelled,
}

/// Failure to get a status snapshot out of a worker.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("lost contact with worker: terminated externally")]
    Unreachable,
    #[error("lost contact with worker: no status reply within {0:?}")]
    TimedOut(Duration),
}

/// Everything a worker needs to run one job.
#[derive(Debug, Clone)]
pub struct DownloadTicket {
    pub job_id: JobId,
    pub source: String,
    pub destination: PathBuf,
    /// Where the termination notice goes.
    pub owner: mpsc::UnboundedSender<WorkerNotice>,
}

/// The one message a worker sends on exit.
#[derive(Debug, Clone)]
pub struct WorkerNotice {
    pub job_id: JobId,
    pub worker: WorkerId,
    pub state: DownloadState,
}

type StatusRequest = oneshot::Sender<DownloadState>;

/// Address of a running worker, used to ask for status snapshots.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    status_tx: mpsc::Sender<StatusRequest>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Asks the worker for a snapshot of its state, waiting at most `timeout`.
    pub async fn status(&self, timeout: Duration) -> Result<DownloadState, ProbeError> {
        let probe = async {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.status_tx
                .send(reply_tx)
                .await
                .map_err(|_| ProbeError::Unreachable)?;
            reply_rx.await.map_err(|_| ProbeError::Unreachable)
        };
        tokio::time::timeout(timeout, probe)
            .await
            .map_err(|_| ProbeError::TimedOut(timeout))?
    }
}

/// The worker's inbound side: cancellation and status requests.
struct Mailbox {
    cancel: CancellationToken,
    status_rx: mpsc::Receiver<StatusRequest>,
}

impl Mailbox {
    /// Drives `fut` to completion while answering status requests from
    /// `state`. Cancellation wins over everything else.
    async fn serve<F: Future>(
        &mut self,
        state: &DownloadState,
        fut: F,
    ) -> Result<F::Output, DownloadError> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                Some(reply) = self.status_rx.recv() => {
                    let _ = reply.send(state.clone());
                }
                out = &mut fut => return Ok(out),
            }
        }
    }
}

/// Drives one job from `initiate` to a terminal status.
pub struct DownloadWorker {
    id: WorkerId,
    ticket: DownloadTicket,
    transport: Arc<dyn Transport>,
    limiter: Option<SpeedLimiter>,
    mailbox: Mailbox,
    state: DownloadState,
}

impl DownloadWorker {
    /// Builds a worker and its handle. Nothing runs until `run` is polled.
    pub(crate) fn prepare(
        id: WorkerId,
        ticket: DownloadTicket,
        transport: Arc<dyn Transport>,
        limiter: Option<SpeedLimiter>,
        cancel: CancellationToken,
    ) -> (Self, WorkerHandle) {
        let (status_tx, status_rx) = mpsc::channel(STATUS_MAILBOX);
        let handle = WorkerHandle { id, status_tx };
        let worker = Self {
            id,
            ticket,
            transport,
            limiter,
            mailbox: Mailbox { cancel, status_rx },
            state: DownloadState::new(),
        };
        (worker, handle)
    }

    /// Runs the download and reports its end state to the owner.
    ///
    /// Exactly one notice is sent per run, whatever the outcome. It goes out
    /// before the status mailbox closes.
    pub async fn run(mut self) -> DownloadState {
        let job_id = self.ticket.job_id;
        self.state.started_at = Some(Utc::now());
        debug!(%job_id, worker = self.id, source = %self.ticket.source, "worker started");

        match self.download().await {
            Ok(digest) => {
                self.state.status = JobStatus::Finish;
                self.state.sha256 = Some(digest);
                self.state.finished_at = Some(Utc::now());
                info!(%job_id, bytes = self.state.bytes_transferred, "download finished");
            }
            Err(DownloadError::Cancelled) => {
                self.state.status = JobStatus::Cancel;
                debug!(%job_id, "download cancelled");
            }
            Err(e) => {
                self.state.status = JobStatus::Error;
                self.state.error = Some(e.to_string());
                self.state.finished_at = Some(Utc::now());
                info!(%job_id, error = %e, "download failed");
            }
        }

        let notice = WorkerNotice {
            job_id,
            worker: self.id,
            state: self.state.clone(),
        };
        if self.ticket.owner.send(notice).is_err() {
            debug!(%job_id, "owner gone before termination notice");
        }
        self.state
    }

    /// Streams the body into the destination. Returns the hex digest.
    async fn download(&mut self) -> Result<String, DownloadError> {
        let transport = Arc::clone(&self.transport);
        let response = self
            .mailbox
            .serve(&self.state, transport.open(&self.ticket.source))
            .await??;
        if !(200..300).contains(&response.status) {
            return Err(DownloadError::Status(response.status));
        }

        self.state.total_size = response.content_length.unwrap_or(0);
        self.state.status = JobStatus::Active;

        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        let mut file = self
            .mailbox
            .serve(&self.state, options.open(&self.ticket.destination))
            .await??;

        let streamed = self.stream_into(&mut file, response.body).await;
        // closed on every path, with whatever was received flushed to disk
        let flushed = file.flush().await;
        drop(file);
        let digest = streamed?;
        flushed?;

        let received = self.state.bytes_transferred;
        match self.state.total_size {
            0 => self.state.total_size = received,
            expected if received < expected => {
                return Err(DownloadError::Truncated { received, expected });
            }
            _ => {}
        }
        Ok(digest.finish())
    }

    /// Appends each chunk in delivery order, pulling the next one only after
    /// the previous write has completed.
    async fn stream_into(
        &mut self,
        file: &mut File,
        mut body: ChunkStream,
    ) -> Result<StreamDigest, DownloadError> {
        let mut digest = StreamDigest::new();
        loop {
            let next = self.mailbox.serve(&self.state, body.next()).await?;
            let Some(chunk) = next else {
                return Ok(digest);
            };
            let chunk = chunk?;
            let received = self.state.bytes_transferred + chunk.len() as u64;
            let expected = self.state.total_size;
            if expected > 0 && received > expected {
                return Err(DownloadError::Overflow { received, expected });
            }
            if let Some(limiter) = &self.limiter {
                self.mailbox
                    .serve(&self.state, limiter.take(chunk.len() as u64))
                    .await?;
            }
            self.mailbox
                .serve(&self.state, file.write_all(&chunk))
                .await??;
            digest.update(&chunk);
            self.state.bytes_transferred = received;
        }
    }
}
