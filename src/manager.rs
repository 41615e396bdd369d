// src/manager.rs

use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::downloader::{DownloadTicket, ProbeError, WorkerHandle, WorkerNotice};
use crate::limiter::SpeedLimiter;
use crate::models::{DownloadJob, DownloadState, JobId};
use crate::supervisor::{SupervisorError, WorkerSupervisor};
use crate::transport::{HttpTransport, Transport, TransportError};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("job with ID {0} not found")]
    JobNotFound(JobId),
    #[error("worker supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),
    #[error("download manager is shut down")]
    ShuttingDown,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

enum Request {
    Add {
        source: String,
        reply: oneshot::Sender<Result<JobId, ManagerError>>,
    },
    Get {
        id: JobId,
        reply: oneshot::Sender<Option<DownloadJob>>,
    },
    List {
        reply: oneshot::Sender<Vec<DownloadJob>>,
    },
    Remove {
        id: JobId,
        reply: oneshot::Sender<Result<(), ManagerError>>,
    },
}

/// Entry point for callers: a cheap, cloneable handle to the job registry.
///
/// All registry access goes through one task, which handles caller requests,
/// worker termination notices and reconciliation passes one at a time.
#[derive(Debug, Clone)]
pub struct DownloadManager {
    requests: mpsc::Sender<Request>,
    supervisor: WorkerSupervisor,
}

impl DownloadManager {
    /// Starts a manager that downloads over HTTP.
    pub async fn start(config: ManagerConfig) -> Result<Self, ManagerError> {
        let transport = HttpTransport::new(&config)?;
        Self::with_transport(config, Arc::new(transport)).await
    }

    /// Starts a manager over any transport. Creates the download directory.
    pub async fn with_transport(
        config: ManagerConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ManagerError> {
        tokio::fs::create_dir_all(&config.download_dir).await?;

        let limiter = config.max_bytes_per_sec.and_then(SpeedLimiter::new);
        let (supervisor, _) = WorkerSupervisor::spawn(transport, limiter);
        let (requests, requests_rx) = mpsc::channel(64);
        let (notice_tx, notices) = mpsc::unbounded_channel();

        let registry = Registry {
            config,
            supervisor: supervisor.clone(),
            jobs: HashMap::new(),
            requests: requests_rx,
            notices,
            notice_tx,
        };
        tokio::spawn(registry.run());
        info!("download manager started");

        Ok(Self {
            requests,
            supervisor,
        })
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(make(reply))
            .await
            .map_err(|_| ManagerError::ShuttingDown)?;
        rx.await.map_err(|_| ManagerError::ShuttingDown)
    }

    /// Registers a download of `source` and starts its worker.
    ///
    /// Returns as soon as the worker is running. Sources that cannot be
    /// fetched still get an id; their job ends in `error`.
    pub async fn add(&self, source: impl Into<String>) -> Result<JobId, ManagerError> {
        let source = source.into();
        self.request(|reply| Request::Add { source, reply }).await?
    }

    pub async fn get(&self, id: JobId) -> Result<DownloadJob, ManagerError> {
        self.request(|reply| Request::Get { id, reply })
            .await?
            .ok_or(ManagerError::JobNotFound(id))
    }

    /// Snapshot of every record, in no particular order.
    pub async fn list(&self) -> Result<Vec<DownloadJob>, ManagerError> {
        self.request(|reply| Request::List { reply }).await
    }

    /// Cancels the job's worker, deletes its file and forgets the job.
    pub async fn remove(&self, id: JobId) -> Result<(), ManagerError> {
        self.request(|reply| Request::Remove { id, reply }).await?
    }

    /// The supervisor running this manager's workers.
    pub fn supervisor(&self) -> &WorkerSupervisor {
        &self.supervisor
    }
}

struct JobEntry {
    job: DownloadJob,
    worker: WorkerHandle,
}

/// The task that owns the job registry.
struct Registry {
    config: ManagerConfig,
    supervisor: WorkerSupervisor,
    jobs: HashMap<JobId, JobEntry>,
    requests: mpsc::Receiver<Request>,
    notices: mpsc::UnboundedReceiver<WorkerNotice>,
    /// Cloned into every ticket so workers report back here.
    notice_tx: mpsc::UnboundedSender<WorkerNotice>,
}

impl Registry {
    async fn run(mut self) {
        let interval = self.config.reconcile_interval();
        let next_pass = tokio::time::sleep(interval);
        tokio::pin!(next_pass);

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
                Some(notice) = self.notices.recv() => self.apply_notice(notice),
                () = &mut next_pass => {
                    self.reconcile().await;
                    // re-armed only once the pass completes
                    next_pass.as_mut().reset(Instant::now() + interval);
                }
            }
        }
        debug!(jobs = self.jobs.len(), "download manager stopped");
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Add { source, reply } => {
                let _ = reply.send(self.add(source).await);
            }
            Request::Get { id, reply } => {
                let _ = reply.send(self.jobs.get(&id).map(|entry| entry.job.clone()));
            }
            Request::List { reply } => {
                let _ = reply.send(self.jobs.values().map(|entry| entry.job.clone()).collect());
            }
            Request::Remove { id, reply } => {
                let _ = reply.send(self.remove(id).await);
            }
        }
    }

    async fn add(&mut self, source: String) -> Result<JobId, ManagerError> {
        let id = Uuid::new_v4();
        let destination = self.config.download_dir.join(id.to_string());
        let ticket = DownloadTicket {
            job_id: id,
            source: source.clone(),
            destination: destination.clone(),
            owner: self.notice_tx.clone(),
        };
        let worker = self.supervisor.add(ticket).await?;
        let job = DownloadJob::new(id, source, destination, worker.id());
        info!(job_id = %id, name = %job.name, source = %job.source, "job added");
        self.jobs.insert(id, JobEntry { job, worker });
        Ok(id)
    }

    async fn remove(&mut self, id: JobId) -> Result<(), ManagerError> {
        let entry = self.jobs.remove(&id).ok_or(ManagerError::JobNotFound(id))?;
        match self.supervisor.remove(entry.worker.id()).await {
            Ok(true) => debug!(job_id = %id, worker = entry.worker.id(), "worker stopped"),
            Ok(false) => {}
            Err(e) => warn!(job_id = %id, error = %e, "could not stop worker"),
        }
        match tokio::fs::remove_file(&entry.job.destination).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                job_id = %id,
                path = %entry.job.destination.display(),
                error = %e,
                "could not delete downloaded file"
            ),
        }
        info!(job_id = %id, status = %entry.job.state.status, "job removed");
        Ok(())
    }

    fn apply_notice(&mut self, notice: WorkerNotice) {
        let Some(entry) = self.jobs.get_mut(&notice.job_id) else {
            debug!(job_id = %notice.job_id, "dropping notice for removed job");
            return;
        };
        if entry.job.merge(&notice.state) {
            debug!(job_id = %notice.job_id, status = %notice.state.status, "termination notice applied");
        }
    }

    fn drain_notices(&mut self) {
        while let Ok(notice) = self.notices.try_recv() {
            self.apply_notice(notice);
        }
    }

    /// Pulls a snapshot from every worker whose job is not yet terminal.
    async fn reconcile(&mut self) {
        let probes: Vec<(JobId, WorkerHandle)> = self
            .jobs
            .values()
            .filter(|entry| !entry.job.state.status.is_terminal())
            .map(|entry| (entry.job.id, entry.worker.clone()))
            .collect();
        if probes.is_empty() {
            return;
        }

        let timeout = self.config.status_timeout();
        let answers: Vec<(JobId, WorkerHandle, Result<DownloadState, ProbeError>)> =
            join_all(probes.into_iter().map(|(id, worker)| async move {
                let answer = worker.status(timeout).await;
                (id, worker, answer)
            }))
            .await;

        // A worker sends its notice before its mailbox closes, so any exit
        // seen by a probe already has its notice queued here.
        self.drain_notices();

        let mut stuck = Vec::new();
        for (id, worker, answer) in answers {
            let Some(entry) = self.jobs.get_mut(&id) else {
                continue;
            };
            match answer {
                Ok(state) => {
                    entry.job.merge(&state);
                }
                Err(e) => {
                    if entry.job.mark_lost(e.to_string()) {
                        warn!(job_id = %id, worker = worker.id(), error = %e, "job lost its worker");
                        if matches!(e, ProbeError::TimedOut(_)) {
                            stuck.push(worker.id());
                        }
                    }
                }
            }
        }

        for worker in stuck {
            if let Err(e) = self.supervisor.terminate(worker).await {
                warn!(worker, error = %e, "could not stop unresponsive worker");
            }
        }
    }
}
