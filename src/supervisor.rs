// src/supervisor.rs

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::downloader::{DownloadTicket, DownloadWorker, WorkerHandle};
use crate::limiter::SpeedLimiter;
use crate::models::JobId;
use crate::transport::Transport;

/// Handle-table index of a worker. Never reused within a supervisor.
pub type WorkerId = u64;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("worker supervisor is not running")]
    Closed,
}

/// A live worker, as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub job_id: JobId,
}

enum Command {
    Add {
        ticket: DownloadTicket,
        reply: oneshot::Sender<WorkerHandle>,
    },
    Remove {
        id: WorkerId,
        force: bool,
        reply: oneshot::Sender<bool>,
    },
    List {
        reply: oneshot::Sender<Vec<WorkerInfo>>,
    },
}

/// Starts and stops download workers. Workers are never restarted: when one
/// exits, for whatever reason, it is only dropped from the live set.
#[derive(Debug, Clone)]
pub struct WorkerSupervisor {
    commands: mpsc::Sender<Command>,
}

impl WorkerSupervisor {
    /// Spawns the supervisor task. It stops once every handle is dropped,
    /// cancelling whatever workers are still live.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        limiter: Option<SpeedLimiter>,
    ) -> (Self, JoinHandle<()>) {
        let (commands, rx) = mpsc::channel(64);
        let supervisor = Supervisor {
            rx,
            transport,
            limiter,
            next_id: 1,
            live: HashMap::new(),
            tasks: JoinSet::new(),
            task_ids: HashMap::new(),
        };
        let join = tokio::spawn(supervisor.run());
        (Self { commands }, join)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| SupervisorError::Closed)?;
        rx.await.map_err(|_| SupervisorError::Closed)
    }

    /// Starts a worker for `ticket`. Returns once the worker is spawned, not
    /// when its download is done.
    pub async fn add(&self, ticket: DownloadTicket) -> Result<WorkerHandle, SupervisorError> {
        self.request(|reply| Command::Add { ticket, reply }).await
    }

    /// Cancels a worker. Returns `false` if it was not live, which is not an
    /// error.
    pub async fn remove(&self, id: WorkerId) -> Result<bool, SupervisorError> {
        self.request(|reply| Command::Remove {
            id,
            force: false,
            reply,
        })
        .await
    }

    /// Cancels a worker and aborts its task at its next yield, whether or
    /// not it is still answering. An aborted worker sends no notice.
    pub async fn terminate(&self, id: WorkerId) -> Result<bool, SupervisorError> {
        self.request(|reply| Command::Remove {
            id,
            force: true,
            reply,
        })
        .await
    }

    /// Snapshot of the live set, ordered by worker id.
    pub async fn workers(&self) -> Result<Vec<WorkerInfo>, SupervisorError> {
        self.request(|reply| Command::List { reply }).await
    }
}

struct LiveWorker {
    job_id: JobId,
    cancel: CancellationToken,
    abort: AbortHandle,
}

struct Supervisor {
    rx: mpsc::Receiver<Command>,
    transport: Arc<dyn Transport>,
    limiter: Option<SpeedLimiter>,
    next_id: WorkerId,
    live: HashMap<WorkerId, LiveWorker>,
    tasks: JoinSet<()>,
    task_ids: HashMap<tokio::task::Id, WorkerId>,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some(joined) = self.tasks.join_next_with_id() => self.reap(joined),
            }
        }

        if !self.live.is_empty() {
            debug!(count = self.live.len(), "supervisor stopping, cancelling live workers");
        }
        for (_, worker) in self.live.drain() {
            worker.cancel.cancel();
        }
        while let Some(joined) = self.tasks.join_next_with_id().await {
            self.reap(joined);
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Add { ticket, reply } => {
                let handle = self.start(ticket);
                if reply.send(handle).is_err() {
                    // the caller went away; the worker still runs and reports as usual
                    debug!("add caller dropped before reply");
                }
            }
            Command::Remove { id, force, reply } => {
                let _ = reply.send(self.stop(id, force));
            }
            Command::List { reply } => {
                let mut workers: Vec<WorkerInfo> = self
                    .live
                    .iter()
                    .map(|(id, worker)| WorkerInfo {
                        id: *id,
                        job_id: worker.job_id,
                    })
                    .collect();
                workers.sort_by_key(|w| w.id);
                let _ = reply.send(workers);
            }
        }
    }

    fn start(&mut self, ticket: DownloadTicket) -> WorkerHandle {
        let id = self.next_id;
        self.next_id += 1;
        let job_id = ticket.job_id;
        let cancel = CancellationToken::new();
        let (worker, handle) = DownloadWorker::prepare(
            id,
            ticket,
            Arc::clone(&self.transport),
            self.limiter.clone(),
            cancel.clone(),
        );
        let abort = self.tasks.spawn(async move {
            worker.run().await;
        });
        self.task_ids.insert(abort.id(), id);
        self.live.insert(
            id,
            LiveWorker {
                job_id,
                cancel,
                abort,
            },
        );
        debug!(worker = id, %job_id, "worker spawned");
        handle
    }

    fn stop(&mut self, id: WorkerId, force: bool) -> bool {
        match self.live.remove(&id) {
            Some(worker) => {
                worker.cancel.cancel();
                if force {
                    worker.abort.abort();
                }
                debug!(worker = id, job_id = %worker.job_id, force, "worker cancelled");
                true
            }
            None => false,
        }
    }

    fn reap(&mut self, joined: Result<(tokio::task::Id, ()), JoinError>) {
        let (task, outcome) = match joined {
            Ok((task, ())) => (task, None),
            Err(e) => (e.id(), Some(e)),
        };
        let Some(id) = self.task_ids.remove(&task) else {
            return;
        };
        self.live.remove(&id);
        match outcome {
            None => debug!(worker = id, "worker exited"),
            Some(e) if e.is_panic() => warn!(worker = id, "worker panicked"),
            Some(e) => debug!(worker = id, error = %e, "worker aborted"),
        }
    }
}
