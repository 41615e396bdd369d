pub mod config;
pub mod downloader;
pub mod integrity;
pub mod limiter;
pub mod logging;
pub mod manager;
pub mod models;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
mod test_support;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::config::ManagerConfig;
    pub use crate::manager::{DownloadManager, ManagerError};
    pub use crate::models::{DownloadJob, DownloadState, JobId, JobStatus};
    pub use crate::supervisor::{WorkerId, WorkerInfo, WorkerSupervisor};
    pub use crate::transport::{HttpTransport, Transport, TransportError, TransportResponse};
}
