pub mod catalog;
pub mod config;
pub mod digest;
pub mod download;
pub mod error;
pub mod publish;
pub mod repository;
pub mod transfer;
pub mod worker;

pub use catalog::{
    scan_local, version_stamp, Action, ActionSummary, CatalogOptions, LocalRecord, PluginCatalog,
    PluginEntry, RemoteRecord, SharedCatalog, Status, View,
};
pub use config::Config;
pub use digest::{compute_digest, verify_digest, verify_size, Digester, Sha256Digester};
pub use download::{DownloadCoordinator, DownloadReport, Downloader};
pub use error::{Result, SyncError};
pub use publish::{upload_batch, PublishCoordinator, PublishReport, Publisher, UploadFile};
pub use repository::{render_manifest, InstallLayout, RepositoryLayout};
pub use transfer::{CancelToken, FsTransferEngine, TransferEngine, TransferEvent, TransferTask};
pub use worker::{wait, Progress, RunEvent, Worker};
