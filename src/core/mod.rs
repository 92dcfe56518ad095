pub mod comparator;
pub mod engine;
pub mod filter;
pub mod inventory;
pub mod scanner;
pub mod strm;
pub mod transfer;

pub use comparator::{reconcile, ReconcileResult, UpdateMode};
pub use engine::{RunCommand, RunSummary, SyncEngine};
pub use filter::{ExtFilter, FileKind};
pub use scanner::{DirectoryTask, ScanConfig, ScanStream, ScanSummary, StrmScanner};
pub use strm::StrmEntry;
pub use transfer::{AssetDownloader, DownloadOutcome};
