//! Catalog access, retry policy, and export requests

pub mod catalog;
pub mod export;
pub mod fetch;

// Re-export main types
pub use catalog::{
    DateWindow, LandCoverScene, LidarGranule, MemoryCatalog, OpticalScene, RadarScene,
    SceneCatalog,
};
pub use export::{DownloadRequest, DriveExport, ExportSink, RecordingSink};
pub use fetch::{fetch_with_retry, RetryPolicy};
