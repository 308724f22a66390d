//! External service integrations and pipeline stages

pub mod acquisition;
pub mod library;
pub mod logging;
pub mod matcher;
pub mod radarr;
pub mod rate_limiter;
pub mod snapshots;
pub mod trakt;

pub use acquisition::{AcquisitionEngine, ReReleaseDetector, RootFolderRule, RuleBook, YearCutoff};
pub use library::{LibraryBackend, LibraryClient, LibraryIndex};
pub use radarr::RadarrClient;
pub use snapshots::{LiveStatus, SnapshotRow, SnapshotStore, StatusLabel, WeekSnapshot};
pub use trakt::{BoxOfficeSource, TraktClient};
