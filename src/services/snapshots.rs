//! Per-week snapshot files
//!
//! Each week is one JSON file, `{data_dir}/{year}W{week:02}.json`, written
//! once. The only later mutation is [`SnapshotStore::refresh_status`], which
//! rewrites the live status block of each row. Replacing a week requires an
//! explicit [`SnapshotStore::delete`] first.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::library::{LibraryClient, LibraryIndex, find_profile};
use crate::error::StoreError;
use crate::types::{
    AcquisitionDecision, Availability, BoxOfficeEntry, ExternalId, LibraryItem, MatchResult,
    QualityProfile, WeekKey,
};

/// Display label derived from an item's live state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusLabel {
    Downloaded,
    Missing,
    #[serde(rename = "In Cinemas")]
    InCinemas,
    Pending,
}

impl StatusLabel {
    pub fn for_item(item: &LibraryItem) -> Self {
        if item.has_file {
            StatusLabel::Downloaded
        } else if item.availability == Some(Availability::Released) && item.is_available {
            StatusLabel::Missing
        } else if item.availability == Some(Availability::InCinemas) {
            StatusLabel::InCinemas
        } else {
            StatusLabel::Pending
        }
    }
}

/// Library-side state of a row's item at the time of the last refresh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveStatus {
    pub quality_profile_id: i64,
    pub quality_profile_name: Option<String>,
    pub has_file: bool,
    pub availability: Option<Availability>,
    pub label: StatusLabel,
    /// The item could be moved to the configured upgrade profile
    pub can_upgrade: bool,
    pub refreshed_at: DateTime<Utc>,
}

impl LiveStatus {
    pub fn from_item(item: &LibraryItem, profiles: &[QualityProfile], upgrade: Option<&QualityProfile>) -> Self {
        Self {
            quality_profile_id: item.quality_profile_id,
            quality_profile_name: profiles
                .iter()
                .find(|p| p.id == item.quality_profile_id)
                .map(|p| p.name.clone()),
            has_file: item.has_file,
            availability: item.availability,
            label: StatusLabel::for_item(item),
            can_upgrade: upgrade.is_some_and(|u| u.id != item.quality_profile_id),
            refreshed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub entry: BoxOfficeEntry,
    pub matched: MatchResult,
    /// Present only for entries the rule engine looked at
    pub decision: Option<AcquisitionDecision>,
    pub status: Option<LiveStatus>,
}

impl SnapshotRow {
    /// Library item backing this row, matched or newly added
    pub fn library_item(&self) -> Option<&LibraryItem> {
        self.matched
            .item
            .as_ref()
            .or_else(|| self.decision.as_ref().and_then(|d| d.item.as_ref()))
    }
}

/// Recorded result of one run for one week
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeekSnapshot {
    pub key: WeekKey,
    pub created_at: DateTime<Utc>,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub rows: Vec<SnapshotRow>,
}

/// File-backed snapshot store.
///
/// Clones share one write lock, so `create`, `delete` and the read-modify-write
/// of `refresh_status` never interleave.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    writes: Arc<Mutex<()>>,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            writes: Arc::new(Mutex::new(())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: WeekKey) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    fn temp_path_for(&self, key: WeekKey) -> PathBuf {
        self.dir.join(format!(".{}.{}.tmp", key, Uuid::new_v4()))
    }

    pub async fn exists(&self, key: WeekKey) -> Result<bool, StoreError> {
        Ok(tokio::fs::try_exists(self.path_for(key)).await?)
    }

    /// Persist a new week. Fails with `AlreadyExists` rather than overwrite.
    pub async fn create(&self, key: WeekKey, rows: Vec<SnapshotRow>) -> Result<WeekSnapshot, StoreError> {
        let snapshot = WeekSnapshot {
            key,
            created_at: Utc::now(),
            refreshed_at: None,
            rows,
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;

        let _writing = self.writes.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let temp = self.write_temp(key, &bytes).await?;

        // hard_link refuses to replace an existing file, so the check and the
        // publish are one step
        let linked = tokio::fs::hard_link(&temp, self.path_for(key)).await;
        let _ = tokio::fs::remove_file(&temp).await;
        match linked {
            Ok(()) => {
                info!(week = %key, rows = snapshot.rows.len(), "Wrote weekly snapshot");
                Ok(snapshot)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(StoreError::AlreadyExists(key)),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_temp(&self, key: WeekKey, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let temp = self.temp_path_for(key);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp)
            .await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        Ok(temp)
    }

    pub async fn read(&self, key: WeekKey) -> Result<WeekSnapshot, StoreError> {
        let bytes = match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(StoreError::NotFound(key)),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Stored weeks, newest first
    pub async fn list_weeks(&self) -> Result<Vec<WeekKey>, StoreError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut weeks = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            match stem.parse::<WeekKey>() {
                Ok(key) => weeks.push(key),
                Err(_) => debug!(file = %stem, "Ignoring non-snapshot file"),
            }
        }

        weeks.sort_unstable_by(|a, b| b.cmp(a));
        Ok(weeks)
    }

    pub async fn delete(&self, key: WeekKey) -> Result<(), StoreError> {
        let _writing = self.writes.lock().await;
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => {
                info!(week = %key, "Deleted weekly snapshot");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(key)),
            Err(e) => Err(e.into()),
        }
    }

    /// Keep the newest `keep` weeks, deleting the rest
    pub async fn prune(&self, keep: usize) -> Result<Vec<WeekKey>, StoreError> {
        let expired: Vec<WeekKey> = self.list_weeks().await?.into_iter().skip(keep).collect();
        for key in &expired {
            self.delete(*key).await?;
        }
        Ok(expired)
    }

    /// Re-read the live state of every matched or added item.
    ///
    /// Only the `status` block of each row and the snapshot's `refreshed_at`
    /// change. Items no longer in the library keep their previous status.
    /// The library is queried before taking the write lock; the snapshot is
    /// then re-read under the lock, so a week deleted and recreated in the
    /// meantime gets its own rows refreshed rather than the stale ones.
    pub async fn refresh_status(
        &self,
        key: WeekKey,
        library: &LibraryClient,
        upgrade_profile: Option<&str>,
    ) -> Result<WeekSnapshot, StoreError> {
        if !self.exists(key).await? {
            return Err(StoreError::NotFound(key));
        }

        library.invalidate();
        let index = library.index().await?;
        let profiles = library.list_quality_profiles().await?;
        let upgrade = upgrade_profile.and_then(|name| find_profile(&profiles, name));

        let _writing = self.writes.lock().await;
        let mut snapshot = self.read(key).await?;
        for row in &mut snapshot.rows {
            let Some(stored) = row.library_item() else {
                continue;
            };
            match current_item(&index, stored) {
                Some(live) => row.status = Some(LiveStatus::from_item(live, &profiles, upgrade.as_ref())),
                None => warn!(week = %key, rank = row.entry.rank, item_id = stored.id, "Item no longer in library"),
            }
        }
        snapshot.refreshed_at = Some(Utc::now());

        self.replace(key, &snapshot).await?;
        debug!(week = %key, "Refreshed snapshot status");
        Ok(snapshot)
    }

    /// Atomically swap in new contents for an existing week. Callers hold the
    /// write lock.
    async fn replace(&self, key: WeekKey, snapshot: &WeekSnapshot) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let temp = self.write_temp(key, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&temp, self.path_for(key)).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

fn current_item<'a>(index: &'a LibraryIndex, stored: &LibraryItem) -> Option<&'a LibraryItem> {
    stored
        .tmdb_id
        .and_then(|id| index.get(&ExternalId::Tmdb(id)))
        .or_else(|| {
            stored
                .imdb_id
                .as_ref()
                .and_then(|id| index.get(&ExternalId::Imdb(id.clone())))
        })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::config::AddOptions;
    use crate::error::LibraryError;
    use crate::services::library::LibraryBackend;
    use crate::services::library::testing::{FakeBackend, item};
    use crate::types::{EntryMetadata, ExternalIds, MatchMethod, RootFolder};

    /// Backend whose listing blocks until released
    struct GatedBackend {
        inner: FakeBackend,
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl LibraryBackend for GatedBackend {
        async fn list_all(&self) -> Result<Vec<LibraryItem>, LibraryError> {
            self.started.notify_one();
            self.release.notified().await;
            self.inner.list_all().await
        }

        async fn create(
            &self,
            entry: &BoxOfficeEntry,
            root_folder: &str,
            profile: &QualityProfile,
            options: &AddOptions,
        ) -> Result<LibraryItem, LibraryError> {
            self.inner.create(entry, root_folder, profile, options).await
        }

        async fn update_quality_profile(&self, item_id: i64, profile_id: i64) -> Result<(), LibraryError> {
            self.inner.update_quality_profile(item_id, profile_id).await
        }

        async fn root_folders(&self) -> Result<Vec<RootFolder>, LibraryError> {
            self.inner.root_folders().await
        }

        async fn quality_profiles(&self) -> Result<Vec<QualityProfile>, LibraryError> {
            self.inner.quality_profiles().await
        }
    }

    fn row(rank: u32, matched: Option<LibraryItem>) -> SnapshotRow {
        SnapshotRow {
            entry: BoxOfficeEntry {
                rank,
                title: format!("Entry {}", rank),
                year: Some(2024),
                ids: ExternalIds {
                    primary: matched.as_ref().and_then(|i| i.tmdb_id),
                    secondary: None,
                },
                revenue: Some(10_000_000 / rank as i64),
                metadata: EntryMetadata::default(),
            },
            matched: MatchResult {
                rank,
                method: if matched.is_some() { MatchMethod::Primary } else { MatchMethod::None },
                item: matched,
            },
            decision: None,
            status: None,
        }
    }

    #[tokio::test]
    async fn test_create_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        let key = WeekKey::new(2024, 10);

        store.create(key, vec![row(1, None)]).await.unwrap();
        let before = std::fs::read(dir.path().join("2024W10.json")).unwrap();

        let second = store.create(key, vec![row(1, None), row(2, None)]).await;
        assert_matches!(second, Err(StoreError::AlreadyExists(k)) if k == key);

        let after = std::fs::read(dir.path().join("2024W10.json")).unwrap();
        assert_eq!(before, after);
        assert_eq!(store.read(key).await.unwrap().rows.len(), 1);
    }

    #[tokio::test]
    async fn test_read_missing_week() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        assert_matches!(store.read(WeekKey::new(2024, 1)).await, Err(StoreError::NotFound(_)));
        assert_matches!(store.delete(WeekKey::new(2024, 1)).await, Err(StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_weeks_newest_first_and_prune() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        for key in [WeekKey::new(2023, 52), WeekKey::new(2024, 3), WeekKey::new(2024, 1)] {
            store.create(key, Vec::new()).await.unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        assert_eq!(
            store.list_weeks().await.unwrap(),
            vec![WeekKey::new(2024, 3), WeekKey::new(2024, 1), WeekKey::new(2023, 52)]
        );

        let pruned = store.prune(2).await.unwrap();
        assert_eq!(pruned, vec![WeekKey::new(2023, 52)]);
        assert!(!store.exists(WeekKey::new(2023, 52)).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_then_create_replaces_week() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        let key = WeekKey::new(2024, 10);

        store.create(key, vec![row(1, None)]).await.unwrap();
        store.delete(key).await.unwrap();
        store.create(key, vec![row(1, None), row(2, None)]).await.unwrap();
        assert_eq!(store.read(key).await.unwrap().rows.len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_only_touches_status() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        let key = WeekKey::new(2024, 10);

        let stored = item(1, Some(100), None);
        let created = store
            .create(key, vec![row(1, Some(stored.clone())), row(2, None)])
            .await
            .unwrap();

        // The file has since landed
        let mut live = stored.clone();
        live.has_file = true;
        let backend = Arc::new(FakeBackend::with_items(vec![live]));
        let library = LibraryClient::new(backend, Duration::from_secs(60));

        let refreshed = store.refresh_status(key, &library, Some("Ultra-HD")).await.unwrap();

        for (before, after) in created.rows.iter().zip(&refreshed.rows) {
            assert_eq!(before.entry, after.entry);
            assert_eq!(before.matched, after.matched);
            assert_eq!(before.decision, after.decision);
        }
        let status = refreshed.rows[0].status.as_ref().unwrap();
        assert_eq!(status.label, StatusLabel::Downloaded);
        assert_eq!(status.quality_profile_name.as_deref(), Some("HD-1080p"));
        assert!(status.can_upgrade);
        assert!(refreshed.rows[1].status.is_none());
        assert!(refreshed.refreshed_at.is_some());
        assert_eq!(store.read(key).await.unwrap(), refreshed);
    }

    #[tokio::test]
    async fn test_refresh_never_restores_a_replaced_week() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        let key = WeekKey::new(2024, 10);

        let stored = item(1, Some(100), None);
        let mut old = row(1, Some(stored.clone()));
        old.entry.title = "OLD".into();
        store.create(key, vec![old]).await.unwrap();

        let backend = Arc::new(GatedBackend {
            inner: FakeBackend::with_items(vec![stored.clone()]),
            started: Notify::new(),
            release: Notify::new(),
        });
        let library = Arc::new(LibraryClient::new(backend.clone(), Duration::from_secs(60)));

        let refresh = tokio::spawn({
            let store = store.clone();
            let library = library.clone();
            async move { store.refresh_status(key, &library, None).await }
        });

        // Replace the week while the refresh is waiting on the library
        backend.started.notified().await;
        store.delete(key).await.unwrap();
        let mut new = row(1, Some(stored));
        new.entry.title = "NEW".into();
        store.create(key, vec![new]).await.unwrap();
        backend.release.notify_one();

        let refreshed = refresh.await.unwrap().unwrap();
        assert_eq!(refreshed.rows[0].entry.title, "NEW");

        let on_disk = store.read(key).await.unwrap();
        assert_eq!(on_disk.rows[0].entry.title, "NEW");
        assert!(on_disk.rows[0].status.is_some());
        assert!(on_disk.refreshed_at.is_some());
    }

    #[tokio::test]
    async fn test_refresh_missing_week() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        let backend = Arc::new(FakeBackend::with_items(vec![]));
        let library = LibraryClient::new(backend.clone(), Duration::from_secs(60));

        let result = store.refresh_status(WeekKey::new(2024, 10), &library, None).await;
        assert_matches!(result, Err(StoreError::NotFound(_)));
        assert_eq!(backend.list_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_status_labels() {
        let mut i = item(1, Some(1), None);
        i.availability = Some(Availability::Released);
        i.is_available = true;
        assert_eq!(StatusLabel::for_item(&i), StatusLabel::Missing);
        i.availability = Some(Availability::InCinemas);
        assert_eq!(StatusLabel::for_item(&i), StatusLabel::InCinemas);
        i.availability = Some(Availability::Announced);
        assert_eq!(StatusLabel::for_item(&i), StatusLabel::Pending);
        i.has_file = true;
        assert_eq!(StatusLabel::for_item(&i), StatusLabel::Downloaded);
        assert_eq!(serde_json::to_string(&StatusLabel::InCinemas).unwrap(), "\"In Cinemas\"");
    }
}
