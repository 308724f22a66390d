//! Cached view of the managed media library
//!
//! [`LibraryClient`] wraps a [`LibraryBackend`] (Radarr in production) with an
//! external-id index rebuilt from a full listing. Lookups never scan the
//! library; the index is rebuilt when it expires or is invalidated, and a
//! rebuild builds a fresh index and swaps it in whole. Items we create are
//! folded into the cached index instead of forcing a relisting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::matcher::match_entry;
use crate::config::AddOptions;
use crate::error::LibraryError;
use crate::types::{BoxOfficeEntry, ExternalId, LibraryItem, QualityProfile, RootFolder};

/// Raw library operations
#[async_trait]
pub trait LibraryBackend: Send + Sync {
    /// Every item in the library
    async fn list_all(&self) -> Result<Vec<LibraryItem>, LibraryError>;

    /// Create a new item for `entry`.
    ///
    /// Returns [`LibraryError::AlreadyExists`] when the library already holds
    /// the title.
    async fn create(
        &self,
        entry: &BoxOfficeEntry,
        root_folder: &str,
        profile: &QualityProfile,
        options: &AddOptions,
    ) -> Result<LibraryItem, LibraryError>;

    async fn update_quality_profile(&self, item_id: i64, profile_id: i64) -> Result<(), LibraryError>;

    async fn root_folders(&self) -> Result<Vec<RootFolder>, LibraryError>;

    async fn quality_profiles(&self) -> Result<Vec<QualityProfile>, LibraryError>;
}

/// External-id index over one library listing
#[derive(Debug, Clone, Default)]
pub struct LibraryIndex {
    by_tmdb: HashMap<i64, LibraryItem>,
    by_imdb: HashMap<String, LibraryItem>,
    len: usize,
}

impl LibraryIndex {
    pub fn build(items: Vec<LibraryItem>) -> Self {
        let mut index = LibraryIndex::default();
        for item in items {
            index.insert(item);
        }
        index
    }

    pub fn insert(&mut self, item: LibraryItem) {
        self.len += 1;
        if let Some(imdb) = item.imdb_id.clone().filter(|id| !id.is_empty()) {
            self.by_imdb.insert(imdb, item.clone());
        }
        if let Some(tmdb) = item.tmdb_id {
            self.by_tmdb.insert(tmdb, item);
        }
    }

    pub fn get(&self, id: &ExternalId) -> Option<&LibraryItem> {
        match id {
            ExternalId::Tmdb(tmdb) => self.by_tmdb.get(tmdb),
            ExternalId::Imdb(imdb) => self.by_imdb.get(imdb),
        }
    }

    /// Number of items in the listing the index was built from
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

struct CachedIndex {
    index: Arc<LibraryIndex>,
    built_at: Instant,
}

/// Library access used by the sync pipeline
pub struct LibraryClient {
    backend: Arc<dyn LibraryBackend>,
    ttl: Duration,
    cache: RwLock<Option<CachedIndex>>,
}

impl LibraryClient {
    pub fn new(backend: Arc<dyn LibraryBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            cache: RwLock::new(None),
        }
    }

    /// Current index, rebuilding it if missing or expired
    pub async fn index(&self) -> Result<Arc<LibraryIndex>, LibraryError> {
        if let Some(cached) = self.cache.read().as_ref() {
            if cached.built_at.elapsed() < self.ttl {
                return Ok(cached.index.clone());
            }
        }
        self.rebuild_index().await
    }

    /// Fetch a full listing and swap in a new index
    pub async fn rebuild_index(&self) -> Result<Arc<LibraryIndex>, LibraryError> {
        let items = self.backend.list_all().await?;
        let index = Arc::new(LibraryIndex::build(items));
        info!(items = index.len(), "Rebuilt library index");

        *self.cache.write() = Some(CachedIndex {
            index: index.clone(),
            built_at: Instant::now(),
        });
        Ok(index)
    }

    /// Record a freshly created item in the cached index without relisting
    fn remember(&self, item: &LibraryItem) {
        if let Some(cached) = self.cache.write().as_mut() {
            Arc::make_mut(&mut cached.index).insert(item.clone());
        }
    }

    /// Drop the cached index; the next lookup rebuilds it
    pub fn invalidate(&self) {
        debug!("Library index invalidated");
        *self.cache.write() = None;
    }

    pub async fn find_by_external_id(&self, id: &ExternalId) -> Result<Option<LibraryItem>, LibraryError> {
        Ok(self.index().await?.get(id).cloned())
    }

    /// Add `entry` to the library, or return the existing item if its
    /// external id is already present.
    pub async fn add(
        &self,
        entry: &BoxOfficeEntry,
        root_folder: &str,
        profile: &QualityProfile,
        options: &AddOptions,
    ) -> Result<LibraryItem, LibraryError> {
        if let Some(existing) = self.lookup_entry(entry).await? {
            debug!(title = %entry.title, item_id = existing.id, "Title already in library, not adding");
            return Ok(existing);
        }

        match self.backend.create(entry, root_folder, profile, options).await {
            Ok(item) => {
                info!(
                    title = %item.title,
                    item_id = item.id,
                    root_folder = %root_folder,
                    profile = %profile.name,
                    "Added title to library"
                );
                self.remember(&item);
                Ok(item)
            }
            Err(LibraryError::AlreadyExists(detail)) => {
                // Added behind our back since the index was built
                warn!(title = %entry.title, detail = %detail, "Library reported title already exists");
                self.invalidate();
                self.rebuild_index().await?;
                self.lookup_entry(entry)
                    .await?
                    .ok_or(LibraryError::AlreadyExists(detail))
            }
            Err(e) => Err(e),
        }
    }

    async fn lookup_entry(&self, entry: &BoxOfficeEntry) -> Result<Option<LibraryItem>, LibraryError> {
        let index = self.index().await?;
        Ok(match_entry(entry, &index).item)
    }

    pub async fn set_quality_profile(&self, item_id: i64, profile_id: i64) -> Result<(), LibraryError> {
        self.backend.update_quality_profile(item_id, profile_id).await?;
        info!(item_id, profile_id, "Updated quality profile");
        self.invalidate();
        Ok(())
    }

    /// Move an item to the quality profile called `profile_name`
    pub async fn upgrade_quality(&self, item_id: i64, profile_name: &str) -> Result<QualityProfile, LibraryError> {
        let profile = find_profile(&self.list_quality_profiles().await?, profile_name)
            .ok_or_else(|| LibraryError::UnknownProfile(profile_name.to_string()))?;
        self.set_quality_profile(item_id, profile.id).await?;
        Ok(profile)
    }

    pub async fn list_root_folders(&self) -> Result<Vec<RootFolder>, LibraryError> {
        self.backend.root_folders().await
    }

    pub async fn list_quality_profiles(&self) -> Result<Vec<QualityProfile>, LibraryError> {
        self.backend.quality_profiles().await
    }
}

/// Case-insensitive profile lookup by name
pub fn find_profile(profiles: &[QualityProfile], name: &str) -> Option<QualityProfile> {
    profiles
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
        .cloned()
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::{FakeBackend, item};
    use super::*;
    use crate::types::{EntryMetadata, ExternalIds};

    fn entry(title: &str, tmdb: Option<i64>) -> BoxOfficeEntry {
        BoxOfficeEntry {
            rank: 1,
            title: title.to_string(),
            year: Some(2024),
            ids: ExternalIds { primary: tmdb, secondary: None },
            revenue: None,
            metadata: EntryMetadata::default(),
        }
    }

    fn profile() -> QualityProfile {
        QualityProfile { id: 1, name: "HD-1080p".into() }
    }

    #[tokio::test]
    async fn test_lookups_share_one_listing() {
        let backend = Arc::new(FakeBackend::with_items(vec![item(1, Some(10), Some("tt1"))]));
        let client = LibraryClient::new(backend.clone(), Duration::from_secs(60));

        assert_eq!(client.find_by_external_id(&ExternalId::Tmdb(10)).await.unwrap().unwrap().id, 1);
        assert_eq!(
            client.find_by_external_id(&ExternalId::Imdb("tt1".into())).await.unwrap().unwrap().id,
            1
        );
        assert!(client.find_by_external_id(&ExternalId::Tmdb(99)).await.unwrap().is_none());
        assert_eq!(backend.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_rebuild() {
        let backend = Arc::new(FakeBackend::with_items(vec![]));
        let client = LibraryClient::new(backend.clone(), Duration::from_secs(60));

        assert!(client.find_by_external_id(&ExternalId::Tmdb(10)).await.unwrap().is_none());
        backend.items.lock().push(item(1, Some(10), None));
        assert!(client.find_by_external_id(&ExternalId::Tmdb(10)).await.unwrap().is_none());

        client.invalidate();
        assert!(client.find_by_external_id(&ExternalId::Tmdb(10)).await.unwrap().is_some());
        assert_eq!(backend.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_index_is_rebuilt() {
        let backend = Arc::new(FakeBackend::with_items(vec![]));
        let client = LibraryClient::new(backend.clone(), Duration::ZERO);

        client.index().await.unwrap();
        client.index().await.unwrap();
        assert_eq!(backend.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let backend = Arc::new(FakeBackend::with_items(vec![]));
        let client = LibraryClient::new(backend.clone(), Duration::from_secs(60));
        let options = AddOptions::default();

        let first = client.add(&entry("New", Some(42)), "/movies", &profile(), &options).await.unwrap();
        let second = client.add(&entry("New", Some(42)), "/movies", &profile(), &options).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(backend.create_calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.items.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_adds_reuse_the_cached_listing() {
        let backend = Arc::new(FakeBackend::with_items(vec![item(1, Some(10), None)]));
        let client = LibraryClient::new(backend.clone(), Duration::from_secs(60));
        let options = AddOptions::default();

        for tmdb in 40..45 {
            client
                .add(&entry(&format!("New {}", tmdb), Some(tmdb)), "/movies", &profile(), &options)
                .await
                .unwrap();
        }

        assert_eq!(backend.create_calls.load(Ordering::SeqCst), 5);
        assert_eq!(backend.list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.index().await.unwrap().len(), 6);
        assert!(client.find_by_external_id(&ExternalId::Tmdb(42)).await.unwrap().is_some());
        assert_eq!(backend.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_add_recovers_from_stale_index() {
        let backend = Arc::new(FakeBackend::with_items(vec![]));
        let client = LibraryClient::new(backend.clone(), Duration::from_secs(60));
        client.index().await.unwrap();

        // Someone else adds the title after our index was built
        backend.items.lock().push(item(7, Some(42), None));

        let added = client
            .add(&entry("New", Some(42)), "/movies", &profile(), &AddOptions::default())
            .await
            .unwrap();
        assert_eq!(added.id, 7);
        assert_eq!(backend.items.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_upgrade_quality_by_name() {
        let backend = Arc::new(FakeBackend::with_items(vec![item(1, Some(10), None)]));
        let client = LibraryClient::new(backend.clone(), Duration::from_secs(60));

        let profile = client.upgrade_quality(1, "ultra-hd").await.unwrap();
        assert_eq!(profile.id, 2);
        assert_eq!(backend.items.lock()[0].quality_profile_id, 2);

        let err = client.upgrade_quality(1, "4K HDR").await.unwrap_err();
        assert_eq!(err, LibraryError::UnknownProfile("4K HDR".into()));
    }
}
