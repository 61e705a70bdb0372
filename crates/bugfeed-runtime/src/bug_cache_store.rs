//! Bug cache collaborators and the per-bug critical section around them.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bugfeed_timeline::BugRecord;
use chrono::{DateTime, Utc};
use tokio::sync::{OwnedMutexGuard, RwLock};

#[async_trait]
/// Trait contract for the key-value bug store keyed by bug id.
pub trait BugCache: Send + Sync {
    async fn get(&self, bug_id: u64) -> Result<Option<BugRecord>>;
    async fn save(&self, bug: &BugRecord) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryBugCache {
    bugs: RwLock<HashMap<u64, BugRecord>>,
}

impl InMemoryBugCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.bugs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.bugs.read().await.is_empty()
    }
}

#[async_trait]
impl BugCache for InMemoryBugCache {
    async fn get(&self, bug_id: u64) -> Result<Option<BugRecord>> {
        Ok(self.bugs.read().await.get(&bug_id).cloned())
    }

    async fn save(&self, bug: &BugRecord) -> Result<()> {
        self.bugs.write().await.insert(bug.id, bug.clone());
        Ok(())
    }
}

/// One pretty-printed JSON document per bug under a cache directory.
#[derive(Debug, Clone)]
pub struct JsonFileBugCache {
    root: PathBuf,
}

impl JsonFileBugCache {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if root.as_os_str().is_empty() {
            bail!("bug cache directory cannot be empty");
        }
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bug_path(&self, bug_id: u64) -> PathBuf {
        self.root.join(format!("bug-{bug_id}.json"))
    }
}

#[async_trait]
impl BugCache for JsonFileBugCache {
    async fn get(&self, bug_id: u64) -> Result<Option<BugRecord>> {
        let path = self.bug_path(bug_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(error).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        let bug = serde_json::from_str::<BugRecord>(&raw)
            .with_context(|| format!("failed to parse cached bug {}", path.display()))?;
        Ok(Some(bug))
    }

    async fn save(&self, bug: &BugRecord) -> Result<()> {
        let path = self.bug_path(bug.id);
        let mut payload = serde_json::to_string_pretty(bug)
            .with_context(|| format!("failed to encode bug {}", bug.id))?;
        payload.push('\n');
        write_text_atomic(&path, &payload).await
    }
}

/// Temp file + rename so readers never observe a half-written bug.
async fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("bug");
    let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", std::process::id()));
    tokio::fs::write(&temp_path, content)
        .await
        .with_context(|| format!("failed to write temporary file {}", temp_path.display()))?;
    tokio::fs::rename(&temp_path, path).await.with_context(|| {
        format!(
            "failed to rename temporary bug file {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}

type LockMap = HashMap<u64, Arc<tokio::sync::Mutex<()>>>;

#[derive(Debug, Default)]
struct BugLocks {
    locks: Arc<Mutex<LockMap>>,
}

impl BugLocks {
    async fn acquire(&self, bug_id: u64) -> BugLockGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(bug_id).or_default().clone()
        };
        BugLockGuard {
            bug_id,
            guard: Some(lock.lock_owned().await),
            locks: self.locks.clone(),
        }
    }

    fn tracked(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Holds one bug's critical section. The lock entry is dropped with the
/// last holder or waiter.
#[derive(Debug)]
pub struct BugLockGuard {
    bug_id: u64,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<Mutex<LockMap>>,
}

impl Drop for BugLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.bug_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.bug_id);
        }
    }
}

/// Bug cache plus the per-bug critical section every mutation runs under.
///
/// Reconciliation appends, full fetches and read/star toggles for the same
/// bug are serialized here so scalar field updates never interleave.
pub struct BugStore {
    cache: Arc<dyn BugCache>,
    locks: BugLocks,
}

impl BugStore {
    pub fn new(cache: Arc<dyn BugCache>) -> Self {
        Self {
            cache,
            locks: BugLocks::default(),
        }
    }

    pub fn cache(&self) -> &Arc<dyn BugCache> {
        &self.cache
    }

    pub async fn lock_bug(&self, bug_id: u64) -> BugLockGuard {
        self.locks.acquire(bug_id).await
    }

    /// Number of bugs with a held or awaited lock.
    pub fn locked_bugs(&self) -> usize {
        self.locks.tracked()
    }

    pub async fn get(&self, bug_id: u64) -> Result<Option<BugRecord>> {
        self.cache.get(bug_id).await
    }

    /// Applies `mutate` to the cached bug and persists it.
    ///
    /// Returns `None` without saving when the bug is not cached.
    pub async fn update<R, F>(&self, bug_id: u64, mutate: F) -> Result<Option<R>>
    where
        F: FnOnce(&mut BugRecord) -> R + Send,
        R: Send,
    {
        let _guard = self.lock_bug(bug_id).await;
        let Some(mut bug) = self.cache.get(bug_id).await? else {
            return Ok(None);
        };
        let result = mutate(&mut bug);
        self.cache.save(&bug).await?;
        Ok(Some(result))
    }

    /// Stores a full fetch result, keeping client annotations and every
    /// record of the existing cache entry.
    ///
    /// Records a push appended after the fetch was issued survive a fetch
    /// that finishes late.
    pub async fn store_full_fetch(&self, mut fetched: BugRecord) -> Result<BugRecord> {
        let _guard = self.lock_bug(fetched.id).await;
        if let Some(existing) = self.cache.get(fetched.id).await? {
            fetched.last_viewed = existing.last_viewed;
            fetched.unread = existing.unread;
            fetched.starred = existing.starred;
            let retained = fetched.retain_cached_records(&existing);
            if retained > 0 {
                tracing::debug!(
                    bug_id = fetched.id,
                    retained,
                    "kept cached records missing from full fetch"
                );
            }
        }
        fetched.update_needed = false;
        self.cache.save(&fetched).await?;
        Ok(fetched)
    }

    pub async fn set_last_viewed(&self, bug_id: u64, time: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .update(bug_id, |bug| bug.last_viewed = Some(time))
            .await?
            .is_some())
    }

    pub async fn toggle_unread(&self, bug_id: u64, unread: bool) -> Result<bool> {
        Ok(self
            .update(bug_id, |bug| bug.unread = unread)
            .await?
            .is_some())
    }

    pub async fn toggle_star(&self, bug_id: u64, starred: bool) -> Result<bool> {
        Ok(self
            .update(bug_id, |bug| bug.starred = starred)
            .await?
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bugfeed_timeline::{BugRecord, Comment, Person};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tempfile::tempdir;

    use super::{BugCache, BugStore, InMemoryBugCache, JsonFileBugCache};

    fn comment(id: u64) -> Comment {
        Comment {
            id,
            creator: Person::new("alice@example.com"),
            creation_time: Utc
                .timestamp_opt(1_410_000_000 + id as i64, 0)
                .single()
                .expect("valid timestamp"),
            raw_text: format!("comment {id}"),
            text: None,
        }
    }

    #[tokio::test]
    async fn functional_json_file_cache_round_trips_bugs() {
        let temp = tempdir().expect("tempdir");
        let cache = JsonFileBugCache::open(temp.path().join("bugs")).expect("cache");
        assert!(cache.get(42).await.expect("get").is_none());

        let mut bug = BugRecord::new(42);
        bug.fields.insert("summary".to_string(), json!("Crash"));
        bug.starred = true;
        cache.save(&bug).await.expect("save");

        let loaded = cache.get(42).await.expect("get").expect("cached bug");
        assert_eq!(loaded, bug);
        assert!(cache.bug_path(42).exists());
    }

    #[tokio::test]
    async fn regression_json_file_cache_reports_corrupt_documents() {
        let temp = tempdir().expect("tempdir");
        let cache = JsonFileBugCache::open(temp.path()).expect("cache");
        std::fs::write(cache.bug_path(9), "{not json").expect("write corrupt");
        let error = cache.get(9).await.expect_err("corrupt cache entry");
        assert!(error.to_string().contains("failed to parse cached bug"));
    }

    #[tokio::test]
    async fn functional_store_toggles_only_touch_cached_bugs() {
        let cache = Arc::new(InMemoryBugCache::new());
        let store = BugStore::new(cache.clone());
        assert!(!store.toggle_star(5, true).await.expect("toggle"));
        assert!(cache.is_empty().await);

        cache.save(&BugRecord::new(5)).await.expect("save");
        let viewed = Utc::now();
        assert!(store.toggle_star(5, true).await.expect("toggle"));
        assert!(store.toggle_unread(5, true).await.expect("toggle"));
        assert!(store.set_last_viewed(5, viewed).await.expect("viewed"));

        let bug = store.get(5).await.expect("get").expect("bug");
        assert!(bug.starred);
        assert!(bug.unread);
        assert_eq!(bug.last_viewed, Some(viewed));
    }

    #[tokio::test]
    async fn integration_store_full_fetch_keeps_client_annotations() {
        let cache = Arc::new(InMemoryBugCache::new());
        let store = BugStore::new(cache.clone());
        let mut existing = BugRecord::new(5);
        existing.starred = true;
        existing.update_needed = true;
        cache.save(&existing).await.expect("save");

        let mut fetched = BugRecord::new(5);
        fetched.comments = Some(Vec::new());
        let stored = store.store_full_fetch(fetched).await.expect("store");
        assert!(stored.starred);
        assert!(!stored.update_needed);
        assert!(!stored.needs_details());
    }

    #[tokio::test]
    async fn regression_stale_full_fetch_keeps_pushed_comment() {
        let cache = Arc::new(InMemoryBugCache::new());
        let store = BugStore::new(cache.clone());
        let mut existing = BugRecord::new(5);
        existing.comments = Some(vec![comment(1), comment(2)]);
        cache.save(&existing).await.expect("save");

        let mut stale = BugRecord::new(5);
        stale.comments = Some(vec![comment(1)]);
        let stored = store.store_full_fetch(stale).await.expect("store");
        let ids = stored
            .comments
            .iter()
            .flatten()
            .map(|comment| comment.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(cache.get(5).await.expect("get"), Some(stored));
    }

    #[tokio::test]
    async fn regression_released_bug_locks_are_forgotten() {
        let store = Arc::new(BugStore::new(Arc::new(InMemoryBugCache::new())));
        let guard = store.lock_bug(3).await;
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                let _guard = store.lock_bug(3).await;
            })
        };
        tokio::task::yield_now().await;
        drop(guard);
        assert_eq!(store.locked_bugs(), 1);
        waiter.await.expect("waiter");
        assert_eq!(store.locked_bugs(), 0);

        for bug_id in 0..32 {
            store.toggle_star(bug_id, true).await.expect("toggle");
        }
        assert_eq!(store.locked_bugs(), 0);
    }

    #[tokio::test]
    async fn integration_concurrent_updates_on_one_bug_do_not_lose_writes() {
        let cache = Arc::new(InMemoryBugCache::new());
        let store = Arc::new(BugStore::new(cache.clone()));
        cache.save(&BugRecord::new(11)).await.expect("save");

        let mut handles = Vec::new();
        for index in 0..16_u64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update(11, move |bug| {
                        let counter = bug
                            .fields
                            .get("counter")
                            .and_then(serde_json::Value::as_u64)
                            .unwrap_or(0);
                        bug.fields
                            .insert("counter".to_string(), json!(counter + 1));
                        bug.fields
                            .insert(format!("writer_{index}"), json!(true));
                    })
                    .await
                    .expect("update")
            }));
        }
        for handle in handles {
            assert!(handle.await.expect("join").is_some());
        }
        let bug = store.get(11).await.expect("get").expect("bug");
        assert_eq!(bug.fields["counter"], json!(16));
    }
}
