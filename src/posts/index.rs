//! Chronological index of posts, stored in a redb file next to the post
//! directories.
//!
//! The index maps `(date, slug)` to a [`PostProjection`] so listings never
//! touch the post directories. It is a rebuildable cache: the directories
//! are authoritative and [`IndexHandle::rebuild`] regenerates the table from
//! them.
//!
//! The database is opened for one logical operation at a time through
//! [`ChronologicalIndex::open`] and closed when the returned handle is
//! dropped. redb locks the file exclusively while it is open, so every
//! `ChronologicalIndex` in the process that points at the same file shares
//! one gate and handles queue behind each other. A lock held by another
//! process is waited out with a bounded backoff.

use super::{
    error::PostsError,
    types::{PostEntry, PostIdentity, PostProjection, ScanDirection},
};
use redb::{
    AccessGuard, Database, DatabaseError, ReadOnlyTable, ReadableTableMetadata, TableDefinition,
    TableError,
};
use std::{
    collections::HashMap,
    ops::Bound,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock, PoisonError, Weak},
    time::Duration,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

type PostKey = (i64, &'static str);

const POSTS_TABLE: TableDefinition<'static, PostKey, &'static [u8]> =
    TableDefinition::new("posts");

const OPEN_RETRY_LIMIT: u32 = 40;
const OPEN_RETRY_INITIAL_DELAY: Duration = Duration::from_millis(5);
const OPEN_RETRY_MAX_DELAY: Duration = Duration::from_millis(250);

/// Open gates by canonical index path. Entries die with their last handle.
static GATES: LazyLock<std::sync::Mutex<HashMap<PathBuf, Weak<Mutex<()>>>>> =
    LazyLock::new(Default::default);

#[derive(Debug, Clone)]
pub struct ChronologicalIndex {
    path: PathBuf,
}

impl ChronologicalIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the index file, creating it if needed. Waits while any other
    /// handle on the same file is open, in this process or another one.
    pub async fn open(&self) -> Result<IndexHandle, PostsError> {
        let key = canonical_index_path(&self.path).await?;
        let gate = gate_for(key).lock_owned().await;

        let mut delay = OPEN_RETRY_INITIAL_DELAY;
        let mut attempt = 0;
        let db = loop {
            match Database::create(&self.path) {
                Ok(db) => break db,
                Err(DatabaseError::DatabaseAlreadyOpen) if attempt < OPEN_RETRY_LIMIT => {
                    attempt += 1;
                    if attempt == 1 {
                        warn!("Index {:?} is locked by another process, waiting", self.path);
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(OPEN_RETRY_MAX_DELAY);
                }
                Err(e) => return Err(e.into()),
            }
        };
        debug!("Opened index {:?}", self.path);

        Ok(IndexHandle {
            db,
            path: self.path.clone(),
            _gate: gate,
        })
    }
}

/// Resolves the index path through symlinks and `..` so that differently
/// spelled paths to one file share a gate. Creates the parent directory.
async fn canonical_index_path(path: &Path) -> Result<PathBuf, PostsError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    tokio::fs::create_dir_all(parent).await?;
    let parent = tokio::fs::canonicalize(parent).await?;
    Ok(match path.file_name() {
        Some(name) => parent.join(name),
        None => parent,
    })
}

fn gate_for(key: PathBuf) -> Arc<Mutex<()>> {
    let mut gates = GATES.lock().unwrap_or_else(PoisonError::into_inner);
    gates.retain(|_, gate| gate.strong_count() > 0);
    if let Some(gate) = gates.get(&key).and_then(Weak::upgrade) {
        return gate;
    }
    let gate = Arc::new(Mutex::new(()));
    gates.insert(key, Arc::downgrade(&gate));
    gate
}

/// An open index. Dropping it closes the database file.
pub struct IndexHandle {
    // Declared before the gate so the file lock is released first.
    db: Database,
    path: PathBuf,
    _gate: OwnedMutexGuard<()>,
}

impl IndexHandle {
    pub fn close(self) {}

    /// Inserts or overwrites the entry at `key`.
    pub fn put(&self, key: &PostIdentity, value: &PostProjection) -> Result<(), PostsError> {
        let bytes = encode_projection(value)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(POSTS_TABLE)?;
            table.insert((key.date, key.slug.as_str()), bytes.as_slice())?;
        }
        txn.commit()?;
        debug!("Indexed {}", key);
        Ok(())
    }

    /// Removes the entry at `key`, returning whether it was present.
    pub fn remove(&self, key: &PostIdentity) -> Result<bool, PostsError> {
        let txn = self.db.begin_write()?;
        let existed = {
            let mut table = txn.open_table(POSTS_TABLE)?;
            let removed = table.remove((key.date, key.slug.as_str()))?;
            removed.is_some()
        };
        txn.commit()?;
        debug!("Removed index entry {} (present: {})", key, existed);
        Ok(existed)
    }

    /// Removes `from` and inserts `to` in a single transaction. Returns
    /// whether `from` was present.
    pub fn move_entry(
        &self,
        from: &PostIdentity,
        to: &PostIdentity,
        value: &PostProjection,
    ) -> Result<bool, PostsError> {
        let bytes = encode_projection(value)?;
        let txn = self.db.begin_write()?;
        let existed = {
            let mut table = txn.open_table(POSTS_TABLE)?;
            let existed = table.remove((from.date, from.slug.as_str()))?.is_some();
            table.insert((to.date, to.slug.as_str()), bytes.as_slice())?;
            existed
        };
        txn.commit()?;
        debug!("Moved index entry {} -> {}", from, to);
        Ok(existed)
    }

    /// Returns up to `limit` entries in key order, starting strictly after
    /// `start_after` when given. Pass the last identity of one call as the
    /// `start_after` of the next to continue.
    pub fn scan(
        &self,
        start_after: Option<&PostIdentity>,
        limit: usize,
        direction: ScanDirection,
    ) -> Result<Vec<PostEntry>, PostsError> {
        self.page(start_after, 0, limit, direction)
    }

    /// Like [`scan`](Self::scan), skipping `offset` entries first.
    pub fn page(
        &self,
        start_after: Option<&PostIdentity>,
        offset: usize,
        limit: usize,
        direction: ScanDirection,
    ) -> Result<Vec<PostEntry>, PostsError> {
        let mut entries = Vec::new();
        if limit == 0 {
            return Ok(entries);
        }

        let txn = self.db.begin_read()?;
        let Some(table) = open_read_table(&txn)? else {
            return Ok(entries);
        };

        let range = match (start_after, direction) {
            (None, _) => table.range::<PostKey>(..)?,
            (Some(key), ScanDirection::NewestFirst) => table.range((
                Bound::Unbounded,
                Bound::Excluded((key.date, key.slug.as_str())),
            ))?,
            (Some(key), ScanDirection::OldestFirst) => table.range((
                Bound::Excluded((key.date, key.slug.as_str())),
                Bound::Unbounded,
            ))?,
        };

        match direction {
            ScanDirection::NewestFirst => collect_entries(range.rev(), offset, limit, &mut entries)?,
            ScanDirection::OldestFirst => collect_entries(range, offset, limit, &mut entries)?,
        }

        Ok(entries)
    }

    pub fn len(&self) -> Result<u64, PostsError> {
        let txn = self.db.begin_read()?;
        match open_read_table(&txn)? {
            Some(table) => Ok(table.len()?),
            None => Ok(0),
        }
    }

    pub fn is_empty(&self) -> Result<bool, PostsError> {
        Ok(self.len()? == 0)
    }

    /// Discards every entry and writes `entries` in their place, in one
    /// transaction.
    pub fn rebuild(&self, entries: &[PostEntry]) -> Result<usize, PostsError> {
        let txn = self.db.begin_write()?;
        txn.delete_table(POSTS_TABLE)?;
        {
            let mut table = txn.open_table(POSTS_TABLE)?;
            for entry in entries {
                let bytes = encode_projection(&entry.projection)?;
                table.insert(
                    (entry.identity.date, entry.identity.slug.as_str()),
                    bytes.as_slice(),
                )?;
            }
        }
        txn.commit()?;
        debug!("Rebuilt index {:?} with {} entries", self.path, entries.len());
        Ok(entries.len())
    }
}

impl Drop for IndexHandle {
    fn drop(&mut self) {
        debug!("Closed index {:?}", self.path);
    }
}

fn open_read_table(
    txn: &redb::ReadTransaction,
) -> Result<Option<ReadOnlyTable<PostKey, &'static [u8]>>, PostsError> {
    match txn.open_table(POSTS_TABLE) {
        Ok(table) => Ok(Some(table)),
        Err(TableError::TableDoesNotExist(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn collect_entries<'a, I>(
    rows: I,
    offset: usize,
    limit: usize,
    entries: &mut Vec<PostEntry>,
) -> Result<(), PostsError>
where
    I: Iterator<
        Item = Result<
            (AccessGuard<'a, PostKey>, AccessGuard<'a, &'static [u8]>),
            redb::StorageError,
        >,
    >,
{
    for row in rows.skip(offset).take(limit) {
        let (key, value) = row?;
        let (date, slug) = key.value();
        let projection = serde_json::from_slice(value.value()).map_err(|e| {
            PostsError::CorruptRecord(format!("index entry {}@{}: {}", slug, date, e))
        })?;
        entries.push(PostEntry {
            identity: PostIdentity::new(date, slug),
            projection,
        });
    }
    Ok(())
}

fn encode_projection(value: &PostProjection) -> Result<Vec<u8>, PostsError> {
    Ok(serde_json::to_vec(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn projection(title: &str) -> PostProjection {
        PostProjection {
            title: title.to_string(),
            summary: format!("{} summary", title),
            image: None,
        }
    }

    fn slugs(entries: &[PostEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.identity.slug.as_str()).collect()
    }

    #[tokio::test]
    async fn test_put_overwrites_and_remove_signals_absence() {
        let temp_dir = TempDir::new().unwrap();
        let index = ChronologicalIndex::new(temp_dir.path().join("index.db"));
        let handle = index.open().await.unwrap();
        let key = PostIdentity::new(10, "soup");

        handle.put(&key, &projection("Soup")).unwrap();
        handle.put(&key, &projection("Better Soup")).unwrap();
        assert_eq!(handle.len().unwrap(), 1);

        let entries = handle.scan(None, 10, ScanDirection::OldestFirst).unwrap();
        assert_eq!(entries[0].projection.title, "Better Soup");

        assert!(handle.remove(&key).unwrap());
        assert!(!handle.remove(&key).unwrap());
        assert!(handle.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_scan_orders_by_date_then_slug() {
        let temp_dir = TempDir::new().unwrap();
        let index = ChronologicalIndex::new(temp_dir.path().join("index.db"));
        let handle = index.open().await.unwrap();

        for (date, slug) in [(20, "b"), (10, "z"), (20, "a"), (30, "m")] {
            handle
                .put(&PostIdentity::new(date, slug), &projection(slug))
                .unwrap();
        }

        let oldest = handle.scan(None, 10, ScanDirection::OldestFirst).unwrap();
        assert_eq!(slugs(&oldest), vec!["z", "a", "b", "m"]);

        let newest = handle.scan(None, 10, ScanDirection::NewestFirst).unwrap();
        assert_eq!(slugs(&newest), vec!["m", "b", "a", "z"]);
    }

    #[tokio::test]
    async fn test_scan_resumes_from_cursor() {
        let temp_dir = TempDir::new().unwrap();
        let index = ChronologicalIndex::new(temp_dir.path().join("index.db"));
        let handle = index.open().await.unwrap();

        for date in 0..7 {
            let slug = format!("post-{}", date);
            handle
                .put(&PostIdentity::new(date, slug.clone()), &projection(&slug))
                .unwrap();
        }

        for direction in [ScanDirection::NewestFirst, ScanDirection::OldestFirst] {
            let mut seen = Vec::new();
            let mut cursor: Option<PostIdentity> = None;
            loop {
                let batch = handle.scan(cursor.as_ref(), 3, direction).unwrap();
                if batch.is_empty() {
                    break;
                }
                cursor = batch.last().map(|e| e.identity.clone());
                seen.extend(batch.into_iter().map(|e| e.identity.date));
            }

            let mut expected: Vec<i64> = (0..7).collect();
            if direction == ScanDirection::NewestFirst {
                expected.reverse();
            }
            assert_eq!(seen, expected);
        }
    }

    #[tokio::test]
    async fn test_empty_index_reads() {
        let temp_dir = TempDir::new().unwrap();
        let index = ChronologicalIndex::new(temp_dir.path().join("nested/index.db"));
        let handle = index.open().await.unwrap();

        assert_eq!(handle.len().unwrap(), 0);
        assert!(handle.scan(None, 5, ScanDirection::NewestFirst).unwrap().is_empty());
        assert!(handle.page(None, 0, 0, ScanDirection::NewestFirst).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_move_entry_and_rebuild() {
        let temp_dir = TempDir::new().unwrap();
        let index = ChronologicalIndex::new(temp_dir.path().join("index.db"));
        let handle = index.open().await.unwrap();

        let old = PostIdentity::new(1, "old");
        let new = PostIdentity::new(2, "new");
        handle.put(&old, &projection("Old")).unwrap();
        assert!(handle.move_entry(&old, &new, &projection("New")).unwrap());

        let entries = handle.scan(None, 10, ScanDirection::OldestFirst).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].identity, new);

        let replacement = vec![
            PostEntry {
                identity: PostIdentity::new(5, "five"),
                projection: projection("Five"),
            },
            PostEntry {
                identity: PostIdentity::new(6, "six"),
                projection: projection("Six"),
            },
        ];
        assert_eq!(handle.rebuild(&replacement).unwrap(), 2);
        let entries = handle.scan(None, 10, ScanDirection::OldestFirst).unwrap();
        assert_eq!(entries, replacement);
    }

    #[tokio::test]
    async fn test_handles_are_scoped() {
        let temp_dir = TempDir::new().unwrap();
        let index = ChronologicalIndex::new(temp_dir.path().join("index.db"));

        let handle = index.open().await.unwrap();
        handle
            .put(&PostIdentity::new(1, "kept"), &projection("Kept"))
            .unwrap();
        handle.close();

        // A second handle can only be acquired once the first is closed.
        let first = index.open().await.unwrap();
        let waiting = {
            let index = index.clone();
            tokio::spawn(async move {
                let handle = index.open().await.unwrap();
                handle.len().unwrap()
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());
        drop(first);

        assert_eq!(waiting.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_separate_indexes_on_one_file_share_a_gate() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir(temp_dir.path().join("posts")).unwrap();
        let first = ChronologicalIndex::new(temp_dir.path().join("posts/index.db"));
        let second = ChronologicalIndex::new(temp_dir.path().join("posts/../posts/index.db"));

        let held = first.open().await.unwrap();
        held.put(&PostIdentity::new(1, "held"), &projection("Held")).unwrap();

        let waiting = tokio::spawn(async move {
            let handle = second.open().await.unwrap();
            handle.len().unwrap()
        });
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());
        drop(held);

        assert_eq!(waiting.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_open_waits_out_a_foreign_lock() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index.db");
        let index = ChronologicalIndex::new(&path);

        // Opened directly, bypassing the gate, like another process would.
        let foreign = Database::create(&path).unwrap();

        let waiting = {
            let index = index.clone();
            tokio::spawn(async move {
                let handle = index.open().await.unwrap();
                handle.is_empty().unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());
        drop(foreign);

        assert!(waiting.await.unwrap());
    }
}
