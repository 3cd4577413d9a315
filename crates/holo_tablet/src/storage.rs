//! Row storage engines behind a tablet.
//!
//! A tablet treats storage as an ordered byte-key/byte-value map. Every scan
//! is handed out as a [`ScanIter`] that counts itself in the engine's
//! [`IterStats`] while alive, so callers can check that each read opens one
//! iteration scope and releases it.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use fjall::{Keyspace, PartitionCreateOptions};
use tracing::warn;

/// Item yielded by a storage scan.
pub type ScanItem = anyhow::Result<(Vec<u8>, Vec<u8>)>;

/// Counters of iteration scopes opened over an engine's lifetime and still
/// open right now.
#[derive(Debug, Default)]
pub struct IterStats {
    opened: AtomicU64,
    live: AtomicU64,
}

impl IterStats {
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn live(&self) -> u64 {
        self.live.load(Ordering::Relaxed)
    }

    fn enter(&self) -> IterGuard<'_> {
        self.opened.fetch_add(1, Ordering::Relaxed);
        self.live.fetch_add(1, Ordering::Relaxed);
        IterGuard { stats: self }
    }
}

struct IterGuard<'a> {
    stats: &'a IterStats,
}

impl Drop for IterGuard<'_> {
    fn drop(&mut self) {
        self.stats.live.fetch_sub(1, Ordering::Relaxed);
    }
}

/// One iteration scope over a key range.
pub struct ScanIter<'a> {
    inner: Box<dyn Iterator<Item = ScanItem> + 'a>,
    _guard: IterGuard<'a>,
}

impl<'a> ScanIter<'a> {
    fn new(stats: &'a IterStats, inner: Box<dyn Iterator<Item = ScanItem> + 'a>) -> Self {
        Self {
            inner,
            _guard: stats.enter(),
        }
    }
}

impl Iterator for ScanIter<'_> {
    type Item = ScanItem;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

/// Puts and deletes applied together.
#[derive(Debug, Default)]
pub struct StorageBatch {
    pub puts: Vec<(Vec<u8>, Vec<u8>)>,
    pub deletes: Vec<Vec<u8>>,
}

impl StorageBatch {
    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty()
    }
}

pub trait RowStorage: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()>;
    fn delete(&self, key: &[u8]) -> anyhow::Result<()>;
    fn apply_batch(&self, batch: StorageBatch) -> anyhow::Result<()>;
    /// Open a scan over `[start, end)`; `end = None` is unbounded.
    fn scan(&self, start: &[u8], end: Option<&[u8]>, reverse: bool)
        -> anyhow::Result<ScanIter<'_>>;
    /// Drop every row this engine holds.
    fn destroy(&self) -> anyhow::Result<()>;
    fn iter_stats(&self) -> &IterStats;
}

fn empty_range(start: &[u8], end: Option<&[u8]>) -> bool {
    end.is_some_and(|end| end <= start)
}

/// In-memory engine for tests and ephemeral clusters.
#[derive(Default)]
pub struct MemoryRowStorage {
    rows: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    stats: IterStats,
}

impl MemoryRowStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RowStorage for MemoryRowStorage {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        rows.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        rows.remove(key);
        Ok(())
    }

    fn apply_batch(&self, batch: StorageBatch) -> anyhow::Result<()> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in batch.puts {
            rows.insert(key, value);
        }
        for key in batch.deletes {
            rows.remove(&key);
        }
        Ok(())
    }

    fn scan(
        &self,
        start: &[u8],
        end: Option<&[u8]>,
        reverse: bool,
    ) -> anyhow::Result<ScanIter<'_>> {
        let mut entries = Vec::new();
        if !empty_range(start, end) {
            let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
            let upper = end.map_or(Bound::Unbounded, |end| Bound::Excluded(end.to_vec()));
            entries = rows
                .range((Bound::Included(start.to_vec()), upper))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Vec<_>>();
        }
        if reverse {
            entries.reverse();
        }
        Ok(ScanIter::new(
            &self.stats,
            Box::new(entries.into_iter().map(Ok)),
        ))
    }

    fn destroy(&self) -> anyhow::Result<()> {
        self.rows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    fn iter_stats(&self) -> &IterStats {
        &self.stats
    }
}

/// Fjall-backed engine: one keyspace partition per tablet.
pub struct FjallRowStorage {
    keyspace: Arc<Keyspace>,
    rows: fjall::PartitionHandle,
    stats: IterStats,
}

impl FjallRowStorage {
    pub fn open(keyspace: Arc<Keyspace>, tablet_id: u64) -> anyhow::Result<Self> {
        let name = format!("tablet_{tablet_id}");
        let rows = keyspace.open_partition(&name, PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            rows,
            stats: IterStats::default(),
        })
    }
}

fn fjall_range(
    rows: &fjall::PartitionHandle,
    start: &[u8],
    end: Option<&[u8]>,
) -> Box<dyn DoubleEndedIterator<Item = fjall::Result<fjall::KvPair>>> {
    let start = start.to_vec();
    match end {
        None => Box::new(rows.range(start..)),
        Some(end) => Box::new(rows.range(start..end.to_vec())),
    }
}

impl RowStorage for FjallRowStorage {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.rows.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        if let Err(err) = self.rows.insert(key, value) {
            warn!(error = ?err, "fjall row write failed");
            return Err(err.into());
        }
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        if let Err(err) = self.rows.remove(key) {
            warn!(error = ?err, "fjall row delete failed");
            return Err(err.into());
        }
        Ok(())
    }

    fn apply_batch(&self, batch: StorageBatch) -> anyhow::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut write = self.keyspace.batch();
        for (key, value) in batch.puts {
            write.insert(&self.rows, key, value);
        }
        for key in batch.deletes {
            write.remove(&self.rows, key);
        }
        if let Err(err) = write.commit() {
            warn!(error = ?err, "fjall row batch write failed");
            return Err(err.into());
        }
        Ok(())
    }

    fn scan(
        &self,
        start: &[u8],
        end: Option<&[u8]>,
        reverse: bool,
    ) -> anyhow::Result<ScanIter<'_>> {
        if empty_range(start, end) {
            return Ok(ScanIter::new(&self.stats, Box::new(std::iter::empty())));
        }
        let range = fjall_range(&self.rows, start, end);
        let ordered: Box<dyn Iterator<Item = fjall::Result<fjall::KvPair>>> = if reverse {
            Box::new(range.rev())
        } else {
            Box::new(range)
        };
        let items = ordered.map(|item| {
            item.map(|(k, v)| (k.to_vec(), v.to_vec()))
                .map_err(anyhow::Error::from)
        });
        Ok(ScanIter::new(&self.stats, Box::new(items)))
    }

    fn destroy(&self) -> anyhow::Result<()> {
        self.keyspace.delete_partition(self.rows.clone())?;
        Ok(())
    }

    fn iter_stats(&self) -> &IterStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(storage: &dyn RowStorage) {
        for key in [b"a", b"b", b"c", b"d"] {
            storage.put(key.as_slice(), b"v").expect("put");
        }
    }

    fn keys(
        storage: &dyn RowStorage,
        start: &[u8],
        end: Option<&[u8]>,
        rev: bool,
    ) -> Vec<Vec<u8>> {
        storage
            .scan(start, end, rev)
            .expect("scan")
            .map(|item| item.expect("item").0)
            .collect()
    }

    #[test]
    fn memory_scan_is_bounded_and_counted() {
        let storage = MemoryRowStorage::new();
        fill(&storage);
        assert_eq!(
            keys(&storage, b"b", Some(b"d".as_slice()), false),
            vec![b"b".to_vec(), b"c".to_vec()]
        );
        assert_eq!(
            keys(&storage, b"b", None, true),
            vec![b"d".to_vec(), b"c".to_vec(), b"b".to_vec()]
        );
        assert!(keys(&storage, b"d", Some(b"b".as_slice()), false).is_empty());
        assert_eq!(storage.iter_stats().opened(), 3);
        assert_eq!(storage.iter_stats().live(), 0);

        let scan = storage.scan(b"", None, false).expect("scan");
        assert_eq!(storage.iter_stats().live(), 1);
        drop(scan);
        assert_eq!(storage.iter_stats().live(), 0);
    }

    #[test]
    fn fjall_storage_round_trips_and_batches() {
        let dir = tempfile::tempdir().expect("temp dir");
        let keyspace = Arc::new(fjall::Config::new(dir.path()).open().expect("open keyspace"));
        let storage = FjallRowStorage::open(keyspace, 7).expect("open storage");
        fill(&storage);
        storage.delete(b"a").expect("delete");
        assert_eq!(storage.get(b"a").expect("get"), None);
        assert_eq!(storage.get(b"b").expect("get"), Some(b"v".to_vec()));

        let mut batch = StorageBatch::default();
        batch.puts.push((b"e".to_vec(), b"w".to_vec()));
        batch.deletes.push(b"b".to_vec());
        storage.apply_batch(batch).expect("batch");
        assert_eq!(
            keys(&storage, b"", None, false),
            vec![b"c".to_vec(), b"d".to_vec(), b"e".to_vec()]
        );
        assert_eq!(keys(&storage, b"", Some(b"d".as_slice()), true), vec![b"c".to_vec()]);
        assert_eq!(storage.iter_stats().opened(), 2);
        assert_eq!(storage.iter_stats().live(), 0);
    }
}
