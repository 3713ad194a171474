//! Disk tier
//!
//! Persistent tier: each entry is one bincode-encoded file in the
//! persistence directory, named by a monotonic file sequence. An
//! in-memory index maps keys to their files and is rebuilt by scanning
//! the directory on open, so resident entries survive a process restart.

use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

use crate::cache::accounting::PoolAccountant;
use crate::cache::codec;
use crate::cache::error::CacheError;
use crate::cache::traits::{CacheKey, CacheValue};

use super::{EvictionCandidate, PutMode, Removed, TierHit, TierId, TierStore, next_tick};

const ENTRY_EXTENSION: &str = "ent";

#[derive(Serialize, Deserialize)]
#[serde(bound = "K: Serialize + serde::de::DeserializeOwned, V: Serialize + serde::de::DeserializeOwned")]
struct DiskRecord<K, V> {
    key: K,
    value: V,
    created_at: u64,
}

struct DiskSlot {
    file_seq: u64,
    cost: u64,
    created_at: u64,
    last_access: AtomicU64,
    insert_seq: u64,
}

/// File-backed persistent tier.
pub struct DiskTier<K, V> {
    dir: PathBuf,
    index: DashMap<K, DiskSlot>,
    file_seq: AtomicU64,
    accountant: Arc<PoolAccountant>,
    _value: PhantomData<fn() -> V>,
}

impl<K: CacheKey, V: CacheValue> DiskTier<K, V> {
    /// Open the tier over `dir`, creating the directory if needed and
    /// re-indexing any entries left by a previous run. Restored usage is
    /// force-reserved; the coordinator shrinks back to capacity after
    /// build.
    pub fn open(dir: &Path, accountant: Arc<PoolAccountant>) -> Result<Self, CacheError> {
        fs::create_dir_all(dir)?;
        let index: DashMap<K, DiskSlot> = DashMap::new();
        let mut max_seq = 0u64;
        for dirent in fs::read_dir(dir)? {
            let path = dirent?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            let Some(seq) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| u64::from_str_radix(s, 16).ok())
            else {
                continue;
            };
            let bytes = fs::read(&path)?;
            let record: DiskRecord<K, V> = match codec::decode(&bytes) {
                Ok(record) => record,
                Err(err) => {
                    log::warn!("skipping unreadable disk entry {}: {}", path.display(), err);
                    continue;
                }
            };
            max_seq = max_seq.max(seq);
            let cost = bytes.len() as u64;
            let tick = next_tick();
            let slot = DiskSlot {
                file_seq: seq,
                cost,
                created_at: record.created_at,
                last_access: AtomicU64::new(tick),
                insert_seq: tick,
            };
            accountant.force_reserve(TierId::Disk, cost);
            let key = record.key.clone();
            if let Some(stale) = index.insert(key.clone(), slot) {
                // Crash between write and cleanup can leave two files for
                // one key; the higher sequence is authoritative.
                let dead_seq = if seq > stale.file_seq {
                    accountant.release(TierId::Disk, stale.cost);
                    stale.file_seq
                } else {
                    accountant.release(TierId::Disk, cost);
                    index.insert(key, stale);
                    seq
                };
                let dead = dir.join(format!("{:016x}.{}", dead_seq, ENTRY_EXTENSION));
                if let Err(err) = fs::remove_file(&dead) {
                    log::warn!("failed to prune stale disk entry {}: {}", dead.display(), err);
                }
            }
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            index,
            file_seq: AtomicU64::new(max_seq),
            accountant,
            _value: PhantomData,
        })
    }

    fn entry_path(&self, file_seq: u64) -> PathBuf {
        self.dir.join(format!("{:016x}.{}", file_seq, ENTRY_EXTENSION))
    }

    fn next_file_seq(&self) -> u64 {
        self.file_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn read_record(&self, file_seq: u64) -> Result<DiskRecord<K, V>, CacheError> {
        let bytes = fs::read(self.entry_path(file_seq))?;
        codec::decode(&bytes)
    }
}

impl<K: CacheKey, V: CacheValue> TierStore<K, V> for DiskTier<K, V> {
    fn id(&self) -> TierId {
        TierId::Disk
    }

    fn get(&self, key: &K) -> Result<Option<TierHit<V>>, CacheError> {
        match self.index.get(key) {
            Some(slot) => {
                let record = self.read_record(slot.file_seq)?;
                slot.last_access.store(next_tick(), Ordering::Relaxed);
                Ok(Some(TierHit {
                    value: record.value,
                    created_at: slot.created_at,
                }))
            }
            None => Ok(None),
        }
    }

    fn peek(&self, key: &K) -> Result<Option<V>, CacheError> {
        match self.index.get(key) {
            Some(slot) => Ok(Some(self.read_record(slot.file_seq)?.value)),
            None => Ok(None),
        }
    }

    fn put(
        &self,
        key: K,
        value: V,
        created_at: u64,
        mode: PutMode,
    ) -> Result<Option<V>, CacheError> {
        let record = DiskRecord {
            key: key.clone(),
            value,
            created_at,
        };
        let bytes = codec::encode(&record)?;
        let cost = bytes.len() as u64;
        match self.index.entry(key) {
            Entry::Occupied(mut occupied) => {
                let old_cost = occupied.get().cost;
                if cost > old_cost {
                    let delta = cost - old_cost;
                    match mode {
                        PutMode::Admit => {
                            if !self.accountant.try_reserve(TierId::Disk, delta) {
                                return Err(CacheError::admission_denied(TierId::Disk.as_str()));
                            }
                        }
                        PutMode::Force => self.accountant.force_reserve(TierId::Disk, delta),
                    }
                } else {
                    self.accountant.release(TierId::Disk, old_cost - cost);
                }
                let old_seq = occupied.get().file_seq;
                let previous = self.read_record(old_seq).ok().map(|r| r.value);
                let new_seq = self.next_file_seq();
                if let Err(err) = fs::write(self.entry_path(new_seq), &bytes) {
                    // Unwind the accounting adjustment; the old entry stays.
                    if cost > old_cost {
                        self.accountant.release(TierId::Disk, cost - old_cost);
                    } else {
                        self.accountant.force_reserve(TierId::Disk, old_cost - cost);
                    }
                    return Err(err.into());
                }
                let tick = next_tick();
                *occupied.get_mut() = DiskSlot {
                    file_seq: new_seq,
                    cost,
                    created_at,
                    last_access: AtomicU64::new(tick),
                    insert_seq: tick,
                };
                let old_path = self.entry_path(old_seq);
                if let Err(err) = fs::remove_file(&old_path) {
                    log::warn!("failed to remove superseded disk entry {}: {}", old_path.display(), err);
                }
                Ok(previous)
            }
            Entry::Vacant(vacant) => {
                match mode {
                    PutMode::Admit => {
                        if !self.accountant.try_reserve(TierId::Disk, cost) {
                            return Err(CacheError::admission_denied(TierId::Disk.as_str()));
                        }
                    }
                    PutMode::Force => self.accountant.force_reserve(TierId::Disk, cost),
                }
                let file_seq = self.next_file_seq();
                if let Err(err) = fs::write(self.entry_path(file_seq), &bytes) {
                    self.accountant.release(TierId::Disk, cost);
                    return Err(err.into());
                }
                let tick = next_tick();
                vacant.insert(DiskSlot {
                    file_seq,
                    cost,
                    created_at,
                    last_access: AtomicU64::new(tick),
                    insert_seq: tick,
                });
                Ok(None)
            }
        }
    }

    fn remove(&self, key: &K) -> Result<Option<Removed<V>>, CacheError> {
        match self.index.remove(key) {
            Some((_, slot)) => {
                self.accountant.release(TierId::Disk, slot.cost);
                // Read before delete, but delete regardless: a corrupt or
                // missing file must not stay behind as an orphan.
                let record = self.read_record(slot.file_seq);
                let path = self.entry_path(slot.file_seq);
                if let Err(err) = fs::remove_file(&path) {
                    log::warn!("failed to remove disk entry {}: {}", path.display(), err);
                }
                Ok(Some(Removed {
                    value: record?.value,
                    created_at: slot.created_at,
                }))
            }
            None => Ok(None),
        }
    }

    fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    fn created_at(&self, key: &K) -> Option<u64> {
        self.index.get(key).map(|slot| slot.created_at)
    }

    fn candidates(&self) -> Vec<EvictionCandidate<K>> {
        self.index
            .iter()
            .map(|entry| EvictionCandidate {
                key: entry.key().clone(),
                last_access: entry.last_access.load(Ordering::Relaxed),
                insert_seq: entry.insert_seq,
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn clear(&self) {
        let mut released = 0u64;
        let mut dead_files = Vec::new();
        self.index.retain(|_, slot| {
            released += slot.cost;
            dead_files.push(slot.file_seq);
            false
        });
        self.accountant.release(TierId::Disk, released);
        for file_seq in dead_files {
            let path = self.entry_path(file_seq);
            if let Err(err) = fs::remove_file(&path) {
                log::warn!("failed to remove disk entry {}: {}", path.display(), err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::accounting::ResourceUnit;

    fn accountant(capacity: u64) -> Arc<PoolAccountant> {
        Arc::new(PoolAccountant::new(&[(
            TierId::Disk,
            ResourceUnit::Bytes,
            capacity,
        )]))
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let acct = accountant(4096);
        {
            let tier: DiskTier<u64, String> = DiskTier::open(dir.path(), acct.clone()).unwrap();
            tier.put(1, "persisted".to_string(), 7, PutMode::Admit)
                .unwrap();
        }
        let reopened_acct = accountant(4096);
        let tier: DiskTier<u64, String> =
            DiskTier::open(dir.path(), reopened_acct.clone()).unwrap();
        let hit = tier.get(&1).unwrap().unwrap();
        assert_eq!(hit.value, "persisted");
        assert_eq!(hit.created_at, 7);
        assert!(reopened_acct.usage(TierId::Disk) > 0);
    }

    #[test]
    fn replacement_swaps_the_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let tier: DiskTier<u64, String> = DiskTier::open(dir.path(), accountant(4096)).unwrap();
        tier.put(1, "first".to_string(), 0, PutMode::Admit).unwrap();
        let previous = tier.put(1, "second".to_string(), 0, PutMode::Admit).unwrap();
        assert_eq!(previous.as_deref(), Some("first"));
        assert_eq!(tier.get(&1).unwrap().unwrap().value, "second");
        let files = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 1);
    }

    #[test]
    fn remove_deletes_the_file_and_releases_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let acct = accountant(4096);
        let tier: DiskTier<u64, String> = DiskTier::open(dir.path(), acct.clone()).unwrap();
        tier.put(1, "gone soon".to_string(), 0, PutMode::Admit)
            .unwrap();
        let removed = tier.remove(&1).unwrap().unwrap();
        assert_eq!(removed.value, "gone soon");
        assert_eq!(acct.usage(TierId::Disk), 0);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn remove_with_a_missing_file_still_releases_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        let acct = accountant(4096);
        let tier: DiskTier<u64, String> = DiskTier::open(dir.path(), acct.clone()).unwrap();
        tier.put(1, "vanishing".to_string(), 0, PutMode::Admit)
            .unwrap();
        // External tampering: the backing file disappears under us.
        for dirent in fs::read_dir(dir.path()).unwrap() {
            fs::remove_file(dirent.unwrap().path()).unwrap();
        }
        let err = tier.remove(&1).unwrap_err();
        assert!(matches!(err, CacheError::Io(_)));
        // The slot and its reserved bytes are gone regardless.
        assert_eq!(tier.len(), 0);
        assert_eq!(acct.usage(TierId::Disk), 0);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn clear_empties_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let acct = accountant(4096);
        let tier: DiskTier<u64, String> = DiskTier::open(dir.path(), acct.clone()).unwrap();
        for i in 0..5u64 {
            tier.put(i, format!("value-{}", i), 0, PutMode::Admit)
                .unwrap();
        }
        tier.clear();
        assert_eq!(tier.len(), 0);
        assert_eq!(acct.usage(TierId::Disk), 0);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
