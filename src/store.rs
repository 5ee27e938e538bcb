//! On-disk hit storage.
//!
//! Layout under the store root:
//!
//! ```text
//! <alignment>/<chrom>.single.hits   single hits sorted by position
//! <alignment>/<chrom>.pleft.hits    paired hits keyed on their left end, left order
//! <alignment>/<chrom>.pright.hits   paired hits keyed on their right end, right order
//! ```
//!
//! Each file is the magic `RDBHITS1` followed by a bincode-encoded hit vector.
//! A file's path relative to the root is its lock key; the alignment name is
//! the lock key for the alignment as a whole. Keys are always acquired
//! alignment-level first, then file-level, each in sorted order.

use crate::error::{ReadDbError, Result};
use crate::hits::{PairedHit, SingleHit};
use crate::locks::LockSet;
use crate::protocol::RegionQuery;
use log::{debug, info};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, PoisonError, RwLock};

const MAGIC: &[u8] = b"RDBHITS1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitFileKind {
    Single,
    PairedLeft,
    PairedRight,
}

impl HitFileKind {
    fn suffix(self) -> &'static str {
        match self {
            HitFileKind::Single => "single",
            HitFileKind::PairedLeft => "pleft",
            HitFileKind::PairedRight => "pright",
        }
    }

    fn from_file_name(name: &str) -> Option<(i32, HitFileKind)> {
        let stem = name.strip_suffix(".hits")?;
        let (chrom, suffix) = stem.rsplit_once('.')?;
        let kind = match suffix {
            "single" => HitFileKind::Single,
            "pleft" => HitFileKind::PairedLeft,
            "pright" => HitFileKind::PairedRight,
            _ => return None,
        };
        Some((chrom.parse().ok()?, kind))
    }
}

/// Lock key of one hit file.
pub fn file_key(alignment: &str, chrom: i32, kind: HitFileKind) -> String {
    format!("{}/{}.{}.hits", alignment, chrom, kind.suffix())
}

/// Alignment ids become directory names, so they are restricted to a safe alphabet.
pub fn validate_alignment_name(alignment: &str) -> Result<()> {
    let valid = !alignment.is_empty()
        && !alignment.starts_with('.')
        && alignment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ReadDbError::Client(format!(
            "invalid alignment id '{}'",
            alignment
        )))
    }
}

fn read_hit_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(ReadDbError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Invalid magic bytes - not a hit file: {}", path.display()),
        )));
    }
    bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard()).map_err(|e| {
        ReadDbError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to decode hit file {}: {e:?}", path.display()),
        ))
    })
}

// Write to a sibling temp file and rename, so readers never see a partial file.
fn write_hit_file<T: Serialize>(path: &Path, hits: &[T]) -> Result<()> {
    let tmp_path = path.with_extension("hits.tmp");
    {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC)?;
        bincode::serde::encode_into_std_write(hits, &mut writer, bincode::config::standard())
            .map_err(|e| {
                ReadDbError::Io(io::Error::other(format!(
                    "Failed to encode hit file {}: {e:?}",
                    path.display()
                )))
            })?;
        writer.flush()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Bounds the decoded hit files kept in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Hits kept decoded per hit type (single, paired). Past this the least
    /// recently used files are dropped; a single larger file is still kept.
    pub max_hits: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_hits: 20_000_000,
        }
    }
}

struct CachedFile<T> {
    hits: Arc<Vec<T>>,
    last_used: AtomicU64,
}

/// Decoded hit files, shared between requests, evicted least recently used
/// first once they hold more than `max_hits` hits.
struct HitCache<T> {
    entries: RwLock<FxHashMap<String, CachedFile<T>>>,
    clock: AtomicU64,
    max_hits: usize,
}

impl<T: DeserializeOwned> HitCache<T> {
    fn new(max_hits: usize) -> Self {
        HitCache {
            entries: RwLock::new(FxHashMap::default()),
            clock: AtomicU64::new(0),
            max_hits,
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, AtomicOrdering::Relaxed)
    }

    /// Callers must hold at least a read lock on `key`.
    fn get_or_load(&self, key: &str, path: &Path) -> Result<Option<Arc<Vec<T>>>> {
        if let Some(entry) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            entry.last_used.store(self.tick(), AtomicOrdering::Relaxed);
            return Ok(Some(Arc::clone(&entry.hits)));
        }
        if !path.exists() {
            return Ok(None);
        }
        let hits = Arc::new(read_hit_file::<T>(path)?);
        debug!("Loaded {} hits from {}", hits.len(), path.display());
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            key.to_string(),
            CachedFile {
                hits: Arc::clone(&hits),
                last_used: AtomicU64::new(self.tick()),
            },
        );
        self.evict(&mut entries, key);
        Ok(Some(hits))
    }

    fn evict(&self, entries: &mut FxHashMap<String, CachedFile<T>>, keep: &str) {
        let mut total: usize = entries.values().map(|e| e.hits.len()).sum();
        while total > self.max_hits {
            let oldest = entries
                .iter()
                .filter(|(key, _)| key.as_str() != keep)
                .min_by_key(|(_, e)| e.last_used.load(AtomicOrdering::Relaxed))
                .map(|(key, _)| key.clone());
            let Some(oldest) = oldest else {
                break;
            };
            if let Some(entry) = entries.remove(&oldest) {
                debug!("Evicted {} ({} hits) from the cache", oldest, entry.hits.len());
                total -= entry.hits.len();
            }
        }
    }

    /// Callers must hold the write lock on `key`.
    fn invalidate(&self, key: &str) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    fn invalidate_prefix(&self, prefix: &str) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|key, _| !key.starts_with(prefix));
    }

    fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn hit_count(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|e| e.hits.len())
            .sum()
    }

    #[cfg(test)]
    fn contains(&self, key: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }
}

/// Per-alignment, per-chromosome hit files with a shared read cache.
pub struct HitStore {
    root: PathBuf,
    single: HitCache<SingleHit>,
    paired: HitCache<PairedHit>,
}

impl HitStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        Self::open_with(root, CacheConfig::default())
    }

    pub fn open_with<P: AsRef<Path>>(root: P, cache: CacheConfig) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        info!(
            "Opened hit store at {} (cache up to {} hits per type)",
            root.display(),
            cache.max_hits
        );
        Ok(HitStore {
            root,
            single: HitCache::new(cache.max_hits),
            paired: HitCache::new(cache.max_hits),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of hit files currently decoded in memory.
    pub fn cached_files(&self) -> usize {
        self.single.len() + self.paired.len()
    }

    /// Number of hits held by the decoded files.
    pub fn cached_hits(&self) -> usize {
        self.single.hit_count() + self.paired.hit_count()
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn alignment_dir(&self, alignment: &str) -> PathBuf {
        self.root.join(alignment)
    }

    pub fn exists(&self, locks: &mut LockSet, alignment: &str) -> Result<bool> {
        validate_alignment_name(alignment)?;
        locks.acquire_read(alignment);
        Ok(self.alignment_dir(alignment).is_dir())
    }

    /// Alignments present in the store, sorted.
    pub fn alignments(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if validate_alignment_name(name).is_ok() {
                        names.push(name.to_string());
                    }
                }
            }
        }
        names.sort();
        Ok(names)
    }

    // Read-lock the alignments in sorted order, failing on unknown ones.
    fn lock_alignments(&self, locks: &mut LockSet, alignments: &[String]) -> Result<Vec<String>> {
        let mut sorted = alignments.to_vec();
        sorted.sort();
        sorted.dedup();
        for alignment in &sorted {
            validate_alignment_name(alignment)?;
            locks.acquire_read(alignment);
            if !self.alignment_dir(alignment).is_dir() {
                return Err(ReadDbError::Client(format!(
                    "unknown alignment '{}'",
                    alignment
                )));
            }
        }
        Ok(sorted)
    }

    fn load_files<T: DeserializeOwned>(
        &self,
        cache: &HitCache<T>,
        locks: &mut LockSet,
        query: &RegionQuery,
        kind: HitFileKind,
    ) -> Result<Vec<Arc<Vec<T>>>> {
        query.validate()?;
        let alignments = self.lock_alignments(locks, &query.alignments)?;
        let mut loaded = Vec::with_capacity(alignments.len());
        for alignment in &alignments {
            let key = file_key(alignment, query.chrom, kind);
            locks.acquire_read(&key);
            if let Some(hits) = cache.get_or_load(&key, &self.path_for(&key))? {
                loaded.push(hits);
            }
        }
        if loaded.is_empty() {
            return Err(ReadDbError::Client(format!(
                "no {} hits on chromosome {} in {}",
                if kind == HitFileKind::Single { "single" } else { "paired" },
                query.chrom,
                alignments.join(",")
            )));
        }
        Ok(loaded)
    }

    pub fn single_hits(&self, locks: &mut LockSet, query: &RegionQuery) -> Result<Vec<SingleHit>> {
        let files = self.load_files(&self.single, locks, query, HitFileKind::Single)?;
        let mut hits = Vec::new();
        for file in &files {
            let lo = file.partition_point(|h| h.pos < query.start);
            let hi = file.partition_point(|h| h.pos <= query.end);
            hits.extend(
                file[lo..hi]
                    .iter()
                    .filter(|h| h.strand.matches(query.strand))
                    .copied(),
            );
        }
        if files.len() > 1 {
            hits.par_sort_by(|a, b| a.cmp_position(b));
        }
        Ok(hits)
    }

    /// Paired hits whose `left_side` (or right side) end lies in the region.
    pub fn paired_hits(
        &self,
        locks: &mut LockSet,
        query: &RegionQuery,
        left_side: bool,
    ) -> Result<Vec<PairedHit>> {
        let kind = if left_side {
            HitFileKind::PairedLeft
        } else {
            HitFileKind::PairedRight
        };
        let files = self.load_files(&self.paired, locks, query, kind)?;
        let mut hits = Vec::new();
        for file in &files {
            let pos = |h: &PairedHit| h.side(left_side).1;
            let lo = file.partition_point(|h| pos(h) < query.start);
            let hi = file.partition_point(|h| pos(h) <= query.end);
            hits.extend(
                file[lo..hi]
                    .iter()
                    .filter(|h| h.side(left_side).2.matches(query.strand))
                    .copied(),
            );
        }
        if files.len() > 1 {
            hits.par_sort_by(|a, b| a.cmp_side(b, left_side));
        }
        Ok(hits)
    }

    pub fn count(&self, locks: &mut LockSet, query: &RegionQuery, paired: bool) -> Result<u64> {
        if paired {
            Ok(self.paired_hits(locks, query, true)?.len() as u64)
        } else {
            Ok(self.single_hits(locks, query)?.len() as u64)
        }
    }

    pub fn weight(&self, locks: &mut LockSet, query: &RegionQuery, paired: bool) -> Result<f64> {
        if paired {
            Ok(self
                .paired_hits(locks, query, true)?
                .iter()
                .map(|h| h.weight as f64)
                .sum())
        } else {
            Ok(self
                .single_hits(locks, query)?
                .iter()
                .map(|h| h.weight as f64)
                .sum())
        }
    }

    /// Chromosomes with single (or paired) hits in `alignment`.
    pub fn chroms(&self, locks: &mut LockSet, alignment: &str, paired: bool) -> Result<Vec<i32>> {
        self.lock_alignments(locks, &[alignment.to_string()])?;
        let mut chroms = Vec::new();
        for entry in fs::read_dir(self.alignment_dir(alignment))? {
            let entry = entry?;
            let name = entry.file_name();
            let Some((chrom, kind)) = name.to_str().and_then(HitFileKind::from_file_name) else {
                continue;
            };
            let wanted = if paired {
                kind == HitFileKind::PairedLeft || kind == HitFileKind::PairedRight
            } else {
                kind == HitFileKind::Single
            };
            if wanted {
                chroms.push(chrom);
            }
        }
        chroms.sort_unstable();
        chroms.dedup();
        Ok(chroms)
    }

    fn check_hit(length: i32, weight: f32) -> Result<()> {
        if length < 1 {
            return Err(ReadDbError::Client(format!(
                "hit length must be positive, got {}",
                length
            )));
        }
        if !(weight > 0.0 && weight <= 1.0) {
            return Err(ReadDbError::Client(format!(
                "hit weight must be in (0, 1], got {}",
                weight
            )));
        }
        Ok(())
    }

    /// Add single hits to `alignment`, creating it if needed. Returns the number added.
    pub fn add_single_hits(
        &self,
        locks: &mut LockSet,
        alignment: &str,
        hits: &[SingleHit],
    ) -> Result<usize> {
        validate_alignment_name(alignment)?;
        for hit in hits {
            Self::check_hit(hit.length, hit.weight)?;
        }
        let mut by_chrom: FxHashMap<i32, Vec<SingleHit>> = FxHashMap::default();
        for hit in hits {
            by_chrom.entry(hit.chrom).or_default().push(*hit);
        }

        locks.acquire_read(alignment);
        fs::create_dir_all(self.alignment_dir(alignment))?;

        let mut chroms: Vec<i32> = by_chrom.keys().copied().collect();
        chroms.sort_unstable();
        for chrom in chroms {
            let key = file_key(alignment, chrom, HitFileKind::Single);
            locks.acquire_write(&key);
            let path = self.path_for(&key);
            let mut merged: Vec<SingleHit> = if path.exists() {
                read_hit_file(&path)?
            } else {
                Vec::new()
            };
            merged.extend(by_chrom.remove(&chrom).unwrap_or_default());
            merged.par_sort_by(|a, b| a.cmp_position(b));
            write_hit_file(&path, &merged)?;
            self.single.invalidate(&key);
            debug!("Wrote {} hits to {}", merged.len(), path.display());
        }
        Ok(hits.len())
    }

    /// Add paired hits; each one is indexed under its left and its right end.
    pub fn add_paired_hits(
        &self,
        locks: &mut LockSet,
        alignment: &str,
        hits: &[PairedHit],
    ) -> Result<usize> {
        validate_alignment_name(alignment)?;
        for hit in hits {
            Self::check_hit(hit.left_len.min(hit.right_len), hit.weight)?;
        }
        let mut by_file: FxHashMap<String, (bool, Vec<PairedHit>)> = FxHashMap::default();
        for hit in hits {
            let hit = hit.normalized();
            by_file
                .entry(file_key(alignment, hit.left_chrom, HitFileKind::PairedLeft))
                .or_insert_with(|| (true, Vec::new()))
                .1
                .push(hit);
            by_file
                .entry(file_key(alignment, hit.right_chrom, HitFileKind::PairedRight))
                .or_insert_with(|| (false, Vec::new()))
                .1
                .push(hit);
        }

        locks.acquire_read(alignment);
        fs::create_dir_all(self.alignment_dir(alignment))?;

        let mut keys: Vec<String> = by_file.keys().cloned().collect();
        keys.sort();
        for key in keys {
            let Some((left_side, new_hits)) = by_file.remove(&key) else {
                continue;
            };
            locks.acquire_write(&key);
            let path = self.path_for(&key);
            let mut merged: Vec<PairedHit> = if path.exists() {
                read_hit_file(&path)?
            } else {
                Vec::new()
            };
            merged.extend(new_hits);
            merged.par_sort_by(|a, b| a.cmp_side(b, left_side));
            write_hit_file(&path, &merged)?;
            self.paired.invalidate(&key);
            debug!("Wrote {} paired hits to {}", merged.len(), path.display());
        }
        Ok(hits.len())
    }

    /// Remove an alignment and all its hit files.
    pub fn delete_alignment(&self, locks: &mut LockSet, alignment: &str) -> Result<()> {
        validate_alignment_name(alignment)?;
        locks.acquire_write(alignment);
        let dir = self.alignment_dir(alignment);
        if !dir.is_dir() {
            return Err(ReadDbError::Client(format!(
                "unknown alignment '{}'",
                alignment
            )));
        }
        let mut keys = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                keys.push(format!("{}/{}", alignment, name));
            }
        }
        keys.sort();
        for key in &keys {
            locks.acquire_write(key);
        }
        fs::remove_dir_all(&dir)?;
        let prefix = format!("{}/", alignment);
        self.single.invalidate_prefix(&prefix);
        self.paired.invalidate_prefix(&prefix);
        info!("Deleted alignment {} ({} files)", alignment, keys.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hits::{Strand, CODE_MATE_PAIR};
    use crate::locks::{LockConfig, LockRegistry};
    use tempfile::TempDir;

    fn hit(chrom: i32, pos: i32, strand: Strand) -> SingleHit {
        SingleHit::new(chrom, pos, strand, 36, 1.0)
    }

    fn query(alignments: &[&str], chrom: i32, start: i32, end: i32) -> RegionQuery {
        RegionQuery::new(
            alignments.iter().map(|s| s.to_string()).collect(),
            chrom,
            start,
            end,
        )
    }

    #[test]
    fn test_add_and_query_single_hits() {
        let dir = TempDir::new().unwrap();
        let store = HitStore::open(dir.path()).unwrap();
        let registry = LockRegistry::new(LockConfig::default());
        let mut locks = registry.lock_set();

        store
            .add_single_hits(
                &mut locks,
                "chipseq1",
                &[hit(1, 300, Strand::Plus), hit(1, 100, Strand::Minus), hit(2, 50, Strand::Plus)],
            )
            .unwrap();
        store
            .add_single_hits(&mut locks, "chipseq1", &[hit(1, 200, Strand::Plus)])
            .unwrap();
        locks.release_all();

        let hits = store.single_hits(&mut locks, &query(&["chipseq1"], 1, 100, 250)).unwrap();
        let positions: Vec<i32> = hits.iter().map(|h| h.pos).collect();
        assert_eq!(positions, vec![100, 200]);

        let plus = store
            .single_hits(
                &mut locks,
                &query(&["chipseq1"], 1, 1, 1000).with_strand(Some(Strand::Plus)),
            )
            .unwrap();
        assert_eq!(plus.len(), 2);
        assert_eq!(store.chroms(&mut locks, "chipseq1", false).unwrap(), vec![1, 2]);
        assert_eq!(store.count(&mut locks, &query(&["chipseq1"], 2, 1, 100), false).unwrap(), 1);
    }

    #[test]
    fn test_multiple_alignments_are_merged_in_order() {
        let dir = TempDir::new().unwrap();
        let store = HitStore::open(dir.path()).unwrap();
        let registry = LockRegistry::new(LockConfig::default());
        let mut locks = registry.lock_set();
        store
            .add_single_hits(&mut locks, "a", &[hit(1, 10, Strand::Plus), hit(1, 30, Strand::Plus)])
            .unwrap();
        store
            .add_single_hits(&mut locks, "b", &[hit(1, 20, Strand::Plus)])
            .unwrap();
        let hits = store.single_hits(&mut locks, &query(&["b", "a"], 1, 1, 100)).unwrap();
        let positions: Vec<i32> = hits.iter().map(|h| h.pos).collect();
        assert_eq!(positions, vec![10, 20, 30]);
    }

    #[test]
    fn test_unknown_alignment_and_empty_chromosome_are_client_errors() {
        let dir = TempDir::new().unwrap();
        let store = HitStore::open(dir.path()).unwrap();
        let registry = LockRegistry::new(LockConfig::default());
        let mut locks = registry.lock_set();
        store
            .add_single_hits(&mut locks, "a", &[hit(1, 10, Strand::Plus)])
            .unwrap();
        assert!(matches!(
            store.single_hits(&mut locks, &query(&["missing"], 1, 1, 100)),
            Err(ReadDbError::Client(_))
        ));
        assert!(matches!(
            store.single_hits(&mut locks, &query(&["a"], 7, 1, 100)),
            Err(ReadDbError::Client(_))
        ));
        // the next query on a populated chromosome still works
        assert_eq!(store.single_hits(&mut locks, &query(&["a"], 1, 1, 100)).unwrap().len(), 1);
        assert!(matches!(
            store.add_single_hits(&mut locks, "../escape", &[hit(1, 10, Strand::Plus)]),
            Err(ReadDbError::Client(_))
        ));
    }

    #[test]
    fn test_paired_hits_by_side() {
        let dir = TempDir::new().unwrap();
        let store = HitStore::open(dir.path()).unwrap();
        let registry = LockRegistry::new(LockConfig::default());
        let mut locks = registry.lock_set();
        let pair = PairedHit {
            left_chrom: 1,
            left_pos: 5000,
            left_strand: Strand::Minus,
            left_len: 36,
            right_chrom: 1,
            right_pos: 1000,
            right_strand: Strand::Plus,
            right_len: 36,
            weight: 1.0,
            code: CODE_MATE_PAIR,
        };
        store.add_paired_hits(&mut locks, "pe", &[pair]).unwrap();

        // stored normalized: the lower coordinate end is the left end
        let left = store.paired_hits(&mut locks, &query(&["pe"], 1, 900, 1100), true).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].left_pos, 1000);
        let right = store.paired_hits(&mut locks, &query(&["pe"], 1, 4900, 5100), false).unwrap();
        assert_eq!(right.len(), 1);
        assert!(store
            .paired_hits(&mut locks, &query(&["pe"], 1, 4900, 5100), true)
            .unwrap()
            .is_empty());
        assert_eq!(store.chroms(&mut locks, "pe", true).unwrap(), vec![1]);
    }

    #[test]
    fn test_cache_invalidated_on_write_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = HitStore::open(dir.path()).unwrap();
        let registry = LockRegistry::new(LockConfig::default());
        let mut locks = registry.lock_set();
        store
            .add_single_hits(&mut locks, "a", &[hit(1, 10, Strand::Plus)])
            .unwrap();
        assert_eq!(store.single_hits(&mut locks, &query(&["a"], 1, 1, 100)).unwrap().len(), 1);
        assert_eq!(store.cached_files(), 1);
        store
            .add_single_hits(&mut locks, "a", &[hit(1, 20, Strand::Plus)])
            .unwrap();
        assert_eq!(store.single_hits(&mut locks, &query(&["a"], 1, 1, 100)).unwrap().len(), 2);

        store.delete_alignment(&mut locks, "a").unwrap();
        assert!(!store.exists(&mut locks, "a").unwrap());
        assert_eq!(store.cached_files(), 0);
        assert!(store.delete_alignment(&mut locks, "a").is_err());
    }

    #[test]
    fn test_cache_evicts_least_recently_used() {
        let dir = TempDir::new().unwrap();
        let store = HitStore::open_with(dir.path(), CacheConfig { max_hits: 3 }).unwrap();
        let registry = LockRegistry::new(LockConfig::default());
        let mut locks = registry.lock_set();
        store
            .add_single_hits(
                &mut locks,
                "a",
                &[
                    hit(1, 10, Strand::Plus),
                    hit(1, 20, Strand::Plus),
                    hit(2, 10, Strand::Plus),
                    hit(3, 10, Strand::Plus),
                ],
            )
            .unwrap();
        locks.release_all();
        let key = |chrom| file_key("a", chrom, HitFileKind::Single);
        let mut load = |chrom| {
            let hits = store.single_hits(&mut locks, &query(&["a"], chrom, 1, 100)).unwrap();
            locks.release_all();
            hits.len()
        };

        assert_eq!(load(1), 2);
        assert_eq!(load(2), 1);
        assert_eq!(store.cached_hits(), 3);
        // chrom 3 pushes the cache over budget and evicts chrom 1
        assert_eq!(load(3), 1);
        assert!(!store.single.contains(&key(1)));
        assert_eq!(store.cached_files(), 2);
        // touch chrom 2 so chrom 3 is the oldest when chrom 1 comes back
        assert_eq!(load(2), 1);
        assert_eq!(load(1), 2);
        assert!(store.single.contains(&key(1)));
        assert!(store.single.contains(&key(2)));
        assert!(!store.single.contains(&key(3)));
        assert_eq!(store.cached_hits(), 3);
    }

    #[test]
    fn test_cache_keeps_a_file_larger_than_the_budget() {
        let dir = TempDir::new().unwrap();
        let store = HitStore::open_with(dir.path(), CacheConfig { max_hits: 1 }).unwrap();
        let registry = LockRegistry::new(LockConfig::default());
        let mut locks = registry.lock_set();
        store
            .add_single_hits(&mut locks, "a", &[hit(1, 10, Strand::Plus), hit(1, 20, Strand::Plus)])
            .unwrap();
        assert_eq!(store.single_hits(&mut locks, &query(&["a"], 1, 1, 100)).unwrap().len(), 2);
        assert_eq!(store.cached_files(), 1);
    }

    #[test]
    fn test_file_name_parsing() {
        assert_eq!(
            HitFileKind::from_file_name("12.pleft.hits"),
            Some((12, HitFileKind::PairedLeft))
        );
        assert_eq!(HitFileKind::from_file_name("12.single.hits.tmp"), None);
        assert_eq!(HitFileKind::from_file_name("notes.txt"), None);
    }
}
