//! Named read/write locks.
//!
//! One lock per resource key (the relative path of an alignment file). The
//! registry owns every lock; request handlers hold them through a [`LockSet`]
//! which remembers what it acquired and releases everything on
//! [`LockSet::release_all`] or when dropped.

use log::debug;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Lock table cleanup thresholds. Cleanup only bounds memory; correctness
/// never depends on it.
#[derive(Debug, Clone, Copy)]
pub struct LockConfig {
    /// Consider a cleanup every this many acquisitions (0 disables cleanup).
    pub gc_interval: usize,
    /// Only clean up once the table holds more entries than this.
    pub gc_threshold: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            gc_interval: 1000,
            gc_threshold: 10000,
        }
    }
}

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
    waiting_writers: usize,
}

/// A read/write lock whose holds are not tied to a stack frame.
#[derive(Debug, Default)]
pub struct ResourceLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl ResourceLock {
    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, LockState>) -> MutexGuard<'a, LockState> {
        self.released
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_read(&self) {
        let mut state = self.state();
        // queued writers go first so a steady stream of readers cannot starve them
        while state.writer || state.waiting_writers > 0 {
            state = self.wait(state);
        }
        state.readers += 1;
    }

    fn lock_write(&self) {
        let mut state = self.state();
        state.waiting_writers += 1;
        while state.writer || state.readers > 0 {
            state = self.wait(state);
        }
        state.waiting_writers -= 1;
        state.writer = true;
    }

    fn unlock_read(&self) {
        let mut state = self.state();
        state.readers = state.readers.saturating_sub(1);
        if state.readers == 0 {
            self.released.notify_all();
        }
    }

    fn unlock_write(&self) {
        let mut state = self.state();
        state.writer = false;
        self.released.notify_all();
    }

    pub fn readers(&self) -> usize {
        self.state().readers
    }

    pub fn is_write_locked(&self) -> bool {
        self.state().writer
    }

    fn is_idle(&self) -> bool {
        let state = self.state();
        state.readers == 0 && !state.writer && state.waiting_writers == 0
    }
}

/// Process-wide table of named locks. Built once at server start and shared
/// by `Arc`.
#[derive(Debug)]
pub struct LockRegistry {
    table: Mutex<FxHashMap<String, Arc<ResourceLock>>>,
    acquisitions: AtomicUsize,
    config: LockConfig,
}

impl LockRegistry {
    pub fn new(config: LockConfig) -> Arc<Self> {
        Arc::new(LockRegistry {
            table: Mutex::new(FxHashMap::default()),
            acquisitions: AtomicUsize::new(0),
            config,
        })
    }

    /// Start an empty per-request lock set.
    pub fn lock_set(self: &Arc<Self>) -> LockSet {
        LockSet {
            registry: Arc::clone(self),
            held: FxHashMap::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    fn table(&self) -> MutexGuard<'_, FxHashMap<String, Arc<ResourceLock>>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, key: &str) -> Arc<ResourceLock> {
        let mut table = self.table();
        let lock = match table.get(key) {
            Some(lock) => Arc::clone(lock),
            None => {
                let lock = Arc::new(ResourceLock::default());
                table.insert(key.to_string(), Arc::clone(&lock));
                lock
            }
        };

        let count = self.acquisitions.fetch_add(1, Ordering::Relaxed) + 1;
        if self.config.gc_interval > 0
            && count % self.config.gc_interval == 0
            && table.len() > self.config.gc_threshold
        {
            let removed = Self::sweep(&mut table);
            debug!(
                "Lock table cleanup removed {} idle entries, {} remain",
                removed,
                table.len()
            );
        }
        lock
    }

    /// Remove every idle entry now, regardless of the configured thresholds.
    pub fn collect_garbage(&self) -> usize {
        Self::sweep(&mut self.table())
    }

    // An entry is removable when nobody holds it and nobody has a handle to it.
    // Handles are only created under the table mutex, so the strong count
    // cannot grow while we sweep.
    fn sweep(table: &mut FxHashMap<String, Arc<ResourceLock>>) -> usize {
        let before = table.len();
        table.retain(|_, lock| Arc::strong_count(lock) > 1 || !lock.is_idle());
        before - table.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Debug)]
struct Hold {
    lock: Arc<ResourceLock>,
    mode: LockMode,
    count: usize,
}

/// The locks one unit of work holds. Reentrant per key.
#[derive(Debug)]
pub struct LockSet {
    registry: Arc<LockRegistry>,
    held: FxHashMap<String, Hold>,
}

impl LockSet {
    /// Block until `key` is held shared. Holding the write lock already
    /// covers reads.
    pub fn acquire_read(&mut self, key: &str) {
        if let Some(hold) = self.held.get_mut(key) {
            hold.count += 1;
            return;
        }
        let lock = self.registry.handle(key);
        lock.lock_read();
        self.held.insert(
            key.to_string(),
            Hold {
                lock,
                mode: LockMode::Read,
                count: 1,
            },
        );
    }

    /// Block until `key` is held exclusively. A read hold on the same key is
    /// released first; upgrading in place would deadlock against itself.
    pub fn acquire_write(&mut self, key: &str) {
        if let Some(hold) = self.held.get_mut(key) {
            if hold.mode == LockMode::Write {
                hold.count += 1;
                return;
            }
            hold.lock.unlock_read();
            hold.lock.lock_write();
            hold.mode = LockMode::Write;
            hold.count += 1;
            return;
        }
        let lock = self.registry.handle(key);
        lock.lock_write();
        self.held.insert(
            key.to_string(),
            Hold {
                lock,
                mode: LockMode::Write,
                count: 1,
            },
        );
    }

    /// Release every lock in the set. Safe to call when nothing is held.
    pub fn release_all(&mut self) {
        for (_, hold) in self.held.drain() {
            match hold.mode {
                LockMode::Read => hold.lock.unlock_read(),
                LockMode::Write => hold.lock.unlock_write(),
            }
        }
    }

    pub fn mode(&self, key: &str) -> Option<LockMode> {
        self.held.get(key).map(|hold| hold.mode)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_concurrent_readers_do_not_block() {
        let registry = LockRegistry::new(LockConfig::default());
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let mut set = registry.lock_set();
                    set.acquire_read("align1/1.single.hits");
                    // every reader must get here while all of them hold the lock
                    barrier.wait();
                    set.release_all();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_writer_waits_for_readers() {
        let registry = LockRegistry::new(LockConfig::default());
        let mut reader = registry.lock_set();
        reader.acquire_read("key");

        let acquired = Arc::new(AtomicBool::new(false));
        let writer = {
            let registry = Arc::clone(&registry);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let mut set = registry.lock_set();
                set.acquire_write("key");
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!acquired.load(Ordering::SeqCst));
        reader.release_all();
        writer.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_read_then_write_in_same_set() {
        let registry = LockRegistry::new(LockConfig::default());
        let mut set = registry.lock_set();
        set.acquire_read("key");
        set.acquire_read("key");
        set.acquire_write("key");
        assert_eq!(set.mode("key"), Some(LockMode::Write));
        // reads under a write hold are reentrant
        set.acquire_read("key");
        assert_eq!(set.mode("key"), Some(LockMode::Write));
        set.release_all();
        assert!(set.is_empty());

        let mut other = registry.lock_set();
        other.acquire_write("key");
        other.release_all();
    }

    #[test]
    fn test_release_all_without_locks_is_noop() {
        let registry = LockRegistry::new(LockConfig::default());
        let mut set = registry.lock_set();
        set.release_all();
        set.release_all();
        assert!(set.is_empty());
    }

    #[test]
    fn test_drop_releases() {
        let registry = LockRegistry::new(LockConfig::default());
        {
            let mut set = registry.lock_set();
            set.acquire_write("key");
        }
        let mut set = registry.lock_set();
        set.acquire_write("key");
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_garbage_collection_keeps_held_locks() {
        let registry = LockRegistry::new(LockConfig {
            gc_interval: 1,
            gc_threshold: 3,
        });
        let mut keeper = registry.lock_set();
        keeper.acquire_read("held");
        for i in 0..10 {
            let mut set = registry.lock_set();
            set.acquire_read(&format!("key{}", i));
        }
        // sweeps run whenever the table passes the threshold
        assert!(registry.len() <= 4);
        registry.collect_garbage();
        assert_eq!(registry.len(), 1);
        keeper.release_all();
        registry.collect_garbage();
        assert!(registry.is_empty());
    }
}
