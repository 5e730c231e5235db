//! Generic fixed-capacity, reference-counted object cache.
//!
//! A cache is an arena of `N` slots ("slabs") plus one bookkeeping table
//! guarded by a single lock. Slots are keyed by a caller-defined integer id
//! (a block address, an inode number). What a slab holds and how it moves
//! to and from the backing store is decided by a [`CacheStrategy`].
//!
//! Invariants:
//! - a valid id occupies at most one slot;
//! - a slot with a non-zero reference count is never evicted;
//! - a dirty slot is synced through the strategy before it is reused.
//!
//! Lock order: the bookkeeping lock may wait on a slot's data lock, so code
//! holding a slot's data (inside [`CacheRef::read`] / [`CacheRef::modify`])
//! must never call back into the *same* cache.

use alloc::vec::Vec;
use core::mem::ManuallyDrop;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, RwLock};

use crate::error::{FileSystemError, FsResult};

/// Moves slab contents between a cache and whatever backs it.
pub trait CacheStrategy: Send + Sync {
    type Slab: Send + Sync;
    /// Structural lookup key accepted by [`Cache::query`].
    type Query: ?Sized;

    fn new_slab(&self) -> Self::Slab;

    /// Put a slab back into its pristine (zeroed) state.
    fn reset(&self, slab: &mut Self::Slab);

    /// Load `id` from the backing store. An error leaves the slot unused.
    fn populate(&self, id: u32, slab: &mut Self::Slab) -> FsResult<()>;

    /// Write a dirty slab back.
    fn sync(&self, id: u32, slab: &Self::Slab) -> FsResult<()>;

    /// Called after the final sync when `id` leaves the cache.
    fn eject(&self, _id: u32, _slab: &mut Self::Slab) -> FsResult<()> {
        Ok(())
    }

    /// Does `slab` (holding `id`) answer `query`?
    fn query(&self, _query: &Self::Query, _id: u32, _slab: &Self::Slab) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SlotMeta {
    id: u32,
    refs: usize,
    valid: bool,
    /// Drop the entry as soon as it is fully dereferenced.
    clobber: bool,
}

struct Slot<T> {
    data: RwLock<T>,
    dirty: AtomicBool,
}

struct CacheCtrl {
    meta: Vec<SlotMeta>,
    /// Next slot the victim search starts from.
    clock: usize,
    hits: u64,
    misses: u64,
}

impl CacheCtrl {
    fn find(&self, id: u32) -> Option<usize> {
        self.meta.iter().position(|m| m.valid && m.id == id)
    }
}

/// What `cache_dump` used to print.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub capacity: usize,
    /// Valid and referenced.
    pub allocated: usize,
    /// Valid but unreferenced.
    pub stale: usize,
    pub unused: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Handle to a slot that is kept alive without a borrow, e.g. by an open
/// file. Obtained from [`CacheRef::into_raw`]; every raw slot must be given
/// back with [`Cache::release_raw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSlot {
    index: usize,
    id: u32,
}

impl RawSlot {
    pub fn id(&self) -> u32 {
        self.id
    }
}

pub struct Cache<S: CacheStrategy> {
    name: &'static str,
    strategy: S,
    ctrl: Mutex<CacheCtrl>,
    slots: Vec<Slot<S::Slab>>,
}

impl<S: CacheStrategy> Cache<S> {
    pub fn new(name: &'static str, capacity: usize, strategy: S) -> FsResult<Self> {
        if capacity == 0 {
            return Err(FileSystemError::InvalidArgument);
        }
        let slots = (0..capacity)
            .map(|_| Slot {
                data: RwLock::new(strategy.new_slab()),
                dirty: AtomicBool::new(false),
            })
            .collect();
        Ok(Self {
            name,
            strategy,
            ctrl: Mutex::new(CacheCtrl {
                meta: alloc::vec![SlotMeta::default(); capacity],
                clock: 0,
                hits: 0,
                misses: 0,
            }),
            slots,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Reference `id`, loading it through the strategy on a miss.
    pub fn reference(&self, id: u32) -> FsResult<CacheRef<'_, S>> {
        let mut ctrl = self.ctrl.lock();
        if let Some(index) = ctrl.find(id) {
            ctrl.meta[index].refs += 1;
            ctrl.hits += 1;
            return Ok(CacheRef { cache: self, index });
        }
        ctrl.misses += 1;
        let index = self.alloc_nolock(&mut ctrl, id)?;
        let loaded = {
            let mut data = self.slots[index].data.write();
            self.strategy.populate(id, &mut data)
        };
        if let Err(e) = loaded {
            ctrl.meta[index] = SlotMeta::default();
            return Err(e);
        }
        self.slots[index].dirty.store(false, Ordering::Release);
        Ok(CacheRef { cache: self, index })
    }

    /// Reference `id` for a complete overwrite: nothing is read from the
    /// backing store and the slab is reset and marked dirty.
    pub fn add_reference(&self, id: u32) -> FsResult<CacheRef<'_, S>> {
        let mut ctrl = self.ctrl.lock();
        let index = match ctrl.find(id) {
            Some(index) => {
                ctrl.meta[index].refs += 1;
                index
            }
            None => self.alloc_nolock(&mut ctrl, id)?,
        };
        self.strategy.reset(&mut self.slots[index].data.write());
        self.slots[index].dirty.store(true, Ordering::Release);
        Ok(CacheRef { cache: self, index })
    }

    /// Look at `id` without taking a reference. The closure runs under the
    /// cache lock, so nothing it sees can outlive the call.
    pub fn soft_search<V>(&self, id: u32, f: impl FnOnce(&S::Slab) -> V) -> Option<V> {
        let ctrl = self.ctrl.lock();
        let index = ctrl.find(id)?;
        let data = self.slots[index].data.read();
        Some(f(&data))
    }

    /// Find a cached entry through the strategy's structural match and
    /// reference it.
    pub fn query(&self, query: &S::Query) -> Option<CacheRef<'_, S>> {
        let mut ctrl = self.ctrl.lock();
        let index = (0..self.slots.len()).find(|&i| {
            let meta = ctrl.meta[i];
            meta.valid && self.strategy.query(query, meta.id, &self.slots[i].data.read())
        })?;
        ctrl.meta[index].refs += 1;
        ctrl.hits += 1;
        Some(CacheRef { cache: self, index })
    }

    /// Current reference count of `id`, `None` if it is not cached.
    pub fn count_refs(&self, id: u32) -> Option<usize> {
        let ctrl = self.ctrl.lock();
        ctrl.find(id).map(|i| ctrl.meta[i].refs)
    }

    /// Warm the cache with `id` without keeping it referenced.
    pub fn prepare(&self, id: u32) -> FsResult<()> {
        self.reference(id).map(|r| {
            r.release();
        })
    }

    /// Write `id` back if it is cached and dirty.
    pub fn sync(&self, id: u32) -> FsResult<()> {
        let ctrl = self.ctrl.lock();
        match ctrl.find(id) {
            Some(index) => self.sync_slot(index, id),
            None => Ok(()),
        }
    }

    /// Write every dirty slot back. Keeps going after a failure and reports
    /// the first one.
    pub fn sync_all(&self) -> FsResult<()> {
        let ctrl = self.ctrl.lock();
        let mut result = Ok(());
        for (index, meta) in ctrl.meta.iter().enumerate() {
            if !meta.valid {
                continue;
            }
            if let Err(e) = self.sync_slot(index, meta.id) {
                log::error!("{} cache: sync of {} failed: {}", self.name, meta.id, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Sync and drop every unreferenced entry.
    pub fn clean(&self) -> FsResult<()> {
        let mut ctrl = self.ctrl.lock();
        for index in 0..self.slots.len() {
            let meta = ctrl.meta[index];
            if meta.valid && meta.refs == 0 {
                self.evict_slot(index, meta.id)?;
                ctrl.meta[index] = SlotMeta::default();
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let ctrl = self.ctrl.lock();
        let mut stats = CacheStats {
            capacity: self.slots.len(),
            hits: ctrl.hits,
            misses: ctrl.misses,
            ..CacheStats::default()
        };
        for meta in &ctrl.meta {
            match (meta.valid, meta.refs) {
                (false, _) => stats.unused += 1,
                (true, 0) => stats.stale += 1,
                (true, _) => stats.allocated += 1,
            }
        }
        stats
    }

    /// Log the slot table and hit rate.
    pub fn dump(&self) {
        let stats = self.stats();
        {
            let ctrl = self.ctrl.lock();
            for meta in ctrl.meta.iter().filter(|m| m.valid) {
                log::debug!("{} cache: {} has {} references", self.name, meta.id, meta.refs);
            }
        }
        let total = (stats.hits + stats.misses).max(1);
        log::info!(
            "{} cache: allocated {} stale {} unused {} hits {} misses {} ({}% hit)",
            self.name,
            stats.allocated,
            stats.stale,
            stats.unused,
            stats.hits,
            stats.misses,
            stats.hits * 100 / total
        );
    }

    /// Re-reference a slot pinned by [`CacheRef::into_raw`].
    pub fn reference_raw(&self, raw: &RawSlot) -> FsResult<CacheRef<'_, S>> {
        let mut ctrl = self.ctrl.lock();
        let meta = ctrl.meta.get_mut(raw.index).ok_or(FileSystemError::InvalidArgument)?;
        if !meta.valid || meta.id != raw.id || meta.refs == 0 {
            return Err(FileSystemError::InvalidArgument);
        }
        meta.refs += 1;
        Ok(CacheRef { cache: self, index: raw.index })
    }

    /// Drop the pin held by `raw`. Returns the remaining reference count.
    pub fn release_raw(&self, raw: RawSlot) -> FsResult<usize> {
        {
            let ctrl = self.ctrl.lock();
            let meta = ctrl.meta.get(raw.index).ok_or(FileSystemError::InvalidArgument)?;
            if !meta.valid || meta.id != raw.id || meta.refs == 0 {
                return Err(FileSystemError::InvalidArgument);
            }
        }
        Ok(self.dereference(raw.index))
    }

    /// Pick a victim slot for `id` and claim it with one reference.
    fn alloc_nolock(&self, ctrl: &mut CacheCtrl, id: u32) -> FsResult<usize> {
        let count = self.slots.len();
        let start = if ctrl.clock >= count { 0 } else { ctrl.clock };
        let victim = (0..count)
            .map(|step| (start + step) % count)
            .find(|&i| ctrl.meta[i].refs == 0);
        let Some(index) = victim else {
            log::warn!("{} cache: no room for {}", self.name, id);
            return Err(FileSystemError::CacheExhausted);
        };
        ctrl.clock = index + 1;

        let old = ctrl.meta[index];
        if old.valid {
            self.evict_slot(index, old.id)?;
        }
        ctrl.meta[index] = SlotMeta {
            id,
            refs: 1,
            valid: true,
            clobber: false,
        };
        Ok(index)
    }

    fn sync_slot(&self, index: usize, id: u32) -> FsResult<()> {
        let slot = &self.slots[index];
        if !slot.dirty.load(Ordering::Acquire) {
            return Ok(());
        }
        let data = slot.data.read();
        // Cleared under the read lock; a concurrent modify re-marks it.
        slot.dirty.store(false, Ordering::Release);
        if let Err(e) = self.strategy.sync(id, &data) {
            slot.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    fn evict_slot(&self, index: usize, id: u32) -> FsResult<()> {
        self.sync_slot(index, id)?;
        let mut data = self.slots[index].data.write();
        if let Err(e) = self.strategy.eject(id, &mut data) {
            log::warn!("{} cache: eject of {} failed: {}", self.name, id, e);
        }
        Ok(())
    }

    fn dereference(&self, index: usize) -> usize {
        let mut ctrl = self.ctrl.lock();
        let meta = ctrl.meta[index];
        debug_assert!(meta.refs > 0, "{} cache: slot {} over-released", self.name, meta.id);
        let refs = meta.refs.saturating_sub(1);
        ctrl.meta[index].refs = refs;
        if refs == 0 && meta.clobber {
            match self.evict_slot(index, meta.id) {
                Ok(()) => ctrl.meta[index] = SlotMeta::default(),
                Err(e) => {
                    log::error!("{} cache: clobber of {} failed: {}", self.name, meta.id, e);
                }
            }
        }
        refs
    }
}

/// A counted reference to one cache slot. Dropping it dereferences the
/// slot; the slot stays cached until it is chosen as a victim.
pub struct CacheRef<'a, S: CacheStrategy> {
    cache: &'a Cache<S>,
    index: usize,
}

impl<'a, S: CacheStrategy> CacheRef<'a, S> {
    pub fn id(&self) -> u32 {
        self.cache.ctrl.lock().meta[self.index].id
    }

    pub fn read<V>(&self, f: impl FnOnce(&S::Slab) -> V) -> V {
        f(&self.cache.slots[self.index].data.read())
    }

    /// Mutate the slab; the slot becomes dirty.
    pub fn modify<V>(&self, f: impl FnOnce(&mut S::Slab) -> V) -> V {
        let slot = &self.cache.slots[self.index];
        let mut data = slot.data.write();
        slot.dirty.store(true, Ordering::Release);
        f(&mut data)
    }

    /// Mutate parts of the slab that are never written back. The dirty
    /// flag is left alone.
    pub fn modify_untracked<V>(&self, f: impl FnOnce(&mut S::Slab) -> V) -> V {
        f(&mut self.cache.slots[self.index].data.write())
    }

    pub fn is_dirty(&self) -> bool {
        self.cache.slots[self.index].dirty.load(Ordering::Acquire)
    }

    /// Write this slot back now.
    pub fn sync(&self) -> FsResult<()> {
        let id = self.id();
        self.cache.sync_slot(self.index, id)
    }

    /// Evict the entry as soon as the last reference goes away.
    pub fn set_clobber(&self) {
        self.cache.ctrl.lock().meta[self.index].clobber = true;
    }

    pub fn count_refs(&self) -> usize {
        self.cache.ctrl.lock().meta[self.index].refs
    }

    /// Explicit dereference. Returns the references left.
    pub fn release(self) -> usize {
        let this = ManuallyDrop::new(self);
        this.cache.dereference(this.index)
    }

    /// Keep the reference alive past this borrow.
    pub fn into_raw(self) -> RawSlot {
        let this = ManuallyDrop::new(self);
        let id = this.cache.ctrl.lock().meta[this.index].id;
        RawSlot { index: this.index, id }
    }
}

impl<S: CacheStrategy> Drop for CacheRef<'_, S> {
    fn drop(&mut self) {
        self.cache.dereference(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;
    use alloc::string::String;
    use alloc::vec::Vec;
    use core::sync::atomic::AtomicUsize;

    /// Backing store is a map of id -> value; slab is (value, label).
    #[derive(Default)]
    struct MapStrategy {
        store: Mutex<BTreeMap<u32, u64>>,
        populates: AtomicUsize,
        syncs: AtomicUsize,
        ejects: AtomicUsize,
        fail_ids: Mutex<Vec<u32>>,
    }

    impl CacheStrategy for MapStrategy {
        type Slab = (u64, String);
        type Query = str;

        fn new_slab(&self) -> Self::Slab {
            (0, String::new())
        }

        fn reset(&self, slab: &mut Self::Slab) {
            *slab = (0, String::new());
        }

        fn populate(&self, id: u32, slab: &mut Self::Slab) -> FsResult<()> {
            if self.fail_ids.lock().contains(&id) {
                return Err(FileSystemError::IoError);
            }
            self.populates.fetch_add(1, Ordering::SeqCst);
            slab.0 = self.store.lock().get(&id).copied().unwrap_or(0);
            slab.1 = alloc::format!("obj{}", id);
            Ok(())
        }

        fn sync(&self, id: u32, slab: &Self::Slab) -> FsResult<()> {
            self.syncs.fetch_add(1, Ordering::SeqCst);
            self.store.lock().insert(id, slab.0);
            Ok(())
        }

        fn eject(&self, _id: u32, _slab: &mut Self::Slab) -> FsResult<()> {
            self.ejects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn query(&self, query: &str, _id: u32, slab: &Self::Slab) -> bool {
            slab.1 == query
        }
    }

    fn cache(capacity: usize) -> Cache<MapStrategy> {
        Cache::new("test", capacity, MapStrategy::default()).unwrap()
    }

    #[test]
    fn repeated_reference_shares_one_slot() {
        let c = cache(4);
        let refs: Vec<_> = (0..5).map(|_| c.reference(7).unwrap()).collect();
        assert_eq!(c.count_refs(7), Some(5));
        assert_eq!(c.strategy().populates.load(Ordering::SeqCst), 1);
        assert_eq!(c.stats().allocated, 1);

        let mut remaining: Vec<usize> = refs.into_iter().map(|r| r.release()).collect();
        assert_eq!(remaining.pop(), Some(0));
        assert!(remaining.iter().all(|&n| n > 0));
        // Fully dereferenced but still cached.
        assert_eq!(c.count_refs(7), Some(0));
        assert_eq!(c.stats().stale, 1);
    }

    #[test]
    fn concurrent_references_share_one_slot() {
        const THREADS: usize = 8;
        let c = cache(1);
        let held = std::sync::Barrier::new(THREADS + 1);
        let release = std::sync::Barrier::new(THREADS + 1);
        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    let r = c.reference(7).unwrap();
                    held.wait();
                    release.wait();
                    r.release();
                });
            }
            held.wait();
            assert_eq!(c.count_refs(7), Some(THREADS));
            assert_eq!(c.strategy().populates.load(Ordering::SeqCst), 1);
            assert_eq!(c.stats().allocated, 1);
            release.wait();
        });
        assert_eq!(c.count_refs(7), Some(0));
        // The only slot is evictable again.
        assert!(c.reference(8).is_ok());
        assert_eq!(c.count_refs(7), None);
    }

    #[test]
    fn exhausted_when_every_slot_is_referenced() {
        let c = cache(2);
        let _a = c.reference(1).unwrap();
        let _b = c.reference(2).unwrap();
        assert_eq!(c.reference(3).err(), Some(FileSystemError::CacheExhausted));
    }

    #[test]
    fn eviction_syncs_dirty_victim() {
        let c = cache(1);
        c.reference(1).unwrap().modify(|s| s.0 = 42);
        let _b = c.reference(2).unwrap();
        assert_eq!(c.strategy().store.lock().get(&1), Some(&42));
        assert_eq!(c.strategy().ejects.load(Ordering::SeqCst), 1);
        drop(_b);
        assert_eq!(c.reference(1).unwrap().read(|s| s.0), 42);
    }

    #[test]
    fn clean_victims_are_not_synced() {
        let c = cache(1);
        c.reference(1).unwrap().read(|_| ());
        c.reference(2).unwrap();
        assert_eq!(c.strategy().syncs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_populate_frees_slot() {
        let c = cache(1);
        c.strategy().fail_ids.lock().push(9);
        assert_eq!(c.reference(9).err(), Some(FileSystemError::IoError));
        assert_eq!(c.count_refs(9), None);
        assert!(c.reference(1).is_ok());
    }

    #[test]
    fn add_reference_skips_populate() {
        let c = cache(2);
        c.strategy().store.lock().insert(5, 99);
        let r = c.add_reference(5).unwrap();
        assert_eq!(r.read(|s| s.0), 0);
        assert!(r.is_dirty());
        assert_eq!(c.strategy().populates.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn soft_search_does_not_count() {
        let c = cache(2);
        c.reference(3).unwrap().modify(|s| s.0 = 8);
        assert_eq!(c.soft_search(3, |s| s.0), Some(8));
        assert_eq!(c.count_refs(3), Some(0));
        assert_eq!(c.soft_search(4, |s| s.0), None);
    }

    #[test]
    fn query_matches_structurally() {
        let c = cache(4);
        drop(c.reference(11).unwrap());
        let hit = c.query("obj11").unwrap();
        assert_eq!(hit.id(), 11);
        assert_eq!(hit.count_refs(), 1);
        assert!(c.query("obj12").is_none());
    }

    #[test]
    fn clobber_evicts_on_last_release() {
        let c = cache(2);
        let r = c.reference(4).unwrap();
        r.modify(|s| s.0 = 3);
        r.set_clobber();
        assert_eq!(r.release(), 0);
        assert_eq!(c.count_refs(4), None);
        assert_eq!(c.strategy().store.lock().get(&4), Some(&3));
    }

    #[test]
    fn sync_all_writes_dirty_entries() {
        let c = cache(4);
        for id in 0..3 {
            c.reference(id).unwrap().modify(|s| s.0 = id as u64 + 100);
        }
        c.sync_all().unwrap();
        assert_eq!(c.strategy().syncs.load(Ordering::SeqCst), 3);
        c.sync_all().unwrap();
        assert_eq!(c.strategy().syncs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn raw_slot_pins_entry() {
        let c = cache(1);
        let raw = c.reference(6).unwrap().into_raw();
        assert_eq!(raw.id(), 6);
        assert_eq!(c.reference(7).err(), Some(FileSystemError::CacheExhausted));
        {
            let again = c.reference_raw(&raw).unwrap();
            assert_eq!(again.count_refs(), 2);
        }
        assert_eq!(c.release_raw(raw), Ok(0));
        assert!(c.reference(7).is_ok());
    }

    #[test]
    fn clean_drops_unreferenced() {
        let c = cache(3);
        c.reference(1).unwrap().modify(|s| s.0 = 1);
        let _held = c.reference(2).unwrap();
        c.clean().unwrap();
        assert_eq!(c.count_refs(1), None);
        assert_eq!(c.count_refs(2), Some(1));
        assert_eq!(c.strategy().store.lock().get(&1), Some(&1));
    }

    #[test]
    fn hit_and_miss_counters() {
        let c = cache(2);
        c.prepare(1).unwrap();
        drop(c.reference(1).unwrap());
        let stats = c.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.capacity, 2);
    }
}
