//! Fixed-capacity concurrent hash tables for dataplane flow state, guarded by
//! fine-grained spinlocks.
//!
//! Two variants share the same inline-slot chunk layout. [`ChainMap`] is a
//! compile-time-sized table of coarse buckets; a bucket that overflows grows a
//! chain of extended chunks drawn from a shared pool. [`ProbeMap`] is a
//! runtime-sized open-addressed table that resolves overflow by probing
//! neighboring chunks. Neither table allocates: both are views over zeroed
//! memory provided by the caller, sized up front with `calculate_sizeof`.
//!
//! Lookups hand the caller a guard that keeps the chunk lock held; the value
//! behind the guard is stable and mutable in place until the guard drops.

use std::cell::UnsafeCell;
use std::hash::{BuildHasher, Hash, Hasher};
use std::mem::{align_of, size_of, MaybeUninit};
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;

// ================================================================================================
// CONSTANTS
// ================================================================================================

/// Pure CPU hints before a waiter yields to the scheduler
const SPIN_BEFORE_YIELD: i32 = 128;

/// Upper bound on pair slots per chunk, imposed by the `u32` occupancy bitmap
const MAX_SLOTS_PER_CHUNK: usize = 32;

// ================================================================================================
// SPINLOCK PRIMITIVES
// ================================================================================================

static NEXT_LOCK_OWNER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static LOCK_OWNER: u64 = NEXT_LOCK_OWNER.fetch_add(1, Ordering::Relaxed);
}

/// Nonzero id of the calling thread, used for recursive lock ownership.
#[inline(always)]
fn lock_owner_id() -> u64 {
    LOCK_OWNER.with(|id| *id)
}

#[inline(always)]
fn delay(spins: &mut i32) {
    if *spins < SPIN_BEFORE_YIELD {
        *spins += *spins + 1;
        std::hint::spin_loop();
    } else {
        *spins = 0;
        thread::yield_now();
    }
}

/// Plain test-and-set spinlock with spin/yield backoff.
///
/// Guards a single [`ProbeMap`] chunk. Not reentrant: a thread that already
/// holds the lock and calls `lock` again deadlocks. Fairness is not
/// guaranteed; critical sections are expected to stay short.
pub struct Spinlock {
    state: AtomicU32,
}

impl Spinlock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    #[inline(always)]
    pub fn lock(&self) {
        let mut spins = 0;
        loop {
            if self.state.load(Ordering::Relaxed) == 0
                && self
                    .state
                    .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            delay(&mut spins);
        }
    }

    #[inline(always)]
    pub fn unlock(&self) {
        self.state.store(0, Ordering::Release);
    }
}

impl Default for Spinlock {
    fn default() -> Self {
        Self::new()
    }
}

/// Owner-id + depth spinlock.
///
/// Guards a [`ChainMap`] bucket together with every extended chunk reachable
/// from it. The owning thread may re-acquire while already holding the lock,
/// so a thread sitting on a lookup guard can run another operation that
/// hashes to the same bucket without deadlocking. `unlock` must be called
/// once per successful `lock`.
pub struct RecursiveSpinlock {
    owner: AtomicU64,
    depth: UnsafeCell<u32>,
}

// SAFETY: `owner` is only transferred through the CAS in `lock`; `depth` is
// read and written exclusively by the thread that currently owns the lock.
unsafe impl Send for RecursiveSpinlock {}
unsafe impl Sync for RecursiveSpinlock {}

impl RecursiveSpinlock {
    pub const fn new() -> Self {
        Self {
            owner: AtomicU64::new(0),
            depth: UnsafeCell::new(0),
        }
    }

    #[inline(always)]
    pub fn lock(&self) {
        let me = lock_owner_id();
        if self.owner.load(Ordering::Relaxed) == me {
            unsafe { *self.depth.get() += 1 };
            return;
        }
        let mut spins = 0;
        loop {
            if self.owner.load(Ordering::Relaxed) == 0
                && self
                    .owner
                    .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                break;
            }
            delay(&mut spins);
        }
        unsafe { *self.depth.get() = 1 };
    }

    #[inline(always)]
    pub fn unlock(&self) {
        debug_assert_eq!(self.owner.load(Ordering::Relaxed), lock_owner_id());
        let depth = unsafe { &mut *self.depth.get() };
        if *depth > 1 {
            *depth -= 1;
            return;
        }
        *depth = 0;
        self.owner.store(0, Ordering::Release);
    }
}

impl Default for RecursiveSpinlock {
    fn default() -> Self {
        Self::new()
    }
}

// ================================================================================================
// HASHING
// ================================================================================================

/// Default hash provider: CRC32C over the key bytes.
///
/// Stateless and thread-safe; every table built with `CrcState` places a
/// given key identically, which keeps bucket selection reproducible across
/// runs. Substitute any other `BuildHasher` through the tables' `S`
/// parameter when DoS resistance matters more than reproducibility.
#[derive(Clone, Copy, Debug, Default)]
pub struct CrcState;

impl BuildHasher for CrcState {
    type Hasher = CrcHasher;

    #[inline(always)]
    fn build_hasher(&self) -> CrcHasher {
        CrcHasher(crc32fast::Hasher::new())
    }
}

/// Streaming CRC32C hasher; `finish` returns the checksum widened to `u64`.
#[derive(Clone)]
pub struct CrcHasher(crc32fast::Hasher);

impl Hasher for CrcHasher {
    #[inline(always)]
    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    #[inline(always)]
    fn finish(&self) -> u64 {
        self.0.clone().finalize() as u64
    }
}

/// Hash a key down to the 32 bits used for bucket and chunk selection.
#[inline(always)]
fn hash_key<S: BuildHasher, K: Hash>(hasher: &S, key: &K) -> u32 {
    let mut h = hasher.build_hasher();
    key.hash(&mut h);
    h.finish() as u32
}

// ================================================================================================
// STATISTICS
// ================================================================================================

/// Counter snapshot of a [`ChainMap`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChainStats {
    /// Occupied pair slots across all buckets and chains.
    pub pairs: u64,
    /// Extended chunks currently linked into any chain.
    pub extended_chunks_count: u64,
    /// Running maximum of chunks in a single bucket chain.
    pub longest_chain: u64,
    /// Inserts rejected because the extended-chunk pool was exhausted.
    pub insert_failed: u64,
}

/// Counter snapshot of a [`ProbeMap`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProbeStats {
    /// Occupied pair slots across all chunks.
    pub pairs: u64,
    /// Inserts rejected because the probe window held no free slot.
    pub insert_failed: u64,
    /// Running maximum of chunks a successful insert had to visit past its
    /// home chunk; zero while every pair landed in its home chunk.
    pub longest_probe: u64,
}

#[repr(C)]
struct ChainCounters {
    pairs: AtomicU64,
    extended_chunks: AtomicU64,
    longest_chain: AtomicU64,
    insert_failed: AtomicU64,
}

impl ChainCounters {
    fn reset(&mut self) {
        *self.pairs.get_mut() = 0;
        *self.extended_chunks.get_mut() = 0;
        *self.longest_chain.get_mut() = 0;
        *self.insert_failed.get_mut() = 0;
    }
}

// ================================================================================================
// SLOT AND CHUNK LAYOUT
// ================================================================================================

/// One pair slot. Key and value bytes are only meaningful while the matching
/// occupancy bit is set; the all-zero pattern is a valid empty slot.
#[repr(C)]
struct Slot<K, V> {
    key: MaybeUninit<K>,
    value: MaybeUninit<V>,
}

/// Fixed array of pair slots plus its occupancy bitmap. Every access runs
/// under the lock of the enclosing bucket or chunk.
#[repr(C)]
struct SlotArray<K, V, const N: usize> {
    occupied: AtomicU32,
    slots: UnsafeCell<[Slot<K, V>; N]>,
}

impl<K, V, const N: usize> SlotArray<K, V, N> {
    #[inline(always)]
    fn find_key(&self, key: &K) -> Option<usize>
    where
        K: Eq,
    {
        let mut bits = self.occupied.load(Ordering::Relaxed);
        while bits != 0 {
            let i = bits.trailing_zeros() as usize;
            let slot = unsafe { &(*self.slots.get())[i] };
            if unsafe { slot.key.assume_init_ref() } == key {
                return Some(i);
            }
            bits &= bits - 1;
        }
        None
    }

    #[inline(always)]
    fn first_empty(&self) -> Option<usize> {
        let free = !self.occupied.load(Ordering::Relaxed) & slot_mask(N);
        if free == 0 {
            None
        } else {
            Some(free.trailing_zeros() as usize)
        }
    }

    #[inline(always)]
    fn has_free_slot(&self) -> bool {
        self.occupied.load(Ordering::Relaxed) != slot_mask(N)
    }

    /// Writes a pair into slot `i` and marks it occupied.
    ///
    /// The occupancy bit is set after the pair bytes so a reader under the
    /// same lock never observes a marked slot with stale contents.
    #[inline(always)]
    unsafe fn fill(&self, i: usize, key: K, value: V) {
        let slot = &mut (*self.slots.get())[i];
        slot.key.write(key);
        slot.value.write(value);
        let bits = self.occupied.load(Ordering::Relaxed);
        self.occupied.store(bits | (1 << i), Ordering::Relaxed);
    }

    #[inline(always)]
    fn value_ptr(&self, i: usize) -> *mut V {
        unsafe { (*self.slots.get())[i].value.as_mut_ptr() }
    }

    fn reset(&mut self) {
        *self.occupied.get_mut() = 0;
        unsafe { ptr::write_bytes(self.slots.get_mut().as_mut_ptr(), 0, N) };
    }
}

// ================================================================================================
// CHAIN TABLE
// ================================================================================================

/// A chunk in a bucket chain: pair slots plus the link to the next extended
/// chunk. `next` stores the pool index plus one; zero ends the chain, so the
/// zeroed initial state is a table of empty unlinked buckets.
#[repr(C)]
struct ChainChunk<K, V, const N: usize> {
    pairs: SlotArray<K, V, N>,
    next: AtomicU32,
}

impl<K, V, const N: usize> ChainChunk<K, V, N> {
    fn reset(&mut self) {
        self.pairs.reset();
        *self.next.get_mut() = 0;
    }
}

#[repr(C)]
struct ChainBucket<K, V, const C1: usize> {
    lock: RecursiveSpinlock,
    chunk: ChainChunk<K, V, C1>,
}

/// Where the chain walk found room for a new pair.
enum ChainFreeSlot {
    Primary(usize),
    Extended(u32, usize),
}

/// Chained, coarse-bucket concurrent hash table with a fixed compile-time
/// shape.
///
/// `P` primary buckets of `C1` pair slots each share a pool of `E` extended
/// chunks of `C2` slots. A key hashes to bucket `hash % P`; one recursive
/// spinlock per bucket covers the primary chunk and every extended chunk
/// linked behind it. When a bucket fills up, `insert` draws a chunk from the
/// pool and links it as the chain tail; the pool only grows until [`clear`].
///
/// The table is a view over caller-provided zeroed memory, bound with
/// [`from_zeroed`]; it never allocates and never frees. `insert`, `lookup`
/// and `stats` are safe from any number of threads; [`clear`] takes
/// `&mut self` and therefore demands exclusive access.
///
/// [`clear`]: ChainMap::clear
/// [`from_zeroed`]: ChainMap::from_zeroed
#[repr(C)]
pub struct ChainMap<
    K,
    V,
    const P: usize,
    const E: usize,
    const C1: usize,
    const C2: usize,
    S: BuildHasher = CrcState,
> {
    buckets: [ChainBucket<K, V, C1>; P],
    extended: [ChainChunk<K, V, C2>; E],
    pool_next: AtomicU32,
    counters: ChainCounters,
    hasher: S,
}

// SAFETY: all slot and link mutation happens under the owning bucket's lock,
// and the lock's release/acquire edges order it; counters are atomics. Keys
// and values move across threads through insert and guard access, hence the
// Send bounds.
unsafe impl<K, V, const P: usize, const E: usize, const C1: usize, const C2: usize, S> Send
    for ChainMap<K, V, P, E, C1, C2, S>
where
    K: Send,
    V: Send,
    S: Send + BuildHasher,
{
}
unsafe impl<K, V, const P: usize, const E: usize, const C1: usize, const C2: usize, S> Sync
    for ChainMap<K, V, P, E, C1, C2, S>
where
    K: Send + Sync,
    V: Send + Sync,
    S: Sync + BuildHasher,
{
}

impl<K, V, const P: usize, const E: usize, const C1: usize, const C2: usize>
    ChainMap<K, V, P, E, C1, C2, CrcState>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    /// Binds a table view onto caller-provided zeroed memory, hashing with
    /// CRC32C.
    ///
    /// # Safety
    ///
    /// Same contract as [`from_zeroed_with_hasher`](Self::from_zeroed_with_hasher).
    pub unsafe fn from_zeroed<'a>(base: *mut u8) -> &'a mut Self {
        Self::from_zeroed_with_hasher(base, CrcState)
    }
}

impl<K, V, const P: usize, const E: usize, const C1: usize, const C2: usize, S>
    ChainMap<K, V, P, E, C1, C2, S>
where
    K: Copy + Eq + Hash,
    V: Copy,
    S: BuildHasher,
{
    const SHAPE_OK: () = assert!(
        P > 0 && C1 > 0 && C1 <= MAX_SLOTS_PER_CHUNK && C2 > 0 && C2 <= MAX_SLOTS_PER_CHUNK
    );

    /// Total usable key slots: `P * C1` primary plus `E * C2` extended.
    pub const KEYS_SIZE: usize = P * C1 + E * C2;

    /// Exact byte count of backing memory required for this table shape.
    pub const fn calculate_sizeof() -> usize {
        size_of::<Self>()
    }

    /// Required alignment of the backing memory.
    pub const fn buffer_align() -> usize {
        align_of::<Self>()
    }

    /// Binds a table view onto caller-provided memory using `hasher`.
    ///
    /// The zeroed byte pattern is the valid empty table, so no further
    /// initialization runs; the returned reference borrows the buffer for
    /// `'a` and the table never frees it.
    ///
    /// # Safety
    ///
    /// `base` must point to at least [`calculate_sizeof`](Self::calculate_sizeof)
    /// bytes of zeroed memory aligned to [`buffer_align`](Self::buffer_align),
    /// valid and not aliased for the whole lifetime `'a`.
    pub unsafe fn from_zeroed_with_hasher<'a>(base: *mut u8, hasher: S) -> &'a mut Self {
        let () = Self::SHAPE_OK;
        debug_assert!(!base.is_null());
        debug_assert_eq!(base as usize % Self::buffer_align(), 0);
        let table = base as *mut Self;
        ptr::write(ptr::addr_of_mut!((*table).hasher), hasher);
        &mut *table
    }

    #[inline(always)]
    fn bucket_of(&self, key: &K) -> &ChainBucket<K, V, C1> {
        &self.buckets[hash_key(&self.hasher, key) as usize % P]
    }

    /// Draws the next extended chunk from the pool, if any remain.
    fn alloc_extended(&self) -> Option<u32> {
        let mut cur = self.pool_next.load(Ordering::Relaxed);
        loop {
            if cur as usize >= E {
                return None;
            }
            match self.pool_next.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(cur),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Inserts a pair, overwriting the value in place if the key is already
    /// present anywhere in its bucket chain.
    ///
    /// Returns `false` only when the bucket chain is full and the extended
    /// pool is exhausted; the failure is also counted in
    /// [`stats`](Self::stats).
    pub fn insert(&self, key: K, value: V) -> bool {
        let bucket = self.bucket_of(&key);
        bucket.lock.lock();

        if let Some(i) = bucket.chunk.pairs.find_key(&key) {
            unsafe { ptr::write(bucket.chunk.pairs.value_ptr(i), value) };
            bucket.lock.unlock();
            return true;
        }
        let mut free = bucket.chunk.pairs.first_empty().map(ChainFreeSlot::Primary);
        let mut chain_len: u64 = 1;
        let mut tail = &bucket.chunk.next;

        let mut next = bucket.chunk.next.load(Ordering::Relaxed);
        while next != 0 {
            let ext = &self.extended[(next - 1) as usize];
            chain_len += 1;
            if let Some(i) = ext.pairs.find_key(&key) {
                unsafe { ptr::write(ext.pairs.value_ptr(i), value) };
                bucket.lock.unlock();
                return true;
            }
            if free.is_none() {
                if let Some(i) = ext.pairs.first_empty() {
                    free = Some(ChainFreeSlot::Extended(next - 1, i));
                }
            }
            tail = &ext.next;
            next = ext.next.load(Ordering::Relaxed);
        }

        if let Some(slot) = free {
            match slot {
                ChainFreeSlot::Primary(i) => unsafe { bucket.chunk.pairs.fill(i, key, value) },
                ChainFreeSlot::Extended(c, i) => unsafe {
                    self.extended[c as usize].pairs.fill(i, key, value)
                },
            }
            self.counters.pairs.fetch_add(1, Ordering::Relaxed);
            bucket.lock.unlock();
            return true;
        }

        match self.alloc_extended() {
            Some(idx) => {
                let ext = &self.extended[idx as usize];
                unsafe { ext.pairs.fill(0, key, value) };
                tail.store(idx + 1, Ordering::Relaxed);
                self.counters.pairs.fetch_add(1, Ordering::Relaxed);
                self.counters.extended_chunks.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .longest_chain
                    .fetch_max(chain_len + 1, Ordering::Relaxed);
                bucket.lock.unlock();
                true
            }
            None => {
                self.counters.insert_failed.fetch_add(1, Ordering::Relaxed);
                bucket.lock.unlock();
                false
            }
        }
    }

    /// Looks the key up, returning a guard that keeps the bucket locked.
    ///
    /// On a hit the guard dereferences to the stored value, mutable in
    /// place; the bucket stays locked against other threads until the guard
    /// drops. A miss releases the lock internally and returns `None`.
    pub fn lookup(&self, key: &K) -> Option<ChainGuard<'_, V>> {
        let bucket = self.bucket_of(key);
        bucket.lock.lock();

        if let Some(i) = bucket.chunk.pairs.find_key(key) {
            return Some(ChainGuard {
                value: bucket.chunk.pairs.value_ptr(i),
                lock: &bucket.lock,
            });
        }
        let mut next = bucket.chunk.next.load(Ordering::Relaxed);
        while next != 0 {
            let ext = &self.extended[(next - 1) as usize];
            if let Some(i) = ext.pairs.find_key(key) {
                return Some(ChainGuard {
                    value: ext.pairs.value_ptr(i),
                    lock: &bucket.lock,
                });
            }
            next = ext.next.load(Ordering::Relaxed);
        }
        bucket.lock.unlock();
        None
    }

    /// Copies the value out for the key, releasing the bucket lock before
    /// returning.
    pub fn get(&self, key: &K) -> Option<V> {
        self.lookup(key).map(|guard| *guard)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.lookup(key).is_some()
    }

    /// Number of occupied pair slots.
    pub fn len(&self) -> usize {
        self.counters.pairs.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter snapshot. Each counter is read atomically on its own; the
    /// snapshot is consistent per counter, not across counters.
    pub fn stats(&self) -> ChainStats {
        ChainStats {
            pairs: self.counters.pairs.load(Ordering::Relaxed),
            extended_chunks_count: self.counters.extended_chunks.load(Ordering::Relaxed),
            longest_chain: self.counters.longest_chain.load(Ordering::Relaxed),
            insert_failed: self.counters.insert_failed.load(Ordering::Relaxed),
        }
    }

    /// Re-initializes every bucket to empty, returns all extended chunks to
    /// the pool and zeroes the counters. Exclusive access is enforced by the
    /// mutable borrow.
    pub fn clear(&mut self) {
        for bucket in self.buckets.iter_mut() {
            *bucket.lock.owner.get_mut() = 0;
            *bucket.lock.depth.get_mut() = 0;
            bucket.chunk.reset();
        }
        for ext in self.extended.iter_mut() {
            ext.reset();
        }
        *self.pool_next.get_mut() = 0;
        self.counters.reset();
    }
}

/// Holds a [`ChainMap`] bucket lock on behalf of the caller after a lookup
/// hit. Dereferences to the stored value; dropping the guard releases the
/// bucket.
pub struct ChainGuard<'a, V> {
    value: *mut V,
    lock: &'a RecursiveSpinlock,
}

impl<V> Deref for ChainGuard<'_, V> {
    type Target = V;

    #[inline(always)]
    fn deref(&self) -> &V {
        unsafe { &*self.value }
    }
}

impl<V> DerefMut for ChainGuard<'_, V> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut V {
        unsafe { &mut *self.value }
    }
}

impl<V> Drop for ChainGuard<'_, V> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

// ================================================================================================
// PROBE TABLE
// ================================================================================================

#[repr(C)]
struct ProbeChunk<K, V, const C: usize> {
    lock: Spinlock,
    pairs: SlotArray<K, V, C>,
}

/// Modular open-addressed concurrent hash table over caller-provided memory.
///
/// The backing buffer holds `ceil(total_size / C)` chunks of `C` pair slots,
/// each guarded by its own non-recursive spinlock. A key hashes to chunk
/// `hash % chunk_count` and the probe walks consecutive chunks from there,
/// holding at most one chunk lock at a time. The walk spans at most one full
/// traversal of the chunk array, which doubles as the insertion-failure
/// threshold: `insert` reports failure only once every chunk was seen full
/// of other keys.
///
/// The handle itself carries no storage. Construct it with [`new`], size the
/// buffer with [`calculate_sizeof`], bind with [`update_pointer`], then
/// [`clear`] once before first use.
///
/// [`new`]: ProbeMap::new
/// [`calculate_sizeof`]: ProbeMap::calculate_sizeof
/// [`update_pointer`]: ProbeMap::update_pointer
/// [`clear`]: ProbeMap::clear
pub struct ProbeMap<K, V, const C: usize, S: BuildHasher = CrcState> {
    chunks: *mut ProbeChunk<K, V, C>,
    chunk_count: u32,
    total_size: u32,
    pairs: AtomicU64,
    insert_failed: AtomicU64,
    longest_probe: AtomicU64,
    hasher: S,
}

// SAFETY: chunk state is only touched under the owning chunk's spinlock and
// the bound buffer outlives the handle per the `update_pointer` contract;
// counters are atomics. Keys and values move across threads through insert
// and guard access, hence the Send bounds.
unsafe impl<K, V, const C: usize, S> Send for ProbeMap<K, V, C, S>
where
    K: Send,
    V: Send,
    S: Send + BuildHasher,
{
}
unsafe impl<K, V, const C: usize, S> Sync for ProbeMap<K, V, C, S>
where
    K: Send + Sync,
    V: Send + Sync,
    S: Sync + BuildHasher,
{
}

impl<K, V, const C: usize> ProbeMap<K, V, C, CrcState>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    /// Creates an unbound handle hashing with CRC32C.
    pub fn new() -> Self {
        Self::with_hasher(CrcState)
    }
}

impl<K, V, const C: usize> Default for ProbeMap<K, V, C, CrcState>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, const C: usize, S> ProbeMap<K, V, C, S>
where
    K: Copy + Eq + Hash,
    V: Copy,
    S: BuildHasher,
{
    const SHAPE_OK: () = assert!(C > 0 && C <= MAX_SLOTS_PER_CHUNK);

    /// Creates an unbound handle using `hasher`. Operations are only valid
    /// after [`update_pointer`](Self::update_pointer) binds the memory
    /// window.
    pub fn with_hasher(hasher: S) -> Self {
        let () = Self::SHAPE_OK;
        Self {
            chunks: ptr::null_mut(),
            chunk_count: 0,
            total_size: 0,
            pairs: AtomicU64::new(0),
            insert_failed: AtomicU64::new(0),
            longest_probe: AtomicU64::new(0),
            hasher,
        }
    }

    /// Exact byte count of backing memory for a table holding `total_size`
    /// pairs.
    pub const fn calculate_sizeof(total_size: u32) -> usize {
        chunk_count_for(total_size, C) * size_of::<ProbeChunk<K, V, C>>()
    }

    /// Required alignment of the backing memory.
    pub const fn buffer_align() -> usize {
        align_of::<ProbeChunk<K, V, C>>()
    }

    /// Fixes the table's memory window to the chunk array at `base + offset`.
    ///
    /// Call [`clear`](Self::clear) afterwards to establish the empty state;
    /// only then is the table ready for concurrent use.
    ///
    /// # Safety
    ///
    /// `base + offset` must point to at least
    /// [`calculate_sizeof`](Self::calculate_sizeof)`(total_size)` bytes of
    /// memory aligned to [`buffer_align`](Self::buffer_align), valid for the
    /// whole lifetime of the handle and not aliased by anything else.
    pub unsafe fn update_pointer(&mut self, base: *mut u8, offset: usize, total_size: u32) {
        let window = base.add(offset);
        debug_assert!(!window.is_null());
        debug_assert_eq!(window as usize % Self::buffer_align(), 0);
        self.chunks = window as *mut ProbeChunk<K, V, C>;
        self.chunk_count = chunk_count_for(total_size, C) as u32;
        self.total_size = total_size;
    }

    /// Pair capacity the table was bound with.
    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    #[inline(always)]
    fn chunk(&self, idx: u32) -> &ProbeChunk<K, V, C> {
        debug_assert!(idx < self.chunk_count);
        unsafe { &*self.chunks.add(idx as usize) }
    }

    /// Looks the key up and always returns its hash so a following
    /// [`insert`](Self::insert) can reuse it.
    ///
    /// On a hit the chunk containing the key stays locked; the guard
    /// dereferences to the value and releases the chunk on drop. A miss
    /// holds no lock. The walk stops early at the first chunk with a free
    /// slot: since pairs are never removed and inserts take the first free
    /// slot in the same probe order, the key cannot live beyond it.
    pub fn lookup(&self, key: &K) -> (u32, Option<ProbeGuard<'_, V>>) {
        let hash = hash_key(&self.hasher, key);
        if self.chunk_count == 0 {
            return (hash, None);
        }
        let start = hash % self.chunk_count;
        for step in 0..self.chunk_count {
            let chunk = self.chunk((start + step) % self.chunk_count);
            chunk.lock.lock();
            if let Some(i) = chunk.pairs.find_key(key) {
                return (
                    hash,
                    Some(ProbeGuard {
                        value: chunk.pairs.value_ptr(i),
                        lock: &chunk.lock,
                    }),
                );
            }
            let open = chunk.pairs.has_free_slot();
            chunk.lock.unlock();
            if open {
                break;
            }
        }
        (hash, None)
    }

    /// Inserts a pair using a hash previously returned by
    /// [`lookup`](Self::lookup) for the same key, overwriting in place if
    /// the key is already present in the probe window.
    ///
    /// Chunk locks are taken one at a time; the pair lands in the first
    /// free slot of the first non-full chunk once the key is known absent
    /// from every chunk before it. Returns `false` only when one full
    /// traversal found every chunk occupied by other keys; the failure is
    /// also counted in [`stats`](Self::stats).
    pub fn insert(&self, hash: u32, key: K, value: V) -> bool {
        debug_assert!(self.chunk_count != 0);
        debug_assert_eq!(hash, hash_key(&self.hasher, &key));
        if self.chunk_count == 0 {
            self.insert_failed.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let start = hash % self.chunk_count;
        for step in 0..self.chunk_count {
            let chunk = self.chunk((start + step) % self.chunk_count);
            chunk.lock.lock();
            if let Some(i) = chunk.pairs.find_key(&key) {
                unsafe { ptr::write(chunk.pairs.value_ptr(i), value) };
                chunk.lock.unlock();
                return true;
            }
            if let Some(i) = chunk.pairs.first_empty() {
                unsafe { chunk.pairs.fill(i, key, value) };
                self.pairs.fetch_add(1, Ordering::Relaxed);
                chunk.lock.unlock();
                if step > 0 {
                    self.longest_probe.fetch_max(step as u64 + 1, Ordering::Relaxed);
                }
                return true;
            }
            chunk.lock.unlock();
        }
        self.insert_failed.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Computes the hash and performs the insert-or-overwrite walk in one
    /// call. Concurrent callers with the same key serialize at the chunk
    /// holding (or receiving) that key, so the key never occupies two slots.
    pub fn insert_or_update(&self, key: K, value: V) -> bool {
        let hash = hash_key(&self.hasher, &key);
        self.insert(hash, key, value)
    }

    /// Copies the value out for the key, releasing the chunk lock before
    /// returning.
    pub fn get(&self, key: &K) -> Option<V> {
        let (_, found) = self.lookup(key);
        found.map(|guard| *guard)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.lookup(key).1.is_some()
    }

    /// Number of occupied pair slots.
    pub fn len(&self) -> usize {
        self.pairs.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter snapshot. Each counter is read atomically on its own; the
    /// snapshot is consistent per counter, not across counters.
    pub fn stats(&self) -> ProbeStats {
        ProbeStats {
            pairs: self.pairs.load(Ordering::Relaxed),
            insert_failed: self.insert_failed.load(Ordering::Relaxed),
            longest_probe: self.longest_probe.load(Ordering::Relaxed),
        }
    }

    /// Zeroes every chunk's occupancy and value storage and resets the
    /// counters. Exclusive access is enforced by the mutable borrow; this is
    /// the only way to prepare a freshly bound table for use.
    pub fn clear(&mut self) {
        for i in 0..self.chunk_count as usize {
            let chunk = unsafe { &mut *self.chunks.add(i) };
            *chunk.lock.state.get_mut() = 0;
            chunk.pairs.reset();
        }
        *self.pairs.get_mut() = 0;
        *self.insert_failed.get_mut() = 0;
        *self.longest_probe.get_mut() = 0;
    }
}

/// Holds a [`ProbeMap`] chunk lock on behalf of the caller after a lookup
/// hit. Dereferences to the stored value; dropping the guard releases the
/// chunk.
pub struct ProbeGuard<'a, V> {
    value: *mut V,
    lock: &'a Spinlock,
}

impl<V> Deref for ProbeGuard<'_, V> {
    type Target = V;

    #[inline(always)]
    fn deref(&self) -> &V {
        unsafe { &*self.value }
    }
}

impl<V> DerefMut for ProbeGuard<'_, V> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut V {
        unsafe { &mut *self.value }
    }
}

impl<V> Drop for ProbeGuard<'_, V> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

// ================================================================================================
// UTILITY FUNCTIONS
// ================================================================================================

/// Bitmap mask covering the low `slots` bits.
const fn slot_mask(slots: usize) -> u32 {
    if slots >= 32 {
        u32::MAX
    } else {
        (1u32 << slots) - 1
    }
}

/// Chunks needed to hold `total_size` pairs at `slots_per_chunk` each.
const fn chunk_count_for(total_size: u32, slots_per_chunk: usize) -> usize {
    (total_size as usize + slots_per_chunk - 1) / slots_per_chunk
}
