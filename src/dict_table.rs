use core::fmt;
use core::fmt::Debug;
use core::sync::atomic::AtomicI32;
use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use parking_lot::Mutex;
use parking_lot::MutexGuard;

use crate::key::Key;
use crate::key::KeyKind;
use crate::key::ops_for;
use crate::key::{EqFn, HashFn};

/// Index slot that has never held an entry. Probing may stop here.
const FREE: i32 = -1;

/// Index slot vacated by a removal. Probing must continue past it, but an
/// insert may recycle it.
const DUMMY: i32 = -2;

/// Index capacity used by the first lazy allocation and after `clear`.
const INITIAL_CAPACITY: usize = 7;

/// Capacity multiplier applied when the load factor is exceeded.
const GROWTH_FACTOR: usize = 3;

/// Load factor bound: live entries stay at or below 7/10 of the index
/// capacity after every insert.
const LOAD_NUM: usize = 7;
const LOAD_DEN: usize = 10;

#[inline(always)]
fn load_limit(capacity: usize) -> usize {
    capacity * LOAD_NUM / LOAD_DEN
}

/// Index capacity that keeps `entries` live entries within the load factor.
#[inline(always)]
fn capacity_for(entries: usize) -> usize {
    entries * LOAD_DEN / LOAD_NUM + 2
}

/// An immutable `(key, value, hash)` record. Records are replaced, never
/// mutated: an overwrite installs a fresh record and retires the old one, so
/// a concurrent reader always sees a fully-constructed record.
struct Bucket<V> {
    key: Key,
    value: V,
    hash: u32,
}

/// Flat probe array. Each slot holds [`FREE`], [`DUMMY`], or a non-negative
/// position into the bucket list. The array is only ever replaced wholesale
/// (growth, tombstone purge, specialization switch, clear); individual slots
/// move strictly from `FREE` to a position to `DUMMY`, so a retired array
/// stays self-consistent for readers that still hold it.
struct IndexArray {
    slots: Box<[AtomicI32]>,
}

impl IndexArray {
    fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| AtomicI32::new(FREE)).collect();
        IndexArray { slots }
    }

    /// A value copy of the current slots, used to give readers of the old
    /// array a stable view across a strategy switch.
    fn snapshot(&self) -> Self {
        let slots = self
            .slots
            .iter()
            .map(|slot| AtomicI32::new(slot.load(Ordering::Relaxed)))
            .collect();
        IndexArray { slots }
    }
}

/// Append-only bucket storage. `len` is published after the slot write, so a
/// reader that observes an index entry for position `p` also observes the
/// record at `p`. Growth transfers the record pointers into a larger slot
/// array and publishes it wholesale; dropping a retired array never frees the
/// records it shared with its successor.
struct BucketArray<V> {
    slots: Box<[Atomic<Bucket<V>>]>,
    len: AtomicUsize,
}

impl<V> BucketArray<V> {
    fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Atomic::null()).collect();
        BucketArray {
            slots,
            len: AtomicUsize::new(0),
        }
    }
}

/// The hash/equality pair a table is currently probing with, plus the key
/// kind it was selected for. `kind == None` is the permanent generic pair.
#[derive(Clone, Copy)]
struct Strategy {
    kind: Option<KeyKind>,
    hash: HashFn,
    eq: EqFn,
}

impl Strategy {
    fn for_kind(kind: Option<KeyKind>) -> Self {
        let (hash, eq) = ops_for(kind);
        Strategy { kind, hash, eq }
    }

    fn generic() -> Self {
        Strategy::for_kind(None)
    }
}

/// Low-level statistics for a [`DictTable`], captured at a single point in
/// time under the mutation lock.
#[cfg(feature = "stats")]
#[derive(Debug, Clone)]
pub struct DictStats {
    /// Number of live entries.
    pub len: usize,
    /// Index array capacity (0 before the first mutation).
    pub index_capacity: usize,
    /// Total bucket-list slots, live and tombstoned.
    pub bucket_slots: usize,
    /// Index slots currently holding a tombstone.
    pub tombstones: usize,
    /// `len / index_capacity`, or 0 for an unallocated table.
    pub load_factor: f64,
    /// `None` before any key was observed, `Some(true)` while all observed
    /// keys share one kind, `Some(false)` after the switch to generic
    /// hashing.
    pub homogeneous: Option<bool>,
}

/// An open-addressing dictionary table with lock-free reads and adaptive,
/// type-specialized hashing.
///
/// `DictTable<V>` maps dynamically-typed [`Key`]s to values. Storage is split
/// into a flat probe index and an append-only bucket list; removals leave
/// tombstones in the index and retire the bucket record, and the index is
/// rebuilt (never shrunk) when the 0.7 load factor is exceeded.
///
/// The table tracks whether every key observed so far shares one concrete
/// kind. While it does, probing runs on that kind's specialized hash/equality
/// pair; the first key of a second kind (or a [`Key::Null`]) permanently
/// switches the table to the generic pair, cloning the index array first so
/// in-flight readers finish against a stable view.
///
/// # Concurrency
///
/// The table is built for one mutator and any number of readers:
///
/// - [`add`](DictTable::add), [`remove`](DictTable::remove),
///   [`clear`](DictTable::clear) and friends serialize on an internal mutex
///   ([`lock`](DictTable::lock) exposes the batching variant).
/// - [`try_get`](DictTable::try_get) and [`contains`](DictTable::contains)
///   take no lock and never allocate beyond the returned value clone.
///
/// Reads stay correct because every structure is either replaced wholesale
/// after being fully built, appended to behind a published length, or has
/// slots overwritten record-pointer-at-a-time; retired arrays and records are
/// reclaimed through epoch-based garbage collection once all in-flight
/// readers have moved on. A read that races a mutation sees either the old or
/// the new state of the touched entry, never a torn one. `len` is published
/// after the tombstone on removal, so a reader never observes a decremented
/// count alongside the removed record. Mutation requires `V: Send` because a
/// retired record's destructor may run on whichever thread next flushes the
/// collector.
///
/// # Examples
///
/// ```rust
/// use adapt_hash::{DictTable, Key};
///
/// let table: DictTable<i64> = DictTable::new();
/// table.add(Key::from("a"), 1);
/// table.add(Key::from("b"), 2);
/// table.add(Key::from("a"), 3);
///
/// assert_eq!(table.len(), 2);
/// assert_eq!(table.try_get(&Key::from("a")), Some(3));
/// assert!(table.remove(&Key::from("b")));
/// assert_eq!(table.try_get(&Key::from("b")), None);
/// ```
pub struct DictTable<V> {
    index: Atomic<IndexArray>,
    buckets: Atomic<BucketArray<V>>,
    strategy: Atomic<Strategy>,
    /// Live entries. Decremented only after the tombstone writes.
    count: AtomicUsize,
    /// Live plus tombstoned index slots; mutator-only, bounds probe lengths.
    fill: AtomicUsize,
    /// Bumped on every successful structural change.
    version: AtomicUsize,
    lock: Mutex<()>,
}

impl<V> Default for DictTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> DictTable<V> {
    /// Creates an empty table. No storage is allocated until the first
    /// mutation.
    pub fn new() -> Self {
        DictTable {
            index: Atomic::null(),
            buckets: Atomic::null(),
            strategy: Atomic::null(),
            count: AtomicUsize::new(0),
            fill: AtomicUsize::new(0),
            version: AtomicUsize::new(0),
            lock: Mutex::new(()),
        }
    }

    /// Creates a table pre-sized so that `entries` insertions do not trigger
    /// a resize.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use adapt_hash::{DictTable, Key};
    ///
    /// let table: DictTable<u32> = DictTable::with_capacity(100);
    /// for i in 0..100 {
    ///     table.add(Key::from(i as i64), i);
    /// }
    /// assert_eq!(table.len(), 100);
    /// ```
    pub fn with_capacity(entries: usize) -> Self {
        let table = Self::new();
        if entries > 0 {
            let guard = epoch::pin();
            table.init_storage(capacity_for(entries), &guard);
        }
        table
    }

    /// Builds a table from a sequence of key/value pairs, pre-sizing storage
    /// for the sequence length. Later duplicates overwrite earlier ones.
    ///
    /// When the caller knows every key shares one concrete kind, passing
    /// `known_homogeneous = true` skips the per-key kind check after the
    /// first pair.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use adapt_hash::{DictTable, Key};
    ///
    /// let table = DictTable::from_pairs(
    ///     vec![(Key::from(1), "one"), (Key::from(2), "two")],
    ///     true,
    /// );
    /// assert_eq!(table.try_get(&Key::from(2)), Some("two"));
    /// ```
    pub fn from_pairs<I>(pairs: I, known_homogeneous: bool) -> Self
    where
        I: IntoIterator<Item = (Key, V)>,
        I::IntoIter: ExactSizeIterator,
        V: Send,
    {
        let pairs = pairs.into_iter();
        let table = Self::new();
        let _lock = table.lock.lock();
        let guard = epoch::pin();
        table.init_storage(capacity_for(pairs.len()), &guard);
        let mut first = true;
        for (key, value) in pairs {
            let check_kind = first || !known_homogeneous;
            table.add_inner(key, value, check_kind, &guard);
            first = false;
        }
        drop(_lock);
        table
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Returns `true` if the table holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current value of the modification counter.
    ///
    /// The counter is bumped on every successful structural change (insert,
    /// overwrite, removal, clear). Callers that hand out iteration snapshots
    /// can compare values to detect modification; the table itself does not
    /// enforce anything with it.
    pub fn version(&self) -> usize {
        self.version.load(Ordering::Acquire)
    }

    /// Looks up `key` and clones out its value.
    ///
    /// Lock-free: safe to call concurrently with any number of other reads
    /// and with the single permitted concurrent mutator.
    pub fn try_get(&self, key: &Key) -> Option<V>
    where
        V: Clone,
    {
        let guard = epoch::pin();
        self.get_in(key, &guard).map(|bucket| bucket.value.clone())
    }

    /// Returns `true` if `key` is present. Lock-free, like
    /// [`try_get`](DictTable::try_get).
    pub fn contains(&self, key: &Key) -> bool {
        let guard = epoch::pin();
        self.get_in(key, &guard).is_some()
    }

    /// Inserts or overwrites `key`. Duplicate-key insertion is an overwrite,
    /// never an error.
    pub fn add(&self, key: Key, value: V)
    where
        V: Send,
    {
        let _lock = self.lock.lock();
        let guard = epoch::pin();
        self.add_inner(key, value, true, &guard);
    }

    /// Removes `key`, reporting whether a matching entry existed.
    pub fn remove(&self, key: &Key) -> bool
    where
        V: Send,
    {
        let _lock = self.lock.lock();
        let guard = epoch::pin();
        self.remove_in(key, &guard).is_some()
    }

    /// Removes `key` and clones out the value it mapped to.
    pub fn try_remove(&self, key: &Key) -> Option<V>
    where
        V: Clone + Send,
    {
        let _lock = self.lock.lock();
        let guard = epoch::pin();
        self.remove_in(key, &guard).map(|bucket| bucket.value.clone())
    }

    /// Removes every entry and resets storage to the initial capacity.
    ///
    /// The key-kind specialization is deliberately retained: a table that is
    /// cleared and refilled with same-shaped keys keeps its fast path.
    pub fn clear(&self)
    where
        V: Send,
    {
        let _lock = self.lock.lock();
        let guard = epoch::pin();
        self.clear_inner(&guard);
    }

    /// Grows the index array (never shrinks it) so that `entries` live
    /// entries fit within the load factor, reindexing existing records if
    /// growth occurs.
    pub fn ensure_capacity(&self, entries: usize) {
        let _lock = self.lock.lock();
        let guard = epoch::pin();
        self.ensure_capacity_inner(entries, &guard);
    }

    /// Acquires the mutation lock and returns a guard exposing the
    /// lock-already-held mutation cores, for callers batching several
    /// mutations under one acquisition.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use adapt_hash::{DictTable, Key};
    ///
    /// let table: DictTable<i32> = DictTable::new();
    /// {
    ///     let write = table.lock();
    ///     for i in 0..10 {
    ///         write.add(Key::from(i), i as i32);
    ///     }
    /// }
    /// assert_eq!(table.len(), 10);
    /// ```
    pub fn lock(&self) -> WriteGuard<'_, V> {
        WriteGuard {
            table: self,
            _lock: self.lock.lock(),
        }
    }

    /// Snapshot of the live `(key, value)` pairs at a single point in time,
    /// taken under the mutation lock.
    pub fn items(&self) -> Vec<(Key, V)>
    where
        V: Clone,
    {
        let _lock = self.lock.lock();
        let guard = epoch::pin();
        let mut items = Vec::with_capacity(self.count.load(Ordering::Relaxed));
        self.for_each_bucket(&guard, |bucket| {
            items.push((bucket.key.clone(), bucket.value.clone()));
        });
        items
    }

    /// Snapshot of the live keys at a single point in time.
    pub fn keys(&self) -> Vec<Key> {
        let _lock = self.lock.lock();
        let guard = epoch::pin();
        let mut keys = Vec::with_capacity(self.count.load(Ordering::Relaxed));
        self.for_each_bucket(&guard, |bucket| keys.push(bucket.key.clone()));
        keys
    }

    /// Iterator over a snapshot of the live entries.
    ///
    /// The snapshot reflects a single consistent point in time; mutations
    /// performed after `iter` returns are not observed by it.
    pub fn iter(&self) -> Iter<V>
    where
        V: Clone,
    {
        Iter {
            inner: self.items().into_iter(),
        }
    }

    /// Bulk-merges every live entry of `self` into `other`, overwriting
    /// duplicate keys there.
    ///
    /// Both tables are locked for the duration, acquired in address order so
    /// concurrent cross-merges cannot deadlock. Merging a table into itself
    /// is a no-op.
    pub fn merge_into(&self, other: &DictTable<V>)
    where
        V: Clone + Send,
    {
        if core::ptr::eq(self, other) {
            return;
        }
        let (_first, _second);
        if (self as *const Self as usize) < (other as *const Self as usize) {
            _first = self.lock.lock();
            _second = other.lock.lock();
        } else {
            _second = other.lock.lock();
            _first = self.lock.lock();
        }
        let guard = epoch::pin();
        other.ensure_capacity_inner(
            other.count.load(Ordering::Relaxed) + self.count.load(Ordering::Relaxed),
            &guard,
        );
        self.for_each_bucket(&guard, |bucket| {
            other.add_inner(bucket.key.clone(), bucket.value.clone(), true, &guard);
        });
    }

    /// Statistics snapshot, taken under the mutation lock.
    #[cfg(feature = "stats")]
    pub fn stats(&self) -> DictStats {
        let _lock = self.lock.lock();
        let guard = epoch::pin();
        let len = self.count.load(Ordering::Relaxed);
        let fill = self.fill.load(Ordering::Relaxed);
        let index = self.index.load(Ordering::Relaxed, &guard);
        let index_capacity = if index.is_null() {
            0
        } else {
            // SAFETY: non-null arrays are valid until retired, and the lock
            // keeps this one current.
            unsafe { index.deref() }.slots.len()
        };
        let buckets = self.buckets.load(Ordering::Relaxed, &guard);
        let bucket_slots = if buckets.is_null() {
            0
        } else {
            // SAFETY: as above.
            unsafe { buckets.deref() }.len.load(Ordering::Relaxed)
        };
        DictStats {
            len,
            index_capacity,
            bucket_slots,
            tombstones: fill - len,
            load_factor: if index_capacity == 0 {
                0.0
            } else {
                len as f64 / index_capacity as f64
            },
            homogeneous: self.strategy_state(&guard),
        }
    }

    #[cfg(any(test, feature = "stats"))]
    fn strategy_state(&self, guard: &Guard) -> Option<bool> {
        let strategy = self.strategy.load(Ordering::Acquire, guard);
        if strategy.is_null() {
            None
        } else {
            // SAFETY: strategy records are retired only after replacement.
            Some(unsafe { strategy.deref() }.kind.is_some())
        }
    }

    #[cfg(test)]
    fn index_capacity(&self) -> usize {
        let guard = epoch::pin();
        let index = self.index.load(Ordering::Acquire, &guard);
        if index.is_null() {
            0
        } else {
            // SAFETY: non-null arrays are valid while the guard is held.
            unsafe { index.deref() }.slots.len()
        }
    }

    // --- lock-free read core -------------------------------------------

    /// Probe for `key`. Returns a reference valid for the guard's lifetime.
    ///
    /// The retry loop handles the one cross-array race a reader can observe:
    /// an index entry referring past the end of an already-replaced bucket
    /// array. Reloading both arrays is guaranteed to make progress because
    /// the mutator publishes the bucket array before any index entry that
    /// refers into it.
    fn get_in<'g>(&self, key: &Key, guard: &'g Guard) -> Option<&'g Bucket<V>> {
        'retry: loop {
            let index = self.index.load(Ordering::Acquire, guard);
            if index.is_null() {
                return None;
            }
            // SAFETY: non-null arrays are fully initialized before being
            // published and stay valid while the guard pins the epoch.
            let index = unsafe { index.deref() };
            let buckets = self.buckets.load(Ordering::Acquire, guard);
            if buckets.is_null() {
                return None;
            }
            // SAFETY: as above.
            let buckets = unsafe { buckets.deref() };

            let (hash_fn, eq_fn) = self.current_fns(guard);
            let hash = hash_fn(key);
            let capacity = index.slots.len();
            let mut slot = hash as usize % capacity;
            loop {
                let entry = index.slots[slot].load(Ordering::Acquire);
                if entry == FREE {
                    return None;
                }
                if entry >= 0 {
                    let pos = entry as usize;
                    if pos >= buckets.len.load(Ordering::Acquire) || pos >= buckets.slots.len() {
                        continue 'retry;
                    }
                    let bucket = buckets.slots[pos].load(Ordering::Acquire, guard);
                    if !bucket.is_null() {
                        // SAFETY: records are immutable once published and
                        // retired records outlive the pinned epoch.
                        let bucket = unsafe { bucket.deref() };
                        if bucket.hash == hash && eq_fn(&bucket.key, key) {
                            return Some(bucket);
                        }
                    }
                }
                slot += 1;
                if slot == capacity {
                    slot = 0;
                }
            }
        }
    }

    fn current_fns(&self, guard: &Guard) -> (HashFn, EqFn) {
        let strategy = self.strategy.load(Ordering::Acquire, guard);
        if strategy.is_null() {
            ops_for(None)
        } else {
            // SAFETY: strategy records are retired only after replacement.
            let strategy = unsafe { strategy.deref() };
            (strategy.hash, strategy.eq)
        }
    }

    // --- mutation cores (mutation lock held) ---------------------------

    fn init_storage(&self, capacity: usize, guard: &Guard) {
        let capacity = capacity.max(INITIAL_CAPACITY);
        assert!(capacity <= i32::MAX as usize, "index capacity overflow");
        debug_assert!(self.index.load(Ordering::Relaxed, guard).is_null());
        // Buckets first: a reader that sees the index also sees storage.
        self.buckets.store(
            Owned::new(BucketArray::with_capacity(capacity)),
            Ordering::Release,
        );
        self.index.store(
            Owned::new(IndexArray::with_capacity(capacity)),
            Ordering::Release,
        );
        self.fill.store(0, Ordering::Relaxed);
    }

    /// Pick the probe pair for `key`, updating the specialization state:
    /// first key selects its kind's pair, a key of a second kind (or a null
    /// key) permanently degrades the table to the generic pair.
    fn observe_kind(&self, key: &Key, guard: &Guard) -> (HashFn, EqFn) {
        let kind = key.kind();
        let current = self.strategy.load(Ordering::Relaxed, guard);
        if current.is_null() {
            let strategy = Strategy::for_kind(kind);
            let fns = (strategy.hash, strategy.eq);
            self.strategy.store(Owned::new(strategy), Ordering::Release);
            return fns;
        }
        // SAFETY: strategy records are retired only after replacement.
        let strategy = unsafe { current.deref() };
        match strategy.kind {
            None => (strategy.hash, strategy.eq),
            Some(observed) if Some(observed) == kind => (strategy.hash, strategy.eq),
            Some(_) => {
                self.become_heterogeneous(current, guard);
                ops_for(None)
            }
        }
    }

    /// Permanent homogeneous → heterogeneous switch. The index array is
    /// cloned before any structural write under the new pair, so a reader
    /// still probing the old array with the old pair completes against a
    /// stable, self-consistent view.
    fn become_heterogeneous(&self, old_strategy: Shared<'_, Strategy>, guard: &Guard) {
        let index = self.index.load(Ordering::Relaxed, guard);
        if !index.is_null() {
            // SAFETY: current array, lock held.
            let snapshot = unsafe { index.deref() }.snapshot();
            self.index.store(Owned::new(snapshot), Ordering::Release);
            // SAFETY: the old array is unreachable to new readers.
            unsafe { guard.defer_destroy(index) };
        }
        self.strategy
            .store(Owned::new(Strategy::generic()), Ordering::Release);
        // SAFETY: the old strategy is unreachable to new readers.
        unsafe { guard.defer_destroy(old_strategy) };
    }

    fn add_inner(&self, key: Key, value: V, check_kind: bool, guard: &Guard)
    where
        V: Send,
    {
        if self.index.load(Ordering::Relaxed, guard).is_null() {
            self.init_storage(INITIAL_CAPACITY, guard);
        }
        let (hash_fn, eq_fn) = if check_kind {
            self.observe_kind(&key, guard)
        } else {
            self.current_fns(guard)
        };
        let hash = hash_fn(&key);

        // Load after observe_kind: the strategy switch replaces the index.
        // SAFETY: storage is initialized above and current under the lock.
        let index = unsafe { self.index.load(Ordering::Relaxed, guard).deref() };
        let buckets = unsafe { self.buckets.load(Ordering::Relaxed, guard).deref() };

        let capacity = index.slots.len();
        let mut slot = hash as usize % capacity;
        let mut recycled = None;
        let target = loop {
            let entry = index.slots[slot].load(Ordering::Relaxed);
            if entry == FREE {
                break recycled.unwrap_or(slot);
            }
            if entry == DUMMY {
                if recycled.is_none() {
                    recycled = Some(slot);
                }
            } else {
                let pos = entry as usize;
                let bucket = buckets.slots[pos].load(Ordering::Relaxed, guard);
                debug_assert!(!bucket.is_null());
                // SAFETY: live index entries reference live records.
                let existing = unsafe { bucket.deref() };
                if existing.hash == hash && eq_fn(&existing.key, &key) {
                    // Overwrite: install a fresh record, never mutate one.
                    let replacement = Owned::new(Bucket { key, value, hash });
                    buckets.slots[pos].store(replacement, Ordering::Release);
                    // SAFETY: unreachable to new readers once replaced.
                    unsafe { guard.defer_destroy(bucket) };
                    self.version.fetch_add(1, Ordering::Release);
                    return;
                }
            }
            slot += 1;
            if slot == capacity {
                slot = 0;
            }
        };

        let pos = self.append_bucket(Bucket { key, value, hash }, guard);
        index.slots[target].store(pos as i32, Ordering::Release);
        if recycled.is_none() {
            self.fill.fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Release);
        self.version.fetch_add(1, Ordering::Release);

        let count = self.count.load(Ordering::Relaxed);
        if count > load_limit(capacity) {
            self.rebuild_index(capacity * GROWTH_FACTOR, guard);
        } else if self.fill.load(Ordering::Relaxed) > load_limit(capacity) {
            // Tombstone pressure: rebuild at the same capacity so probe
            // chains stay bounded without growing the table.
            self.rebuild_index(capacity, guard);
        }
    }

    /// Append a record to the bucket list, growing it if full. Returns the
    /// record's position.
    fn append_bucket(&self, bucket: Bucket<V>, guard: &Guard) -> usize {
        let mut shared = self.buckets.load(Ordering::Relaxed, guard);
        // SAFETY: storage is initialized on the add path before this call.
        let mut buckets = unsafe { shared.deref() };
        let len = buckets.len.load(Ordering::Relaxed);
        if len == buckets.slots.len() {
            let new_capacity = (buckets.slots.len() * 2).max(INITIAL_CAPACITY);
            assert!(new_capacity <= i32::MAX as usize, "bucket list overflow");
            let grown = BucketArray::with_capacity(new_capacity);
            for pos in 0..len {
                let record = buckets.slots[pos].load(Ordering::Relaxed, guard);
                grown.slots[pos].store(record, Ordering::Relaxed);
            }
            grown.len.store(len, Ordering::Relaxed);
            // Publish fully populated; the retired array shares the record
            // pointers but never frees them.
            self.buckets.store(Owned::new(grown), Ordering::Release);
            // SAFETY: unreachable to new readers once replaced.
            unsafe { guard.defer_destroy(shared) };
            shared = self.buckets.load(Ordering::Relaxed, guard);
            // SAFETY: just published.
            buckets = unsafe { shared.deref() };
        }
        buckets.slots[len].store(Owned::new(bucket), Ordering::Release);
        buckets.len.store(len + 1, Ordering::Release);
        len
    }

    /// Rebuild the index array at `new_capacity`, reindexing every live
    /// record by its stored hash. Records are reused as-is; keys are never
    /// rehashed.
    fn rebuild_index(&self, new_capacity: usize, guard: &Guard) {
        let new_capacity = new_capacity.max(INITIAL_CAPACITY);
        assert!(new_capacity <= i32::MAX as usize, "index capacity overflow");
        // SAFETY: storage is initialized on every path that rebuilds.
        let buckets = unsafe { self.buckets.load(Ordering::Relaxed, guard).deref() };
        let len = buckets.len.load(Ordering::Relaxed);
        let rebuilt = IndexArray::with_capacity(new_capacity);
        let mut live = 0;
        for pos in 0..len {
            let bucket = buckets.slots[pos].load(Ordering::Relaxed, guard);
            if bucket.is_null() {
                continue;
            }
            // SAFETY: non-null records are live under the lock.
            let hash = unsafe { bucket.deref() }.hash;
            let mut slot = hash as usize % new_capacity;
            while rebuilt.slots[slot].load(Ordering::Relaxed) != FREE {
                slot += 1;
                if slot == new_capacity {
                    slot = 0;
                }
            }
            rebuilt.slots[slot].store(pos as i32, Ordering::Relaxed);
            live += 1;
        }
        debug_assert_eq!(live, self.count.load(Ordering::Relaxed));
        // Publish only once fully populated: readers see the old, fully
        // valid array or this one, never a partially filled one.
        let old = self.index.swap(Owned::new(rebuilt), Ordering::Release, guard);
        self.fill.store(live, Ordering::Relaxed);
        if !old.is_null() {
            // SAFETY: unreachable to new readers once replaced.
            unsafe { guard.defer_destroy(old) };
        }
    }

    fn ensure_capacity_inner(&self, entries: usize, guard: &Guard) {
        let needed = capacity_for(entries);
        let index = self.index.load(Ordering::Relaxed, guard);
        if index.is_null() {
            self.init_storage(needed, guard);
            return;
        }
        // SAFETY: current array, lock held.
        let current = unsafe { index.deref() }.slots.len();
        if needed > current {
            self.rebuild_index(needed, guard);
        }
    }

    fn remove_in<'g>(&self, key: &Key, guard: &'g Guard) -> Option<&'g Bucket<V>>
    where
        V: Send,
    {
        let index = self.index.load(Ordering::Relaxed, guard);
        if index.is_null() {
            return None;
        }
        // SAFETY: current arrays, lock held.
        let index = unsafe { index.deref() };
        let buckets = unsafe { self.buckets.load(Ordering::Relaxed, guard).deref() };
        let (hash_fn, eq_fn) = self.current_fns(guard);
        let hash = hash_fn(key);
        let capacity = index.slots.len();
        let mut slot = hash as usize % capacity;
        loop {
            let entry = index.slots[slot].load(Ordering::Relaxed);
            if entry == FREE {
                return None;
            }
            if entry >= 0 {
                let pos = entry as usize;
                let bucket = buckets.slots[pos].load(Ordering::Relaxed, guard);
                debug_assert!(!bucket.is_null());
                // SAFETY: live index entries reference live records.
                let existing = unsafe { bucket.deref() };
                if existing.hash == hash && eq_fn(&existing.key, key) {
                    // Tombstone before the count moves: a racing reader must
                    // never see a decremented count while the record is
                    // still reachable.
                    buckets.slots[pos].store(Shared::null(), Ordering::Release);
                    index.slots[slot].store(DUMMY, Ordering::Release);
                    self.count.fetch_sub(1, Ordering::Release);
                    self.version.fetch_add(1, Ordering::Release);
                    // SAFETY: unreachable to new readers once tombstoned;
                    // the reference stays valid while the guard is pinned.
                    unsafe { guard.defer_destroy(bucket) };
                    return Some(existing);
                }
            }
            slot += 1;
            if slot == capacity {
                slot = 0;
            }
        }
    }

    fn clear_inner(&self, guard: &Guard)
    where
        V: Send,
    {
        let index = self.index.load(Ordering::Relaxed, guard);
        if index.is_null() {
            return;
        }
        let buckets = self.buckets.load(Ordering::Relaxed, guard);
        // SAFETY: current array, lock held.
        let bucket_arr = unsafe { buckets.deref() };
        let len = bucket_arr.len.load(Ordering::Relaxed);

        // Fresh arrays first, then the counter; the specialization state is
        // retained across clears.
        self.buckets.store(
            Owned::new(BucketArray::with_capacity(INITIAL_CAPACITY)),
            Ordering::Release,
        );
        self.index.store(
            Owned::new(IndexArray::with_capacity(INITIAL_CAPACITY)),
            Ordering::Release,
        );
        self.count.store(0, Ordering::Release);
        self.fill.store(0, Ordering::Relaxed);
        self.version.fetch_add(1, Ordering::Release);

        for pos in 0..len {
            let bucket = bucket_arr.slots[pos].load(Ordering::Relaxed, guard);
            if !bucket.is_null() {
                // SAFETY: unreachable to new readers once the arrays swap.
                unsafe { guard.defer_destroy(bucket) };
            }
        }
        // SAFETY: as above.
        unsafe {
            guard.defer_destroy(buckets);
            guard.defer_destroy(index);
        }
    }

    /// Visit every live record in bucket-list order. Caller holds the lock.
    fn for_each_bucket(&self, guard: &Guard, mut visit: impl FnMut(&Bucket<V>)) {
        let buckets = self.buckets.load(Ordering::Relaxed, guard);
        if buckets.is_null() {
            return;
        }
        // SAFETY: current array, lock held.
        let buckets = unsafe { buckets.deref() };
        let len = buckets.len.load(Ordering::Relaxed);
        for pos in 0..len {
            let bucket = buckets.slots[pos].load(Ordering::Relaxed, guard);
            if !bucket.is_null() {
                // SAFETY: non-null records are live under the lock.
                visit(unsafe { bucket.deref() });
            }
        }
    }
}

impl<V: Clone> Clone for DictTable<V> {
    /// Structural copy: the index array and bucket list are copied
    /// slot-for-slot (tombstones included, so positions stay aligned) and
    /// each live record is re-allocated with shallow-cloned key and value.
    /// The specialization state carries over. Subsequent mutations of either
    /// table do not affect the other.
    fn clone(&self) -> Self {
        let _lock = self.lock.lock();
        let guard = epoch::pin();
        let cloned = DictTable::new();

        let strategy = self.strategy.load(Ordering::Relaxed, &guard);
        if !strategy.is_null() {
            // SAFETY: strategy records are retired only after replacement.
            let strategy = *unsafe { strategy.deref() };
            cloned.strategy.store(Owned::new(strategy), Ordering::Relaxed);
        }

        let index = self.index.load(Ordering::Relaxed, &guard);
        if index.is_null() {
            return cloned;
        }
        // SAFETY: current arrays, lock held.
        let index = unsafe { index.deref() };
        let buckets = unsafe { self.buckets.load(Ordering::Relaxed, &guard).deref() };
        let len = buckets.len.load(Ordering::Relaxed);

        let new_buckets = BucketArray::with_capacity(buckets.slots.len());
        for pos in 0..len {
            let bucket = buckets.slots[pos].load(Ordering::Relaxed, &guard);
            if bucket.is_null() {
                continue;
            }
            // SAFETY: non-null records are live under the lock.
            let bucket = unsafe { bucket.deref() };
            new_buckets.slots[pos].store(
                Owned::new(Bucket {
                    key: bucket.key.clone(),
                    value: bucket.value.clone(),
                    hash: bucket.hash,
                }),
                Ordering::Relaxed,
            );
        }
        new_buckets.len.store(len, Ordering::Relaxed);

        // The clone is not shared yet; relaxed stores suffice.
        cloned
            .index
            .store(Owned::new(index.snapshot()), Ordering::Relaxed);
        cloned.buckets.store(Owned::new(new_buckets), Ordering::Relaxed);
        cloned
            .count
            .store(self.count.load(Ordering::Relaxed), Ordering::Relaxed);
        cloned
            .fill
            .store(self.fill.load(Ordering::Relaxed), Ordering::Relaxed);
        cloned
            .version
            .store(self.version.load(Ordering::Relaxed), Ordering::Relaxed);
        cloned
    }
}

impl<V> Drop for DictTable<V> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` proves no reader still holds these pointers,
        // so everything can be freed through the unprotected guard.
        unsafe {
            let guard = epoch::unprotected();
            let buckets = self.buckets.load(Ordering::Relaxed, guard);
            if !buckets.is_null() {
                let arr = buckets.deref();
                for pos in 0..arr.len.load(Ordering::Relaxed) {
                    let bucket = arr.slots[pos].load(Ordering::Relaxed, guard);
                    if !bucket.is_null() {
                        drop(bucket.into_owned());
                    }
                }
                drop(buckets.into_owned());
            }
            let index = self.index.load(Ordering::Relaxed, guard);
            if !index.is_null() {
                drop(index.into_owned());
            }
            let strategy = self.strategy.load(Ordering::Relaxed, guard);
            if !strategy.is_null() {
                drop(strategy.into_owned());
            }
        }
    }
}

impl<V: Debug> Debug for DictTable<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let _lock = self.lock.lock();
        let guard = epoch::pin();
        let mut map = f.debug_map();
        self.for_each_bucket(&guard, |bucket| {
            map.entry(&bucket.key, &bucket.value);
        });
        map.finish()
    }
}

impl<V: Clone> IntoIterator for &DictTable<V> {
    type Item = (Key, V);
    type IntoIter = Iter<V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over a point-in-time snapshot of a [`DictTable`]'s entries.
///
/// This `struct` is created by [`DictTable::iter()`].
pub struct Iter<V> {
    inner: std::vec::IntoIter<(Key, V)>,
}

impl<V> Iterator for Iter<V> {
    type Item = (Key, V);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<V> ExactSizeIterator for Iter<V> {}

impl<V> core::iter::FusedIterator for Iter<V> {}

/// Write guard over a [`DictTable`], created by [`DictTable::lock()`].
///
/// The guard's methods are the lock-already-held mutation cores; the table's
/// own mutation methods are acquire-and-delegate wrappers around them. Reads
/// remain lock-free while a guard is held.
pub struct WriteGuard<'a, V> {
    table: &'a DictTable<V>,
    _lock: MutexGuard<'a, ()>,
}

impl<V> WriteGuard<'_, V> {
    /// Lock-held core of [`DictTable::add`].
    pub fn add(&self, key: Key, value: V)
    where
        V: Send,
    {
        let guard = epoch::pin();
        self.table.add_inner(key, value, true, &guard);
    }

    /// Lock-held core of [`DictTable::remove`].
    pub fn remove(&self, key: &Key) -> bool
    where
        V: Send,
    {
        let guard = epoch::pin();
        self.table.remove_in(key, &guard).is_some()
    }

    /// Lock-held core of [`DictTable::try_remove`].
    pub fn try_remove(&self, key: &Key) -> Option<V>
    where
        V: Clone + Send,
    {
        let guard = epoch::pin();
        self.table
            .remove_in(key, &guard)
            .map(|bucket| bucket.value.clone())
    }

    /// Lock-held core of [`DictTable::clear`].
    pub fn clear(&self)
    where
        V: Send,
    {
        let guard = epoch::pin();
        self.table.clear_inner(&guard);
    }

    /// Lock-held core of [`DictTable::ensure_capacity`].
    pub fn ensure_capacity(&self, entries: usize) {
        let guard = epoch::pin();
        self.table.ensure_capacity_inner(entries, &guard);
    }
}
