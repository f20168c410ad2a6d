//! The host resource table: live resources keyed by integer id, plus the
//! string-keyed persistent list.
//!
//! Both lists are vectors of [`Bucket`]s in insertion order with hash chains
//! threaded through each value slot's `aux` word. Removal leaves a tombstone
//! (an undef slot) so iteration order and chain links stay intact; tombstones
//! are reclaimed by [`ResourceTable::compact`], which also runs on its own
//! once they outnumber live entries.
//!
//! Ids start at 1 and are never reused by a table.

use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use thiserror::Error;
use tracing::trace;

use crate::layout::{Bucket, INVALID_INDEX, RawValue, ResourcePtr, hash_key};
use crate::value::Value;

const COMPACT_MIN_TOMBSTONES: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    pub fn new(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Resource id #{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("resource table is full ({0} live entries)")]
    Full(usize),
    #[error("persistent key `{0}` is already registered")]
    DuplicateKey(String),
}

struct BucketList {
    buckets: Vec<Bucket>,
    heads: HashMap<u64, u32>,
    live: usize,
}

// Buckets carry raw pointers; every access goes through the owning RwLock.
unsafe impl Send for BucketList {}
unsafe impl Sync for BucketList {}

impl BucketList {
    fn new() -> Self {
        Self {
            buckets: Vec::new(),
            heads: HashMap::new(),
            live: 0,
        }
    }

    fn push(&mut self, mut bucket: Bucket) {
        let pos = self.buckets.len() as u32;
        let next = self.heads.insert(bucket.hash(), pos).unwrap_or(INVALID_INDEX);
        bucket.val_mut().set_aux(next);
        self.buckets.push(bucket);
        self.live += 1;
    }

    fn find(&self, h: u64, key: Option<&str>) -> Option<usize> {
        let mut idx = *self.heads.get(&h)?;
        while idx != INVALID_INDEX {
            let bucket = &self.buckets[idx as usize];
            if !bucket.is_tombstone() && bucket.hash() == h && bucket.key() == key {
                return Some(idx as usize);
            }
            idx = bucket.val().aux();
        }
        None
    }

    fn get(&self, h: u64, key: Option<&str>) -> Option<ResourcePtr> {
        let idx = self.find(h, key)?;
        self.buckets[idx].val().get().as_resource()
    }

    fn remove(&mut self, h: u64, key: Option<&str>) -> Option<ResourcePtr> {
        let idx = self.find(h, key)?;
        let slot = self.buckets[idx].val_mut();
        let ptr = slot.get().as_resource();
        slot.set(Value::Undef);
        self.live -= 1;
        ptr
    }

    fn tombstones(&self) -> usize {
        self.buckets.len() - self.live
    }

    fn compact(&mut self) -> usize {
        let before = self.buckets.len();
        let old = std::mem::take(&mut self.buckets);
        self.heads.clear();
        self.live = 0;
        for bucket in old {
            if !bucket.is_tombstone() {
                self.push(bucket);
            }
        }
        before - self.buckets.len()
    }

    fn maybe_compact(&mut self) {
        let tombstones = self.tombstones();
        if tombstones >= COMPACT_MIN_TOMBSTONES && tombstones > self.live {
            let reclaimed = self.compact();
            trace!(reclaimed, live = self.live, "resource table compacted");
        }
    }

    fn live(&self) -> impl Iterator<Item = (&Bucket, ResourcePtr)> {
        self.buckets
            .iter()
            .filter_map(|bucket| bucket.val().get().as_resource().map(|ptr| (bucket, ptr)))
    }
}

struct IndexedList {
    list: BucketList,
    next_free: u64,
}

pub struct ResourceTable {
    regular: RwLock<IndexedList>,
    persistent: RwLock<BucketList>,
    limit: Option<usize>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self {
            regular: RwLock::new(IndexedList {
                list: BucketList::new(),
                next_free: 1,
            }),
            persistent: RwLock::new(BucketList::new()),
            limit: None,
        }
    }

    /// A table that refuses registrations beyond `limit` live entries.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new()
        }
    }

    /// Registers `ptr` under a fresh id and stamps the id into the
    /// resource's `handle`.
    ///
    /// # Safety
    /// The caller must own a reference to `ptr`, and must remove the entry
    /// before the record is freed.
    ///
    /// ```compile_fail,E0133
    /// use ragelord_obj_model::{ResourcePtr, ResourceTable};
    ///
    /// let table = ResourceTable::new();
    /// let _ = table.register(ResourcePtr::allocate(1));
    /// ```
    pub unsafe fn register(&self, ptr: ResourcePtr) -> Result<ResourceId, TableError> {
        let mut regular = self.regular.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(limit) = self.limit {
            if regular.list.live >= limit {
                return Err(TableError::Full(regular.list.live));
            }
        }
        let id = regular.next_free;
        regular.next_free += 1;
        // SAFETY: the caller owns a reference, so the record is alive.
        unsafe { ptr.as_ref() }.set_handle(id as i64);
        regular
            .list
            .push(Bucket::indexed(id, RawValue::from(Value::Resource(ptr))));
        Ok(ResourceId(id))
    }

    pub fn fetch(&self, id: ResourceId) -> Option<ResourcePtr> {
        let regular = self.regular.read().unwrap_or_else(PoisonError::into_inner);
        regular.list.get(id.0, None)
    }

    /// Runs `f` on the resource under `id` while holding the table's read
    /// lock. Removal takes the write lock, so a resource seen here is not
    /// freed until `f` returns.
    pub fn fetch_with<R>(&self, id: ResourceId, f: impl FnOnce(ResourcePtr) -> R) -> Option<R> {
        let regular = self.regular.read().unwrap_or_else(PoisonError::into_inner);
        regular.list.get(id.0, None).map(f)
    }

    pub fn unregister(&self, id: ResourceId) -> Option<ResourcePtr> {
        let mut regular = self.regular.write().unwrap_or_else(PoisonError::into_inner);
        let ptr = regular.list.remove(id.0, None);
        regular.list.maybe_compact();
        ptr
    }

    /// Stores `ptr` under `key`.
    ///
    /// # Safety
    /// The entry is treated as owning one reference to `ptr`; the caller must
    /// have taken that reference, and the record must outlive the entry.
    pub unsafe fn register_persistent(
        &self,
        key: &str,
        ptr: ResourcePtr,
    ) -> Result<(), TableError> {
        let mut persistent = self.persistent.write().unwrap_or_else(PoisonError::into_inner);
        if persistent.find(hash_key(key), Some(key)).is_some() {
            return Err(TableError::DuplicateKey(key.to_string()));
        }
        persistent.push(Bucket::keyed(key, RawValue::from(Value::Resource(ptr))));
        Ok(())
    }

    pub fn fetch_persistent(&self, key: &str) -> Option<ResourcePtr> {
        let persistent = self.persistent.read().unwrap_or_else(PoisonError::into_inner);
        persistent.get(hash_key(key), Some(key))
    }

    /// Persistent-list counterpart of [`ResourceTable::fetch_with`].
    pub fn fetch_persistent_with<R>(
        &self,
        key: &str,
        f: impl FnOnce(ResourcePtr) -> R,
    ) -> Option<R> {
        let persistent = self.persistent.read().unwrap_or_else(PoisonError::into_inner);
        persistent.get(hash_key(key), Some(key)).map(f)
    }

    pub fn unregister_persistent(&self, key: &str) -> Option<ResourcePtr> {
        let mut persistent = self.persistent.write().unwrap_or_else(PoisonError::into_inner);
        let ptr = persistent.remove(hash_key(key), Some(key));
        persistent.maybe_compact();
        ptr
    }

    /// Keys under which `ptr` is held in the persistent list.
    pub fn persistent_keys_of(&self, ptr: ResourcePtr) -> Vec<String> {
        let persistent = self.persistent.read().unwrap_or_else(PoisonError::into_inner);
        persistent
            .live()
            .filter(|(_, held)| *held == ptr)
            .filter_map(|(bucket, _)| bucket.key().map(str::to_string))
            .collect()
    }

    pub fn persistent_keys(&self) -> Vec<String> {
        let persistent = self.persistent.read().unwrap_or_else(PoisonError::into_inner);
        persistent
            .live()
            .filter_map(|(bucket, _)| bucket.key().map(str::to_string))
            .collect()
    }

    /// Live ids in registration order.
    pub fn ids(&self) -> Vec<ResourceId> {
        let regular = self.regular.read().unwrap_or_else(PoisonError::into_inner);
        regular
            .list
            .live()
            .map(|(bucket, _)| ResourceId(bucket.hash()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.regular.read().unwrap_or_else(PoisonError::into_inner).list.live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn persistent_len(&self) -> usize {
        self.persistent.read().unwrap_or_else(PoisonError::into_inner).live
    }

    /// Drops every tombstone from both lists; returns how many were reclaimed.
    pub fn compact(&self) -> usize {
        let regular = self
            .regular
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .list
            .compact();
        let persistent = self
            .persistent
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .compact();
        regular + persistent
    }
}

impl Default for ResourceTable {
    fn default() -> Self {
        Self::new()
    }
}
