//! A sharded free-list object pool.
//!
//! Each shard hands out an object from its own free list on a hit, or a
//! fresh one from `factory` on a miss; mutation of the free list is
//! guarded by the shard's own lock, matching the original's
//! `fast_mblock`-per-shard design (`fs_api_allocator.c`'s
//! `task_slice_pair`/`waiting_task`/`slice_entry` mblocks, one triplet
//! per allocator context). A returned object is pushed back verbatim —
//! it is *not* cleared or re-run through `factory` — so callers must
//! overwrite whatever fields they care about immediately after
//! `alloc`, the same contract `fast_mblock_alloc_object` gives its
//! callers in the original. `BufferPool` is the one pool in this crate
//! that does clear its contents on return, since a stale combine buffer
//! would otherwise leak a previous slice's bytes into the next one.

use parking_lot::Mutex;

/// A pooled object, returned to its shard's free list when dropped.
pub struct PooledObject<T> {
    inner: Option<Box<T>>,
    shard: *const Mutex<Vec<Box<T>>>,
}

// SAFETY: the raw pointer only ever refers to a `Mutex<Vec<Box<T>>>` owned
// by the `ObjectPool` that produced this handle, which outlives every
// `PooledObject` drawn from it (an `ObjectPool` is never torn down while
// handles are outstanding in this codebase's usage — all pools live for
// the duration of the owning `Engine`).
unsafe impl<T: Send> Send for PooledObject<T> {}

impl<T> std::ops::Deref for PooledObject<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.inner.as_deref().expect("PooledObject used after release")
    }
}

impl<T> std::ops::DerefMut for PooledObject<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner.as_deref_mut().expect("PooledObject used after release")
    }
}

impl<T> Drop for PooledObject<T> {
    fn drop(&mut self) {
        if let Some(obj) = self.inner.take() {
            // SAFETY: see the `unsafe impl Send` note above.
            let shard = unsafe { &*self.shard };
            shard.lock().push(obj);
        }
    }
}

struct Shard<T> {
    free: Mutex<Vec<Box<T>>>,
}

/// A sharded pool of reusable `T`s. `factory` constructs a fresh `T` on a
/// free-list miss; the pool never shrinks below whatever is currently
/// checked back in.
pub struct ObjectPool<T> {
    shards: Vec<Shard<T>>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T> ObjectPool<T> {
    pub fn new(shard_count: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        let mut shards = Vec::with_capacity(shard_count);
        shards.resize_with(shard_count, || Shard {
            free: Mutex::new(Vec::new()),
        });
        Self {
            shards,
            factory: Box::new(factory),
        }
    }

    /// Pre-populate a shard's free list with `count` fresh objects, as
    /// the original pre-allocates its mblocks up front.
    pub fn prealloc(&self, shard_index: usize, count: usize) {
        let mut free = self.shards[shard_index].free.lock();
        free.reserve(count);
        for _ in 0..count {
            free.push(Box::new((self.factory)()));
        }
    }

    pub fn alloc(&self, shard_index: usize) -> PooledObject<T> {
        let shard = &self.shards[shard_index];
        let obj = shard.free.lock().pop().unwrap_or_else(|| Box::new((self.factory)()));
        PooledObject {
            inner: Some(obj),
            shard: &shard.free as *const _,
        }
    }

    /// Number of objects currently idle in `shard_index`'s free list.
    pub fn idle_count(&self, shard_index: usize) -> usize {
        self.shards[shard_index].free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_returned_objects() {
        let pool: ObjectPool<Vec<u8>> = ObjectPool::new(4, Vec::new);
        {
            let mut obj = pool.alloc(0);
            obj.push(1);
        }
        assert_eq!(pool.idle_count(0), 1);
        let obj = pool.alloc(0);
        assert_eq!(obj.len(), 1, "should have reused the returned Vec");
    }

    #[test]
    fn prealloc_populates_free_list() {
        let pool: ObjectPool<u32> = ObjectPool::new(2, || 0);
        pool.prealloc(1, 5);
        assert_eq!(pool.idle_count(1), 5);
        assert_eq!(pool.idle_count(0), 0);
    }
}
