//! Sharded pool of fixed-capacity combine buffers
//! (`write_combine.buffer_size`, spec.md §3 `SliceEntry`).

use parking_lot::Mutex;

pub struct PooledBuffer {
    inner: Option<Vec<u8>>,
    shard: *const Mutex<Vec<Vec<u8>>>,
}

unsafe impl Send for PooledBuffer {}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<u8>;
    fn deref(&self) -> &Vec<u8> {
        self.inner.as_ref().expect("PooledBuffer used after release")
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.inner.as_mut().expect("PooledBuffer used after release")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(mut buf) = self.inner.take() {
            buf.clear();
            // SAFETY: the shard pointer refers to a `BufferPool`-owned
            // `Mutex` that outlives every buffer handle drawn from it.
            let shard = unsafe { &*self.shard };
            shard.lock().push(buf);
        }
    }
}

struct Shard {
    free: Mutex<Vec<Vec<u8>>>,
}

/// A sharded pool of zero-length, `capacity`-preallocated byte buffers.
pub struct BufferPool {
    shards: Vec<Shard>,
    capacity: usize,
}

impl BufferPool {
    pub fn new(shard_count: usize, capacity: usize) -> Self {
        let mut shards = Vec::with_capacity(shard_count);
        shards.resize_with(shard_count, || Shard {
            free: Mutex::new(Vec::new()),
        });
        Self { shards, capacity }
    }

    pub fn alloc(&self, shard_index: usize) -> PooledBuffer {
        let shard = &self.shards[shard_index];
        let buf = shard
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.capacity));
        PooledBuffer {
            inner: Some(buf),
            shard: &shard.free as *const _,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.capacity
    }
}
