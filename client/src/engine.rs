//! The write-combine engine itself: `combine_write` plus the timeout
//! flush that backs it (spec.md §4.C).

use crate::slice::{CombineResult, SliceEntry};
use crate::transport::Transport;
use crate::wheel::TimingWheel;
use faststore_alloc::{BufferPool, VersionIssuer};
use faststore_common::config::WriteCombineConfig;
use faststore_common::{BlockKey, Error, Opid, Otid, Result, SliceKey};
use faststore_htable::{OpidTable, OtidTable, ShardedTableConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A single caller's write, as handed to [`CombineEngine::combine_write`].
pub struct WriteContext {
    pub otid: Otid,
    pub opid: Opid,
    pub block: BlockKey,
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// Outcome of a successful `combine_write` call: whether this write was
/// absorbed into an existing slice, and a receiver that resolves once
/// the (possibly shared) underlying RPC completes.
pub struct CombineOutcome {
    pub combined: bool,
    pub successive_count: i64,
    pub completion: flume::Receiver<CombineResult>,
}

pub struct CombineEngine {
    otid_table: OtidTable<SliceEntry>,
    opid_table: OpidTable,
    buffer_pool: BufferPool,
    version_issuer: VersionIssuer,
    wheel: TimingWheel,
    transport: Arc<dyn Transport>,
    cfg: WriteCombineConfig,
    alloc_shard_count: usize,
}

impl CombineEngine {
    pub fn new(
        cfg: WriteCombineConfig,
        otid_cfg: ShardedTableConfig,
        opid_cfg: ShardedTableConfig,
        alloc_shard_count: usize,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            otid_table: OtidTable::new(otid_cfg),
            opid_table: OpidTable::new(opid_cfg),
            buffer_pool: BufferPool::new(alloc_shard_count, cfg.buffer_size),
            version_issuer: VersionIssuer::new(alloc_shard_count),
            wheel: TimingWheel::new(alloc_shard_count),
            transport,
            cfg,
            alloc_shard_count,
        }
    }

    fn shard_for(&self, block: &BlockKey) -> usize {
        faststore_alloc::shard_for(block, self.alloc_shard_count)
    }

    /// `combine_write(op_ctx, buff)` (spec.md §4.C). Returns an error
    /// synchronously only for the fatal "this write alone can never fit
    /// in a slice" case; otherwise the returned receiver carries the
    /// eventual RPC outcome.
    pub fn combine_write(&self, ctx: WriteContext) -> Result<CombineOutcome> {
        if ctx.payload.len() > self.cfg.buffer_size {
            return Err(Error::ResourceExhausted(format!(
                "write of {} bytes exceeds buffer_size {}",
                ctx.payload.len(),
                self.cfg.buffer_size
            )));
        }

        let new_slice_key = SliceKey::new(ctx.offset as i32, ctx.payload.len() as i32);
        let shard = self.shard_for(&ctx.block);

        // Ordering entry (spec.md §4.B/§3): `(OPID, block)` tracks
        // sequential-write detection independent of OTID churn. This is
        // the `successive_count` reported back to the caller (spec.md
        // §8 property 8), distinct from the OTIDEntry's own
        // `successive_count`, which only gates the combine decision.
        let opid_successive = self
            .opid_table
            .insert(ctx.opid, ctx.block, ctx.offset, ctx.payload.len() as i64);

        enum Outcome {
            Combined {
                rx: flume::Receiver<CombineResult>,
            },
            New {
                flushed: Option<SliceEntry>,
                rx: flume::Receiver<CombineResult>,
                deadline: Instant,
                version: faststore_common::SliceVersion,
            },
        }

        let outcome = self.otid_table.with_entry_mut(ctx.otid, ctx.block, |entry| {
            let can_combine = matches!(
                &entry.current_slice,
                Some(slice)
                    if new_slice_key.follows(&slice.slice)
                        && (slice.slice.length + new_slice_key.length) as usize <= self.cfg.buffer_size
            );

            if can_combine {
                let slice = entry.current_slice.as_mut().expect("checked above");
                slice.extend(&ctx.payload);
                let rx = slice.register_waiter();
                entry.successive_count += 1;
                entry.last_write_offset = ctx.offset;
                return Outcome::Combined { rx };
            }

            let flushed = entry.current_slice.take();
            let version = self.version_issuer.next(shard);
            let buffer = self.buffer_pool.alloc(shard);
            let mut new_entry = SliceEntry::new(ctx.block, new_slice_key, version, buffer);
            new_entry.extend(&ctx.payload);
            let rx = new_entry.register_waiter();
            entry.current_slice = Some(new_entry);
            entry.successive_count = 0;
            entry.last_write_offset = ctx.offset;

            Outcome::New {
                flushed,
                rx,
                deadline: Instant::now() + Duration::from_millis(self.cfg.max_wait_ms),
                version,
            }
        });

        match outcome {
            Outcome::Combined { rx } => Ok(CombineOutcome {
                combined: true,
                successive_count: opid_successive,
                completion: rx,
            }),
            Outcome::New {
                flushed,
                rx,
                deadline,
                version,
            } => {
                if let Some(old) = flushed {
                    self.dispatch_async(old);
                }
                self.wheel.schedule(ctx.otid, ctx.block, version, deadline);
                Ok(CombineOutcome {
                    combined: false,
                    successive_count: opid_successive,
                    completion: rx,
                })
            }
        }
    }

    /// Drives the timing wheel once, flushing every slice whose
    /// deadline has passed and that no concurrent combine has already
    /// replaced. Callers run this on a periodic background tick.
    pub fn tick(&self) {
        let now = Instant::now();
        for pending in self.wheel.drain_expired(now) {
            let claimed = self.otid_table.take_current_slice_if(
                pending.otid,
                pending.block,
                |slice| slice.version == pending.version,
            );
            if let Some(slice) = claimed {
                self.dispatch_async(slice);
            }
        }
    }

    /// Dispatches a flushed slice's RPC and wakes every caller waiting
    /// on it, off the caller's own call stack.
    fn dispatch_async(&self, mut slice: SliceEntry) {
        let transport = self.transport.clone();
        std::thread::spawn(move || {
            let result: CombineResult = transport.send(&slice).map_err(Arc::new);
            slice.notify_waiters(&result);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingTransport {
        sends: Mutex<Vec<Vec<u8>>>,
        calls: AtomicUsize,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self {
                sends: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Transport for RecordingTransport {
        fn send(&self, slice: &SliceEntry) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sends.lock().unwrap().push(slice.buffer.clone());
            Ok(())
        }
    }

    fn engine(transport: Arc<RecordingTransport>, max_wait_ms: u64) -> CombineEngine {
        let htable_cfg = ShardedTableConfig {
            sharding_count: 2,
            element_limit: 1024,
            min_ttl_ms: 60_000,
            max_ttl_ms: 120_000,
        };
        CombineEngine::new(
            WriteCombineConfig {
                buffer_size: 16384,
                min_wait_ms: 5,
                max_wait_ms,
            },
            htable_cfg,
            htable_cfg,
            4,
            transport,
        )
    }

    #[test]
    fn s1_coalesce_contiguous_writes() {
        let transport = Arc::new(RecordingTransport::new());
        let engine = engine(transport.clone(), 200);
        let block = BlockKey::new(1, 0);

        let a = engine
            .combine_write(WriteContext {
                otid: 7,
                opid: 1,
                block,
                offset: 0,
                payload: vec![b'A'; 4096],
            })
            .unwrap();
        assert!(!a.combined);

        let b = engine
            .combine_write(WriteContext {
                otid: 7,
                opid: 1,
                block,
                offset: 4096,
                payload: vec![b'B'; 4096],
            })
            .unwrap();
        assert!(b.combined);
        assert_eq!(b.successive_count, 1);

        assert_eq!(transport.calls.load(Ordering::SeqCst), 0, "nothing flushed yet");
    }

    #[test]
    fn s2_non_contiguous_flushes_and_resets() {
        let transport = Arc::new(RecordingTransport::new());
        let engine = engine(transport.clone(), 200);
        let block = BlockKey::new(1, 0);

        engine
            .combine_write(WriteContext {
                otid: 7,
                opid: 1,
                block,
                offset: 0,
                payload: vec![b'A'; 4096],
            })
            .unwrap();

        let second = engine
            .combine_write(WriteContext {
                otid: 7,
                opid: 1,
                block,
                offset: 8192,
                payload: vec![b'C'; 4096],
            })
            .unwrap();
        assert!(!second.combined);
        assert_eq!(second.successive_count, 0);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1, "first slice flushed on replace");
    }

    #[test]
    fn s3_timeout_flush_wakes_waiter() {
        let transport = Arc::new(RecordingTransport::new());
        let engine = engine(transport.clone(), 20);
        let block = BlockKey::new(2, 0);

        let outcome = engine
            .combine_write(WriteContext {
                otid: 9,
                opid: 1,
                block,
                offset: 0,
                payload: vec![b'Z'; 128],
            })
            .unwrap();

        std::thread::sleep(Duration::from_millis(30));
        engine.tick();

        let result = outcome
            .completion
            .recv_timeout(Duration::from_millis(500))
            .expect("waiter should be woken after timeout flush");
        assert!(result.is_ok());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }
}
