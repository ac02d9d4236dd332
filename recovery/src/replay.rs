//! REPLAY stage (spec.md §4.G, grounded on `binlog_replay.c`): applies
//! the deduplicated binlog to the local storage engine, partitioned
//! across `RECOVERY_THREADS_PER_DATA_GROUP` worker threads by
//! `hash(block) mod thread_count`.
//!
//! Each worker owns a bounded freelist/waiting-queue pair (depth
//! `RECOVERY_MAX_QUEUE_DEPTH`); the dispatcher blocks (does not error)
//! on freelist exhaustion, matching `deal_binlog_buffer`'s
//! `fc_queue_pop(&thread_ctx->queues.freelist)` spin. Ordering within a
//! block needs no further synchronization: hash-partitioning plus a
//! FIFO waiting queue already serializes every record for one block
//! through the same worker in fetch order.

use crate::dedup::{payload_path, replay_binlog_path, replay_payload_dir};
use faststore_common::binlog::{BinlogRecord, OpType};
use faststore_common::{BlockSliceKey, Error, Result};
use faststore_storage::{Source, StorageEngine};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io::BufRead;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayStats {
    pub write_count: i64,
    pub allocate_count: i64,
    pub delete_count: i64,
    pub fail_count: i64,
}

struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Blocks until there is room, matching the original's freelist-pop
    /// spin (`deal_binlog_buffer`'s `while (1) { ...; if
    /// (!SF_G_CONTINUE_FLAG) return EINTR; }`).
    fn push_wait(&self, item: T, running: &AtomicBool) -> bool {
        let mut items = self.items.lock();
        while items.len() >= self.capacity {
            if !running.load(Ordering::Relaxed) {
                return false;
            }
            self.not_full.wait_for(&mut items, std::time::Duration::from_millis(100));
        }
        items.push_back(item);
        self.not_empty.notify_one();
        true
    }

    fn try_pop(&self) -> Option<T> {
        let mut items = self.items.lock();
        let item = items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }
}

struct ReplayTask {
    op_type: OpType,
    bs_key: BlockSliceKey,
    data_version: u64,
}

/// One of `RECOVERY_THREADS_PER_DATA_GROUP` replay workers.
struct ReplayThreadContext {
    waiting: BoundedQueue<ReplayTask>,
    stats: Mutex<ReplayStats>,
}

fn deal_task(
    task: ReplayTask,
    engine: &StorageEngine,
    payload_dir: &Path,
    stats: &Mutex<ReplayStats>,
) -> Result<()> {
    let result = match task.op_type {
        OpType::DeleteSlice => engine.delete_slices(task.bs_key, Source::Replay).map(|_| ()),
        OpType::DeleteBlock => engine.delete_block(task.bs_key.block, Source::Replay).map(|_| ()),
        OpType::WriteSlice => {
            let payload = std::fs::read(payload_path(payload_dir, task.data_version))?;
            engine
                .write_slice(task.bs_key.block, task.bs_key.slice.offset, &payload, Source::Replay)
                .map(|_| ())
        }
        OpType::AllocateSlice => engine
            .allocate_slice(
                task.bs_key.block,
                task.bs_key.slice.offset,
                task.bs_key.slice.length,
                Source::Replay,
            )
            .map(|_| ()),
        OpType::NoOp => Ok(()),
    };

    let mut stats = stats.lock();
    match (&result, task.op_type) {
        (Ok(_), OpType::WriteSlice) => stats.write_count += 1,
        (Ok(_), OpType::AllocateSlice) => stats.allocate_count += 1,
        (Ok(_), OpType::DeleteSlice | OpType::DeleteBlock) => stats.delete_count += 1,
        (Err(_), _) => stats.fail_count += 1,
        _ => {}
    }
    result
}

/// Runs the REPLAY stage against `replay_dir`'s deduplicated binlog,
/// applying every record to `engine` via the same storage-engine
/// operations live traffic uses, tagged `Source::Replay` so nothing is
/// re-replicated (spec.md §4.G).
pub fn replay_stage(
    engine: &StorageEngine,
    replay_dir: &Path,
    thread_count: usize,
    max_queue_depth: usize,
) -> Result<ReplayStats> {
    let thread_count = thread_count.max(1);
    let contexts: Vec<Arc<ReplayThreadContext>> = (0..thread_count)
        .map(|_| {
            Arc::new(ReplayThreadContext {
                waiting: BoundedQueue::new(max_queue_depth.max(1)),
                stats: Mutex::new(ReplayStats::default()),
            })
        })
        .collect();

    let running = AtomicBool::new(true);
    let pending = AtomicI64::new(0);
    let first_error: Mutex<Option<Error>> = Mutex::new(None);
    let payload_dir = replay_payload_dir(replay_dir);

    let dispatch_result = std::thread::scope(|scope| {
        for ctx in &contexts {
            let running = &running;
            let pending = &pending;
            let first_error = &first_error;
            let payload_dir = &payload_dir;
            scope.spawn(move || {
                while running.load(Ordering::Relaxed) {
                    let Some(task) = ctx.waiting.try_pop() else {
                        std::thread::sleep(std::time::Duration::from_millis(50));
                        if pending.load(Ordering::Relaxed) == 0 && !running.load(Ordering::Relaxed) {
                            break;
                        }
                        continue;
                    };
                    if let Err(e) = deal_task(task, engine, payload_dir, &ctx.stats) {
                        let mut first = first_error.lock();
                        if first.is_none() {
                            *first = Some(e);
                        }
                    }
                    pending.fetch_sub(1, Ordering::SeqCst);
                }
            });
        }

        let dispatch_result =
            dispatch_records(replay_dir, &contexts, thread_count, &pending, &running);

        // Let workers drain the waiting queues, then signal shutdown.
        while pending.load(Ordering::SeqCst) > 0 && running.load(Ordering::Relaxed) {
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        running.store(false, Ordering::SeqCst);
        dispatch_result
    });

    dispatch_result?;
    if let Some(e) = first_error.lock().take() {
        return Err(e);
    }

    let mut total = ReplayStats::default();
    for ctx in &contexts {
        let s = *ctx.stats.lock();
        total.write_count += s.write_count;
        total.allocate_count += s.allocate_count;
        total.delete_count += s.delete_count;
        total.fail_count += s.fail_count;
    }
    Ok(total)
}

fn dispatch_records(
    replay_dir: &Path,
    contexts: &[Arc<ReplayThreadContext>],
    thread_count: usize,
    pending: &AtomicI64,
    running: &AtomicBool,
) -> Result<()> {
    let path = replay_binlog_path(replay_dir);
    if !path.exists() {
        return Ok(());
    }
    let file = std::fs::File::open(&path)?;
    for line in std::io::BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = BinlogRecord::parse(&line)?;
        if record.op_type == OpType::NoOp {
            continue;
        }
        // DeleteBlock carries no slice range; `delete_block` only ever
        // reads `bs_key.block`, so the zero-length placeholder is inert.
        let slice = record
            .slice
            .unwrap_or_else(|| faststore_common::SliceKey::new(0, 0));
        let bs_key = BlockSliceKey::new(record.block, slice);
        let shard = (record.block.hash_code() as usize) % thread_count;

        pending.fetch_add(1, Ordering::SeqCst);
        let pushed = contexts[shard].waiting.push_wait(
            ReplayTask {
                op_type: record.op_type,
                bs_key,
                data_version: record.data_version,
            },
            running,
        );
        if !pushed {
            pending.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Interrupted);
        }
    }
    Ok(())
}
