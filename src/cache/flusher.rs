//! ダーティエントリのライトバックとリタイア.
//!
//! ライトバックはダーティリスト(ログ順)の先頭から進められ、同期点の世代を
//! 跨ぐ並行フラッシュは行われない. これにより、下位ストアが観測する順序は
//! 利用者へ通知した順序と矛盾しない.
//!
//! リタイアは、リング先頭から連続する「ライトバック済みで参照も無い」
//! エントリ群を一トランザクションで回収し、`first_valid_entry`を前進させる.
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::{
    dispatch, fatal, update_resource_gauges, CacheInner, ImageWriteback,
    IN_FLIGHT_FLUSH_BYTES_LIMIT, IN_FLIGHT_FLUSH_WRITE_LIMIT, MAX_FREE_PER_TRANSACTION,
    RETIRE_BATCH_TIME_LIMIT_MS,
};
use crate::log::{Reservation, WriteLogEntry, BLOCK_ALLOC_OVERHEAD_BYTES};
use crate::pmem::PersistentMemory;

/// ダーティリストの先頭から、フラッシュ可能なエントリを下位ストアへ書き出す.
pub(crate) fn process_writeback<P, D>(inner: &Arc<CacheInner<P, D>>)
where
    P: PersistentMemory,
    D: ImageWriteback,
{
    enum Action {
        Stop,
        Skip,
        Flush(Arc<WriteLogEntry>),
    }
    loop {
        let action = {
            let mut state = inner.state.lock().expect("Never fails");
            if state.flush_ops_in_flight >= IN_FLIGHT_FLUSH_WRITE_LIMIT
                || state.flush_bytes_in_flight >= IN_FLIGHT_FLUSH_BYTES_LIMIT
            {
                Action::Stop
            } else if let Some(entry) = state.dirty_entries.front().cloned() {
                let eligible = entry.is_completed()
                    && (state.flush_ops_in_flight == 0
                        || entry.sync_gen() <= state.lowest_flushing_sync_gen);
                if !eligible {
                    Action::Stop
                } else {
                    state.dirty_entries.pop_front();
                    if state.invalidating {
                        // 無効化中: 下位への書き込みは抑止し、書き出し済みとして扱う
                        entry.mark_flushed();
                        state.bytes_dirty -= u64::from(entry.write_bytes());
                        update_resource_gauges(&inner.metrics, &state);
                        Action::Skip
                    } else {
                        if state.flush_ops_in_flight == 0 {
                            state.lowest_flushing_sync_gen = entry.sync_gen();
                        }
                        state.flush_ops_in_flight += 1;
                        state.flush_bytes_in_flight += u64::from(entry.write_bytes());
                        Action::Flush(entry)
                    }
                }
            } else {
                Action::Stop
            }
        };
        match action {
            Action::Stop => break,
            Action::Skip => continue,
            Action::Flush(entry) => flush_entry(inner, entry),
        }
    }
}

/// エントリ一つ分のライトバック書き込みを発行する.
fn flush_entry<P, D>(inner: &Arc<CacheInner<P, D>>, entry: Arc<WriteLogEntry>)
where
    P: PersistentMemory,
    D: ImageWriteback,
{
    // PMEMバッファの読み込みビューは、読み込み中カウントで保護される
    entry.pin_reader();
    let mut data = vec![0; entry.write_bytes() as usize];
    if let Err(e) = track!(inner.pool.read_buffer(entry.buffer_offset(), &mut data)) {
        fatal(inner, &e);
    }

    inner.metrics.writeback.writeback_writes.increment();
    inner.async_ops.fetch_add(1, Ordering::SeqCst);
    let extent = entry.extent();
    let inner_cb = Arc::clone(inner);
    inner.downstream.write(
        vec![extent],
        data,
        Box::new(move |result| {
            entry.unpin_reader();
            {
                let mut state = inner_cb.state.lock().expect("Never fails");
                state.flush_ops_in_flight -= 1;
                state.flush_bytes_in_flight -= u64::from(entry.write_bytes());
                match result {
                    Ok(()) => {
                        entry.mark_flushed();
                        state.bytes_dirty -= u64::from(entry.write_bytes());
                        inner_cb
                            .metrics
                            .writeback
                            .writeback_bytes
                            .add_u64(u64::from(entry.write_bytes()));
                    }
                    Err(e) => {
                        // 失敗したエントリはダーティリストの先頭へ戻し、同じ経路で
                        // 無期限に再試行する (永続性は下位ストアが担う)
                        warn!(
                            inner_cb.logger,
                            "Writeback write failed (will retry): {}", e
                        );
                        inner_cb.metrics.writeback.writeback_failures.increment();
                        state.dirty_entries.push_front(Arc::clone(&entry));
                    }
                }
                update_resource_gauges(&inner_cb.metrics, &state);
            }
            inner_cb.async_ops.fetch_sub(1, Ordering::SeqCst);
            let inner_job = Arc::clone(&inner_cb);
            inner_cb.jobs.execute(move || {
                process_writeback(&inner_job);
                maybe_retire(&inner_job);
            });
        }),
    );
}

/// リング先頭から最大`frees_per_tx`個のエントリを一トランザクションで回収する.
///
/// 一つでも回収できた場合には`true`が返される.
pub(crate) fn retire_entries<P, D>(inner: &Arc<CacheInner<P, D>>, frees_per_tx: usize) -> bool
where
    P: PersistentMemory,
    D: ImageWriteback,
{
    let _retire_guard = inner.retire_lock.lock().expect("Never fails");

    // 候補: ログ順リストの先頭から連続する回収可能エントリ
    let candidates: Vec<Arc<WriteLogEntry>> = {
        let state = inner.state.lock().expect("Never fails");
        state
            .log_entries
            .iter()
            .take(frees_per_tx)
            .take_while(|e| {
                e.is_completed()
                    && (e.is_sync_point() || e.is_flushed())
                    && e.reader_count() == 0
            })
            .cloned()
            .collect()
    };
    if candidates.is_empty() {
        return false;
    }

    // 区間マップから取り除く. これ以降、候補に新たな読み込みピンは付かない
    {
        let mut map = inner.map.write().expect("Never fails");
        for entry in &candidates {
            if entry.is_write() && entry.map_refs() > 0 {
                map.remove_entry(entry);
            }
        }
    }

    // マップ除去後にも読み込み中のエントリがあれば、その手前までで打ち切る
    let retirable: Vec<Arc<WriteLogEntry>> = candidates
        .into_iter()
        .take_while(|e| e.can_retire())
        .collect();
    if retirable.is_empty() {
        return false;
    }

    let count = retirable.len() as u32;
    let num_entries = inner.pool.num_log_entries();
    let first_valid = inner.pool.first_valid_entry();
    debug_assert_eq!(retirable[0].index(), first_valid);
    let new_first_valid = (first_valid + count) % num_entries;
    let freed: Vec<Reservation> = retirable
        .iter()
        .filter(|e| e.is_write())
        .map(|e| Reservation {
            offset: e.buffer_offset(),
            length: e.allocation_bytes(),
        })
        .collect();
    if let Err(e) = track!(inner.pool.commit_retire(new_first_valid, &freed)) {
        fatal(inner, &e);
    }

    // コミット後のメモリ上の更新
    {
        let mut state = inner.state.lock().expect("Never fails");
        for entry in &retirable {
            let front = state.log_entries.pop_front().expect("Never fails");
            debug_assert!(Arc::ptr_eq(&front, entry));
            if entry.is_write() {
                state.bytes_allocated -= entry.allocation_bytes() + BLOCK_ALLOC_OVERHEAD_BYTES;
                state.bytes_cached -= u64::from(entry.write_bytes());
            }
        }
        state.free_log_entries += count;
        update_resource_gauges(&inner.metrics, &state);
    }
    inner.metrics.log.retired_entries.add_u64(u64::from(count));
    inner.metrics.writeback.retire_passes.increment();

    // スロットとPMEM領域が空いたので、資源待ちのリクエストを起こす
    dispatch::dispatch_deferred(inner);
    true
}

/// 高水位を超えている場合に、低水位または時間上限までリタイアを進める.
pub(crate) fn maybe_retire<P, D>(inner: &Arc<CacheInner<P, D>>)
where
    P: PersistentMemory,
    D: ImageWriteback,
{
    let (allocated, forced) = {
        let state = inner.state.lock().expect("Never fails");
        (
            state.bytes_allocated,
            state.invalidating || state.shutting_down,
        )
    };
    if !forced && allocated <= inner.config.retire_high_water_bytes {
        // 高水位未満でも、資源待ちのリクエストが詰まっているなら回収を試みる
        let starving = {
            let deferred = inner.deferred.lock().expect("Never fails");
            !deferred.queue.is_empty()
        };
        if !starving {
            return;
        }
    }

    let started = Instant::now();
    loop {
        let allocated = {
            let state = inner.state.lock().expect("Never fails");
            state.bytes_allocated
        };
        let frees_per_tx = if allocated > inner.config.aggressive_retire_high_water_bytes {
            MAX_FREE_PER_TRANSACTION * 2
        } else {
            MAX_FREE_PER_TRANSACTION
        };
        if !retire_entries(inner, frees_per_tx) {
            break;
        }
        let allocated = {
            let state = inner.state.lock().expect("Never fails");
            state.bytes_allocated
        };
        if !forced && allocated <= inner.config.retire_low_water_bytes {
            break;
        }
        if started.elapsed() >= Duration::from_millis(RETIRE_BATCH_TIME_LIMIT_MS) {
            break;
        }
    }
}

/// 全ダーティエントリが下位ストアへ書き出されるまでライトバックを駆動する.
///
/// 下位ストアをそのまま操作する経路(discard等)の前段で使用される.
/// ここで排出しておかないと、遅延していたライトバックが後から
/// 下位ストアの内容を巻き戻してしまう.
pub(crate) fn drain_dirty<P, D>(inner: &Arc<CacheInner<P, D>>)
where
    P: PersistentMemory,
    D: ImageWriteback,
{
    loop {
        crate::cache::appender::process_pipeline(inner);
        process_writeback(inner);
        let drained = {
            let state = inner.state.lock().expect("Never fails");
            state.ops_to_flush.is_empty()
                && state.ops_to_append.is_empty()
                && state.dirty_entries.is_empty()
                && state.flush_ops_in_flight == 0
        };
        if drained {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// ログが空になるまで、パイプライン・ライトバック・リタイアを駆動する.
///
/// 無効化および停止処理の排出段階で使用される.
pub(crate) fn drain_log<P, D>(inner: &Arc<CacheInner<P, D>>)
where
    P: PersistentMemory,
    D: ImageWriteback,
{
    loop {
        crate::cache::appender::process_pipeline(inner);
        process_writeback(inner);
        while retire_entries(inner, MAX_FREE_PER_TRANSACTION) {}

        let drained = {
            let state = inner.state.lock().expect("Never fails");
            state.ops_to_flush.is_empty()
                && state.ops_to_append.is_empty()
                && state.dirty_entries.is_empty()
                && state.flush_ops_in_flight == 0
                && state.log_entries.is_empty()
        };
        if drained && inner.async_ops.load(Ordering::SeqCst) == 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
