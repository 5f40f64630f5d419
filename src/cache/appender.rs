//! 追記パイプライン.
//!
//! ディスパッチ済みのログ操作は、二段階のバッチ処理を経て永続化される:
//!
//! 1. **バッファフラッシュ**: 書き込みデータのPMEMバッファをフラッシュし、
//!    一度の`drain`をバッチ全体で償却する
//! 2. **追記トランザクション**: 追記ロックの下でスロットを割り当て、
//!    レコード群をフラッシュした後、ルートの`first_free_entry`を前進させて
//!    コミットする. スロットインデックスはバッチ内の並び順に厳密に従い、
//!    リングの終端を跨ぐ場合にはバッチが分割される
//!
//! コミット後の完了ファンアウトで、各操作のエントリはダーティリストへ繋がれ、
//! 所属する同期点のprior_persistedサブ完了と利用者への応答が発火する.
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::cache::flusher;
use crate::cache::request::{LogOperation, WriteShared};
use crate::cache::{
    dispatch, fatal, update_resource_gauges, CacheInner, ImageWriteback,
    MAX_ALLOC_PER_TRANSACTION, OPS_FLUSHED_TOGETHER,
};
use crate::completion::DeferredCallbacks;
use crate::pmem::PersistentMemory;

/// パイプラインに積まれたログ操作を、永続化が完了するまで進める.
///
/// 二つの段階は追記ロックの下で一体として直列化される. これにより、
/// 操作がキュー間を移動する際の順序が入れ替わることはなく、
/// スロット順はディスパッチ順と一致する.
pub(crate) fn process_pipeline<P, D>(inner: &Arc<CacheInner<P, D>>)
where
    P: PersistentMemory,
    D: ImageWriteback,
{
    let committed = {
        let _append_guard = inner.append_lock.lock().expect("Never fails");
        process_flush_batches(inner);
        process_append_batches(inner)
    };
    // 完了ファンアウトは追記ロックの外で行う
    // (ガードセルの解放が後続リクエストのディスパッチを連鎖させるため)
    for batch in committed {
        complete_batch(inner, batch);
    }
}

/// バッファフラッシュのバッチ処理.
fn process_flush_batches<P, D>(inner: &Arc<CacheInner<P, D>>)
where
    P: PersistentMemory,
    D: ImageWriteback,
{
    loop {
        let batch: Vec<LogOperation> = {
            let mut state = inner.state.lock().expect("Never fails");
            let n = std::cmp::min(OPS_FLUSHED_TOGETHER, state.ops_to_flush.len());
            state.ops_to_flush.drain(..n).collect()
        };
        if batch.is_empty() {
            break;
        }

        let mut needs_drain = false;
        for op in &batch {
            if let LogOperation::Write(op) = op {
                if let Err(e) = track!(inner
                    .pool
                    .flush_buffer(op.reservation.offset, u64::from(op.entry.write_bytes())))
                {
                    fatal(inner, &e);
                }
                needs_drain = true;
            }
        }
        if needs_drain {
            if let Err(e) = track!(inner.pool.drain()) {
                fatal(inner, &e);
            }
        }

        let mut state = inner.state.lock().expect("Never fails");
        for op in batch {
            state.ops_to_append.push_back(op);
        }
    }
}

/// 追記トランザクションのバッチ処理.
///
/// 呼び出し元が追記ロックを保持していること.
fn process_append_batches<P, D>(inner: &Arc<CacheInner<P, D>>) -> Vec<Vec<LogOperation>>
where
    P: PersistentMemory,
    D: ImageWriteback,
{
    let mut committed = Vec::new();
    let num_entries = inner.pool.num_log_entries();
    loop {
        let first_slot = inner.pool.first_free_entry();
        let batch: Vec<LogOperation> = {
            let mut state = inner.state.lock().expect("Never fails");
            // リング終端を跨がない連続分だけを一トランザクションに含める
            let contiguous = (num_entries - first_slot) as usize;
            let n = std::cmp::min(
                MAX_ALLOC_PER_TRANSACTION,
                std::cmp::min(state.ops_to_append.len(), contiguous),
            );
            state.ops_to_append.drain(..n).collect()
        };
        if batch.is_empty() {
            break;
        }

        // スロット割当はバッチ内の並び順に厳密に従う
        for (i, op) in batch.iter().enumerate() {
            op.entry().assign_index(first_slot + i as u32);
            if let Err(e) = track!(inner.pool.stage_record(&op.entry().to_record())) {
                fatal(inner, &e);
            }
        }
        if let Err(e) = track!(inner.pool.flush_records(first_slot, batch.len() as u32)) {
            fatal(inner, &e);
        }
        if let Err(e) = track!(inner.pool.drain()) {
            fatal(inner, &e);
        }
        let new_first_free = (first_slot + batch.len() as u32) % num_entries;
        if let Err(e) = track!(inner.pool.commit_append(new_first_free)) {
            fatal(inner, &e);
        }
        committed.push(batch);
    }
    committed
}

/// コミット済みバッチの完了ファンアウト.
fn complete_batch<P, D>(inner: &Arc<CacheInner<P, D>>, batch: Vec<LogOperation>)
where
    P: PersistentMemory,
    D: ImageWriteback,
{
    let mut later = DeferredCallbacks::new();
    let mut write_ops = Vec::new();
    let mut sync_point_ops = Vec::new();
    {
        let mut state = inner.state.lock().expect("Never fails");
        for op in batch {
            op.entry().mark_completed();
            inner.metrics.log.appended_entries.increment();
            state.log_entries.push_back(Arc::clone(op.entry()));
            match op {
                LogOperation::Write(op) => {
                    state.dirty_entries.push_back(Arc::clone(&op.entry));
                    state.bytes_dirty += u64::from(op.entry.write_bytes());
                    op.sync_point.account_write_completed();
                    write_ops.push(op);
                }
                LogOperation::SyncPoint(op) => sync_point_ops.push(op),
            }
        }
        update_resource_gauges(&inner.metrics, &state);
    }

    // 同期点のサブ完了とリクエストの永続完了 (ロック外)
    for mut op in write_ops {
        if let Some(sub) = op.prior_sub.take() {
            sub.complete(Ok(()));
        }
        if op.shared.ops_remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            finish_write_request(inner, &op.shared);
        }
    }
    for op in sync_point_ops {
        op.sync_point.complete_self_persisted(&Ok(()), &mut later);
    }
    std::mem::drop(later);

    // 新たなダーティエントリに対するライトバックと、資源待ちの起床
    let job_inner = Arc::clone(inner);
    inner.jobs.execute(move || {
        flusher::process_writeback(&job_inner);
        flusher::maybe_retire(&job_inner);
    });
}

/// 全操作が永続化されたリクエストの後始末 (`PERSISTED -> COMPLETED`).
fn finish_write_request<P, D>(inner: &Arc<CacheInner<P, D>>, shared: &Arc<WriteShared>)
where
    P: PersistentMemory,
    D: ImageWriteback,
{
    {
        let mut state = inner.state.lock().expect("Never fails");
        state.free_lanes += shared.lanes;
    }

    // persist-on-writeモードでは、ここで初めて利用者へ応答する
    if let Some(reply) = shared.reply.lock().expect("Never fails").take() {
        reply.send(Ok(()));
    }

    if let Some(cell) = shared.guard_cell.lock().expect("Never fails").take() {
        inner.guard.release(cell);
    }
    dispatch::dispatch_deferred(inner);
}
