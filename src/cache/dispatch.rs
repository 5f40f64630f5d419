//! 資源確保とディスパッチ.
//!
//! 書き込みリクエストは、レーン・ログスロット・PMEMバッファの三種類の資源を
//! 全て確保できた場合にのみディスパッチされる. 確保に失敗したリクエストは
//! 遅延キューへ積まれ、リタイア等で資源が解放された際に先頭詰まり方式で
//! 再実行される.
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, Weak};

use crate::cache::appender;
use crate::cache::flusher;
use crate::cache::request::{
    DeferredWork, LogOperation, SyncPointAppendOp, WriteOp, WriteRequest, WriteShared,
};
use crate::cache::{
    fatal, update_resource_gauges, CacheInner, CacheState, ImageWriteback,
    MAX_BYTES_PER_SYNC_POINT, MAX_WRITES_PER_SYNC_POINT,
};
use crate::completion::{Callback, DeferredCallbacks};
use crate::log::{Reservation, WriteLogEntry, BLOCK_ALLOC_OVERHEAD_BYTES};
use crate::pmem::PersistentMemory;
use crate::sync_point::SyncPoint;

/// ガードを獲得した書き込みリクエストの資源確保とディスパッチを行う.
pub(crate) fn alloc_and_dispatch_write<P, D>(inner: &Arc<CacheInner<P, D>>, req: WriteRequest)
where
    P: PersistentMemory,
    D: ImageWriteback,
{
    // 遅延キューに先客がいる場合、順序保存のため自分も並ぶ
    let queue_busy = {
        let deferred = inner.deferred.lock().expect("Never fails");
        !deferred.queue.is_empty()
    };
    if queue_busy {
        defer_write(inner, req);
        return;
    }
    match try_alloc_write(inner, &req) {
        Some(reservations) => dispatch_write(inner, req, reservations),
        None => {
            defer_write(inner, req);
            let job_inner = Arc::clone(inner);
            inner.jobs.execute(move || flusher::maybe_retire(&job_inner));
        }
    }
}

/// リクエストを遅延キューへ積む.
pub(crate) fn defer_write<P, D>(inner: &Arc<CacheInner<P, D>>, mut req: WriteRequest)
where
    P: PersistentMemory,
    D: ImageWriteback,
{
    req.deferred = true;
    inner.metrics.ops.deferred_writes.increment();
    let mut deferred = inner.deferred.lock().expect("Never fails");
    deferred.queue.push_back(DeferredWork::Write(req));
}

/// 書き込みに必要な資源(レーン・スロット・バッファ)の確保を試みる.
///
/// 全てを確保できない場合には何も確保せずに`None`を返す.
fn try_alloc_write<P, D>(inner: &CacheInner<P, D>, req: &WriteRequest) -> Option<Vec<Reservation>>
where
    P: PersistentMemory,
    D: ImageWriteback,
{
    let lanes = req.extents.len();
    let mut state = inner.state.lock().expect("Never fails");
    if state.free_lanes < lanes || (state.free_log_entries as usize) < lanes {
        return None;
    }

    let block_size = inner.pool.block_size();
    let total_allocation: u64 = req
        .extents
        .iter()
        .map(|e| block_size.ceil_align(e.length) + BLOCK_ALLOC_OVERHEAD_BYTES)
        .sum();
    if state.bytes_allocated + total_allocation > inner.config.bytes_allocated_cap {
        return None;
    }

    let mut reservations = Vec::with_capacity(lanes);
    for extent in &req.extents {
        match inner.pool.reserve_buffer(extent.length as u32) {
            Some(reservation) => reservations.push(reservation),
            None => {
                // 一部しか確保できなかった: 予約を取り消して全体を失敗させる
                for reservation in reservations {
                    inner.pool.cancel_reservation(reservation);
                }
                return None;
            }
        }
    }

    state.free_lanes -= lanes;
    state.free_log_entries -= lanes as u32;
    state.bytes_allocated += total_allocation;
    state.bytes_cached += req.total_bytes();
    update_resource_gauges(&inner.metrics, &state);
    Some(reservations)
}

/// 資源確保済みの書き込みリクエストをディスパッチする.
///
/// ペイロードをPMEMバッファへコピーし、区間マップへ登録した上で、
/// 範囲毎のログ操作を追記パイプラインへ投入する.
pub(crate) fn dispatch_write<P, D>(
    inner: &Arc<CacheInner<P, D>>,
    mut req: WriteRequest,
    reservations: Vec<Reservation>,
) where
    P: PersistentMemory,
    D: ImageWriteback,
{
    let mut later = DeferredCallbacks::new();
    let persist_on_flush = inner.config.persist_on_flush;
    let shared = Arc::new(WriteShared {
        ops_remaining: AtomicUsize::new(req.extents.len()),
        lanes: req.extents.len(),
        guard_cell: Mutex::new(req.guard_cell.take()),
        reply: Mutex::new(req.reply.take()),
    });

    let mut ops = Vec::with_capacity(req.extents.len());
    let early_flush;
    {
        let mut state = inner.state.lock().expect("Never fails");

        // persist-on-flushでは、グループが上限に達したら自動で同期点を切り替える
        if persist_on_flush {
            if let Some(sync_point) = state.current_sync_point.clone() {
                let (writes, bytes, _) = sync_point.write_counts();
                if writes >= MAX_WRITES_PER_SYNC_POINT || bytes >= MAX_BYTES_PER_SYNC_POINT {
                    flush_new_sync_point(inner, &mut state, &mut later, None);
                }
            }
        }

        let sync_point = state
            .current_sync_point
            .clone()
            .expect("the current sync point always exists");
        for (extent, reservation) in req.extents.iter().zip(reservations.iter()) {
            let sequence_num = if persist_on_flush {
                0
            } else {
                state.last_op_sequence_num += 1;
                state.last_op_sequence_num
            };
            let entry = Arc::new(WriteLogEntry::new_write(
                sync_point.sync_gen(),
                sequence_num,
                extent.offset,
                extent.length as u32,
                reservation.offset,
                reservation.length,
            ));
            sync_point.account_write(extent.length);
            let prior_sub = sync_point.prior_persisted().add_sub();
            ops.push(WriteOp {
                entry,
                reservation: *reservation,
                sync_point: Arc::clone(&sync_point),
                prior_sub: Some(prior_sub),
                shared: Arc::clone(&shared),
            });
        }

        // 直前の同期点が全て追記済みで、待機も遅延もしていないリクエストは
        // 呼び出し元のスレッドでそのままフラッシュ・追記まで進める
        early_flush = sync_point.earlier().is_none() && !req.detained && !req.deferred;
    }

    // ペイロードを予約済みバッファへコピーする (ロック外)
    let mut payload_pos = 0;
    for (op, extent) in ops.iter().zip(req.extents.iter()) {
        let len = extent.length as usize;
        let data = &req.payload[payload_pos..payload_pos + len];
        if let Err(e) = track!(inner.pool.write_buffer(op.reservation.offset, data)) {
            fatal(inner, &e);
        }
        payload_pos += len;
    }

    {
        let mut map = inner.map.write().expect("Never fails");
        for op in &ops {
            map.insert_entry(&op.entry);
        }
    }

    // persist-on-flush: ディスパッチ時点で利用者へ応答する
    // (永続性は次のflushによってのみ保証される)
    if persist_on_flush {
        if let Some(reply) = shared.reply.lock().expect("Never fails").take() {
            reply.send(Ok(()));
        }
    }

    {
        let mut state = inner.state.lock().expect("Never fails");
        for op in ops {
            state.ops_to_flush.push_back(LogOperation::Write(op));
        }
    }
    std::mem::drop(later);

    if early_flush {
        appender::process_pipeline(inner);
    } else {
        let job_inner = Arc::clone(inner);
        inner.jobs.execute(move || appender::process_pipeline(&job_inner));
    }
}

/// 遅延キューを先頭から順に再実行する.
///
/// 先頭の作業が資源を確保できない場合、そこで打ち切られる(後続は実行されない).
pub(crate) fn dispatch_deferred<P, D>(inner: &Arc<CacheInner<P, D>>)
where
    P: PersistentMemory,
    D: ImageWriteback,
{
    {
        let mut deferred = inner.deferred.lock().expect("Never fails");
        if deferred.dispatching {
            return;
        }
        deferred.dispatching = true;
    }

    enum Front {
        Empty,
        Write(Option<Vec<Reservation>>),
        SyncPointAppend(Arc<SyncPoint>),
    }
    enum Dispatched {
        Write(WriteRequest, Vec<Reservation>),
        SyncPointAppend,
    }

    loop {
        let work = {
            let mut deferred = inner.deferred.lock().expect("Never fails");
            let front = match deferred.queue.front() {
                None => Front::Empty,
                Some(DeferredWork::Write(req)) => Front::Write(try_alloc_write(inner, req)),
                Some(DeferredWork::SyncPointAppend(sync_point)) => {
                    Front::SyncPointAppend(Arc::clone(sync_point))
                }
            };
            match front {
                Front::Empty => {
                    deferred.dispatching = false;
                    return;
                }
                Front::Write(Some(reservations)) => match deferred.queue.pop_front() {
                    Some(DeferredWork::Write(req)) => Dispatched::Write(req, reservations),
                    _ => unreachable!(),
                },
                Front::SyncPointAppend(sync_point)
                    if queue_sync_point_append(inner, &sync_point) =>
                {
                    deferred.queue.pop_front();
                    Dispatched::SyncPointAppend
                }
                Front::Write(None) | Front::SyncPointAppend(_) => {
                    // 先頭が資源を確保できない: ここで打ち切り、リタイアに期待する
                    deferred.dispatching = false;
                    std::mem::drop(deferred);
                    let job_inner = Arc::clone(inner);
                    inner.jobs.execute(move || flusher::maybe_retire(&job_inner));
                    return;
                }
            }
        };
        match work {
            Dispatched::Write(req, reservations) => dispatch_write(inner, req, reservations),
            Dispatched::SyncPointAppend => {
                let job_inner = Arc::clone(inner);
                inner.jobs.execute(move || appender::process_pipeline(&job_inner));
            }
        }
    }
}

/// 新しい同期点を生成して現行の同期点とする.
///
/// 旧同期点に対しては以下を行う:
///
/// - 新旧の連鎖リンクを張り、最終操作シーケンス番号を記録する
/// - 旧同期点が追記発行状態に入るまで新同期点がprior-persistedを
///   主張できないよう、ゲートとなるサブ完了を新同期点の集約器へ追加する
/// - 旧同期点のprior_persisted集約器の活性化を、ロック解放後(`later`)へ遅延する
pub(crate) fn new_sync_point<P, D>(
    inner: &Arc<CacheInner<P, D>>,
    state: &mut CacheState,
    later: &mut DeferredCallbacks,
) -> Arc<SyncPoint>
where
    P: PersistentMemory,
    D: ImageWriteback,
{
    state.current_sync_gen += 1;
    let sync_gen = state.current_sync_gen;

    // prior_persistedのfinisherは自分自身の同期点を参照するため、
    // 生成後に埋められるスロット経由で渡す
    let slot: Arc<Mutex<Weak<SyncPoint>>> = Arc::new(Mutex::new(Weak::new()));
    let weak_inner = Arc::downgrade(inner);
    let finisher_slot = Arc::clone(&slot);
    let new = SyncPoint::new(
        sync_gen,
        Box::new(move |_result| {
            let sync_point = finisher_slot.lock().expect("Never fails").upgrade();
            if let (Some(inner), Some(sync_point)) = (weak_inner.upgrade(), sync_point) {
                maybe_append_sync_point(&inner, &sync_point);
            }
        }),
    );
    *slot.lock().expect("Never fails") = Arc::downgrade(&new);

    if let Some(old) = state.current_sync_point.take() {
        SyncPoint::link_after(&old, &new);
        old.set_final_op_sequence_num(state.last_op_sequence_num);

        let gate = new.prior_persisted().add_sub();
        old.on_appending(later, move || gate.complete(Ok(())));

        later.add(move || old.prior_persisted().activate());
    }
    state.current_sync_point = Some(Arc::clone(&new));
    inner.metrics.log.sync_points.increment();
    new
}

/// 新しい同期点を生成し、旧同期点のレコード追記をスケジュールする.
///
/// `on_self_persisted`が与えられた場合、旧同期点のself_persisted発火時
/// (i.e., そのレコードの永続化完了)に呼び出される. flushの完了通知がこれにあたる.
pub(crate) fn flush_new_sync_point<P, D>(
    inner: &Arc<CacheInner<P, D>>,
    state: &mut CacheState,
    later: &mut DeferredCallbacks,
    on_self_persisted: Option<Callback>,
) where
    P: PersistentMemory,
    D: ImageWriteback,
{
    let new = new_sync_point(inner, state, later);
    let to_append = new
        .earlier()
        .expect("flush_new_sync_point requires an existing sync point");
    to_append.mark_append_scheduled();
    if let Some(callback) = on_self_persisted {
        to_append.on_self_persisted(later, callback);
    }
    let inner = Arc::clone(inner);
    later.add(move || maybe_append_sync_point(&inner, &to_append));
}

/// 条件が揃っていれば、同期点レコードの追記操作を発行する.
///
/// 条件: レコード追記が要求済みであり、かつprior_persisted集約器が発火済み.
/// どちらか一方だけが満たされた時点でも呼び出されるため、冪等に作られている.
pub(crate) fn maybe_append_sync_point<P, D>(
    inner: &Arc<CacheInner<P, D>>,
    sync_point: &Arc<SyncPoint>,
) where
    P: PersistentMemory,
    D: ImageWriteback,
{
    if !sync_point.is_append_scheduled() || !sync_point.prior_persisted().is_fired() {
        return;
    }
    let mut deferred = DeferredCallbacks::new();
    if !sync_point.mark_appending(&mut deferred) {
        // 既に発行済み
        return;
    }

    if queue_sync_point_append(inner, sync_point) {
        let job_inner = Arc::clone(inner);
        inner.jobs.execute(move || appender::process_pipeline(&job_inner));
    } else {
        // 空きスロットが無い: 遅延キュー経由で再試行する
        {
            let mut queue = inner.deferred.lock().expect("Never fails");
            queue
                .queue
                .push_back(DeferredWork::SyncPointAppend(Arc::clone(sync_point)));
        }
        let job_inner = Arc::clone(inner);
        inner.jobs.execute(move || flusher::maybe_retire(&job_inner));
    }
    // deferredのドロップにより、後続同期点のゲートが発火する
}

/// 同期点レコード用のスロットを確保して、追記操作をパイプラインへ積む.
///
/// スロットを確保できなかった場合には`false`が返される.
fn queue_sync_point_append<P, D>(inner: &CacheInner<P, D>, sync_point: &Arc<SyncPoint>) -> bool
where
    P: PersistentMemory,
    D: ImageWriteback,
{
    let mut state = inner.state.lock().expect("Never fails");
    if state.free_log_entries == 0 {
        return false;
    }
    state.free_log_entries -= 1;
    let entry = Arc::new(sync_point.to_log_entry());
    state
        .ops_to_flush
        .push_back(LogOperation::SyncPoint(SyncPointAppendOp {
            entry,
            sync_point: Arc::clone(sync_point),
        }));
    update_resource_gauges(&inner.metrics, &state);
    true
}
