//! ライトバック型のブロックキャッシュ.
//!
//! このモジュールは[ReplicatedWriteLog]構造体を中心として、
//! リクエストの状態遷移・追記パイプライン・ライトバック・リタイアを実装している.
//!
//! # 書き込みの流れ
//!
//! 1. 対象範囲のガードを獲得する(重複する先行操作があれば待機)
//! 2. レーン・ログスロット・PMEMバッファを確保する(不足時は遅延キューへ)
//! 3. ペイロードをPMEMバッファへコピーし、区間マップへ登録する
//! 4. バッファフラッシュと追記トランザクションをバッチで実行する
//! 5. 永続化完了で利用者へ応答し、レーンとガードセルを返却する
//!
//! # 読み込みの流れ
//!
//! 区間マップを検索し、ヒットした部分範囲はPMEMから直接、
//! それ以外は下位ストアへの一度の読み込みで埋めて、結果を合成する.
//!
//! [ReplicatedWriteLog]: ./struct.ReplicatedWriteLog.html
use slog::Logger;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, RwLock};
use trackable::error::ErrorKindExt;

pub use self::builder::CacheBuilder;
pub use self::downstream::{CompareCallback, DataCallback, ImageWriteback};

use self::request::{DeferredQueue, LogOperation};
use self::worker::{JobSender, Timer, WorkerPool};
use crate::block::ImageExtent;
use crate::completion::{reply_pair, AsyncReply, AsyncResult, Callback, DeferredCallbacks};
use crate::guard::{BlockGuard, GuardedRequest};
use crate::log::{LogPool, RecoveredLog, WriteLogEntry, BLOCK_ALLOC_OVERHEAD_BYTES};
use crate::map::WriteLogMap;
use crate::metrics::CacheMetrics;
use crate::pmem::PersistentMemory;
use crate::sync_point::SyncPoint;
use crate::{Error, ErrorKind, Result};

mod appender;
mod builder;
mod dispatch;
mod downstream;
mod flusher;
mod request;
mod worker;

/// プールサイズの下限(バイト単位).
///
/// これ未満のサイズが要求された場合には、この値まで切り上げられる.
pub const MIN_POOL_SIZE: u64 = 1 << 30;

/// プールサイズのデフォルト値(バイト単位).
pub const DEFAULT_POOL_SIZE: u64 = 1 << 30;

/// 並行して複製処理を行える書き込みの上限(レーン数)のデフォルト値.
pub const MAX_CONCURRENT_WRITES: usize = 256;

/// 一つの同期点グループが保持できる書き込み数の上限.
pub const MAX_WRITES_PER_SYNC_POINT: u64 = 256;

/// 一つの同期点グループが保持できる書き込みバイト数の上限.
pub const MAX_BYTES_PER_SYNC_POINT: u64 = 8 * 1024 * 1024;

/// 一度の追記トランザクションに含められる操作数の上限.
pub(crate) const MAX_ALLOC_PER_TRANSACTION: usize = 8;

/// 一度のリタイアトランザクションで解放できるエントリ数の上限.
pub(crate) const MAX_FREE_PER_TRANSACTION: usize = 8;

/// 一度の`drain`で償却されるバッファフラッシュの操作数.
pub(crate) const OPS_FLUSHED_TOGETHER: usize = 4;

/// リタイアを開始する割当量の割合(高水位).
pub(crate) const RETIRE_HIGH_WATER: f64 = 0.5;

/// リタイアを打ち切る割当量の割合(低水位).
pub(crate) const RETIRE_LOW_WATER: f64 = 0.4;

/// 一度のパスで多めに回収を行う割合(広域高水位).
pub(crate) const AGGRESSIVE_RETIRE_HIGH_WATER: f64 = 0.75;

/// 一度のリタイアパスの時間上限(ミリ秒).
pub(crate) const RETIRE_BATCH_TIME_LIMIT_MS: u64 = 250;

/// 並行して発行できるライトバック書き込み数の上限.
pub(crate) const IN_FLIGHT_FLUSH_WRITE_LIMIT: usize = 64;

/// 並行して発行できるライトバック書き込みバイト数の上限.
pub(crate) const IN_FLIGHT_FLUSH_BYTES_LIMIT: u64 = 1024 * 1024;

/// 要求されたプールサイズを許容範囲へ丸める.
pub fn clamped_pool_size(requested: u64) -> u64 {
    std::cmp::max(requested, MIN_POOL_SIZE)
}

/// 解決済みのキャッシュ設定.
#[derive(Debug, Clone)]
pub(crate) struct CacheConfig {
    pub persist_on_flush: bool,
    pub read_only: bool,
    pub lanes: usize,
    pub trust_replica_order: bool,
    pub bytes_allocated_cap: u64,
    pub retire_high_water_bytes: u64,
    pub retire_low_water_bytes: u64,
    pub aggressive_retire_high_water_bytes: u64,
}

/// `state_lock`の下で保護される中心状態.
#[derive(Debug)]
pub(crate) struct CacheState {
    pub current_sync_point: Option<Arc<SyncPoint>>,
    pub current_sync_gen: u64,
    pub last_op_sequence_num: u64,
    pub free_lanes: usize,
    pub free_log_entries: u32,
    pub bytes_allocated: u64,
    pub bytes_cached: u64,
    pub bytes_dirty: u64,
    /// ログ順(追記順)の全エントリ. リタイアは先頭から進む.
    pub log_entries: VecDeque<Arc<WriteLogEntry>>,
    /// 未ライトバックの書き込みエントリ(ログ順).
    pub dirty_entries: VecDeque<Arc<WriteLogEntry>>,
    pub ops_to_flush: VecDeque<LogOperation>,
    pub ops_to_append: VecDeque<LogOperation>,
    pub flush_ops_in_flight: usize,
    pub flush_bytes_in_flight: u64,
    pub lowest_flushing_sync_gen: u64,
    pub invalidating: bool,
    pub shutting_down: bool,
}

/// キャッシュの共有部.
///
/// ロックの獲得順序は(外側から)以下の通りであり、これ以外の順序での獲得はバグである:
///
/// ```text
/// retire_lock -> map(entry_reader) -> deferred -> append_lock -> state -> guard
/// ```
///
/// プール内部のリング・アロケータ用ミューテックスは末端ロックであり、
/// 上記のいずれを保持していても獲得できる.
/// いかなる処理も`state`を保持したままブロックしてはならない.
pub(crate) struct CacheInner<P: PersistentMemory, D: ImageWriteback> {
    pub logger: Logger,
    pub metrics: CacheMetrics,
    pub config: CacheConfig,
    pub downstream: D,
    pub pool: LogPool<P>,
    pub retire_lock: Mutex<()>,
    pub map: RwLock<WriteLogMap>,
    pub deferred: Mutex<DeferredQueue>,
    pub append_lock: Mutex<()>,
    pub state: Mutex<CacheState>,
    pub guard: BlockGuard,
    pub jobs: JobSender,
    pub async_ops: AtomicUsize,
}

/// 致命的なプール障害.
///
/// 追記・リタイアのトランザクションが失敗した場合、コミットの成否が不定となり
/// データ整合性を確立できないため、プロセスを停止させる.
pub(crate) fn fatal<P, D>(inner: &CacheInner<P, D>, error: &Error) -> !
where
    P: PersistentMemory,
    D: ImageWriteback,
{
    crit!(inner.logger, "Fatal log pool failure: {}", error);
    panic!("rwlog: fatal log pool failure: {}", error);
}

/// 資源系ゲージの更新.
pub(crate) fn update_resource_gauges(metrics: &CacheMetrics, state: &CacheState) {
    metrics.log.dirty_bytes.set(state.bytes_dirty as f64);
    metrics.log.allocated_bytes.set(state.bytes_allocated as f64);
    metrics.log.cached_bytes.set(state.bytes_cached as f64);
    metrics.log.free_log_entries.set(f64::from(state.free_log_entries));
}

fn terminated_error() -> Error {
    ErrorKind::Terminated
        .cause("the cache is shutting down")
        .into()
}

/// キャッシュの使用状況のスナップショット.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// スロット配列の要素数.
    pub num_log_entries: u32,
    /// 未ライトバックの書き込みデータのバイト数.
    pub bytes_dirty: u64,
    /// ログが保持している書き込みデータのバイト数.
    pub bytes_cached: u64,
    /// データ領域の割当済みバイト数(オーバヘッド込み).
    pub bytes_allocated: u64,
    /// リングの空きスロット数.
    pub free_log_entries: u32,
    /// 空きレーン数.
    pub free_lanes: usize,
    /// 現行の同期点の世代番号.
    pub current_sync_gen: u64,
    /// リングの次の追記先インデックス.
    pub first_free_entry: u32,
    /// リング内の最古の有効エントリのインデックス.
    pub first_valid_entry: u32,
    /// メモリ上のログ順リストが保持しているエントリ数.
    pub log_entries: usize,
    /// ダーティリストが保持しているエントリ数.
    pub dirty_entries: usize,
}

/// 読み込み結果を構成するスライス.
enum ReadSlice {
    /// ログからの読み込み(ヒット).
    Hit {
        entry: Arc<WriteLogEntry>,
        buffer_offset: u64,
        len: usize,
    },
    /// 下位ストアからの読み込み(ミス).
    Miss { len: usize },
}

/// PMEM複製ログによるライトバック型ブロックキャッシュ.
///
/// 生成には[CacheBuilder]を使用する. 全ての操作は非同期であり、
/// 結果は[AsyncResult]として返される.
///
/// # 永続化モード
///
/// - **persist-on-write** (デフォルト): 書き込みはログレコードが永続化された
///   時点で利用者へ応答される
/// - **persist-on-flush**: 書き込みはディスパッチ時点で応答され、
///   その永続性は次の`flush`によってのみ保証される
///
/// [CacheBuilder]: ./struct.CacheBuilder.html
/// [AsyncResult]: ../completion/struct.AsyncResult.html
pub struct ReplicatedWriteLog<P: PersistentMemory, D: ImageWriteback> {
    inner: Arc<CacheInner<P, D>>,
    workers: Option<WorkerPool>,
    timer: Option<Timer>,
}
impl<P, D> std::fmt::Debug for ReplicatedWriteLog<P, D>
where
    P: PersistentMemory,
    D: ImageWriteback,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ReplicatedWriteLog")
            .field("instance_uuid", &self.inner.pool.instance_uuid())
            .finish()
    }
}
impl<P, D> ReplicatedWriteLog<P, D>
where
    P: PersistentMemory,
    D: ImageWriteback,
{
    pub(crate) fn start(
        builder: CacheBuilder,
        pool: LogPool<P>,
        downstream: D,
        recovered: Option<RecoveredLog>,
    ) -> Result<Self> {
        let logger = builder.logger.clone();
        info!(logger, "Starting the replicated write log";
              "instance_uuid" => %pool.instance_uuid(),
              "num_log_entries" => pool.num_log_entries(),
              "persist_on_flush" => builder.persist_on_flush);

        let metrics = CacheMetrics::new(&builder.metrics);
        let data_region = pool.data_region_length();
        let config = CacheConfig {
            persist_on_flush: builder.persist_on_flush,
            read_only: builder.read_only,
            lanes: builder.lanes,
            trust_replica_order: builder.trust_replica_order,
            bytes_allocated_cap: data_region,
            retire_high_water_bytes: (data_region as f64 * RETIRE_HIGH_WATER) as u64,
            retire_low_water_bytes: (data_region as f64 * RETIRE_LOW_WATER) as u64,
            aggressive_retire_high_water_bytes: (data_region as f64
                * AGGRESSIVE_RETIRE_HIGH_WATER) as u64,
        };
        let (workers, jobs) = WorkerPool::spawn(builder.workers, &logger);
        let state = CacheState {
            current_sync_point: None,
            current_sync_gen: 0,
            last_op_sequence_num: 0,
            free_lanes: config.lanes,
            free_log_entries: pool.free_log_entries(),
            bytes_allocated: 0,
            bytes_cached: 0,
            bytes_dirty: 0,
            log_entries: VecDeque::new(),
            dirty_entries: VecDeque::new(),
            ops_to_flush: VecDeque::new(),
            ops_to_append: VecDeque::new(),
            flush_ops_in_flight: 0,
            flush_bytes_in_flight: 0,
            lowest_flushing_sync_gen: 0,
            invalidating: false,
            shutting_down: false,
        };
        let inner = Arc::new(CacheInner {
            logger: logger.clone(),
            metrics,
            config,
            downstream,
            pool,
            retire_lock: Mutex::new(()),
            map: RwLock::new(WriteLogMap::new()),
            deferred: Mutex::new(DeferredQueue::default()),
            append_lock: Mutex::new(()),
            state: Mutex::new(state),
            guard: BlockGuard::new(),
            jobs,
            async_ops: AtomicUsize::new(0),
        });

        {
            let mut later = DeferredCallbacks::new();
            if let Some(recovered) = recovered {
                track!(rebuild_recovered_state(&inner, recovered, &mut later))?;
            }
            // 最初の現行同期点を生成する
            let mut state = inner.state.lock().expect("Never fails");
            dispatch::new_sync_point(&inner, &mut state, &mut later);
            update_resource_gauges(&inner.metrics, &state);
        }

        // 下位ストアの初期化を同期的に待つ
        let (init_tx, init_rx) = std_mpsc::channel();
        inner.downstream.init(Box::new(move |result| {
            let _ = init_tx.send(result);
        }));
        let init_result = track!(init_rx.recv().map_err(|_| Error::from(
            ErrorKind::Other.cause("the downstream init reply channel was disconnected")
        )))?;
        track!(init_result)?;

        // 復旧直後の排出処理(捏造同期点の追記、ダーティエントリのライトバック)
        let startup = Arc::clone(&inner);
        inner.jobs.execute(move || {
            appender::process_pipeline(&startup);
            flusher::process_writeback(&startup);
            flusher::maybe_retire(&startup);
        });

        let weak = Arc::downgrade(&inner);
        let timer = Timer::spawn(builder.stats_interval, move || {
            if let Some(inner) = weak.upgrade() {
                periodic_tick(&inner);
            }
        });
        Ok(ReplicatedWriteLog {
            inner,
            workers: Some(workers),
            timer: Some(timer),
        })
    }

    /// キャッシュのメトリクスを返す.
    pub fn metrics(&self) -> &CacheMetrics {
        &self.inner.metrics
    }

    /// キャッシュの使用状況のスナップショットを返す.
    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock().expect("Never fails");
        CacheStats {
            num_log_entries: self.inner.pool.num_log_entries(),
            bytes_dirty: state.bytes_dirty,
            bytes_cached: state.bytes_cached,
            bytes_allocated: state.bytes_allocated,
            free_log_entries: state.free_log_entries,
            free_lanes: state.free_lanes,
            current_sync_gen: state.current_sync_gen,
            first_free_entry: self.inner.pool.first_free_entry(),
            first_valid_entry: self.inner.pool.first_valid_entry(),
            log_entries: state.log_entries.len(),
            dirty_entries: state.dirty_entries.len(),
        }
    }

    /// 指定された範囲群を読み込む.
    ///
    /// 結果は各範囲のデータを引数の順に連結したバイト列となる.
    /// ログにヒットした部分範囲はPMEMから直接読み込まれ、
    /// それ以外は下位ストアへの一度の読み込みで埋められる.
    pub fn read(&self, extents: Vec<ImageExtent>) -> AsyncResult<Vec<u8>> {
        let (reply, result) = reply_pair();
        self.inner.metrics.ops.reads.increment();
        {
            let state = self.inner.state.lock().expect("Never fails");
            if state.shutting_down {
                reply.send(Err(track!(terminated_error())));
                return result;
            }
        }

        let mut plan = Vec::new();
        let mut miss_extents = Vec::new();
        let mut hit_bytes = 0;
        let mut miss_bytes = 0;
        {
            let map = self.inner.map.read().expect("Never fails");
            for extent in &extents {
                if extent.is_empty() {
                    continue;
                }
                let mut cursor = extent.offset;
                for (sub, entry) in map.find(extent) {
                    if cursor < sub.offset {
                        let len = sub.offset - cursor;
                        miss_bytes += len;
                        miss_extents.push(ImageExtent::new(cursor, len));
                        plan.push(ReadSlice::Miss { len: len as usize });
                    }
                    // 出力が完成するまで、エントリを読み込み中として固定する
                    entry.pin_reader();
                    let delta = sub.offset - entry.extent().offset;
                    hit_bytes += sub.length;
                    plan.push(ReadSlice::Hit {
                        buffer_offset: entry.buffer_offset() + delta,
                        len: sub.length as usize,
                        entry,
                    });
                    cursor = sub.end();
                }
                if cursor < extent.end() {
                    let len = extent.end() - cursor;
                    miss_bytes += len;
                    miss_extents.push(ImageExtent::new(cursor, len));
                    plan.push(ReadSlice::Miss { len: len as usize });
                }
            }
        }
        self.inner.metrics.ops.read_hit_bytes.add_u64(hit_bytes);
        self.inner.metrics.ops.read_miss_bytes.add_u64(miss_bytes);

        if miss_extents.is_empty() {
            finish_read(&self.inner, plan, Ok(Vec::new()), reply);
        } else {
            self.inner.async_ops.fetch_add(1, Ordering::SeqCst);
            let inner = Arc::clone(&self.inner);
            self.inner.downstream.read(
                miss_extents,
                Box::new(move |miss_data| {
                    finish_read(&inner, plan, miss_data, reply);
                    inner.async_ops.fetch_sub(1, Ordering::SeqCst);
                }),
            );
        }
        result
    }

    /// 指定された範囲群へ書き込む.
    ///
    /// `payload`は各範囲のデータを引数の順に連結したバイト列である.
    ///
    /// # Errors
    ///
    /// - 長さ0の範囲が含まれる場合や、`payload`の長さが範囲の合計と
    ///   一致しない場合には`ErrorKind::InvalidInput`
    /// - 読み込み専用モードの場合には`ErrorKind::ReadOnly`
    pub fn write(&self, extents: Vec<ImageExtent>, payload: Vec<u8>) -> AsyncResult<()> {
        let (reply, result) = reply_pair();
        self.inner.metrics.ops.writes.increment();

        if self.inner.config.read_only {
            let e = track!(ErrorKind::ReadOnly.cause("the cache is opened as read-only"));
            reply.send(Err(e.into()));
            return result;
        }
        {
            let state = self.inner.state.lock().expect("Never fails");
            if state.shutting_down {
                reply.send(Err(track!(terminated_error())));
                return result;
            }
        }
        if let Err(e) = track!(validate_write(&extents, &payload)) {
            reply.send(Err(e));
            return result;
        }

        let req = request::WriteRequest {
            extents,
            payload,
            reply: Some(reply),
            guard_cell: None,
            detained: false,
            deferred: false,
        };
        let range = req.bounding_extent();
        let inner = Arc::clone(&self.inner);
        self.inner.guard.detain(GuardedRequest {
            range,
            barrier: false,
            on_grant: Box::new(move |cell, detained| {
                let mut req = req;
                req.guard_cell = Some(cell);
                req.detained = detained;
                if detained {
                    inner.metrics.ops.detained_requests.increment();
                }
                dispatch::alloc_and_dispatch_write(&inner, req);
            }),
        });
        result
    }

    /// これまでに応答した書き込みの永続性を保証する.
    ///
    /// バリアとして直列化され、最後の同期点以降に書き込みが存在する場合には
    /// 新しい同期点が作られる. 対象世代以下の全書き込みがログ上で永続化された
    /// 時点で完了する.
    pub fn flush(&self) -> AsyncResult<()> {
        let (reply, result) = reply_pair();
        flush_with_callback(&self.inner, Box::new(move |r| reply.send(r)));
        result
    }

    /// 指定された範囲を解放する.
    ///
    /// 内部的なflushの後、対象範囲を区間マップから無効化した上で、
    /// 解放要求を下位ストアへ引き渡す.
    pub fn discard(
        &self,
        offset: u64,
        length: u64,
        skip_partial_discard: bool,
    ) -> AsyncResult<()> {
        let (reply, result) = reply_pair();
        self.inner.metrics.ops.discards.increment();
        if let Some(e) = self.reject_update() {
            reply.send(Err(e));
            return result;
        }

        let inner = Arc::clone(&self.inner);
        internal_flush(
            &self.inner,
            Box::new(move |flush_result| {
                if let Err(e) = flush_result {
                    reply.send(Err(track!(e)));
                    return;
                }
                {
                    let mut map = inner.map.write().expect("Never fails");
                    map.invalidate(&ImageExtent::new(offset, length));
                }
                inner.async_ops.fetch_add(1, Ordering::SeqCst);
                let inner_cb = Arc::clone(&inner);
                inner.downstream.discard(
                    offset,
                    length,
                    skip_partial_discard,
                    Box::new(move |r| {
                        inner_cb.async_ops.fetch_sub(1, Ordering::SeqCst);
                        reply.send(r);
                    }),
                );
            }),
        );
        result
    }

    /// 指定された範囲を`pattern`の繰り返しで埋める.
    ///
    /// ログは経由せず、内部的なflushと区間マップの無効化の後、
    /// 下位ストアへそのまま引き渡される.
    pub fn writesame(&self, offset: u64, length: u64, pattern: Vec<u8>) -> AsyncResult<()> {
        let (reply, result) = reply_pair();
        self.inner.metrics.ops.writes.increment();
        if let Some(e) = self.reject_update() {
            reply.send(Err(e));
            return result;
        }

        let inner = Arc::clone(&self.inner);
        internal_flush(
            &self.inner,
            Box::new(move |flush_result| {
                if let Err(e) = flush_result {
                    reply.send(Err(track!(e)));
                    return;
                }
                {
                    let mut map = inner.map.write().expect("Never fails");
                    map.invalidate(&ImageExtent::new(offset, length));
                }
                inner.async_ops.fetch_add(1, Ordering::SeqCst);
                let inner_cb = Arc::clone(&inner);
                inner.downstream.writesame(
                    offset,
                    length,
                    pattern,
                    Box::new(move |r| {
                        inner_cb.async_ops.fetch_sub(1, Ordering::SeqCst);
                        reply.send(r);
                    }),
                );
            }),
        );
        result
    }

    /// 比較して一致した場合のみ書き込む.
    ///
    /// 先行する内部的なflushによって、未コミットの上書きを含む全ての
    /// 書き込みが下位ストアへ反映された後に比較が行われる.
    /// 一致した場合には`Ok(None)`が、一致しなかった場合には
    /// 最初の不一致位置を持つ`Ok(Some(offset))`が返される.
    pub fn compare_and_write(
        &self,
        extents: Vec<ImageExtent>,
        compare: Vec<u8>,
        data: Vec<u8>,
    ) -> AsyncResult<Option<u64>> {
        let (reply, result) = reply_pair();
        self.inner.metrics.ops.writes.increment();
        if let Some(e) = self.reject_update() {
            reply.send(Err(e));
            return result;
        }

        let inner = Arc::clone(&self.inner);
        internal_flush(
            &self.inner,
            Box::new(move |flush_result| {
                if let Err(e) = flush_result {
                    reply.send(Err(track!(e)));
                    return;
                }
                {
                    let mut map = inner.map.write().expect("Never fails");
                    for extent in &extents {
                        map.invalidate(extent);
                    }
                }
                inner.async_ops.fetch_add(1, Ordering::SeqCst);
                let inner_cb = Arc::clone(&inner);
                inner.downstream.compare_and_write(
                    extents,
                    compare,
                    data,
                    Box::new(move |r| {
                        inner_cb.async_ops.fetch_sub(1, Ordering::SeqCst);
                        reply.send(r);
                    }),
                );
            }),
        );
        result
    }

    /// キャッシュの内容を全て無効化する.
    ///
    /// バリアとして直列化され、最後の同期点を作成した後、
    /// 全エントリを(下位への書き出しを抑止した上で)リタイアしてから、
    /// 無効化要求を下位ストアへ引き渡す.
    pub fn invalidate(&self) -> AsyncResult<()> {
        let (reply, result) = reply_pair();
        self.inner.metrics.ops.invalidates.increment();

        let inner = Arc::clone(&self.inner);
        self.inner.guard.detain(GuardedRequest {
            range: ImageExtent::new(0, 0),
            barrier: true,
            on_grant: Box::new(move |cell, _detained| {
                let mut later = DeferredCallbacks::new();
                {
                    let mut state = inner.state.lock().expect("Never fails");
                    state.invalidating = true;
                    dispatch::flush_new_sync_point(&inner, &mut state, &mut later, None);
                }
                std::mem::drop(later);

                let inner_job = Arc::clone(&inner);
                inner.jobs.execute(move || {
                    flusher::drain_log(&inner_job);
                    {
                        let mut map = inner_job.map.write().expect("Never fails");
                        map.clear();
                    }
                    inner_job.async_ops.fetch_add(1, Ordering::SeqCst);
                    let inner_cb = Arc::clone(&inner_job);
                    inner_job.downstream.invalidate(Box::new(move |r| {
                        {
                            let mut state = inner_cb.state.lock().expect("Never fails");
                            state.invalidating = false;
                        }
                        inner_cb.async_ops.fetch_sub(1, Ordering::SeqCst);
                        inner_cb.guard.release(cell);
                        reply.send(r);
                    }));
                });
            }),
        });
        result
    }

    /// キャッシュを停止する.
    ///
    /// 内部的なflushの後、全ダーティエントリを下位ストアへ排出し、
    /// 追跡中の非同期操作を待ち合わせ、全エントリをリタイアしてから、
    /// 下位ストアを停止する. 停止後の操作は`ErrorKind::Terminated`で失敗する.
    pub fn shut_down(&self) -> AsyncResult<()> {
        let (reply, result) = reply_pair();
        {
            let mut state = self.inner.state.lock().expect("Never fails");
            if state.shutting_down {
                reply.send(Err(track!(terminated_error())));
                return result;
            }
            state.shutting_down = true;
        }
        info!(self.inner.logger, "Shutting down the replicated write log");

        let inner = Arc::clone(&self.inner);
        internal_flush(
            &self.inner,
            Box::new(move |flush_result| {
                let inner_job = Arc::clone(&inner);
                inner.jobs.execute(move || {
                    flusher::drain_log(&inner_job);
                    inner_job.async_ops.fetch_add(1, Ordering::SeqCst);
                    let inner_cb = Arc::clone(&inner_job);
                    inner_job.downstream.shut_down(Box::new(move |r| {
                        inner_cb.async_ops.fetch_sub(1, Ordering::SeqCst);
                        reply.send(track!(flush_result.and(r)));
                    }));
                });
            }),
        );
        result
    }

    fn reject_update(&self) -> Option<Error> {
        if self.inner.config.read_only {
            let e = track!(ErrorKind::ReadOnly.cause("the cache is opened as read-only"));
            return Some(e.into());
        }
        let state = self.inner.state.lock().expect("Never fails");
        if state.shutting_down {
            return Some(track!(terminated_error()));
        }
        None
    }
}
impl<P, D> Drop for ReplicatedWriteLog<P, D>
where
    P: PersistentMemory,
    D: ImageWriteback,
{
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop();
        }
        if let Some(workers) = self.workers.take() {
            workers.stop();
        }
    }
}

/// flushの本体.
///
/// バリアとしてガードを獲得し、以下のいずれかを行う:
///
/// - 最後の同期点以降に書き込みがある: 新しい同期点を作り、
///   旧同期点の永続化完了に`callback`を繋ぐ
/// - 書き込みは無いが、前の同期点がまだ未永続: その完了に`callback`を繋ぐ
/// - どちらでもない: 即座に完了する
///
/// ガードセルは同期点の作成直後に解放される.
fn flush_with_callback<P, D>(inner: &Arc<CacheInner<P, D>>, callback: Callback)
where
    P: PersistentMemory,
    D: ImageWriteback,
{
    inner.metrics.ops.flushes.increment();
    let inner = Arc::clone(inner);
    let guard_inner = Arc::clone(&inner);
    guard_inner.guard.detain(GuardedRequest {
        range: ImageExtent::new(0, 0),
        barrier: true,
        on_grant: Box::new(move |cell, _detained| {
            let mut later = DeferredCallbacks::new();
            {
                let mut state = inner.state.lock().expect("Never fails");
                let sync_point = state
                    .current_sync_point
                    .clone()
                    .expect("the current sync point always exists");
                let (writes, _, _) = sync_point.write_counts();
                if writes > 0 {
                    dispatch::flush_new_sync_point(&inner, &mut state, &mut later, Some(callback));
                } else if let Some(earlier) = sync_point.earlier() {
                    earlier.on_self_persisted(&mut later, callback);
                } else {
                    later.add(move || callback(Ok(())));
                }
            }
            inner.guard.release(cell);
            // laterのドロップにより、活性化・追記要求・完了が発火する
        }),
    });
}

/// 内部flush.
///
/// 同期点の永続化([flush_with_callback])に加えて、全ダーティエントリの
/// 下位ストアへの排出完了までを保証する. 下位ストアを直接操作する経路
/// (discard / writesame / compare-and-write)の前段として使用される.
fn internal_flush<P, D>(inner: &Arc<CacheInner<P, D>>, callback: Callback)
where
    P: PersistentMemory,
    D: ImageWriteback,
{
    let drain_inner = Arc::clone(inner);
    flush_with_callback(
        inner,
        Box::new(move |result| {
            if let Err(e) = result {
                callback(Err(track!(e)));
                return;
            }
            let job_inner = Arc::clone(&drain_inner);
            drain_inner.jobs.execute(move || {
                flusher::drain_dirty(&job_inner);
                callback(Ok(()));
            });
        }),
    );
}

fn validate_write(extents: &[ImageExtent], payload: &[u8]) -> Result<()> {
    track_assert!(!extents.is_empty(), ErrorKind::InvalidInput);
    let mut total = 0;
    for extent in extents {
        track_assert!(
            !extent.is_empty(),
            ErrorKind::InvalidInput,
            "zero-length write extents are rejected"
        );
        track_assert!(
            extent.length <= u64::from(std::u32::MAX),
            ErrorKind::InvalidInput,
            "too large write extent: length={}",
            extent.length
        );
        track_assert!(
            extent.offset.checked_add(extent.length).is_some(),
            ErrorKind::InvalidInput,
            "write extent overflows the image address space"
        );
        total += extent.length;
    }
    track_assert_eq!(total, payload.len() as u64, ErrorKind::InvalidInput);
    Ok(())
}

/// 読み込み結果の合成と応答.
fn finish_read<P, D>(
    inner: &Arc<CacheInner<P, D>>,
    plan: Vec<ReadSlice>,
    miss_data: Result<Vec<u8>>,
    reply: AsyncReply<Vec<u8>>,
) where
    P: PersistentMemory,
    D: ImageWriteback,
{
    let result = miss_data.and_then(|miss| assemble_read(inner, &plan, &miss));
    for slice in &plan {
        if let ReadSlice::Hit { entry, .. } = slice {
            entry.unpin_reader();
        }
    }
    reply.send(result);
}

fn assemble_read<P, D>(
    inner: &Arc<CacheInner<P, D>>,
    plan: &[ReadSlice],
    miss_data: &[u8],
) -> Result<Vec<u8>>
where
    P: PersistentMemory,
    D: ImageWriteback,
{
    let mut out = Vec::with_capacity(plan.iter().fold(0, |acc, s| match s {
        ReadSlice::Hit { len, .. } | ReadSlice::Miss { len } => acc + len,
    }));
    let mut miss_pos = 0;
    for slice in plan {
        match slice {
            ReadSlice::Hit {
                buffer_offset, len, ..
            } => {
                let mut buf = vec![0; *len];
                track!(inner.pool.read_buffer(*buffer_offset, &mut buf))?;
                out.extend_from_slice(&buf);
            }
            ReadSlice::Miss { len } => {
                track_assert!(
                    miss_pos + len <= miss_data.len(),
                    ErrorKind::Other,
                    "short read from the downstream store"
                );
                out.extend_from_slice(&miss_data[miss_pos..miss_pos + len]);
                miss_pos += len;
            }
        }
    }
    Ok(out)
}

/// 周期的な統計出力と補助処理.
fn periodic_tick<P, D>(inner: &Arc<CacheInner<P, D>>)
where
    P: PersistentMemory,
    D: ImageWriteback,
{
    let (bytes_dirty, bytes_allocated, bytes_cached, free_log_entries, free_lanes) = {
        let state = inner.state.lock().expect("Never fails");
        (
            state.bytes_dirty,
            state.bytes_allocated,
            state.bytes_cached,
            state.free_log_entries,
            state.free_lanes,
        )
    };
    debug!(inner.logger, "Periodic stats";
           "bytes_dirty" => bytes_dirty,
           "bytes_allocated" => bytes_allocated,
           "bytes_cached" => bytes_cached,
           "free_log_entries" => free_log_entries,
           "free_lanes" => free_lanes);
    let job_inner = Arc::clone(inner);
    inner.jobs.execute(move || {
        flusher::process_writeback(&job_inner);
        flusher::maybe_retire(&job_inner);
    });
}

/// プール走査の結果から、メモリ上の状態を再構築する.
///
/// - 欠落世代に対する同期点の捏造(昇順、世代の一致を検証)
/// - 書き込みエントリの同期点への紐付けとカウンタの復元
/// - 区間マップとダーティリストの再構築(走査順の挿入により最新が勝つ)
///
/// 複製層が複製間の順序保証を持たない設定では、捏造された同期点を参照する
/// シーケンス番号無しの書き込みは破棄される(ライトバック済み扱いとなり、
/// リタイアで即座に回収される).
fn rebuild_recovered_state<P, D>(
    inner: &Arc<CacheInner<P, D>>,
    recovered: RecoveredLog,
    later: &mut DeferredCallbacks,
) -> Result<()>
where
    P: PersistentMemory,
    D: ImageWriteback,
{
    let mut fabricated: BTreeMap<u64, Arc<SyncPoint>> = BTreeMap::new();
    let mut map = inner.map.write().expect("Never fails");
    let mut state = inner.state.lock().expect("Never fails");

    for &sync_gen in &recovered.missing_sync_gens {
        track_assert!(
            sync_gen > state.current_sync_gen,
            ErrorKind::InconsistentState
        );
        state.current_sync_gen = sync_gen - 1;
        let sync_point = dispatch::new_sync_point(inner, &mut state, later);
        track_assert_eq!(
            sync_point.sync_gen(),
            sync_gen,
            ErrorKind::InconsistentState
        );
        sync_point.mark_append_scheduled();
        inner.metrics.log.fabricated_sync_points.increment();
        info!(inner.logger, "Fabricated a missing sync point"; "sync_gen" => sync_gen);

        let append_inner = Arc::clone(inner);
        let append_sync_point = Arc::clone(&sync_point);
        later.add(move || dispatch::maybe_append_sync_point(&append_inner, &append_sync_point));
        fabricated.insert(sync_gen, sync_point);
    }
    state.current_sync_gen = std::cmp::max(state.current_sync_gen, recovered.max_sync_gen);
    state.last_op_sequence_num = recovered.max_write_sequence_num;

    let block_size = inner.pool.block_size();
    for record in &recovered.records {
        let allocation_bytes = block_size.ceil_align(u64::from(record.write_bytes));
        let entry = Arc::new(WriteLogEntry::from_record(record, allocation_bytes));
        if record.is_write() {
            state.bytes_allocated += allocation_bytes + BLOCK_ALLOC_OVERHEAD_BYTES;
            state.bytes_cached += u64::from(record.write_bytes);

            let discard_unsequenced = !inner.config.trust_replica_order
                && record.write_sequence_number == 0
                && fabricated.contains_key(&record.sync_gen_number);
            if discard_unsequenced {
                // 複製間の永続化順序が保証されない場合、捏造同期点に属する
                // シーケンス番号無しの書き込みの内容は信用できない
                warn!(inner.logger, "Discarding an unsequenced recovered write";
                      "sync_gen" => record.sync_gen_number,
                      "image_offset" => record.image_offset_bytes,
                      "write_bytes" => record.write_bytes);
                entry.mark_flushed();
            } else {
                map.insert_entry(&entry);
                state.dirty_entries.push_back(Arc::clone(&entry));
                state.bytes_dirty += u64::from(record.write_bytes);
            }
            if let Some(sync_point) = fabricated.get(&record.sync_gen_number) {
                sync_point.account_write(u64::from(record.write_bytes));
                sync_point.account_write_completed();
            }
        }
        state.log_entries.push_back(entry);
    }
    state.free_log_entries = inner.pool.free_log_entries();
    update_resource_gauges(&inner.metrics, &state);
    info!(inner.logger, "Recovered the log pool";
          "entries" => recovered.records.len(),
          "fabricated_sync_points" => recovered.missing_sync_gens.len(),
          "max_sync_gen" => recovered.max_sync_gen);
    Ok(())
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use trackable::result::TestResult;

    use super::*;
    use crate::log::{EntryFlags, LogEntryRecord};
    use crate::pmem::MemoryPmem;

    #[derive(Debug, Default)]
    struct MockState {
        image: Vec<u8>,
        writes: Vec<(u64, u64)>,
        discards: Vec<(u64, u64)>,
        writesames: usize,
        invalidates: usize,
        shut_downs: usize,
        fail_writes: usize,
    }

    /// インラインで完了する下位ストアのテストダブル.
    #[derive(Debug, Clone)]
    struct MockWriteback(Arc<Mutex<MockState>>);
    impl MockWriteback {
        fn new(image_size: usize) -> Self {
            MockWriteback(Arc::new(Mutex::new(MockState {
                image: vec![0; image_size],
                ..MockState::default()
            })))
        }
        fn writes(&self) -> usize {
            self.0.lock().unwrap().writes.len()
        }
        fn discards(&self) -> Vec<(u64, u64)> {
            self.0.lock().unwrap().discards.clone()
        }
        fn invalidates(&self) -> usize {
            self.0.lock().unwrap().invalidates
        }
        fn image_range(&self, offset: usize, len: usize) -> Vec<u8> {
            self.0.lock().unwrap().image[offset..offset + len].to_vec()
        }
        fn fill_image(&self, offset: usize, data: &[u8]) {
            self.0.lock().unwrap().image[offset..offset + data.len()].copy_from_slice(data);
        }
        fn fail_next_writes(&self, count: usize) {
            self.0.lock().unwrap().fail_writes = count;
        }
    }
    impl ImageWriteback for MockWriteback {
        fn read(&self, extents: Vec<ImageExtent>, on_complete: DataCallback) {
            let out = {
                let state = self.0.lock().unwrap();
                let mut out = Vec::new();
                for extent in &extents {
                    out.extend_from_slice(
                        &state.image[extent.offset as usize..extent.end() as usize],
                    );
                }
                out
            };
            on_complete(Ok(out));
        }
        fn write(&self, extents: Vec<ImageExtent>, data: Vec<u8>, on_complete: Callback) {
            let result = {
                let mut state = self.0.lock().unwrap();
                if state.fail_writes > 0 {
                    state.fail_writes -= 1;
                    Err(ErrorKind::Other.cause("injected downstream write failure").into())
                } else {
                    let mut pos = 0;
                    for extent in &extents {
                        let offset = extent.offset as usize;
                        let len = extent.length as usize;
                        state.image[offset..offset + len].copy_from_slice(&data[pos..pos + len]);
                        pos += len;
                    }
                    for extent in &extents {
                        state.writes.push((extent.offset, extent.length));
                    }
                    Ok(())
                }
            };
            on_complete(result);
        }
        fn flush(&self, on_complete: Callback) {
            on_complete(Ok(()));
        }
        fn discard(
            &self,
            offset: u64,
            length: u64,
            _skip_partial_discard: bool,
            on_complete: Callback,
        ) {
            {
                let mut state = self.0.lock().unwrap();
                for b in &mut state.image[offset as usize..(offset + length) as usize] {
                    *b = 0;
                }
                state.discards.push((offset, length));
            }
            on_complete(Ok(()));
        }
        fn writesame(&self, offset: u64, length: u64, pattern: Vec<u8>, on_complete: Callback) {
            {
                let mut state = self.0.lock().unwrap();
                for i in 0..length as usize {
                    state.image[offset as usize + i] = pattern[i % pattern.len()];
                }
                state.writesames += 1;
            }
            on_complete(Ok(()));
        }
        fn compare_and_write(
            &self,
            extents: Vec<ImageExtent>,
            compare: Vec<u8>,
            data: Vec<u8>,
            on_complete: CompareCallback,
        ) {
            let result = {
                let mut state = self.0.lock().unwrap();
                let mut pos = 0;
                let mut mismatch = None;
                'outer: for extent in &extents {
                    for i in 0..extent.length as usize {
                        if state.image[extent.offset as usize + i] != compare[pos + i] {
                            mismatch = Some(extent.offset + i as u64);
                            break 'outer;
                        }
                    }
                    pos += extent.length as usize;
                }
                if let Some(offset) = mismatch {
                    Ok(Some(offset))
                } else {
                    let mut pos = 0;
                    for extent in &extents {
                        let offset = extent.offset as usize;
                        let len = extent.length as usize;
                        state.image[offset..offset + len].copy_from_slice(&data[pos..pos + len]);
                        pos += len;
                    }
                    Ok(None)
                }
            };
            on_complete(result);
        }
        fn invalidate(&self, on_complete: Callback) {
            self.0.lock().unwrap().invalidates += 1;
            on_complete(Ok(()));
        }
        fn init(&self, on_complete: Callback) {
            on_complete(Ok(()));
        }
        fn shut_down(&self, on_complete: Callback) {
            self.0.lock().unwrap().shut_downs += 1;
            on_complete(Ok(()));
        }
    }

    fn pmem() -> MemoryPmem {
        MemoryPmem::new(vec![0; 1024 * 1024])
    }

    fn extent(offset: u64, length: u64) -> ImageExtent {
        ImageExtent::new(offset, length)
    }

    fn poll_until<F: Fn() -> bool>(condition: F) {
        let started = Instant::now();
        while !condition() {
            assert!(
                started.elapsed() < Duration::from_secs(10),
                "condition was not satisfied in time"
            );
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn write_flush_read_round_trip() -> TestResult {
        let pmem = pmem();
        let mock = MockWriteback::new(1 << 20);
        let cache = track!(CacheBuilder::new().create(pmem.clone(), mock.clone()))?;

        let data = vec![0xAB; 4096];
        track!(block_on(cache.write(vec![extent(0, 4096)], data.clone())))?;
        track!(block_on(cache.flush()))?;
        assert_eq!(track!(block_on(cache.read(vec![extent(0, 4096)])))?, data);

        // バックグラウンドのライトバックが下位ストアへ到達する
        poll_until(|| mock.writes() == 1);
        assert_eq!(mock.image_range(0, 4096), data);

        track!(block_on(cache.shut_down()))?;
        std::mem::drop(cache);

        // ログ上の姿: 書き込み(gen 1) + 同期点(gen 1)
        let pool = track!(LogPool::open(pmem))?;
        assert_eq!(pool.first_free_entry(), 2);
        let record = track!(pool.read_record(0))?;
        assert!(record.is_write());
        assert_eq!(record.sync_gen_number, 1);
        let record = track!(pool.read_record(1))?;
        assert!(record.is_sync_point());
        assert_eq!(record.sync_gen_number, 1);
        Ok(())
    }

    #[test]
    fn overwrite_is_resolved_in_favor_of_the_newest_write() -> TestResult {
        let mock = MockWriteback::new(1 << 20);
        let cache = track!(CacheBuilder::new().create(pmem(), mock.clone()))?;

        let a = vec![0xAA; 4096];
        let b = vec![0xBB; 2048];
        track!(block_on(cache.write(vec![extent(0, 4096)], a.clone())))?;
        track!(block_on(cache.write(vec![extent(2048, 2048)], b.clone())))?;

        let mut expected = a[..2048].to_vec();
        expected.extend_from_slice(&b);
        assert_eq!(track!(block_on(cache.read(vec![extent(0, 4096)])))?, expected);

        // 下位ストアもログ順の適用により同じ内容へ収束する
        track!(block_on(cache.flush()))?;
        poll_until(|| mock.writes() == 2);
        assert_eq!(mock.image_range(0, 4096), expected);
        Ok(())
    }

    #[test]
    fn read_interleaves_hits_and_misses() -> TestResult {
        let mock = MockWriteback::new(1 << 20);
        let cache = track!(CacheBuilder::new().create(pmem(), mock.clone()))?;

        mock.fill_image(0, &[0x11; 4096]);
        mock.fill_image(8192, &[0x33; 4096]);
        let hit = vec![0x22; 4096];
        track!(block_on(cache.write(vec![extent(4096, 4096)], hit.clone())))?;

        let mut expected = vec![0x11; 4096];
        expected.extend_from_slice(&hit);
        expected.extend_from_slice(&[0x33; 4096]);
        assert_eq!(
            track!(block_on(cache.read(vec![extent(0, 12288)])))?,
            expected
        );

        assert_eq!(cache.metrics().ops().read_hit_bytes(), 4096);
        assert_eq!(cache.metrics().ops().read_miss_bytes(), 8192);
        Ok(())
    }

    #[test]
    fn retirement_reclaims_flushed_entries() -> TestResult {
        let mock = MockWriteback::new(2 << 20);
        let cache = track!(CacheBuilder::new().create(pmem(), mock.clone()))?;

        // 高水位(データ領域の50%)を超えるまで書き込む
        for i in 0..150u64 {
            let data = vec![i as u8; 4096];
            track!(block_on(cache.write(vec![extent(i * 4096, 4096)], data)))?;
        }
        track!(block_on(cache.flush()))?;

        // ライトバック完了後、リタイアが`first_valid_entry`を前進させ、
        // 低水位(データ領域の40%)を下回るまでバッファが解放される
        let low_water = (968_704.0 * RETIRE_LOW_WATER) as u64;
        poll_until(|| cache.stats().first_valid_entry > 0);
        poll_until(|| cache.stats().bytes_allocated <= low_water);
        assert!(cache.metrics().log().retired_entries() > 0);

        // リタイア済みの範囲は下位ストアから正しく読める
        assert_eq!(
            track!(block_on(cache.read(vec![extent(0, 4096)])))?,
            vec![0u8; 4096]
        );

        // 不変項: free + used == N - 1
        let stats = cache.stats();
        let used = (stats.first_free_entry + stats.num_log_entries - stats.first_valid_entry)
            % stats.num_log_entries;
        assert_eq!(stats.free_log_entries + used, stats.num_log_entries - 1);
        Ok(())
    }

    fn craft_partial_pool(pmem: &MemoryPmem) -> TestResult {
        // W(gen=3), W(gen=3), SP(gen=3), W(gen=4) -- SP(gen=4)の書き込み前にクラッシュ
        let pool = track!(LogPool::create(pmem.clone()))?;
        let mut records = Vec::new();
        for (index, (sync_gen, seq, offset, fill)) in [
            (3u64, 1u64, 0u64, 0x11u8),
            (3, 2, 4096, 0x22),
            (4, 0, 8192, 0x33),
        ]
        .iter()
        .enumerate()
        {
            let reservation = pool.reserve_buffer(512).expect("Some(_)");
            track!(pool.write_buffer(reservation.offset, &vec![*fill; 512]))?;
            let entry_index = if *sync_gen == 4 { 3 } else { index as u32 };
            records.push(LogEntryRecord {
                entry_index,
                sync_gen_number: *sync_gen,
                write_sequence_number: *seq,
                image_offset_bytes: *offset,
                write_bytes: 512,
                flags: if *seq == 0 {
                    EntryFlags::write()
                } else {
                    EntryFlags::sequenced_write()
                },
                buffer_offset: reservation.offset,
            });
        }
        records.insert(
            2,
            LogEntryRecord {
                entry_index: 2,
                sync_gen_number: 3,
                write_sequence_number: 0,
                image_offset_bytes: 0,
                write_bytes: 0,
                flags: EntryFlags::sync_point_record(),
                buffer_offset: 0,
            },
        );
        for record in &records {
            track!(pool.stage_record(record))?;
        }
        track!(pool.flush_records(0, 4))?;
        track!(pool.drain())?;
        track!(pool.commit_append(4))?;
        Ok(())
    }

    #[test]
    fn recovery_fabricates_missing_sync_points() -> TestResult {
        let pmem = pmem();
        craft_partial_pool(&pmem)?;

        let mock = MockWriteback::new(1 << 20);
        let cache = track!(CacheBuilder::new()
            .trust_replica_order(true)
            .open(pmem, mock.clone()))?;

        // 捏造されたSP(gen=4)が起動時に追記される
        assert_eq!(cache.metrics().log().fabricated_sync_points(), 1);
        poll_until(|| cache.stats().first_free_entry == 5);
        assert_eq!(cache.stats().current_sync_gen, 5);

        // 復旧された書き込みは全てダーティリストに載り、ライトバックされる
        poll_until(|| mock.writes() == 3);
        assert_eq!(
            track!(block_on(cache.read(vec![extent(0, 512)])))?,
            vec![0x11; 512]
        );
        assert_eq!(
            track!(block_on(cache.read(vec![extent(4096, 512)])))?,
            vec![0x22; 512]
        );
        assert_eq!(
            track!(block_on(cache.read(vec![extent(8192, 512)])))?,
            vec![0x33; 512]
        );
        Ok(())
    }

    #[test]
    fn recovery_discards_unsequenced_writes_by_default() -> TestResult {
        let pmem = pmem();
        craft_partial_pool(&pmem)?;

        let mock = MockWriteback::new(1 << 20);
        let cache = track!(CacheBuilder::new().open(pmem, mock.clone()))?;
        assert_eq!(cache.metrics().log().fabricated_sync_points(), 1);

        // gen=3の2件だけがライトバックされ、gen=4の書き込みは破棄される
        poll_until(|| mock.writes() == 2);
        assert_eq!(
            track!(block_on(cache.read(vec![extent(8192, 512)])))?,
            vec![0; 512]
        );
        assert_eq!(
            track!(block_on(cache.read(vec![extent(0, 512)])))?,
            vec![0x11; 512]
        );
        Ok(())
    }

    #[test]
    fn persist_on_flush_acknowledges_at_dispatch() -> TestResult {
        let mock = MockWriteback::new(1 << 20);
        let cache = track!(CacheBuilder::new()
            .persist_on_flush(true)
            .create(pmem(), mock.clone()))?;

        for i in 0..10u64 {
            let data = vec![i as u8 + 1; 4096];
            track!(block_on(cache.write(vec![extent(i * 4096, 4096)], data)))?;
        }
        track!(block_on(cache.flush()))?;

        // flush後、全ての書き込みが下位ストアで永続化されている
        poll_until(|| mock.writes() == 10);
        for i in 0..10u64 {
            assert_eq!(
                mock.image_range(i as usize * 4096, 4096),
                vec![i as u8 + 1; 4096]
            );
        }

        // persist-on-flushの書き込みはシーケンス番号を持たない
        let stats = cache.stats();
        assert_eq!(stats.current_sync_gen, 2);
        Ok(())
    }

    #[test]
    fn deferred_writes_complete_under_resource_pressure() -> TestResult {
        let mock = MockWriteback::new(2 << 20);
        let cache = track!(CacheBuilder::new().create(pmem(), mock.clone()))?;

        // データ領域の上限を超える量を一斉に発行する
        let futures: Vec<_> = (0..300u64)
            .map(|i| cache.write(vec![extent(i * 4096, 4096)], vec![i as u8; 4096]))
            .collect();
        for future in futures {
            track!(block_on(future))?;
        }
        assert!(cache.metrics().ops().deferred_writes() > 0);

        assert_eq!(
            track!(block_on(cache.read(vec![extent(299 * 4096, 4096)])))?,
            vec![43; 4096] // 299 % 256
        );
        Ok(())
    }

    #[test]
    fn flush_without_new_writes_is_a_no_op() -> TestResult {
        let mock = MockWriteback::new(1 << 20);
        let cache = track!(CacheBuilder::new().create(pmem(), mock.clone()))?;

        track!(block_on(cache.flush()))?;
        assert_eq!(cache.stats().current_sync_gen, 1);

        track!(block_on(cache.write(vec![extent(0, 512)], vec![1; 512])))?;
        track!(block_on(cache.flush()))?;
        assert_eq!(cache.stats().current_sync_gen, 2);

        // 新しい書き込みが無ければ、二度目のflushは同期点を作らない
        track!(block_on(cache.flush()))?;
        assert_eq!(cache.stats().current_sync_gen, 2);
        Ok(())
    }

    #[test]
    fn discard_invalidates_the_cached_range() -> TestResult {
        let mock = MockWriteback::new(1 << 20);
        let cache = track!(CacheBuilder::new().create(pmem(), mock.clone()))?;

        track!(block_on(cache.write(vec![extent(0, 4096)], vec![0xEE; 4096])))?;
        track!(block_on(cache.discard(0, 4096, false)))?;

        assert_eq!(mock.discards(), vec![(0, 4096)]);
        assert_eq!(
            track!(block_on(cache.read(vec![extent(0, 4096)])))?,
            vec![0; 4096]
        );
        Ok(())
    }

    #[test]
    fn writesame_and_compare_and_write_pass_through() -> TestResult {
        let mock = MockWriteback::new(1 << 20);
        let cache = track!(CacheBuilder::new().create(pmem(), mock.clone()))?;

        track!(block_on(cache.write(vec![extent(0, 4096)], vec![0xAA; 4096])))?;
        track!(block_on(cache.writesame(0, 4096, vec![0x55])))?;
        assert_eq!(
            track!(block_on(cache.read(vec![extent(0, 4096)])))?,
            vec![0x55; 4096]
        );

        // 一致するcompareは書き込みに成功する
        let matched = track!(block_on(cache.compare_and_write(
            vec![extent(0, 4096)],
            vec![0x55; 4096],
            vec![0x77; 4096],
        )))?;
        assert_eq!(matched, None);
        assert_eq!(
            track!(block_on(cache.read(vec![extent(0, 4096)])))?,
            vec![0x77; 4096]
        );

        // 一致しないcompareは最初の不一致位置を返す
        let mismatched = track!(block_on(cache.compare_and_write(
            vec![extent(0, 4096)],
            vec![0x00; 4096],
            vec![0x88; 4096],
        )))?;
        assert_eq!(mismatched, Some(0));
        Ok(())
    }

    #[test]
    fn invalidate_drops_dirty_entries_without_writeback() -> TestResult {
        let mock = MockWriteback::new(1 << 20);
        let cache = track!(CacheBuilder::new()
            .persist_on_flush(true)
            .create(pmem(), mock.clone()))?;

        // 下位ストアへの書き込みを失敗させ続けて、ダーティなまま留める
        mock.fail_next_writes(1_000_000);
        track!(block_on(cache.write(vec![extent(0, 4096)], vec![0xDD; 4096])))?;

        track!(block_on(cache.invalidate()))?;
        assert_eq!(mock.invalidates(), 1);
        assert_eq!(mock.writes(), 0);
        assert_eq!(cache.stats().log_entries, 0);
        assert_eq!(cache.stats().dirty_entries, 0);

        // キャッシュされていた内容は消え、読み込みは下位ストアへ抜ける
        mock.fail_next_writes(0);
        assert_eq!(
            track!(block_on(cache.read(vec![extent(0, 4096)])))?,
            vec![0; 4096]
        );
        Ok(())
    }

    #[test]
    fn writeback_failure_is_requeued_and_retried() -> TestResult {
        let mock = MockWriteback::new(1 << 20);
        let cache = track!(CacheBuilder::new().create(pmem(), mock.clone()))?;

        mock.fail_next_writes(1);
        track!(block_on(cache.write(vec![extent(0, 4096)], vec![0xCC; 4096])))?;
        track!(block_on(cache.flush()))?;

        poll_until(|| mock.writes() == 1);
        assert!(cache.metrics().writeback().writeback_failures() >= 1);
        assert_eq!(mock.image_range(0, 4096), vec![0xCC; 4096]);
        Ok(())
    }

    #[test]
    fn read_only_cache_rejects_updates() -> TestResult {
        let mock = MockWriteback::new(1 << 20);
        let cache = track!(CacheBuilder::new()
            .read_only(true)
            .create(pmem(), mock.clone()))?;

        assert_eq!(
            block_on(cache.write(vec![extent(0, 512)], vec![0; 512]))
                .err()
                .map(|e| *e.kind()),
            Some(ErrorKind::ReadOnly)
        );
        assert_eq!(
            block_on(cache.discard(0, 512, false)).err().map(|e| *e.kind()),
            Some(ErrorKind::ReadOnly)
        );

        // 読み込みとflushは許可される
        assert!(block_on(cache.read(vec![extent(0, 512)])).is_ok());
        assert!(block_on(cache.flush()).is_ok());
        Ok(())
    }

    #[test]
    fn zero_length_writes_are_rejected() -> TestResult {
        let mock = MockWriteback::new(1 << 20);
        let cache = track!(CacheBuilder::new().create(pmem(), mock.clone()))?;

        assert_eq!(
            block_on(cache.write(vec![extent(0, 0)], Vec::new()))
                .err()
                .map(|e| *e.kind()),
            Some(ErrorKind::InvalidInput)
        );
        assert_eq!(
            block_on(cache.write(Vec::new(), Vec::new()))
                .err()
                .map(|e| *e.kind()),
            Some(ErrorKind::InvalidInput)
        );

        // ペイロード長の不一致も拒否される
        assert_eq!(
            block_on(cache.write(vec![extent(0, 512)], vec![0; 256]))
                .err()
                .map(|e| *e.kind()),
            Some(ErrorKind::InvalidInput)
        );
        Ok(())
    }

    #[test]
    fn operations_after_shutdown_fail() -> TestResult {
        let mock = MockWriteback::new(1 << 20);
        let cache = track!(CacheBuilder::new().create(pmem(), mock.clone()))?;

        track!(block_on(cache.write(vec![extent(0, 512)], vec![7; 512])))?;
        track!(block_on(cache.shut_down()))?;

        assert_eq!(
            block_on(cache.write(vec![extent(0, 512)], vec![7; 512]))
                .err()
                .map(|e| *e.kind()),
            Some(ErrorKind::Terminated)
        );
        assert_eq!(
            block_on(cache.shut_down()).err().map(|e| *e.kind()),
            Some(ErrorKind::Terminated)
        );
        Ok(())
    }

    #[test]
    fn multi_extent_writes_work() -> TestResult {
        let mock = MockWriteback::new(1 << 20);
        let cache = track!(CacheBuilder::new().create(pmem(), mock.clone()))?;

        let mut payload = vec![0x01; 512];
        payload.extend_from_slice(&[0x02; 1024]);
        track!(block_on(cache.write(
            vec![extent(0, 512), extent(8192, 1024)],
            payload
        )))?;

        assert_eq!(
            track!(block_on(cache.read(vec![extent(0, 512)])))?,
            vec![0x01; 512]
        );
        assert_eq!(
            track!(block_on(cache.read(vec![extent(8192, 1024)])))?,
            vec![0x02; 1024]
        );
        Ok(())
    }

    #[test]
    fn ring_wraparound_preserves_invariants() -> TestResult {
        let mock = MockWriteback::new(1 << 20);
        let cache = track!(CacheBuilder::new().create(pmem(), mock.clone()))?;

        // スロット数(1239)を超える書き込みで、リングを一周させる
        let slots = u64::from(cache.stats().num_log_entries);
        let total = slots + 200;
        for i in 0..total {
            let offset = (i % 64) * 4096;
            let fill = (i % 251) as u8;
            track!(block_on(cache.write(vec![extent(offset, 512)], vec![fill; 512])))?;
            if i % 128 == 0 {
                track!(block_on(cache.flush()))?;
            }
        }
        track!(block_on(cache.flush()))?;

        assert!(cache.metrics().log().retired_entries() > 0);

        // 不変項: free + used == N - 1
        let stats = cache.stats();
        let used = (stats.first_free_entry + stats.num_log_entries - stats.first_valid_entry)
            % stats.num_log_entries;
        assert_eq!(stats.free_log_entries + used, stats.num_log_entries - 1);

        // 一周後も最後の書き込み内容が読める
        let last = total - 1;
        assert_eq!(
            track!(block_on(cache.read(vec![extent((last % 64) * 4096, 512)])))?,
            vec![(last % 251) as u8; 512]
        );
        Ok(())
    }

    #[test]
    fn reopen_after_clean_shutdown_serves_nothing_from_the_log() -> TestResult {
        let pmem = pmem();
        let mock = MockWriteback::new(1 << 20);
        {
            let cache = track!(CacheBuilder::new().create(pmem.clone(), mock.clone()))?;
            track!(block_on(cache.write(vec![extent(0, 4096)], vec![0x99; 4096])))?;
            track!(block_on(cache.shut_down()))?;
        }

        // 正常停止後のプールは空であり、読み込みは下位ストアから供給される
        let cache = track!(CacheBuilder::new().open(pmem, mock.clone()))?;
        assert_eq!(cache.stats().log_entries, 0);
        assert_eq!(
            track!(block_on(cache.read(vec![extent(0, 4096)])))?,
            vec![0x99; 4096]
        );
        assert_eq!(cache.metrics().ops().read_miss_bytes(), 4096);
        Ok(())
    }
}
