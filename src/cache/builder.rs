use prometrics::metrics::MetricBuilder;
use slog::{Discard, Logger};
use std::path::Path;
use std::time::Duration;

use crate::cache::{clamped_pool_size, ImageWriteback, ReplicatedWriteLog, MAX_CONCURRENT_WRITES};
use crate::log::{scan_pool, LogPool};
use crate::pmem::{FilePmem, PersistentMemory};
use crate::Result;

/// [ReplicatedWriteLog]のビルダ.
///
/// [ReplicatedWriteLog]: ./struct.ReplicatedWriteLog.html
#[derive(Clone)]
pub struct CacheBuilder {
    pub(crate) logger: Logger,
    pub(crate) metrics: MetricBuilder,
    pub(crate) persist_on_flush: bool,
    pub(crate) read_only: bool,
    pub(crate) lanes: usize,
    pub(crate) workers: usize,
    pub(crate) trust_replica_order: bool,
    pub(crate) stats_interval: Duration,
}
impl CacheBuilder {
    /// デフォルト設定で`CacheBuilder`インスタンスを生成する.
    pub fn new() -> Self {
        CacheBuilder {
            logger: Logger::root(Discard, o!()),
            metrics: MetricBuilder::new(),
            persist_on_flush: false,
            read_only: false,
            lanes: MAX_CONCURRENT_WRITES,
            workers: 2,
            trust_replica_order: false,
            stats_interval: Duration::from_secs(30),
        }
    }

    /// ロガーを設定する.
    ///
    /// デフォルトでは何も出力されない.
    pub fn logger(&mut self, logger: Logger) -> &mut Self {
        self.logger = logger;
        self
    }

    /// メトリクス用の共通設定を登録する.
    ///
    /// デフォルト値は`MetricBuilder::new()`.
    pub fn metrics(&mut self, metrics: MetricBuilder) -> &mut Self {
        self.metrics = metrics;
        self
    }

    /// persist-on-flushモードを設定する.
    ///
    /// 有効にすると、書き込みはログレコードの永続化を待たずにディスパッチ時点で
    /// 利用者へ応答され、その永続性は次の`flush`によってのみ保証される.
    ///
    /// デフォルトは無効(persist-on-write: 書き込みはログ永続化後に応答される).
    pub fn persist_on_flush(&mut self, enabled: bool) -> &mut Self {
        self.persist_on_flush = enabled;
        self
    }

    /// 読み込み専用モードを設定する.
    ///
    /// 有効にすると、更新系操作は`ErrorKind::ReadOnly`で失敗する.
    ///
    /// デフォルトは無効.
    pub fn read_only(&mut self, enabled: bool) -> &mut Self {
        self.read_only = enabled;
        self
    }

    /// 並行して複製処理を行える書き込みの上限(レーン数)を設定する.
    ///
    /// デフォルト値は[`MAX_CONCURRENT_WRITES`](./constant.MAX_CONCURRENT_WRITES.html).
    pub fn lanes(&mut self, lanes: usize) -> &mut Self {
        self.lanes = lanes;
        self
    }

    /// ワーカスレッド数を設定する.
    ///
    /// デフォルト値は`2`.
    pub fn workers(&mut self, workers: usize) -> &mut Self {
        self.workers = workers;
        self
    }

    /// 複製層が複製間で同一順序の永続化を保証しているかどうかを設定する.
    ///
    /// 無効(デフォルト)の場合、復旧時に「捏造された同期点を参照する
    /// シーケンス番号無しの書き込み」は破棄される.
    pub fn trust_replica_order(&mut self, enabled: bool) -> &mut Self {
        self.trust_replica_order = enabled;
        self
    }

    /// 周期的な統計出力の間隔を設定する.
    ///
    /// デフォルト値は30秒.
    pub fn stats_interval(&mut self, interval: Duration) -> &mut Self {
        self.stats_interval = interval;
        self
    }

    /// 新規にプールを生成して、キャッシュを起動する.
    pub fn create<P, D>(&self, pmem: P, downstream: D) -> Result<ReplicatedWriteLog<P, D>>
    where
        P: PersistentMemory,
        D: ImageWriteback,
    {
        let pool = track!(LogPool::create(pmem))?;
        track!(ReplicatedWriteLog::start(self.clone(), pool, downstream, None))
    }

    /// 既に存在するプールを開いて、キャッシュを起動する.
    ///
    /// プールの走査と復旧(区間マップ・ダーティリスト・同期点連鎖の再構築、
    /// 欠落同期点の捏造)はこの中で行われる.
    pub fn open<P, D>(&self, pmem: P, downstream: D) -> Result<ReplicatedWriteLog<P, D>>
    where
        P: PersistentMemory,
        D: ImageWriteback,
    {
        let pool = track!(LogPool::open(pmem))?;
        let recovered = track!(scan_pool(&pool))?;
        track!(ReplicatedWriteLog::start(
            self.clone(),
            pool,
            downstream,
            Some(recovered)
        ))
    }

    /// 指定されたパスのプールファイルを開き、存在しなければ生成して、
    /// キャッシュを起動する.
    ///
    /// 新規生成時のプールサイズには、`requested_size`を
    /// [`MIN_POOL_SIZE`](./constant.MIN_POOL_SIZE.html)まで切り上げた値が使われる.
    pub fn open_or_create_file<T, D>(
        &self,
        path: T,
        requested_size: u64,
        downstream: D,
    ) -> Result<ReplicatedWriteLog<FilePmem, D>>
    where
        T: AsRef<Path>,
        D: ImageWriteback,
    {
        let pool_size = clamped_pool_size(requested_size);
        let (pmem, created) = track!(FilePmem::create_if_absent(path, pool_size))?;
        if created {
            track!(self.create(pmem, downstream))
        } else {
            track!(self.open(pmem, downstream))
        }
    }
}
impl Default for CacheBuilder {
    fn default() -> Self {
        CacheBuilder::new()
    }
}
impl std::fmt::Debug for CacheBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CacheBuilder")
            .field("persist_on_flush", &self.persist_on_flush)
            .field("read_only", &self.read_only)
            .field("lanes", &self.lanes)
            .field("workers", &self.workers)
            .field("trust_replica_order", &self.trust_replica_order)
            .field("stats_interval", &self.stats_interval)
            .finish()
    }
}
