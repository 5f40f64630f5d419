//! [Prometheus][prometheus]用のメトリクス.
//!
//! [prometheus]: https://prometheus.io/
use prometrics::metrics::{Counter, Gauge, MetricBuilder};

/// キャッシュ全体のメトリクス.
#[derive(Debug, Clone)]
pub struct CacheMetrics {
    pub(crate) ops: OperationMetrics,
    pub(crate) log: LogMetrics,
    pub(crate) writeback: WritebackMetrics,
}
impl CacheMetrics {
    /// 操作毎のメトリクスを返す.
    pub fn ops(&self) -> &OperationMetrics {
        &self.ops
    }

    /// ログのメトリクスを返す.
    pub fn log(&self) -> &LogMetrics {
        &self.log
    }

    /// ライトバック・リタイアのメトリクスを返す.
    pub fn writeback(&self) -> &WritebackMetrics {
        &self.writeback
    }

    pub(crate) fn new(builder: &MetricBuilder) -> Self {
        CacheMetrics {
            ops: OperationMetrics::new(builder),
            log: LogMetrics::new(builder),
            writeback: WritebackMetrics::new(builder),
        }
    }
}

/// キャッシュに発行された操作のメトリクス.
#[derive(Debug, Clone)]
pub struct OperationMetrics {
    pub(crate) writes: Counter,
    pub(crate) reads: Counter,
    pub(crate) flushes: Counter,
    pub(crate) discards: Counter,
    pub(crate) invalidates: Counter,
    pub(crate) deferred_writes: Counter,
    pub(crate) detained_requests: Counter,
    pub(crate) read_hit_bytes: Counter,
    pub(crate) read_miss_bytes: Counter,
}
impl OperationMetrics {
    /// 発行された書き込み操作の数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// rwlog_cache_writes_total <COUNTER>
    /// ```
    pub fn writes(&self) -> u64 {
        self.writes.value() as u64
    }

    /// 発行された読み込み操作の数.
    pub fn reads(&self) -> u64 {
        self.reads.value() as u64
    }

    /// 発行されたflush操作の数.
    pub fn flushes(&self) -> u64 {
        self.flushes.value() as u64
    }

    /// リソース不足により遅延実行された書き込みの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// rwlog_cache_deferred_writes_total <COUNTER>
    /// ```
    pub fn deferred_writes(&self) -> u64 {
        self.deferred_writes.value() as u64
    }

    /// 範囲の重複により待機させられたリクエストの数.
    pub fn detained_requests(&self) -> u64 {
        self.detained_requests.value() as u64
    }

    /// ログから直接読み込まれたバイト数(読み込みヒット).
    pub fn read_hit_bytes(&self) -> u64 {
        self.read_hit_bytes.value() as u64
    }

    /// 下位ストアから読み込まれたバイト数(読み込みミス).
    pub fn read_miss_bytes(&self) -> u64 {
        self.read_miss_bytes.value() as u64
    }

    fn new(builder: &MetricBuilder) -> Self {
        let mut builder = builder.clone();
        builder.namespace("rwlog").subsystem("cache");
        OperationMetrics {
            writes: builder
                .counter("writes_total")
                .help("Number of issued write operations")
                .finish()
                .expect("Never fails"),
            reads: builder
                .counter("reads_total")
                .help("Number of issued read operations")
                .finish()
                .expect("Never fails"),
            flushes: builder
                .counter("flushes_total")
                .help("Number of issued flush operations")
                .finish()
                .expect("Never fails"),
            discards: builder
                .counter("discards_total")
                .help("Number of issued discard operations")
                .finish()
                .expect("Never fails"),
            invalidates: builder
                .counter("invalidates_total")
                .help("Number of issued invalidate operations")
                .finish()
                .expect("Never fails"),
            deferred_writes: builder
                .counter("deferred_writes_total")
                .help("Number of writes deferred due to resource exhaustion")
                .finish()
                .expect("Never fails"),
            detained_requests: builder
                .counter("detained_requests_total")
                .help("Number of requests detained due to overlapping operations")
                .finish()
                .expect("Never fails"),
            read_hit_bytes: builder
                .counter("read_hit_bytes_total")
                .help("Number of bytes served directly from the log")
                .finish()
                .expect("Never fails"),
            read_miss_bytes: builder
                .counter("read_miss_bytes_total")
                .help("Number of bytes read from the downstream store")
                .finish()
                .expect("Never fails"),
        }
    }
}

/// ログプールのメトリクス.
#[derive(Debug, Clone)]
pub struct LogMetrics {
    pub(crate) appended_entries: Counter,
    pub(crate) retired_entries: Counter,
    pub(crate) sync_points: Counter,
    pub(crate) fabricated_sync_points: Counter,
    pub(crate) dirty_bytes: Gauge,
    pub(crate) allocated_bytes: Gauge,
    pub(crate) cached_bytes: Gauge,
    pub(crate) free_log_entries: Gauge,
}
impl LogMetrics {
    /// 追記されたログエントリの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// rwlog_log_appended_entries_total <COUNTER>
    /// ```
    pub fn appended_entries(&self) -> u64 {
        self.appended_entries.value() as u64
    }

    /// リタイアされたログエントリの数.
    pub fn retired_entries(&self) -> u64 {
        self.retired_entries.value() as u64
    }

    /// 生成された同期点の数.
    pub fn sync_points(&self) -> u64 {
        self.sync_points.value() as u64
    }

    /// 復旧時に捏造された同期点の数.
    pub fn fabricated_sync_points(&self) -> u64 {
        self.fabricated_sync_points.value() as u64
    }

    /// 未ライトバックの書き込みデータのバイト数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// rwlog_log_dirty_bytes <GAUGE>
    /// ```
    pub fn dirty_bytes(&self) -> u64 {
        self.dirty_bytes.value() as u64
    }

    /// データ領域の割当済みバイト数(オーバヘッド込み).
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes.value() as u64
    }

    /// ログが保持している書き込みデータのバイト数.
    pub fn cached_bytes(&self) -> u64 {
        self.cached_bytes.value() as u64
    }

    /// リングの空きスロット数.
    pub fn free_log_entries(&self) -> u64 {
        self.free_log_entries.value() as u64
    }

    fn new(builder: &MetricBuilder) -> Self {
        let mut builder = builder.clone();
        builder.namespace("rwlog").subsystem("log");
        LogMetrics {
            appended_entries: builder
                .counter("appended_entries_total")
                .help("Number of appended log entries")
                .finish()
                .expect("Never fails"),
            retired_entries: builder
                .counter("retired_entries_total")
                .help("Number of retired log entries")
                .finish()
                .expect("Never fails"),
            sync_points: builder
                .counter("sync_points_total")
                .help("Number of created sync points")
                .finish()
                .expect("Never fails"),
            fabricated_sync_points: builder
                .counter("fabricated_sync_points_total")
                .help("Number of sync points fabricated during recovery")
                .finish()
                .expect("Never fails"),
            dirty_bytes: builder
                .gauge("dirty_bytes")
                .help("Number of bytes not yet written back to the downstream store")
                .finish()
                .expect("Never fails"),
            allocated_bytes: builder
                .gauge("allocated_bytes")
                .help("Number of allocated data region bytes including overhead")
                .finish()
                .expect("Never fails"),
            cached_bytes: builder
                .gauge("cached_bytes")
                .help("Number of write data bytes held in the log")
                .finish()
                .expect("Never fails"),
            free_log_entries: builder
                .gauge("free_log_entries")
                .help("Number of free log entry slots")
                .finish()
                .expect("Never fails"),
        }
    }
}

/// ライトバックおよびリタイアのメトリクス.
#[derive(Debug, Clone)]
pub struct WritebackMetrics {
    pub(crate) writeback_writes: Counter,
    pub(crate) writeback_bytes: Counter,
    pub(crate) writeback_failures: Counter,
    pub(crate) retire_passes: Counter,
}
impl WritebackMetrics {
    /// 下位ストアへ発行されたライトバック書き込みの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// rwlog_writeback_writes_total <COUNTER>
    /// ```
    pub fn writeback_writes(&self) -> u64 {
        self.writeback_writes.value() as u64
    }

    /// 下位ストアへ書き出されたバイト数.
    pub fn writeback_bytes(&self) -> u64 {
        self.writeback_bytes.value() as u64
    }

    /// 失敗してリトライ対象となったライトバック書き込みの数.
    pub fn writeback_failures(&self) -> u64 {
        self.writeback_failures.value() as u64
    }

    /// 実行されたリタイアパスの数.
    pub fn retire_passes(&self) -> u64 {
        self.retire_passes.value() as u64
    }

    fn new(builder: &MetricBuilder) -> Self {
        let mut builder = builder.clone();
        builder.namespace("rwlog").subsystem("writeback");
        WritebackMetrics {
            writeback_writes: builder
                .counter("writes_total")
                .help("Number of writeback writes issued to the downstream store")
                .finish()
                .expect("Never fails"),
            writeback_bytes: builder
                .counter("bytes_total")
                .help("Number of bytes written back to the downstream store")
                .finish()
                .expect("Never fails"),
            writeback_failures: builder
                .counter("failures_total")
                .help("Number of writeback writes that failed and were requeued")
                .finish()
                .expect("Never fails"),
            retire_passes: builder
                .counter("retire_passes_total")
                .help("Number of executed retirement passes")
                .finish()
                .expect("Never fails"),
        }
    }
}
