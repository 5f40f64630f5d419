//! リクエストの状態機械を構成するデータ型群.
//!
//! 書き込み・flush・discardのリクエストは、共通の状態遷移を辿る:
//!
//! ```text
//! ARRIVED -> GUARD_PENDING -> GUARD_HELD -> ALLOC_PENDING -> DISPATCHED
//!         -> BUFFER_PERSISTED -> APPENDING -> APPENDED -> PERSISTED -> COMPLETED
//! ```
//!
//! - `GUARD_PENDING -> GUARD_HELD`: ブロック範囲ガードがセルを付与した時点で遷移する.
//!   実行中の操作との重複があった場合には`detained`フラグが立つ
//! - `ALLOC_PENDING`: レーン・ログスロット・PMEMバッファの確保を試みる.
//!   失敗したリクエストは(順序保存のため後続ごと)遅延キューへ積まれる
//! - `DISPATCHED`: ペイロードがPMEMバッファへコピーされ、区間マップに登録される
//! - `BUFFER_PERSISTED`: バッファのフラッシュ完了(バッチでまとめて実施)
//! - `APPENDING` / `APPENDED`: 追記ロックの下でのスロット割当と、追記トランザクションのコミット
//! - `PERSISTED`: 完了のファンアウト. persist-on-writeモードではここで利用者へ応答する
//!   (persist-on-flushモードでは`DISPATCHED`時点で応答済み)
//! - `COMPLETED`: ガードセルとレーンの返却、遅延ディスパッチャの起床
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};

use crate::block::ImageExtent;
use crate::completion::{AsyncReply, GatherSub};
use crate::guard::GuardCell;
use crate::log::{Reservation, WriteLogEntry};
use crate::sync_point::SyncPoint;

/// ガード獲得から資源確保までの間の書き込みリクエスト.
#[derive(Debug)]
pub(crate) struct WriteRequest {
    /// 書き込み対象のイメージ範囲群.
    pub extents: Vec<ImageExtent>,

    /// 全範囲分のペイロード(範囲の順に連結済み).
    pub payload: Vec<u8>,

    /// 利用者への応答先.
    pub reply: Option<AsyncReply<()>>,

    /// 獲得済みのガードセル.
    pub guard_cell: Option<GuardCell>,

    /// ガード獲得時に、重複する先行操作によって待たされたかどうか.
    pub detained: bool,

    /// 資源不足により遅延キューを経由したかどうか.
    pub deferred: bool,
}
impl WriteRequest {
    /// リクエスト全体を覆う最小の範囲を返す.
    pub fn bounding_extent(&self) -> ImageExtent {
        let offset = self
            .extents
            .iter()
            .map(|e| e.offset)
            .min()
            .unwrap_or(0);
        let end = self.extents.iter().map(|e| e.end()).max().unwrap_or(0);
        ImageExtent::new(offset, end - offset)
    }

    /// 書き込みバイト数の合計を返す.
    pub fn total_bytes(&self) -> u64 {
        self.extents.iter().map(|e| e.length).sum()
    }
}

/// ディスパッチ後の書き込みリクエストの共有状態.
///
/// リクエストは範囲毎のログ操作に分割されるため、全ての操作が
/// 永続化された時点(`PERSISTED`)を検出するためのカウンタを持つ.
#[derive(Debug)]
pub(crate) struct WriteShared {
    /// 未永続の操作数.
    pub ops_remaining: AtomicUsize,

    /// このリクエストが保持しているレーン数.
    pub lanes: usize,

    /// 永続化完了時に解放されるガードセル.
    pub guard_cell: Mutex<Option<GuardCell>>,

    /// 利用者への応答先.
    ///
    /// persist-on-flushモードではディスパッチ時点で消費される.
    pub reply: Mutex<Option<AsyncReply<()>>>,
}

/// 書き込み一範囲分のログ操作.
pub(crate) struct WriteOp {
    pub entry: Arc<WriteLogEntry>,
    pub reservation: Reservation,
    pub sync_point: Arc<SyncPoint>,
    pub prior_sub: Option<GatherSub>,
    pub shared: Arc<WriteShared>,
}
impl std::fmt::Debug for WriteOp {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("WriteOp")
            .field("extent", &self.entry.extent())
            .field("sync_gen", &self.entry.sync_gen())
            .finish()
    }
}

/// 同期点レコード一つ分のログ操作.
#[derive(Debug)]
pub(crate) struct SyncPointAppendOp {
    pub entry: Arc<WriteLogEntry>,
    pub sync_point: Arc<SyncPoint>,
}

/// 追記パイプラインを流れるログ操作.
#[derive(Debug)]
pub(crate) enum LogOperation {
    Write(WriteOp),
    SyncPoint(SyncPointAppendOp),
}
impl LogOperation {
    /// この操作が追記するログエントリを返す.
    pub fn entry(&self) -> &Arc<WriteLogEntry> {
        match self {
            LogOperation::Write(op) => &op.entry,
            LogOperation::SyncPoint(op) => &op.entry,
        }
    }
}

/// 資源不足によって遅延された作業.
///
/// キューは先頭詰まり(head-of-line)方式であり、先頭の作業が資源を
/// 確保できるまで後続は実行されない. これにより発行順序が保存される.
#[derive(Debug)]
pub(crate) enum DeferredWork {
    Write(WriteRequest),
    SyncPointAppend(Arc<SyncPoint>),
}

/// 遅延キュー.
#[derive(Debug, Default)]
pub(crate) struct DeferredQueue {
    pub queue: std::collections::VecDeque<DeferredWork>,
    pub dispatching: bool,
}
