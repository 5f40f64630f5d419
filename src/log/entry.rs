use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::block::ImageExtent;
use crate::log::{EntryFlags, LogEntryRecord};

/// スロット未割当を表す番兵値.
const UNASSIGNED_INDEX: u32 = std::u32::MAX;

/// ログエントリのメモリ上の姿.
///
/// 永続化形式である[LogEntryRecord]に対して、完了・ライトバック済みフラグや
/// 読み込み中カウント、区間マップからの被参照カウント、が追加されている.
///
/// エントリは以下によって共同所有される:
///
/// - グローバルなログ順リスト
/// - 区間マップ(エントリのいずれかの範囲が未上書きの間)
/// - 読み込み中のカーソル
///
/// エントリが破棄(リタイア)されるのは、ライトバック済みで、マップからの被参照が無く、
/// 読み込み中でもなく、かつリングの有効末尾に位置する場合のみ.
///
/// [LogEntryRecord]: ./struct.LogEntryRecord.html
#[derive(Debug)]
pub struct WriteLogEntry {
    sync_gen_number: u64,
    write_sequence_number: u64,
    image_offset_bytes: u64,
    write_bytes: u32,
    is_sync_point: bool,
    buffer_offset: u64,
    allocation_bytes: u64,

    entry_index: AtomicU32,
    completed: AtomicBool,
    flushed: AtomicBool,
    reader_count: AtomicUsize,
    map_refs: AtomicUsize,
}
impl WriteLogEntry {
    /// 書き込み用のエントリを生成する.
    ///
    /// `write_sequence_number`は、persist-on-flushグループに属する場合には`0`を指定する.
    pub fn new_write(
        sync_gen_number: u64,
        write_sequence_number: u64,
        image_offset_bytes: u64,
        write_bytes: u32,
        buffer_offset: u64,
        allocation_bytes: u64,
    ) -> Self {
        WriteLogEntry {
            sync_gen_number,
            write_sequence_number,
            image_offset_bytes,
            write_bytes,
            is_sync_point: false,
            buffer_offset,
            allocation_bytes,
            entry_index: AtomicU32::new(UNASSIGNED_INDEX),
            completed: AtomicBool::new(false),
            flushed: AtomicBool::new(false),
            reader_count: AtomicUsize::new(0),
            map_refs: AtomicUsize::new(0),
        }
    }

    /// 同期点用のエントリを生成する.
    pub fn new_sync_point(sync_gen_number: u64) -> Self {
        WriteLogEntry {
            sync_gen_number,
            write_sequence_number: 0,
            image_offset_bytes: 0,
            write_bytes: 0,
            is_sync_point: true,
            buffer_offset: 0,
            allocation_bytes: 0,
            entry_index: AtomicU32::new(UNASSIGNED_INDEX),
            completed: AtomicBool::new(false),
            flushed: AtomicBool::new(false),
            reader_count: AtomicUsize::new(0),
            map_refs: AtomicUsize::new(0),
        }
    }

    /// 復旧時に、永続化形式からメモリ上のエントリを再構築する.
    ///
    /// 復旧されたエントリはログに永続化済みなので、完了状態で生成される.
    pub fn from_record(record: &LogEntryRecord, allocation_bytes: u64) -> Self {
        let entry = if record.is_sync_point() {
            WriteLogEntry::new_sync_point(record.sync_gen_number)
        } else {
            WriteLogEntry::new_write(
                record.sync_gen_number,
                record.write_sequence_number,
                record.image_offset_bytes,
                record.write_bytes,
                record.buffer_offset,
                allocation_bytes,
            )
        };
        entry.assign_index(record.entry_index);
        entry.mark_completed();
        entry
    }

    /// 永続化形式のレコードへ変換する.
    pub fn to_record(&self) -> LogEntryRecord {
        let flags = if self.is_sync_point {
            EntryFlags::sync_point_record()
        } else if self.write_sequence_number != 0 {
            EntryFlags::sequenced_write()
        } else {
            EntryFlags::write()
        };
        LogEntryRecord {
            entry_index: self.index(),
            sync_gen_number: self.sync_gen_number,
            write_sequence_number: self.write_sequence_number,
            image_offset_bytes: self.image_offset_bytes,
            write_bytes: self.write_bytes,
            flags,
            buffer_offset: self.buffer_offset,
        }
    }

    /// このエントリが属する同期点の世代番号を返す.
    pub fn sync_gen(&self) -> u64 {
        self.sync_gen_number
    }

    /// 書き込みのシーケンス番号を返す.
    pub fn write_sequence_number(&self) -> u64 {
        self.write_sequence_number
    }

    /// エントリが書き込みかどうかを判定する.
    pub fn is_write(&self) -> bool {
        !self.is_sync_point
    }

    /// エントリが同期点かどうかを判定する.
    pub fn is_sync_point(&self) -> bool {
        self.is_sync_point
    }

    /// 書き込み対象のイメージ範囲を返す.
    pub fn extent(&self) -> ImageExtent {
        ImageExtent::new(self.image_offset_bytes, u64::from(self.write_bytes))
    }

    /// 書き込みデータの長さ(バイト単位)を返す.
    pub fn write_bytes(&self) -> u32 {
        self.write_bytes
    }

    /// データバッファのプール内オフセットを返す.
    pub fn buffer_offset(&self) -> u64 {
        self.buffer_offset
    }

    /// データバッファの割当サイズ(アライメント済み、バイト単位)を返す.
    pub fn allocation_bytes(&self) -> u64 {
        self.allocation_bytes
    }

    /// スロットインデックスを割り当てる.
    ///
    /// 追記ロックの下で、バッチ内の順序に従って一度だけ呼び出される.
    pub fn assign_index(&self, index: u32) {
        self.entry_index.store(index, Ordering::SeqCst);
    }

    /// 割当済みのスロットインデックスを返す.
    ///
    /// # パニック
    ///
    /// インデックスが未割当の場合にはパニックする.
    pub fn index(&self) -> u32 {
        let index = self.entry_index.load(Ordering::SeqCst);
        assert_ne!(index, UNASSIGNED_INDEX, "log entry index is not assigned");
        index
    }

    /// エントリの追記トランザクションがコミットされたことを記録する.
    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }

    /// エントリが完了済みかどうかを返す.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// エントリのデータが下位ストアへ書き出されたことを記録する.
    pub fn mark_flushed(&self) {
        self.flushed.store(true, Ordering::SeqCst);
    }

    /// エントリのデータが下位ストアへ書き出し済みかどうかを返す.
    pub fn is_flushed(&self) -> bool {
        self.flushed.load(Ordering::SeqCst)
    }

    /// 読み込み中カウントを一つ増やす.
    ///
    /// カウントが零でない間、エントリはリタイアされない.
    pub fn pin_reader(&self) {
        self.reader_count.fetch_add(1, Ordering::SeqCst);
    }

    /// 読み込み中カウントを一つ減らす.
    pub fn unpin_reader(&self) {
        let prev = self.reader_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
    }

    /// 現在の読み込み中カウントを返す.
    pub fn reader_count(&self) -> usize {
        self.reader_count.load(Ordering::SeqCst)
    }

    /// 区間マップからの被参照カウントを一つ増やす.
    pub fn add_map_ref(&self) {
        self.map_refs.fetch_add(1, Ordering::SeqCst);
    }

    /// 区間マップからの被参照カウントを一つ減らす.
    pub fn release_map_ref(&self) {
        let prev = self.map_refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
    }

    /// 現在の区間マップからの被参照カウントを返す.
    pub fn map_refs(&self) -> usize {
        self.map_refs.load(Ordering::SeqCst)
    }

    /// エントリがリタイア可能かどうかを判定する.
    ///
    /// リングの有効末尾に位置するかどうかは、呼び出し側が別途確認する必要がある.
    pub fn can_retire(&self) -> bool {
        self.is_completed()
            && (self.is_sync_point || self.is_flushed())
            && self.reader_count() == 0
            && self.map_refs() == 0
    }
}
