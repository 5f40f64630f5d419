use std::collections::BTreeSet;

use crate::log::{LogEntryRecord, LogPool};
use crate::pmem::PersistentMemory;
use crate::{ErrorKind, Result};

/// プール走査の結果.
///
/// メモリ上の各データ構造(区間マップ、ダーティリスト、同期点連鎖)の再構築は、
/// この結果を受け取った[cache]モジュールが行う.
///
/// [cache]: ../cache/index.html
#[derive(Debug)]
pub struct RecoveredLog {
    /// ログ順(i.e., スロットインデックス順)に並んだ有効レコード群.
    pub records: Vec<LogEntryRecord>,

    /// 対応する同期点レコードがログ内に存在しなかった世代群(昇順).
    ///
    /// これらの世代に対しては、復旧側で合成同期点を捏造する必要がある.
    pub missing_sync_gens: Vec<u64>,

    /// 走査中に観測された最大の同期点世代.
    pub max_sync_gen: u64,

    /// 走査中に観測された最大の書き込みシーケンス番号.
    pub max_write_sequence_num: u64,
}

/// プールの有効スロット範囲`[first_valid_entry, first_free_entry)`を走査する.
///
/// 走査中に以下の検証と復元を行う:
///
/// - 各レコードの`valid`フラグと、スロットインデックスの整合性
/// - 同期点レコードの世代が走査順で狭義単調増加であること
/// - 書き込みレコードが参照する世代のうち、同期点レコードが
///   ログ内に現れないものを「欠落世代」として収集
/// - 書き込みレコードのデータバッファをアロケータ上で割当済みとしてマーク
pub fn scan_pool<P: PersistentMemory>(pool: &LogPool<P>) -> Result<RecoveredLog> {
    let num_entries = pool.num_log_entries();
    let first_valid = pool.first_valid_entry();
    let first_free = pool.first_free_entry();
    let used = pool.used_log_entries();

    let mut records = Vec::with_capacity(used as usize);
    let mut seen_sync_gens = BTreeSet::new();
    let mut missing_sync_gens = BTreeSet::new();
    let mut last_sync_point_gen = 0;
    let mut max_sync_gen = 0;
    let mut max_write_sequence_num = 0;

    let mut index = first_valid;
    while index != first_free {
        let record = track!(pool.read_record(index))?;
        track_assert!(
            record.flags.valid(),
            ErrorKind::StorageCorrupted,
            "invalid record in the valid range: index={}",
            index
        );
        track_assert_eq!(
            record.entry_index,
            index,
            ErrorKind::StorageCorrupted,
            "slot index mismatch"
        );

        if record.is_sync_point() {
            track_assert!(
                record.sync_gen_number > last_sync_point_gen,
                ErrorKind::StorageCorrupted,
                "sync point generations must strictly increase: index={}, gen={}",
                index,
                record.sync_gen_number
            );
            last_sync_point_gen = record.sync_gen_number;
            seen_sync_gens.insert(record.sync_gen_number);
            missing_sync_gens.remove(&record.sync_gen_number);
        } else {
            if !seen_sync_gens.contains(&record.sync_gen_number) {
                missing_sync_gens.insert(record.sync_gen_number);
            }
            if record.flags.has_data() {
                track!(pool.mark_buffer_allocated(
                    record.buffer_offset,
                    pool.block_size().ceil_align(u64::from(record.write_bytes))
                ))?;
            }
            max_write_sequence_num =
                std::cmp::max(max_write_sequence_num, record.write_sequence_number);
        }
        max_sync_gen = std::cmp::max(max_sync_gen, record.sync_gen_number);

        records.push(record);
        index = (index + 1) % num_entries;
    }

    Ok(RecoveredLog {
        records,
        missing_sync_gens: missing_sync_gens.into_iter().collect(),
        max_sync_gen,
        max_write_sequence_num,
    })
}
