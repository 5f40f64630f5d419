//! イメージ範囲からログエントリへの区間マップ.
//!
//! ログからの読み込みとリタイアの進行判断に使用される.
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::block::ImageExtent;
use crate::log::WriteLogEntry;

/// 区間マップの一エントリ.
#[derive(Debug, Clone)]
struct MapEntry {
    end: u64,
    log_entry: Arc<WriteLogEntry>,
}

/// イメージのバイト範囲を、その範囲を覆う最新のログエントリへ対応付けるインデックス.
///
/// マップが保持する範囲同士は重複しない. 重複は挿入時に即座に解決され、
/// 古いエントリの範囲は縮小・分割・削除される.
///
/// 各ログエントリの被参照カウント(`map_refs`)は、そのエントリを指す
/// マップエントリの数と常に一致する. カウントが零になったエントリは
/// マップ上に存在しない.
///
/// このインデックス自体は永続化されることはないメモリ上のデータ構造であり、
/// プールを開く際に、有効なログエントリ群を用いて毎回再構築される.
#[derive(Debug, Default)]
pub struct WriteLogMap {
    // 開始位置 => エントリ. `BTreeMap`の範囲検索で重複判定を行う
    map: BTreeMap<u64, MapEntry>,
}
impl WriteLogMap {
    /// 新しい`WriteLogMap`インスタンスを生成する.
    pub fn new() -> Self {
        WriteLogMap {
            map: BTreeMap::new(),
        }
    }

    /// 書き込みエントリをマップに登録する.
    ///
    /// 既存エントリと重複する範囲は、新しいエントリで上書きされる:
    ///
    /// - 完全に覆われた既存エントリは削除される
    /// - 左端のみ重複する既存エントリは、新範囲の右側部分へ縮小される
    /// - 右端のみ重複する既存エントリは、新範囲の左側部分へ縮小される
    /// - 新範囲が既存エントリの内部に収まる場合、既存エントリは左右の残余に分割される
    ///   (分割された両者は同じログエントリを指すため、被参照カウントが一つ増える)
    pub fn insert_entry(&mut self, log_entry: &Arc<WriteLogEntry>) {
        let range = log_entry.extent();
        debug_assert!(!range.is_empty());
        self.punch_hole(&range);

        self.map.insert(
            range.offset,
            MapEntry {
                end: range.end(),
                log_entry: Arc::clone(log_entry),
            },
        );
        log_entry.add_map_ref();
    }

    /// 指定された範囲をマップから無効化する.
    ///
    /// 重複する既存エントリの扱いは[insert_entry](#method.insert_entry)と同様だが、
    /// 新規エントリの登録は行われない.
    pub fn invalidate(&mut self, range: &ImageExtent) {
        if range.is_empty() {
            return;
        }
        self.punch_hole(range);
    }

    /// 指定されたログエントリをマップから取り除く.
    ///
    /// そのエントリを指す全てのマップエントリが削除される.
    pub fn remove_entry(&mut self, log_entry: &Arc<WriteLogEntry>) {
        let starts: Vec<u64> = self
            .map
            .iter()
            .filter(|(_, e)| Arc::ptr_eq(&e.log_entry, log_entry))
            .map(|(&start, _)| start)
            .collect();
        for start in starts {
            let entry = self.map.remove(&start).expect("Never fails");
            entry.log_entry.release_map_ref();
        }
    }

    /// 指定された範囲と重複するマップエントリ群を検索する.
    ///
    /// 結果は、範囲内に切り詰めたサブ範囲と対応するログエントリのペアのリストであり、
    /// イメージオフセットの昇順にソートされている.
    pub fn find(&self, range: &ImageExtent) -> Vec<(ImageExtent, Arc<WriteLogEntry>)> {
        // 範囲同士は重複しないため、`range`と重複するのは
        // 「開始位置が`range.end()`未満」のエントリ群の末尾の連続部分となる
        let mut hits: Vec<_> = self
            .map
            .range(..range.end())
            .rev()
            .take_while(|(_, entry)| entry.end > range.offset)
            .map(|(&start, entry)| {
                let hit_start = std::cmp::max(start, range.offset);
                let hit_end = std::cmp::min(entry.end, range.end());
                (
                    ImageExtent::new(hit_start, hit_end - hit_start),
                    Arc::clone(&entry.log_entry),
                )
            })
            .collect();
        hits.reverse();
        hits
    }

    /// マップが保持しているエントリ数を返す.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// マップが空かどうかを判定する.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// マップ上の全範囲の長さの合計(バイト単位)を返す.
    pub fn mapped_bytes(&self) -> u64 {
        self.map
            .iter()
            .map(|(&start, entry)| entry.end - start)
            .sum()
    }

    /// 全エントリを削除する.
    pub fn clear(&mut self) {
        for entry in self.map.values() {
            entry.log_entry.release_map_ref();
        }
        self.map.clear();
    }

    /// `range`と重複する既存範囲を除去・調整する.
    fn punch_hole(&mut self, range: &ImageExtent) {
        let overlapping: Vec<u64> = self
            .map
            .range(..range.end())
            .rev()
            .take_while(|(_, e)| e.end > range.offset)
            .map(|(&start, _)| start)
            .collect();

        for start in overlapping {
            let existing = self.map.remove(&start).expect("Never fails");
            let left_remainder = start < range.offset;
            let right_remainder = existing.end > range.end();

            match (left_remainder, right_remainder) {
                (false, false) => {
                    // 完全に覆われた
                    existing.log_entry.release_map_ref();
                }
                (true, false) => {
                    // 左側の残余のみ
                    self.map.insert(
                        start,
                        MapEntry {
                            end: range.offset,
                            log_entry: existing.log_entry,
                        },
                    );
                }
                (false, true) => {
                    // 右側の残余のみ
                    self.map.insert(range.end(), existing);
                }
                (true, true) => {
                    // 新範囲が内部に収まる: 左右に分割
                    existing.log_entry.add_map_ref();
                    self.map.insert(
                        start,
                        MapEntry {
                            end: range.offset,
                            log_entry: Arc::clone(&existing.log_entry),
                        },
                    );
                    self.map.insert(range.end(), existing);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::block::ImageExtent;
    use crate::log::WriteLogEntry;

    fn write_entry(offset: u64, length: u32) -> Arc<WriteLogEntry> {
        Arc::new(WriteLogEntry::new_write(1, 0, offset, length, 0, 0))
    }

    #[test]
    fn insert_and_find_works() {
        let mut map = WriteLogMap::new();
        let a = write_entry(0, 4096);
        map.insert_entry(&a);
        assert_eq!(a.map_refs(), 1);

        let hits = map.find(&ImageExtent::new(1024, 512));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, ImageExtent::new(1024, 512));

        assert!(map.find(&ImageExtent::new(4096, 512)).is_empty());
    }

    #[test]
    fn overwrite_splits_existing_entry() {
        let mut map = WriteLogMap::new();
        let a = write_entry(0, 4096);
        let b = write_entry(1024, 1024);
        map.insert_entry(&a);
        map.insert_entry(&b);

        // aは[0,1024)と[2048,4096)に分割され、被参照カウントは2となる
        assert_eq!(a.map_refs(), 2);
        assert_eq!(b.map_refs(), 1);
        assert_eq!(map.len(), 3);
        assert_eq!(map.mapped_bytes(), 4096);

        let hits = map.find(&ImageExtent::new(0, 4096));
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].0, ImageExtent::new(0, 1024));
        assert!(Arc::ptr_eq(&hits[0].1, &a));
        assert_eq!(hits[1].0, ImageExtent::new(1024, 1024));
        assert!(Arc::ptr_eq(&hits[1].1, &b));
        assert_eq!(hits[2].0, ImageExtent::new(2048, 2048));
        assert!(Arc::ptr_eq(&hits[2].1, &a));
    }

    #[test]
    fn overwrite_shrinks_partial_overlaps() {
        let mut map = WriteLogMap::new();
        let a = write_entry(0, 2048);
        let b = write_entry(2048, 2048);
        let c = write_entry(1024, 2048);
        map.insert_entry(&a);
        map.insert_entry(&b);
        map.insert_entry(&c);

        assert_eq!(a.map_refs(), 1);
        assert_eq!(b.map_refs(), 1);
        assert_eq!(c.map_refs(), 1);
        assert_eq!(map.mapped_bytes(), 4096);

        let hits = map.find(&ImageExtent::new(0, 4096));
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].0, ImageExtent::new(0, 1024));
        assert!(Arc::ptr_eq(&hits[0].1, &a));
        assert_eq!(hits[1].0, ImageExtent::new(1024, 2048));
        assert!(Arc::ptr_eq(&hits[1].1, &c));
        assert_eq!(hits[2].0, ImageExtent::new(3072, 1024));
        assert!(Arc::ptr_eq(&hits[2].1, &b));
    }

    #[test]
    fn full_cover_removes_existing_entries() {
        let mut map = WriteLogMap::new();
        let a = write_entry(1024, 512);
        let b = write_entry(2048, 512);
        let c = write_entry(0, 4096);
        map.insert_entry(&a);
        map.insert_entry(&b);
        map.insert_entry(&c);

        assert_eq!(a.map_refs(), 0);
        assert_eq!(b.map_refs(), 0);
        assert_eq!(c.map_refs(), 1);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn invalidate_works() {
        let mut map = WriteLogMap::new();
        let a = write_entry(0, 4096);
        map.insert_entry(&a);

        map.invalidate(&ImageExtent::new(1024, 1024));
        assert_eq!(a.map_refs(), 2);
        assert_eq!(map.mapped_bytes(), 3072);
        assert!(map.find(&ImageExtent::new(1024, 1024)).is_empty());

        map.invalidate(&ImageExtent::new(0, 4096));
        assert_eq!(a.map_refs(), 0);
        assert!(map.is_empty());
    }

    #[test]
    fn remove_entry_works() {
        let mut map = WriteLogMap::new();
        let a = write_entry(0, 4096);
        let b = write_entry(1024, 1024);
        map.insert_entry(&a);
        map.insert_entry(&b);
        assert_eq!(a.map_refs(), 2);

        map.remove_entry(&a);
        assert_eq!(a.map_refs(), 0);
        assert_eq!(map.len(), 1);

        let hits = map.find(&ImageExtent::new(0, 4096));
        assert_eq!(hits.len(), 1);
        assert!(Arc::ptr_eq(&hits[0].1, &b));
    }
}
