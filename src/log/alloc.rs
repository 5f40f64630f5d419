use std::collections::{BTreeMap, BTreeSet};

use crate::{ErrorKind, Result};

/// データ領域から投機的に予約されたバッファ.
///
/// 予約は、追記トランザクションのコミットによって*公開*されるか、
/// トランザクションに至らず失敗した場合に
/// [`cancel_reservation`](./struct.LogPool.html#method.cancel_reservation)で
/// *取り消される*かのいずれかとなる.
///
/// 公開前の予約を参照する有効なエントリは存在しないため、
/// 公開されなかった予約が復旧処理から見えることはない.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// バッファのプール内オフセット.
    pub offset: u64,

    /// バッファの長さ(ブロック境界にアライメント済み、バイト単位).
    pub length: u64,
}

/// データ領域用のアロケータ.
///
/// 指定された容量を有するデータ領域から、個々の書き込みに必要な部分領域の割当を担当する.
///
/// 割当の単位はブロックであり、要求サイズは事前にブロック境界へ切り上げられている必要がある.
///
/// この実装自体は、完全にメモリ上のデータ構造であり、状態は永続化されない.
/// 割当状況自体は有効なログエントリ群に情報が残っているので、
/// プールを開く際には、そこから前回の状態を復元することになる.
///
/// # 割当戦略
///
/// このアロケータは"BestFit"戦略を採用している.
///
/// 新規割当要求が発行された際には、空き領域のリストを探索し、
/// 要求サイズを満たす空き領域の中で、一番サイズが小さいものが選択される.
///
/// 選択された空き領域は、その中から要求サイズ分だけの割当を行い、
/// もしまだ余剰分がある場合には、再び空き領域リストに戻される.
#[derive(Debug)]
pub struct BufferAllocator {
    start_index: BTreeMap<u64, u64>, // 開始位置 => 長さ
    size_index: BTreeSet<(u64, u64)>, // (長さ, 開始位置)
    region_offset: u64,
    region_length: u64,
    allocated_bytes: u64,
}
impl BufferAllocator {
    /// 指定された領域全体を空きとするアロケータを生成する.
    pub fn new(region_offset: u64, region_length: u64) -> Self {
        let mut allocator = BufferAllocator {
            start_index: BTreeMap::new(),
            size_index: BTreeSet::new(),
            region_offset,
            region_length,
            allocated_bytes: 0,
        };
        if region_length > 0 {
            allocator.insert_free(region_offset, region_length);
        }
        allocator
    }

    /// `size`分の部分領域の割当を行う.
    ///
    /// 十分な空き領域が存在しない場合には`None`が返される.
    pub fn allocate(&mut self, size: u64) -> Option<u64> {
        debug_assert!(size > 0);
        let &(len, start) = self.size_index.range((size, 0)..).next()?;
        self.remove_free(start, len);
        if len > size {
            self.insert_free(start + size, len - size);
        }
        self.allocated_bytes += size;
        Some(start)
    }

    /// 割当済みの部分領域の解放を行う.
    ///
    /// # 事前条件
    ///
    /// - `[start, start + size)`は「以前に割当済み」かつ「未解放」の部分領域である
    pub fn release(&mut self, start: u64, size: u64) {
        debug_assert!(size > 0);
        self.allocated_bytes -= size;

        let mut start = start;
        let mut size = size;

        // 直前の空き領域と隣接していればマージする
        if let Some((&prev_start, &prev_len)) = self.start_index.range(..start).next_back() {
            if prev_start + prev_len == start {
                self.remove_free(prev_start, prev_len);
                start = prev_start;
                size += prev_len;
            }
        }

        // 直後の空き領域と隣接していればマージする
        if let Some(&next_len) = self.start_index.get(&(start + size)) {
            self.remove_free(start + size, next_len);
            size += next_len;
        }

        self.insert_free(start, size);
    }

    /// 指定された部分領域を割当済みとしてマークする.
    ///
    /// プールを開いた際に、有効なエントリ群から割当状況を復元するために使用される.
    ///
    /// # Errors
    ///
    /// 指定範囲が既に割当済みの場合には、種類が`ErrorKind::InconsistentState`の
    /// エラーが返される.
    pub fn mark_allocated(&mut self, start: u64, size: u64) -> Result<()> {
        debug_assert!(size > 0);
        let (&free_start, &free_len) = track_assert_some!(
            self.start_index.range(..=start).next_back(),
            ErrorKind::InconsistentState,
            "start={}, size={}",
            start,
            size
        );
        track_assert!(
            start + size <= free_start + free_len,
            ErrorKind::InconsistentState,
            "start={}, size={}, free_start={}, free_len={}",
            start,
            size,
            free_start,
            free_len
        );

        self.remove_free(free_start, free_len);
        if free_start < start {
            self.insert_free(free_start, start - free_start);
        }
        let tail = (free_start + free_len) - (start + size);
        if tail > 0 {
            self.insert_free(start + size, tail);
        }
        self.allocated_bytes += size;
        Ok(())
    }

    /// 割当済みバイト数の合計を返す.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    /// 管理対象領域の容量(バイト単位)を返す.
    pub fn capacity(&self) -> u64 {
        self.region_length
    }

    fn insert_free(&mut self, start: u64, len: u64) {
        self.start_index.insert(start, len);
        self.size_index.insert((len, start));
    }

    fn remove_free(&mut self, start: u64, len: u64) {
        self.start_index.remove(&start);
        self.size_index.remove(&(len, start));
    }
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;

    use super::*;

    #[test]
    fn allocate_and_release_works() {
        let mut allocator = BufferAllocator::new(0, 4096);
        assert_eq!(allocator.capacity(), 4096);

        let a = allocator.allocate(1024).unwrap();
        let b = allocator.allocate(1024).unwrap();
        let c = allocator.allocate(2048).unwrap();
        assert_eq!(allocator.allocated_bytes(), 4096);
        assert_eq!(allocator.allocate(512), None);

        allocator.release(b, 1024);
        assert_eq!(allocator.allocate(2048), None); // 断片化により不可
        assert_eq!(allocator.allocate(1024), Some(b));

        allocator.release(a, 1024);
        allocator.release(b, 1024);
        allocator.release(c, 2048);
        assert_eq!(allocator.allocated_bytes(), 0);

        // 全領域がマージされ、一括で割当可能
        assert_eq!(allocator.allocate(4096), Some(0));
    }

    #[test]
    fn best_fit_prefers_smallest_portion() {
        let mut allocator = BufferAllocator::new(0, 8192);
        let a = allocator.allocate(1024).unwrap(); // [0, 1024)
        let _b = allocator.allocate(512).unwrap(); // [1024, 1536)
        let c = allocator.allocate(2048).unwrap(); // [1536, 3584)
        let _d = allocator.allocate(512).unwrap(); // [3584, 4096)

        allocator.release(a, 1024);
        allocator.release(c, 2048);

        // 空き領域は [0,1024), [1536,3584), [4096,8192) の三つ.
        // 1024バイトの要求にはぴったり収まる[0,1024)が選ばれる.
        assert_eq!(allocator.allocate(1024), Some(0));
    }

    #[test]
    fn mark_allocated_works() -> TestResult {
        let mut allocator = BufferAllocator::new(1024, 4096);
        track!(allocator.mark_allocated(2048, 512))?;
        track!(allocator.mark_allocated(1024, 512))?;
        assert_eq!(allocator.allocated_bytes(), 1024);

        // 既に割当済みの範囲は拒否される
        assert!(allocator.mark_allocated(2048, 512).is_err());

        // 空いている残り領域は割当可能
        assert_eq!(allocator.allocate(512), Some(1536));
        assert_eq!(allocator.allocate(2560), Some(2560));
        assert_eq!(allocator.allocate(512), None);
        Ok(())
    }
}
