use std::io::Cursor;
use std::sync::Mutex;
use uuid::Uuid;

use crate::block::BlockSize;
use crate::log::root::FULL_ROOT_SIZE;
use crate::log::{
    BufferAllocator, LogEntryRecord, PoolRoot, Reservation, LOG_ENTRY_RECORD_SIZE, MAX_LOG_ENTRIES,
    MIN_WRITE_ALLOC_SIZE, RWL_POOL_VERSION, USABLE_SIZE,
};
use crate::pmem::PersistentMemory;
use crate::{ErrorKind, Result};

/// プールとして成立するために必要な最小のスロット数.
const MIN_LOG_ENTRIES: u64 = 4;

/// リングの始端・終端インデックス.
#[derive(Debug, Clone, Copy)]
struct RingIndices {
    first_free_entry: u32,
    first_valid_entry: u32,
}

/// 永続ログプール.
///
/// [PersistentMemory]上に、ルートブロック・スロット配列・データ領域のレイアウトを実装する.
///
/// このレイヤが提供するのは、スロットとバッファの読み書きおよび
/// 追記・リタイアのコミット手順のみであり、リクエストのスケジューリングや
/// 順序付けは上位の[cache]モジュールが担当する.
///
/// # コミット手順
///
/// 追記は以下の順序で行われる:
///
/// 1. 新規エントリのスロットレコードを書き込む([stage_record](#method.stage_record))
/// 2. スロット範囲をフラッシュし、永続化を待機する
/// 3. ルートの`first_free_entry`を前進させて書き直す([commit_append](#method.commit_append))
///
/// コミット点は3のルート書き込みであり、これが完了するまで新規エントリは
/// 復旧処理から見えない. 途中でクラッシュした場合、書きかけのスロットは
/// `first_free_entry`の先にあるため無視される(部分的な公開は構造上発生しない).
///
/// リタイアも同様に、ルートの`first_valid_entry`前進がコミット点となり、
/// コミット後にリタイア対象のデータバッファが解放される.
///
/// [PersistentMemory]: ../pmem/trait.PersistentMemory.html
/// [cache]: ../cache/index.html
#[derive(Debug)]
pub struct LogPool<P: PersistentMemory> {
    pmem: P,
    block_size: BlockSize,
    instance_uuid: Uuid,
    pool_size: u64,
    num_log_entries: u32,
    slot_array_offset: u64,
    data_region_offset: u64,
    data_region_length: u64,
    ring: Mutex<RingIndices>,
    alloc: Mutex<BufferAllocator>,
}
impl<P: PersistentMemory> LogPool<P> {
    /// 新規にプールを生成する.
    ///
    /// スロット数は、プール容量のうち[`USABLE_SIZE`]の割合を
    /// 最小の書き込み(1ブロック + メタデータ)が占めるサイズで割った値となる
    /// (上限は[`MAX_LOG_ENTRIES`]).
    ///
    /// [`USABLE_SIZE`]: ../log/constant.USABLE_SIZE.html
    /// [`MAX_LOG_ENTRIES`]: ../log/constant.MAX_LOG_ENTRIES.html
    pub fn create(pmem: P) -> Result<Self> {
        let block_size = pmem.block_size();
        track_assert_eq!(
            block_size.as_u32(),
            MIN_WRITE_ALLOC_SIZE,
            ErrorKind::InvalidInput
        );
        let pool_size = pmem.capacity();

        let effective_pool_size = (pool_size as f64 * USABLE_SIZE) as u64;
        let small_write_size = u64::from(MIN_WRITE_ALLOC_SIZE)
            + super::BLOCK_ALLOC_OVERHEAD_BYTES
            + LOG_ENTRY_RECORD_SIZE;
        let num_log_entries = std::cmp::min(effective_pool_size / small_write_size, MAX_LOG_ENTRIES);
        track_assert!(
            num_log_entries >= MIN_LOG_ENTRIES,
            ErrorKind::InvalidInput,
            "the pool is too small: pool_size={}",
            pool_size
        );
        let num_log_entries = num_log_entries as u32;

        let root = PoolRoot::new(pool_size, MIN_WRITE_ALLOC_SIZE, num_log_entries);
        let pool = track!(Self::from_root(pmem, &root))?;
        track!(pool.write_root())?;
        Ok(pool)
    }

    /// 既に存在するプールを開く.
    ///
    /// # Errors
    ///
    /// 以下の場合には、種類が`ErrorKind::InvalidInput`のエラーが返される:
    ///
    /// - レイアウトバージョンが[`RWL_POOL_VERSION`]と異なる
    /// - ブロックサイズが[`MIN_WRITE_ALLOC_SIZE`]と異なる
    /// - 記録されているプールサイズが実際の容量と異なる
    ///
    /// なお、この時点ではデータ領域の割当状況は復元されない.
    /// プールを開いた後、有効なエントリ群を走査して
    /// [mark_buffer_allocated](#method.mark_buffer_allocated)を呼び出す必要がある.
    ///
    /// [`RWL_POOL_VERSION`]: ../log/constant.RWL_POOL_VERSION.html
    /// [`MIN_WRITE_ALLOC_SIZE`]: ../log/constant.MIN_WRITE_ALLOC_SIZE.html
    pub fn open(pmem: P) -> Result<Self> {
        let mut buf = vec![0; FULL_ROOT_SIZE];
        track!(pmem.read_at(0, &mut buf))?;
        let root = track!(PoolRoot::read_from(&buf[..]))?;

        track_assert_eq!(
            root.layout_version,
            RWL_POOL_VERSION,
            ErrorKind::InvalidInput,
            "unsupported pool layout version"
        );
        track_assert_eq!(
            root.block_size,
            MIN_WRITE_ALLOC_SIZE,
            ErrorKind::InvalidInput,
            "unsupported pool block size"
        );
        track_assert_eq!(
            root.pool_size,
            pmem.capacity(),
            ErrorKind::InvalidInput,
            "pool size mismatch"
        );
        track!(Self::from_root(pmem, &root))
    }

    fn from_root(pmem: P, root: &PoolRoot) -> Result<Self> {
        let block_size = pmem.block_size();
        let slot_array_offset = u64::from(block_size.as_u32());
        let slot_array_end =
            slot_array_offset + u64::from(root.num_log_entries) * LOG_ENTRY_RECORD_SIZE;
        let data_region_offset = block_size.ceil_align(slot_array_end);
        track_assert!(
            data_region_offset < root.pool_size,
            ErrorKind::InvalidInput,
            "no room for the data region: pool_size={}",
            root.pool_size
        );
        let data_region_length = root.pool_size - data_region_offset;

        Ok(LogPool {
            pmem,
            block_size,
            instance_uuid: root.instance_uuid,
            pool_size: root.pool_size,
            num_log_entries: root.num_log_entries,
            slot_array_offset,
            data_region_offset,
            data_region_length,
            ring: Mutex::new(RingIndices {
                first_free_entry: root.first_free_entry,
                first_valid_entry: root.first_valid_entry,
            }),
            alloc: Mutex::new(BufferAllocator::new(data_region_offset, data_region_length)),
        })
    }

    /// プールのブロックサイズを返す.
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    /// プールのインスタンスUUIDを返す.
    pub fn instance_uuid(&self) -> Uuid {
        self.instance_uuid
    }

    /// スロット配列の要素数を返す.
    pub fn num_log_entries(&self) -> u32 {
        self.num_log_entries
    }

    /// リングの次の追記先インデックスを返す.
    pub fn first_free_entry(&self) -> u32 {
        self.ring.lock().expect("Never fails").first_free_entry
    }

    /// リング内の最古の有効エントリのインデックスを返す.
    pub fn first_valid_entry(&self) -> u32 {
        self.ring.lock().expect("Never fails").first_valid_entry
    }

    /// リング内の有効エントリ数を返す.
    pub fn used_log_entries(&self) -> u32 {
        let ring = self.ring.lock().expect("Never fails");
        (ring.first_free_entry + self.num_log_entries - ring.first_valid_entry)
            % self.num_log_entries
    }

    /// リングの空きスロット数を返す.
    ///
    /// 一スロットは常に空けておく必要があるため、最大値は`num_log_entries - 1`となる.
    pub fn free_log_entries(&self) -> u32 {
        self.num_log_entries - 1 - self.used_log_entries()
    }

    /// データ領域の容量(バイト単位)を返す.
    pub fn data_region_length(&self) -> u64 {
        self.data_region_length
    }

    /// データ領域の割当済みバイト数を返す.
    pub fn allocated_data_bytes(&self) -> u64 {
        self.alloc.lock().expect("Never fails").allocated_bytes()
    }

    /// 書き込みデータ用のバッファを投機的に予約する.
    ///
    /// 要求サイズはブロック境界へ切り上げられる.
    /// 空きが無い場合には`None`が返される(過渡的な状態であり、エラーではない).
    pub fn reserve_buffer(&self, write_bytes: u32) -> Option<Reservation> {
        let length = self.block_size.ceil_align(u64::from(write_bytes));
        let mut alloc = self.alloc.lock().expect("Never fails");
        alloc.allocate(length).map(|offset| Reservation { offset, length })
    }

    /// 予約を取り消して、領域を空きリストへ戻す.
    pub fn cancel_reservation(&self, reservation: Reservation) {
        let mut alloc = self.alloc.lock().expect("Never fails");
        alloc.release(reservation.offset, reservation.length);
    }

    /// 復旧時に、指定された範囲を割当済みとしてマークする.
    pub fn mark_buffer_allocated(&self, offset: u64, length: u64) -> Result<()> {
        let mut alloc = self.alloc.lock().expect("Never fails");
        track!(alloc.mark_allocated(offset, length))
    }

    /// 指定されたスロットのレコードを読み込む.
    pub fn read_record(&self, index: u32) -> Result<LogEntryRecord> {
        track_assert!(index < self.num_log_entries, ErrorKind::InvalidInput);
        let mut buf = vec![0; LOG_ENTRY_RECORD_SIZE as usize];
        track!(self.pmem.read_at(self.slot_offset(index), &mut buf))?;
        track!(LogEntryRecord::read_from(&buf[..]))
    }

    /// レコードを対応するスロットへ書き込む(フラッシュはしない).
    pub fn stage_record(&self, record: &LogEntryRecord) -> Result<()> {
        track_assert!(
            record.entry_index < self.num_log_entries,
            ErrorKind::InvalidInput
        );
        let mut buf = Cursor::new(vec![0; LOG_ENTRY_RECORD_SIZE as usize]);
        track!(record.write_to(&mut buf))?;
        track!(self
            .pmem
            .write_at(self.slot_offset(record.entry_index), buf.get_ref()))
    }

    /// 連続するスロット範囲をフラッシュする.
    ///
    /// 範囲はリングを周回してはならない. 周回する場合には、
    /// 呼び出し側が連続する区間毎に分割して呼び出す必要がある.
    pub fn flush_records(&self, first_index: u32, count: u32) -> Result<()> {
        track_assert!(
            first_index + count <= self.num_log_entries,
            ErrorKind::InvalidInput,
            "first_index={}, count={}",
            first_index,
            count
        );
        track!(self.pmem.flush_range(
            self.slot_offset(first_index),
            u64::from(count) * LOG_ENTRY_RECORD_SIZE
        ))
    }

    /// データバッファへ書き込む(フラッシュはしない).
    pub fn write_buffer(&self, offset: u64, data: &[u8]) -> Result<()> {
        track!(self.check_buffer_range(offset, data.len() as u64))?;
        track!(self.pmem.write_at(offset, data))
    }

    /// データバッファから読み込む.
    pub fn read_buffer(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        track!(self.check_buffer_range(offset, buf.len() as u64))?;
        track!(self.pmem.read_at(offset, buf))
    }

    /// データバッファの範囲をフラッシュする.
    pub fn flush_buffer(&self, offset: u64, length: u64) -> Result<()> {
        track!(self.check_buffer_range(offset, length))?;
        track!(self.pmem.flush_range(offset, length))
    }

    /// これまでにフラッシュされた内容の永続化完了を待機する.
    pub fn drain(&self) -> Result<()> {
        track!(self.pmem.drain())
    }

    /// 追記をコミットする.
    ///
    /// `first_free_entry`を前進させてルートを書き直す.
    /// これにより、ステージ済みの新規エントリ群とそれらのバッファ予約が公開される.
    ///
    /// 呼び出し前に、対象スロット群のフラッシュと`drain`が完了している必要がある.
    ///
    /// # Errors
    ///
    /// このメソッドがエラーを返した場合、コミットの成否は不定であり、
    /// データ整合性を確立できない. 呼び出し側はキャッシュを致命的エラーとして
    /// 閉じなければならない.
    pub fn commit_append(&self, new_first_free_entry: u32) -> Result<()> {
        track_assert!(
            new_first_free_entry < self.num_log_entries,
            ErrorKind::InvalidInput
        );
        {
            let mut ring = self.ring.lock().expect("Never fails");
            ring.first_free_entry = new_first_free_entry;
        }
        track!(self.write_root())
    }

    /// リタイアをコミットする.
    ///
    /// `first_valid_entry`を前進させてルートを書き直し、コミット後に
    /// リタイア対象のデータバッファ群を解放する.
    ///
    /// # Errors
    ///
    /// [commit_append](#method.commit_append)と同様に、エラーは致命的となる.
    pub fn commit_retire(&self, new_first_valid_entry: u32, freed: &[Reservation]) -> Result<()> {
        track_assert!(
            new_first_valid_entry < self.num_log_entries,
            ErrorKind::InvalidInput
        );
        {
            let mut ring = self.ring.lock().expect("Never fails");
            ring.first_valid_entry = new_first_valid_entry;
        }
        track!(self.write_root())?;

        let mut alloc = self.alloc.lock().expect("Never fails");
        for buffer in freed {
            alloc.release(buffer.offset, buffer.length);
        }
        Ok(())
    }

    fn slot_offset(&self, index: u32) -> u64 {
        self.slot_array_offset + u64::from(index) * LOG_ENTRY_RECORD_SIZE
    }

    fn check_buffer_range(&self, offset: u64, length: u64) -> Result<()> {
        track_assert!(
            self.data_region_offset <= offset
                && offset + length <= self.data_region_offset + self.data_region_length,
            ErrorKind::InvalidInput,
            "offset={}, length={}",
            offset,
            length
        );
        Ok(())
    }

    fn write_root(&self) -> Result<()> {
        let root = {
            let ring = self.ring.lock().expect("Never fails");
            PoolRoot {
                layout_version: RWL_POOL_VERSION,
                instance_uuid: self.instance_uuid,
                pool_size: self.pool_size,
                block_size: MIN_WRITE_ALLOC_SIZE,
                num_log_entries: self.num_log_entries,
                first_free_entry: ring.first_free_entry,
                first_valid_entry: ring.first_valid_entry,
            }
        };
        let mut buf = Cursor::new(vec![0; FULL_ROOT_SIZE]);
        track!(root.write_to(&mut buf))?;
        track!(self.pmem.write_at(0, buf.get_ref()))?;
        track!(self.pmem.flush_range(0, FULL_ROOT_SIZE as u64))?;
        track!(self.pmem.drain())
    }
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;

    use super::*;
    use crate::log::EntryFlags;
    use crate::pmem::MemoryPmem;

    fn new_pool() -> LogPool<MemoryPmem> {
        LogPool::create(MemoryPmem::new(vec![0; 1024 * 1024])).unwrap()
    }

    fn write_record(index: u32, sync_gen: u64, buffer_offset: u64) -> LogEntryRecord {
        LogEntryRecord {
            entry_index: index,
            sync_gen_number: sync_gen,
            write_sequence_number: 0,
            image_offset_bytes: 0,
            write_bytes: 512,
            flags: EntryFlags::write(),
            buffer_offset,
        }
    }

    #[test]
    fn create_works() -> TestResult {
        let pool = new_pool();
        assert_eq!(pool.first_free_entry(), 0);
        assert_eq!(pool.first_valid_entry(), 0);
        assert_eq!(pool.used_log_entries(), 0);
        assert_eq!(pool.free_log_entries(), pool.num_log_entries() - 1);

        // 1MiBのプール: (1MiB * 0.7) / 592 = 1239 スロット
        assert_eq!(pool.num_log_entries(), 1239);
        Ok(())
    }

    #[test]
    fn create_and_reopen_works() -> TestResult {
        let pmem = MemoryPmem::new(vec![0; 1024 * 1024]);
        let pool = track!(LogPool::create(pmem.clone()))?;
        let uuid = pool.instance_uuid();
        let reservation = pool.reserve_buffer(512).expect("Some(_)");
        track!(pool.stage_record(&write_record(0, 1, reservation.offset)))?;
        track!(pool.flush_records(0, 1))?;
        track!(pool.drain())?;
        track!(pool.commit_append(1))?;
        std::mem::drop(pool);

        let pool = track!(LogPool::open(pmem))?;
        assert_eq!(pool.instance_uuid(), uuid);
        assert_eq!(pool.first_free_entry(), 1);
        assert_eq!(pool.first_valid_entry(), 0);
        assert_eq!(pool.used_log_entries(), 1);

        let record = track!(pool.read_record(0))?;
        assert_eq!(record.sync_gen_number, 1);
        assert!(record.is_write());
        Ok(())
    }

    #[test]
    fn uncommitted_records_are_invisible() -> TestResult {
        let pmem = MemoryPmem::new(vec![0; 1024 * 1024]);
        let pool = track!(LogPool::create(pmem.clone()))?;

        // コミットせずにステージだけ行う
        let reservation = pool.reserve_buffer(512).expect("Some(_)");
        track!(pool.stage_record(&write_record(0, 1, reservation.offset)))?;
        std::mem::drop(pool);

        let pool = track!(LogPool::open(pmem))?;
        assert_eq!(pool.used_log_entries(), 0);
        Ok(())
    }

    #[test]
    fn retire_commit_releases_buffers() -> TestResult {
        let pool = new_pool();
        let r0 = pool.reserve_buffer(512).expect("Some(_)");
        let r1 = pool.reserve_buffer(512).expect("Some(_)");
        assert_eq!(pool.allocated_data_bytes(), 1024);

        track!(pool.commit_append(2))?;
        assert_eq!(pool.used_log_entries(), 2);

        track!(pool.commit_retire(1, &[r0]))?;
        assert_eq!(pool.first_valid_entry(), 1);
        assert_eq!(pool.used_log_entries(), 1);
        assert_eq!(pool.allocated_data_bytes(), 512);

        track!(pool.commit_retire(2, &[r1]))?;
        assert_eq!(pool.used_log_entries(), 0);
        assert_eq!(pool.allocated_data_bytes(), 0);
        Ok(())
    }

    #[test]
    fn version_mismatch_is_rejected() -> TestResult {
        let pmem = MemoryPmem::new(vec![0; 1024 * 1024]);
        track!(LogPool::create(pmem.clone()))?;

        // ルートのレイアウトバージョンを書き換える
        let mut buf = vec![0; FULL_ROOT_SIZE];
        track!(pmem.read_at(0, &mut buf))?;
        let mut root = track!(PoolRoot::read_from(&buf[..]))?;
        root.layout_version += 1;
        let mut out = Cursor::new(vec![0; FULL_ROOT_SIZE]);
        track!(root.write_to(&mut out))?;
        track!(pmem.write_at(0, out.get_ref()))?;

        assert_eq!(
            LogPool::open(pmem).err().map(|e| *e.kind()),
            Some(ErrorKind::InvalidInput)
        );
        Ok(())
    }

    #[test]
    fn too_small_pool_is_rejected() {
        assert!(LogPool::create(MemoryPmem::new(vec![0; 1024])).is_err());
    }
}
