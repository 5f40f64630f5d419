use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use crate::block::BlockSize;
use crate::pmem::PersistentMemory;
use crate::{ErrorKind, Result};

/// ファイルベースの`PersistentMemory`の実装.
///
/// 位置指定I/O(`pread`/`pwrite`相当)で読み書きを行い、
/// `drain`で`fdatasync`相当の同期命令を発行する.
///
/// DAXマウントされたPMEMデバイス上のファイルを指定すれば、
/// 実際の永続メモリを格納先として使用できる.
#[derive(Debug, Clone)]
pub struct FilePmem {
    file: Arc<File>,
    capacity: u64,
    block_size: BlockSize,
}
impl FilePmem {
    /// 指定されたパスに新しいファイルを生成して、それを操作する`FilePmem`インスタンスを返す.
    ///
    /// # Errors
    ///
    /// `capacity`がブロック境界に揃っていない場合には、
    /// 種類が`ErrorKind::InvalidInput`のエラーが返される.
    pub fn create<P: AsRef<Path>>(path: P, capacity: u64) -> Result<Self> {
        let block_size = BlockSize::min();
        track_assert!(
            block_size.is_aligned(capacity),
            ErrorKind::InvalidInput,
            "capacity={}",
            capacity
        );
        let file = track_io!(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path))?;
        track_io!(file.set_len(capacity))?;
        Ok(FilePmem {
            file: Arc::new(file),
            capacity,
            block_size,
        })
    }

    /// 既に存在するファイルを開いて、それを操作する`FilePmem`インスタンスを返す.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = track_io!(OpenOptions::new().read(true).write(true).open(path))?;
        let capacity = track_io!(file.metadata())?.len();
        Ok(FilePmem {
            file: Arc::new(file),
            capacity,
            block_size: BlockSize::min(),
        })
    }

    /// ファイルが存在すればそれを開き、存在しなければ生成する.
    ///
    /// 結果のタプルの第二要素は、ファイルが新規に生成されたかどうかを示す.
    pub fn create_if_absent<P: AsRef<Path>>(path: P, capacity: u64) -> Result<(Self, bool)> {
        if path.as_ref().exists() {
            track!(Self::open(path)).map(|pmem| (pmem, false))
        } else {
            track!(Self::create(path, capacity)).map(|pmem| (pmem, true))
        }
    }

    fn check_range(&self, offset: u64, length: u64) -> Result<()> {
        track_assert!(
            offset + length <= self.capacity,
            ErrorKind::InvalidInput,
            "offset={}, length={}, capacity={}",
            offset,
            length,
            self.capacity
        );
        Ok(())
    }
}
impl PersistentMemory for FilePmem {
    fn capacity(&self) -> u64 {
        self.capacity
    }
    fn block_size(&self) -> BlockSize {
        self.block_size
    }
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        track!(self.check_range(offset, buf.len() as u64))?;
        track_io!(self.file.read_exact_at(buf, offset))?;
        Ok(())
    }
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        track!(self.check_range(offset, buf.len() as u64))?;
        track_io!(self.file.write_all_at(buf, offset))?;
        Ok(())
    }
    fn flush_range(&self, offset: u64, length: u64) -> Result<()> {
        // 永続化は`drain`の同期命令で一括して行われる
        track!(self.check_range(offset, length))
    }
    fn drain(&self) -> Result<()> {
        track_io!(self.file.sync_data())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;
    use trackable::result::TestResult;

    use super::*;
    use crate::pmem::PersistentMemory;

    #[test]
    fn create_and_open_works() -> TestResult {
        let dir = track_io!(TempDir::new("rwlog_test"))?;
        let path = dir.path().join("test.pool");

        let pmem = track!(FilePmem::create(&path, 1024 * 1024))?;
        assert_eq!(pmem.capacity(), 1024 * 1024);
        track!(pmem.write_at(4096, b"hello"))?;
        track!(pmem.flush_range(4096, 5))?;
        track!(pmem.drain())?;

        let pmem = track!(FilePmem::open(&path))?;
        assert_eq!(pmem.capacity(), 1024 * 1024);
        let mut buf = vec![0; 5];
        track!(pmem.read_at(4096, &mut buf))?;
        assert_eq!(buf, b"hello");
        Ok(())
    }

    #[test]
    fn create_if_absent_works() -> TestResult {
        let dir = track_io!(TempDir::new("rwlog_test"))?;
        let path = dir.path().join("test.pool");

        let (_, created) = track!(FilePmem::create_if_absent(&path, 1024 * 1024))?;
        assert!(created);
        let (_, created) = track!(FilePmem::create_if_absent(&path, 1024 * 1024))?;
        assert!(!created);
        Ok(())
    }

    #[test]
    fn unaligned_capacity_is_rejected() {
        let dir = TempDir::new("rwlog_test").unwrap();
        assert!(FilePmem::create(dir.path().join("test.pool"), 1000).is_err());
    }
}
