use std::sync::{Arc, Mutex};

use crate::block::BlockSize;
use crate::pmem::PersistentMemory;
use crate::{ErrorKind, Result};

/// メモリベースの`PersistentMemory`の実装.
///
/// # 注意
///
/// これは主にテストや性能計測用途を意図した実装であり、
/// `PersistentMemory`が本来要求する"不揮発性"は満たしていない.
#[derive(Debug, Clone)]
pub struct MemoryPmem {
    memory: Arc<Mutex<Vec<u8>>>,
    block_size: BlockSize,
}
impl MemoryPmem {
    /// 新しい`MemoryPmem`インスタンスを生成する.
    pub fn new(memory: Vec<u8>) -> Self {
        Self::with_block_size(memory, BlockSize::min())
    }

    /// ブロックサイズを指定して`MemoryPmem`インスタンスを生成する.
    pub fn with_block_size(memory: Vec<u8>, block_size: BlockSize) -> Self {
        MemoryPmem {
            memory: Arc::new(Mutex::new(memory)),
            block_size,
        }
    }

    /// 領域全体のコピーを返す.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.memory.lock().expect("Never fails").clone()
    }

    fn check_range(&self, offset: u64, length: u64) -> Result<()> {
        track_assert!(
            offset + length <= self.capacity(),
            ErrorKind::InvalidInput,
            "offset={}, length={}, capacity={}",
            offset,
            length,
            self.capacity()
        );
        Ok(())
    }
}
impl PersistentMemory for MemoryPmem {
    fn capacity(&self) -> u64 {
        self.memory.lock().expect("Never fails").len() as u64
    }
    fn block_size(&self) -> BlockSize {
        self.block_size
    }
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        track!(self.check_range(offset, buf.len() as u64))?;
        let memory = self.memory.lock().expect("Never fails");
        let start = offset as usize;
        buf.copy_from_slice(&memory[start..start + buf.len()]);
        Ok(())
    }
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        track!(self.check_range(offset, buf.len() as u64))?;
        let mut memory = self.memory.lock().expect("Never fails");
        let start = offset as usize;
        memory[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }
    fn flush_range(&self, offset: u64, length: u64) -> Result<()> {
        track!(self.check_range(offset, length))
    }
    fn drain(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;

    use super::*;
    use crate::pmem::PersistentMemory;

    #[test]
    fn it_works() -> TestResult {
        let pmem = MemoryPmem::new(vec![0; 1024]);
        assert_eq!(pmem.capacity(), 1024);

        track!(pmem.write_at(512, &[1; 256]))?;
        track!(pmem.flush_range(512, 256))?;
        track!(pmem.drain())?;

        let mut buf = vec![0; 256];
        track!(pmem.read_at(512, &mut buf))?;
        assert_eq!(buf, vec![1; 256]);

        // クローンは同一領域を共有する
        let clone = pmem.clone();
        track!(clone.write_at(0, &[2; 4]))?;
        let mut buf = vec![0; 4];
        track!(pmem.read_at(0, &mut buf))?;
        assert_eq!(buf, vec![2; 4]);
        Ok(())
    }

    #[test]
    fn out_of_range_is_rejected() {
        let pmem = MemoryPmem::new(vec![0; 1024]);
        assert!(pmem.write_at(1020, &[0; 8]).is_err());
        assert!(pmem.read_at(1024, &mut [0; 1]).is_err());
    }
}
