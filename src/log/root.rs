use adler32::RollingAdler32;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use uuid::Uuid;

use crate::log::{MAGIC_NUMBER, RWL_POOL_VERSION};
use crate::{ErrorKind, Result};

/// チェックサム対象となるフィールド群の合計サイズ.
const BODY_SIZE: usize =
    4 /* layout_version */ +
    16 /* instance_uuid */ +
    8 /* pool_size */ +
    4 /* block_size */ +
    4 /* num_log_entries */ +
    4 /* first_free_entry */ +
    4 /* first_valid_entry */;

/// **マジックナンバー** と **チェックサム** も含めたルートのサイズ.
pub(crate) const FULL_ROOT_SIZE: usize = 4 + BODY_SIZE + 4;

/// プールのルート情報.
///
/// プール先頭のルートブロックに格納され、追記・リタイアのコミットの度に書き直される.
/// コミット点はこのルートの書き込みであり、`first_free_entry`・`first_valid_entry`の
/// 前進によって新規エントリの公開とリタイア済み領域の解放が確定する.
#[derive(Debug, Clone)]
pub struct PoolRoot {
    /// プールレイアウトのバージョン.
    ///
    /// 現在の最新バージョンは[`RWL_POOL_VERSION`](../log/constant.RWL_POOL_VERSION.html).
    pub layout_version: u32,

    /// プールの特定のインスタンスを識別するためのUUID.
    pub instance_uuid: Uuid,

    /// プール全体のサイズ(バイト単位).
    pub pool_size: u64,

    /// プールのブロックサイズ.
    ///
    /// [`MIN_WRITE_ALLOC_SIZE`](../log/constant.MIN_WRITE_ALLOC_SIZE.html)と
    /// 一致しない場合、プールは開けない.
    pub block_size: u32,

    /// スロット配列の要素数.
    pub num_log_entries: u32,

    /// リングの次の追記先インデックス.
    pub first_free_entry: u32,

    /// リング内の最古の有効エントリのインデックス.
    pub first_valid_entry: u32,
}
impl PoolRoot {
    /// ルート情報を`writer`に書き込む.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        let body = self.body_bytes();
        track_io!(writer.write_all(&MAGIC_NUMBER[..]))?;
        track_io!(writer.write_all(&body))?;
        track_io!(writer.write_u32::<BigEndian>(Self::checksum(&body)))?;
        Ok(())
    }

    /// ルート情報を`reader`から読み込む.
    ///
    /// # Errors
    ///
    /// マジックナンバーが異なる場合には`ErrorKind::InvalidInput`が、
    /// チェックサム検証に失敗した場合には`ErrorKind::StorageCorrupted`が返される.
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut magic_number = [0; 4];
        track_io!(reader.read_exact(&mut magic_number))?;
        track_assert_eq!(magic_number, MAGIC_NUMBER, ErrorKind::InvalidInput);

        let mut body = [0; BODY_SIZE];
        track_io!(reader.read_exact(&mut body))?;
        let checksum = track_io!(reader.read_u32::<BigEndian>())?;
        track_assert_eq!(
            checksum,
            Self::checksum(&body),
            ErrorKind::StorageCorrupted,
            "the pool root is torn or corrupted"
        );

        let mut body = &body[..];
        let layout_version = track_io!(body.read_u32::<BigEndian>())?;
        let mut instance_uuid = [0; 16];
        track_io!(body.read_exact(&mut instance_uuid))?;
        let instance_uuid = Uuid::from_bytes(instance_uuid);
        let pool_size = track_io!(body.read_u64::<BigEndian>())?;
        let block_size = track_io!(body.read_u32::<BigEndian>())?;
        let num_log_entries = track_io!(body.read_u32::<BigEndian>())?;
        let first_free_entry = track_io!(body.read_u32::<BigEndian>())?;
        let first_valid_entry = track_io!(body.read_u32::<BigEndian>())?;

        Ok(PoolRoot {
            layout_version,
            instance_uuid,
            pool_size,
            block_size,
            num_log_entries,
            first_free_entry,
            first_valid_entry,
        })
    }

    /// 新規プール用のルート情報を生成する.
    pub(crate) fn new(pool_size: u64, block_size: u32, num_log_entries: u32) -> Self {
        PoolRoot {
            layout_version: RWL_POOL_VERSION,
            instance_uuid: Uuid::new_v4(),
            pool_size,
            block_size,
            num_log_entries,
            first_free_entry: 0,
            first_valid_entry: 0,
        }
    }

    fn body_bytes(&self) -> [u8; BODY_SIZE] {
        let mut body = [0; BODY_SIZE];
        {
            let mut writer = &mut body[..];
            writer
                .write_u32::<BigEndian>(self.layout_version)
                .expect("Never fails");
            writer
                .write_all(self.instance_uuid.as_bytes())
                .expect("Never fails");
            writer
                .write_u64::<BigEndian>(self.pool_size)
                .expect("Never fails");
            writer
                .write_u32::<BigEndian>(self.block_size)
                .expect("Never fails");
            writer
                .write_u32::<BigEndian>(self.num_log_entries)
                .expect("Never fails");
            writer
                .write_u32::<BigEndian>(self.first_free_entry)
                .expect("Never fails");
            writer
                .write_u32::<BigEndian>(self.first_valid_entry)
                .expect("Never fails");
        }
        body
    }

    fn checksum(body: &[u8]) -> u32 {
        let mut adler32 = RollingAdler32::new();
        adler32.update_buffer(body);
        adler32.hash()
    }
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;

    use super::*;
    use crate::ErrorKind;

    fn root() -> PoolRoot {
        PoolRoot::new(1024 * 1024, 512, 128)
    }

    #[test]
    fn read_write_works() -> TestResult {
        let mut r0 = root();
        r0.first_free_entry = 10;
        r0.first_valid_entry = 3;

        let mut buf = Vec::new();
        track!(r0.write_to(&mut buf))?;
        assert_eq!(buf.len(), FULL_ROOT_SIZE);

        let r1 = track!(PoolRoot::read_from(&buf[..]))?;
        assert_eq!(r1.layout_version, RWL_POOL_VERSION);
        assert_eq!(r1.instance_uuid, r0.instance_uuid);
        assert_eq!(r1.pool_size, r0.pool_size);
        assert_eq!(r1.block_size, r0.block_size);
        assert_eq!(r1.num_log_entries, r0.num_log_entries);
        assert_eq!(r1.first_free_entry, 10);
        assert_eq!(r1.first_valid_entry, 3);
        Ok(())
    }

    #[test]
    fn torn_root_is_detected() -> TestResult {
        let mut buf = Vec::new();
        track!(root().write_to(&mut buf))?;
        buf[FULL_ROOT_SIZE - 5] ^= 1; // Tampers a byte

        assert_eq!(
            PoolRoot::read_from(&buf[..]).err().map(|e| *e.kind()),
            Some(ErrorKind::StorageCorrupted)
        );
        Ok(())
    }

    #[test]
    fn wrong_magic_number_is_rejected() -> TestResult {
        let mut buf = Vec::new();
        track!(root().write_to(&mut buf))?;
        buf[0] = b'x';

        assert_eq!(
            PoolRoot::read_from(&buf[..]).err().map(|e| *e.kind()),
            Some(ErrorKind::InvalidInput)
        );
        Ok(())
    }
}
