use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::block::ImageExtent;
use crate::{ErrorKind, Result};

/// スロット一つ分のレコードのサイズ(バイト単位).
///
/// 実際のフィールド群よりも大きめに取ってあり、余剰部分はゼロ埋めされる.
pub const LOG_ENTRY_RECORD_SIZE: u64 = 64;

/// フィールド群の合計サイズ.
const FIELDS_SIZE: u64 =
    4 /* entry_index */ +
    8 /* sync_gen_number */ +
    8 /* write_sequence_number */ +
    8 /* image_offset_bytes */ +
    4 /* write_bytes */ +
    1 /* flags */ +
    8 /* buffer_offset */;

const FLAG_VALID: u8 = 0b0000_0001;
const FLAG_SYNC_POINT: u8 = 0b0000_0010;
const FLAG_HAS_DATA: u8 = 0b0000_0100;
const FLAG_SEQUENCED: u8 = 0b0000_1000;
const FLAG_UNMAP: u8 = 0b0001_0000;

const FLAGS_ALL: u8 = FLAG_VALID | FLAG_SYNC_POINT | FLAG_HAS_DATA | FLAG_SEQUENCED | FLAG_UNMAP;

/// ログエントリレコードのフラグ集合.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryFlags(u8);
impl EntryFlags {
    /// スロットに有効なエントリが格納されていることを示す.
    pub fn valid(self) -> bool {
        self.0 & FLAG_VALID != 0
    }

    /// エントリが同期点レコードであることを示す.
    pub fn sync_point(self) -> bool {
        self.0 & FLAG_SYNC_POINT != 0
    }

    /// エントリがデータバッファを参照していることを示す.
    pub fn has_data(self) -> bool {
        self.0 & FLAG_HAS_DATA != 0
    }

    /// 書き込みが個別のシーケンス番号を持つ(persist-on-writeモード)ことを示す.
    pub fn sequenced(self) -> bool {
        self.0 & FLAG_SEQUENCED != 0
    }

    /// エントリが解放(unmap)操作であることを示す.
    pub fn unmap(self) -> bool {
        self.0 & FLAG_UNMAP != 0
    }

    fn as_u8(self) -> u8 {
        self.0
    }

    fn from_u8(flags: u8) -> Result<Self> {
        track_assert_eq!(flags & !FLAGS_ALL, 0, ErrorKind::StorageCorrupted);
        Ok(EntryFlags(flags))
    }

    pub(crate) fn write() -> Self {
        EntryFlags(FLAG_VALID | FLAG_HAS_DATA)
    }

    pub(crate) fn sequenced_write() -> Self {
        EntryFlags(FLAG_VALID | FLAG_HAS_DATA | FLAG_SEQUENCED)
    }

    pub(crate) fn sync_point_record() -> Self {
        EntryFlags(FLAG_VALID | FLAG_SYNC_POINT)
    }
}

/// ログエントリの永続化形式.
///
/// スロット配列の各スロットに格納される固定長レコード.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntryRecord {
    /// リング内でのスロットインデックス.
    pub entry_index: u32,

    /// このエントリが属する同期点の世代番号.
    pub sync_gen_number: u64,

    /// 書き込みのシーケンス番号.
    ///
    /// persist-on-flushグループに属する書き込みでは`0`となる.
    pub write_sequence_number: u64,

    /// 書き込み先のイメージ内バイトオフセット.
    pub image_offset_bytes: u64,

    /// 書き込みデータの長さ(バイト単位).
    pub write_bytes: u32,

    /// フラグ集合.
    pub flags: EntryFlags,

    /// データバッファのプール内オフセット.
    ///
    /// `flags.has_data()`が偽の場合は`0`.
    pub buffer_offset: u64,
}
impl LogEntryRecord {
    /// レコードが書き込みエントリかどうかを判定する.
    pub fn is_write(&self) -> bool {
        self.flags.valid() && !self.flags.sync_point()
    }

    /// レコードが同期点エントリかどうかを判定する.
    pub fn is_sync_point(&self) -> bool {
        self.flags.valid() && self.flags.sync_point()
    }

    /// 書き込み対象のイメージ範囲を返す.
    pub fn extent(&self) -> ImageExtent {
        ImageExtent::new(self.image_offset_bytes, u64::from(self.write_bytes))
    }

    /// `writer`にレコードを書き込む.
    ///
    /// 書き込まれるバイト数は常に`LOG_ENTRY_RECORD_SIZE`となる.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        track_io!(writer.write_u32::<BigEndian>(self.entry_index))?;
        track_io!(writer.write_u64::<BigEndian>(self.sync_gen_number))?;
        track_io!(writer.write_u64::<BigEndian>(self.write_sequence_number))?;
        track_io!(writer.write_u64::<BigEndian>(self.image_offset_bytes))?;
        track_io!(writer.write_u32::<BigEndian>(self.write_bytes))?;
        track_io!(writer.write_u8(self.flags.as_u8()))?;
        track_io!(writer.write_u64::<BigEndian>(self.buffer_offset))?;

        let padding = [0; (LOG_ENTRY_RECORD_SIZE - FIELDS_SIZE) as usize];
        track_io!(writer.write_all(&padding))?;
        Ok(())
    }

    /// `reader`からレコードを読み込む.
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let entry_index = track_io!(reader.read_u32::<BigEndian>())?;
        let sync_gen_number = track_io!(reader.read_u64::<BigEndian>())?;
        let write_sequence_number = track_io!(reader.read_u64::<BigEndian>())?;
        let image_offset_bytes = track_io!(reader.read_u64::<BigEndian>())?;
        let write_bytes = track_io!(reader.read_u32::<BigEndian>())?;
        let flags = track!(EntryFlags::from_u8(track_io!(reader.read_u8())?))?;
        let buffer_offset = track_io!(reader.read_u64::<BigEndian>())?;

        let mut padding = [0; (LOG_ENTRY_RECORD_SIZE - FIELDS_SIZE) as usize];
        track_io!(reader.read_exact(&mut padding))?;
        Ok(LogEntryRecord {
            entry_index,
            sync_gen_number,
            write_sequence_number,
            image_offset_bytes,
            write_bytes,
            flags,
            buffer_offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;

    use super::*;

    #[test]
    fn read_write_works() -> TestResult {
        let records = vec![
            LogEntryRecord {
                entry_index: 0,
                sync_gen_number: 1,
                write_sequence_number: 0,
                image_offset_bytes: 4096,
                write_bytes: 512,
                flags: EntryFlags::write(),
                buffer_offset: 65536,
            },
            LogEntryRecord {
                entry_index: 7,
                sync_gen_number: 3,
                write_sequence_number: 42,
                image_offset_bytes: 0,
                write_bytes: 8192,
                flags: EntryFlags::sequenced_write(),
                buffer_offset: 131072,
            },
            LogEntryRecord {
                entry_index: 8,
                sync_gen_number: 3,
                write_sequence_number: 0,
                image_offset_bytes: 0,
                write_bytes: 0,
                flags: EntryFlags::sync_point_record(),
                buffer_offset: 0,
            },
        ];
        for r0 in records {
            let mut buf = Vec::new();
            track!(r0.write_to(&mut buf))?;
            assert_eq!(buf.len() as u64, LOG_ENTRY_RECORD_SIZE);

            let r1 = track!(LogEntryRecord::read_from(&buf[..]))?;
            assert_eq!(r1, r0);
        }
        Ok(())
    }

    #[test]
    fn unknown_flags_are_rejected() {
        let record = LogEntryRecord {
            entry_index: 0,
            sync_gen_number: 1,
            write_sequence_number: 0,
            image_offset_bytes: 0,
            write_bytes: 0,
            flags: EntryFlags::write(),
            buffer_offset: 0,
        };
        let mut buf = Vec::new();
        record.write_to(&mut buf).unwrap();
        buf[32] |= 0b1000_0000; // 未知のフラグビット

        assert!(LogEntryRecord::read_from(&buf[..]).is_err());
    }

    #[test]
    fn kind_predicates_work() {
        let write = LogEntryRecord {
            entry_index: 0,
            sync_gen_number: 1,
            write_sequence_number: 0,
            image_offset_bytes: 0,
            write_bytes: 512,
            flags: EntryFlags::write(),
            buffer_offset: 0,
        };
        assert!(write.is_write());
        assert!(!write.is_sync_point());

        let sync_point = LogEntryRecord {
            flags: EntryFlags::sync_point_record(),
            ..write
        };
        assert!(!sync_point.is_write());
        assert!(sync_point.is_sync_point());
    }
}
