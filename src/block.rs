//! ブロック(書き込み割当の最小単位)およびイメージ範囲関連の構成要素.
use crate::{ErrorKind, Result};

/// ログプールのブロックサイズを表現するための構造体.
///
/// "ブロック"は書き込みデータバッファの割当単位であり、プールルートには
/// 32bit幅のフィールドとして記録される. データ領域内の各バッファの
/// 割当サイズと、スロット配列直後のデータ領域開始位置は、
/// この境界へ切り上げられる.
///
/// 現在のプールレイアウトは、割当単位の下限
/// ([`MIN_WRITE_ALLOC_SIZE`](../log/constant.MIN_WRITE_ALLOC_SIZE.html))と
/// 異なるブロックサイズを受け付けない. 型としては下限の倍数を表現できるが、
/// これは将来のレイアウト改訂のための余地である.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockSize(u32);
impl BlockSize {
    /// 書き込み割当単位の下限.
    ///
    /// 全てのブロックサイズは、この値の倍数である必要がある.
    pub const MIN: u32 = 512;

    /// 割当単位の下限をそのままブロックサイズとして返す.
    ///
    /// 現在のプールレイアウトが受け付けるのはこの値のみ.
    pub fn min() -> Self {
        BlockSize(Self::MIN)
    }

    /// 指定された値のブロックサイズを表現する`BlockSize`インスタンスを生成する.
    ///
    /// # Errors
    ///
    /// `block_size`が`BlockSize::MIN`の倍数(かつ`MIN`以上)でない場合には、
    /// 種類が`ErrorKind::InvalidInput`のエラーが返される.
    pub fn new(block_size: u32) -> Result<Self> {
        track_assert!(
            block_size >= Self::MIN && block_size % Self::MIN == 0,
            ErrorKind::InvalidInput,
            "block_size={}",
            block_size
        );
        Ok(BlockSize(block_size))
    }

    /// 指定位置を直後のブロック境界へ切り上げる.
    ///
    /// # Examples
    ///
    /// スロット配列の終端からデータ領域の開始位置を求める場合:
    ///
    /// ```
    /// use rwlog::block::BlockSize;
    ///
    /// let block_size = BlockSize::min();
    /// let slot_array_end: u64 = 512 + 1239 * 64;
    /// assert_eq!(block_size.ceil_align(slot_array_end), 79872);
    /// assert_eq!(block_size.ceil_align(79872), 79872);
    /// ```
    pub fn ceil_align(self, position: u64) -> u64 {
        match position % u64::from(self.0) {
            0 => position,
            remainder => position + (u64::from(self.0) - remainder),
        }
    }

    /// 指定位置を直前のブロック境界へ切り下げる.
    pub fn floor_align(self, position: u64) -> u64 {
        position - position % u64::from(self.0)
    }

    /// 指定位置がブロック境界に沿っているかどうかを判定する.
    pub fn is_aligned(self, position: u64) -> bool {
        self.floor_align(position) == position
    }

    /// ブロックサイズ値を`u32`に変換して返す.
    ///
    /// プールルートのフィールド幅に合わせた表現となっている.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// イメージ(仮想ブロックデバイス)内の半開バイト範囲 `[offset, offset + length)`.
///
/// キャッシュに対する読み書きの対象範囲は、全てこの構造体で表現される.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageExtent {
    /// イメージ先頭からのバイトオフセット.
    pub offset: u64,

    /// 範囲の長さ(バイト単位).
    pub length: u64,
}
impl ImageExtent {
    /// 新しい`ImageExtent`インスタンスを生成する.
    pub fn new(offset: u64, length: u64) -> Self {
        ImageExtent { offset, length }
    }

    /// 範囲の終端位置(排他的)を返す.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// 範囲が空かどうかを判定する.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// 二つの範囲が重複しているかどうかを判定する.
    pub fn overlaps(&self, other: &ImageExtent) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// 二つの範囲の共通部分を返す.
    ///
    /// 重複が無い場合には`None`が返される.
    pub fn intersection(&self, other: &ImageExtent) -> Option<ImageExtent> {
        if !self.overlaps(other) {
            return None;
        }
        let offset = std::cmp::max(self.offset, other.offset);
        let end = std::cmp::min(self.end(), other.end());
        Some(ImageExtent::new(offset, end - offset))
    }
}
