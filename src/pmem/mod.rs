//! 永続メモリのインターフェース定義と実装群.
//!
//! このモジュールは[LogPool](../log/struct.LogPool.html)がログの読み書きに使用する
//! バイトアドレッサブルな永続化領域を提供する.
pub use self::file::FilePmem;
pub use self::memory::MemoryPmem;

use crate::block::BlockSize;
use crate::Result;

mod file;
mod memory;

/// バイトアドレッサブルな永続メモリを表すトレイト.
///
/// "永続メモリ"は「任意位置の読み書きが可能な永続化可能バイト列」を意味し、
/// ログプールの格納先として使用される.
///
/// 実装はクローン可能なハンドルであり、クローン同士は同一の領域を共有する.
/// これにより、追記・ライトバック・リタイアといった並行する処理系が
/// 同じプールに安全にアクセスできる.
///
/// # 永続化の規約
///
/// `write_at`による書き込みは、`flush_range`と`drain`が完了するまで
/// 永続化されている保証はない. 永続化が必要な書き込みは、
/// 対象範囲の`flush_range`の後に`drain`を呼び出すこと.
pub trait PersistentMemory: Clone + Send + Sync + 'static {
    /// メモリの容量(バイト単位)を返す.
    fn capacity(&self) -> u64;

    /// このインスタンスのブロックサイズを返す.
    ///
    /// データバッファの割当はこの境界に揃えて行われる.
    fn block_size(&self) -> BlockSize;

    /// 指定位置から`buf`の長さ分のバイト列を読み込む.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// 指定位置に`buf`の内容を書き込む.
    ///
    /// 書き込みの永続化保証については、トレイトのドキュメントを参照のこと.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// 指定範囲の書き込み内容を永続化対象としてフラッシュする.
    fn flush_range(&self, offset: u64, length: u64) -> Result<()>;

    /// これまでにフラッシュされた内容の永続化完了を待機する.
    fn drain(&self) -> Result<()>;
}
