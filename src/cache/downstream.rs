//! 下位ストア(イメージライトバック)のインターフェース定義.
use crate::block::ImageExtent;
use crate::completion::Callback;
use crate::Result;

/// データ付き完了通知用のコールバック.
pub type DataCallback = Box<dyn FnOnce(Result<Vec<u8>>) + Send + 'static>;

/// compare-and-write用のコールバック.
///
/// 比較が成功して書き込みが行われた場合には`Ok(None)`が、
/// 比較が失敗した場合には最初の不一致位置を持つ`Ok(Some(offset))`が渡される.
pub type CompareCallback = Box<dyn FnOnce(Result<Option<u64>>) + Send + 'static>;

/// キャッシュの下位に位置するイメージライトバック層を表すトレイト.
///
/// キャッシュはこのインターフェースを通じてのみ下位ストアへアクセスする.
/// 全ての操作は非同期であり、完了はコールバック経由で通知される
/// (コールバックは任意のスレッドから呼び出されうる).
pub trait ImageWriteback: Send + Sync + 'static {
    /// 指定された範囲群を読み込む.
    ///
    /// 成功時には、各範囲のデータを引数の順に連結したバイト列が渡される.
    fn read(&self, extents: Vec<ImageExtent>, on_complete: DataCallback);

    /// 指定された範囲群へ書き込む.
    ///
    /// `data`は各範囲のデータを引数の順に連結したバイト列である.
    fn write(&self, extents: Vec<ImageExtent>, data: Vec<u8>, on_complete: Callback);

    /// これまでの書き込みを永続化する.
    fn flush(&self, on_complete: Callback);

    /// 指定された範囲を解放する.
    fn discard(&self, offset: u64, length: u64, skip_partial_discard: bool, on_complete: Callback);

    /// 指定された範囲を`pattern`の繰り返しで埋める.
    fn writesame(&self, offset: u64, length: u64, pattern: Vec<u8>, on_complete: Callback);

    /// 比較して一致した場合のみ書き込む.
    fn compare_and_write(
        &self,
        extents: Vec<ImageExtent>,
        compare: Vec<u8>,
        data: Vec<u8>,
        on_complete: CompareCallback,
    );

    /// キャッシュされている内容を無効化する.
    fn invalidate(&self, on_complete: Callback);

    /// 下位ストアを初期化する.
    fn init(&self, on_complete: Callback);

    /// 下位ストアを停止する.
    fn shut_down(&self, on_complete: Callback);
}
