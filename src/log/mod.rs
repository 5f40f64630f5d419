//! 永続ログプール.
//!
//! このモジュール自体は、ログのレイアウトと追記・リタイアのコミット手順の実装であり、
//! リクエストのスケジューリング等とは切り離されている.
//!
//! 利用の際には、使用する[PersistentMemory]実装を指定した上で、
//! [cache]モジュール経由で動作させる必要がある.
//!
//! # レイアウト
//!
//! ```text
//! [ ルートブロック ][ スロット配列: N x 64バイト固定レコード ][ データ領域 ]
//! ```
//!
//! - **ルートブロック**: レイアウトバージョンやリングの始端・終端インデックス等を保持する
//! - **スロット配列**: 固定長の[ログエントリレコード]のリング
//! - **データ領域**: 書き込みデータ用の可変長バッファ群. [BufferAllocator]が割当を管理する
//!
//! # リングの不変項
//!
//! - 有効なエントリはインデックス`[first_valid_entry, first_free_entry) mod N`を占める
//! - 一スロットは常に空である(i.e., `free == N - 1 - used`)
//! - `first_free_entry`は追記ロックの下でのみ、新規エントリを公開するコミットの後に前進する
//! - `first_valid_entry`はリタイアロックの下でのみ、リタイア対象のバッファを解放するコミットの後に前進する
//!
//! [PersistentMemory]: ../pmem/trait.PersistentMemory.html
//! [cache]: ../cache/index.html
//! [ログエントリレコード]: ./struct.LogEntryRecord.html
//! [BufferAllocator]: ./struct.BufferAllocator.html
pub use self::alloc::{BufferAllocator, Reservation};
pub use self::entry::WriteLogEntry;
pub use self::pool::LogPool;
pub use self::record::{EntryFlags, LogEntryRecord, LOG_ENTRY_RECORD_SIZE};
pub use self::recovery::{scan_pool, RecoveredLog};
pub use self::root::PoolRoot;

use crate::block::BlockSize;

mod alloc;
mod entry;
mod pool;
mod record;
mod recovery;
mod root;

/// プールの先頭に書き込まれるマジックナンバー.
///
/// "**R**eplicated **W**rite **L**og **P**ool"の略.
pub const MAGIC_NUMBER: [u8; 4] = *b"rwlp";

/// プールレイアウトの現在のバージョン.
///
/// バージョンが異なるプール同士のデータ形式には互換性が無い.
pub const RWL_POOL_VERSION: u32 = 1;

/// 書き込みデータバッファの割当単位(バイト単位).
///
/// プールのブロックサイズでもあり、これと異なるブロックサイズを持つプールは開けない.
pub const MIN_WRITE_ALLOC_SIZE: u32 = BlockSize::MIN;

/// 一割当あたりのメタデータオーバヘッドの見積もり(バイト単位).
///
/// データ領域の使用量を会計する際に、割当サイズへ加算される.
pub const BLOCK_ALLOC_OVERHEAD_BYTES: u64 = 16;

/// プールが保持可能なログエントリ数の上限.
pub const MAX_LOG_ENTRIES: u64 = 1 << 20;

/// プール容量のうち、実際にログ用に使用可能な割合.
///
/// 残りはメタデータや断片化のための余裕となる.
pub const USABLE_SIZE: f64 = 7.0 / 10.0;
