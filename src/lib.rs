//! Replicated Write Log.
//!
//! `rwlog`は、ブロックデバイスクライアントと低速な永続ストア(イメージライトバック)の間に挟まる、
//! ライトバック型のブロックキャッシュ.
//!
//! # 特徴
//!
//! - 書き込みは、バイトアドレッサブルな永続メモリ(PMEM)上のログに追記された時点で完了応答される
//!   - ログはフォールトドメイン間で複製されることを想定しているが、複製層自体は本crateの管轄外
//! - ログに溜まった書き込みは、クライアントに通知した順序と矛盾しない順序で、
//!   バックグラウンドで下位ストアに排出(ライトバック)される
//! - 書き込み列は**同期点**(sync point)で区切られたグループに分割される:
//!   - グループ内の書き込み同士は自由に並び替え可能
//!   - グループ境界を跨ぐ並び替えは行われない
//!   - `flush`は、対象世代以下の全書き込みが永続化された時点で完了する
//! - 範囲が重複する操作は[ブロック範囲ガード]によって発行順に直列化される
//! - ログ領域は固定長スロットのリング + 可変長データバッファとして管理され、
//!   ライトバック済みの古いエントリから順に回収(リタイア)される
//! - 圧縮・重複排除・暗号化・スナップショットは行わない
//!
//! # モジュールの依存関係
//!
//! ```text
//! cache => log => pmem
//! ```
//!
//! - [cache]モジュール:
//!   - 主に[ReplicatedWriteLog]構造体を提供
//!   - `rwlog`の利用者が直接触るのはこの構造体
//!   - リクエストの状態遷移、追記パイプライン、ライトバック、リタイア、を担当する
//! - [log]モジュール:
//!   - 主に[LogPool]構造体を提供
//!   - [pmem]を永続化層として利用し、その上にログプールのレイアウトを実装している
//! - [pmem]モジュール:
//!   - 主に[PersistentMemory]トレイトとその実装である[FilePmem]を提供
//!   - [log]に対して永続化層を提供するのが目的
//!
//! [ブロック範囲ガード]: ./guard/index.html
//! [cache]: ./cache/index.html
//! [ReplicatedWriteLog]: ./cache/struct.ReplicatedWriteLog.html
//! [log]: ./log/index.html
//! [LogPool]: ./log/struct.LogPool.html
//! [pmem]: ./pmem/index.html
//! [PersistentMemory]: ./pmem/trait.PersistentMemory.html
//! [FilePmem]: ./pmem/struct.FilePmem.html
#![warn(missing_docs)]
extern crate adler32;
extern crate byteorder;
extern crate futures;
extern crate prometrics;
#[cfg(test)]
extern crate tempdir;
#[macro_use]
extern crate trackable;
extern crate uuid;
#[macro_use]
extern crate slog;

pub use crate::error::{Error, ErrorKind};

macro_rules! track_io {
    ($expr:expr) => {
        $expr.map_err(|e: ::std::io::Error| track!(crate::Error::from(e)))
    };
}

pub mod block;
pub mod cache;
pub mod completion;
pub mod guard;
pub mod log;
pub mod map;
pub mod metrics;
pub mod pmem;
pub mod sync_point;

mod error;

/// crate固有の`Result`型.
pub type Result<T> = std::result::Result<T, Error>;
