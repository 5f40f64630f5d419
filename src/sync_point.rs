//! 同期点グラフ.
//!
//! 書き込み列はバリアとしての**同期点**で区切られ、世代`g`を持つ書き込みは
//! 全て同期点`S_g`のグループに属する. `flush`は、対象世代以下の全書き込みが
//! 永続化された時点で完了する.
//!
//! 同期点同士は「まだ完全には永続化されていない」もの同士の連鎖を成す:
//!
//! - 後の同期点から前の同期点へのリンクは共有ハンドルであり、
//!   前の同期点が完全に永続化された時点で明示的に切られる
//! - 前から後へのリンクは非所有(weak)ハンドル
use std::sync::{Arc, Mutex, Weak};

use crate::completion::{Callback, DeferredCallbacks, Gather};
use crate::log::WriteLogEntry;
use crate::Result;

#[derive(Default)]
struct SyncPointInner {
    earlier: Option<Arc<SyncPoint>>,
    later: Weak<SyncPoint>,
    append_scheduled: bool,
    appending: bool,
    self_persisted: bool,
    final_op_sequence_num: u64,
    writes: u64,
    bytes: u64,
    writes_completed: u64,
    on_appending: Vec<Box<dyn FnOnce() + Send + 'static>>,
    on_self_persisted: Vec<Callback>,
}

/// 書き込みストリーム内の一つの同期点.
///
/// 世代番号`g`によって識別され、以下を保持する:
///
/// - 直前の同期点への共有リンク(完全永続化後にはnull)と、直後の同期点へのweakリンク
/// - 追記のスケジュール状態(`append_scheduled` / `appending`)
/// - 所属する書き込みのカウンタ群`(writes, bytes, writes_completed)`
/// - 二つの完了集約器:
///   - **prior_persisted**: 世代`g`以下の全ログエントリが永続化された時点で発火する
///   - **self_persisted**: この同期点自身のレコードが追記・永続化された時点で発火する.
///     サブ完了が常に一つ(自身のレコード追記)だけのため、カウンタ付きの[Gather]では
///     なくフラグと継続リスト(`on_self_persisted`)で表現している
pub struct SyncPoint {
    sync_gen: u64,
    prior_persisted: Gather,
    inner: Mutex<SyncPointInner>,
}
impl SyncPoint {
    /// 新しい同期点を生成する.
    ///
    /// `prior_finisher`は、prior_persisted集約器の活性化後、
    /// 全てのサブ完了が完了した時点で一度だけ呼び出される.
    pub fn new(sync_gen: u64, prior_finisher: Callback) -> Arc<Self> {
        Arc::new(SyncPoint {
            sync_gen,
            prior_persisted: Gather::new(prior_finisher),
            inner: Mutex::new(SyncPointInner::default()),
        })
    }

    /// この同期点の世代番号を返す.
    pub fn sync_gen(&self) -> u64 {
        self.sync_gen
    }

    /// prior_persisted集約器を返す.
    pub fn prior_persisted(&self) -> &Gather {
        &self.prior_persisted
    }

    /// `new`を`old`の直後に連結する.
    pub fn link_after(old: &Arc<SyncPoint>, new: &Arc<SyncPoint>) {
        debug_assert!(old.sync_gen < new.sync_gen);
        old.inner.lock().expect("Never fails").later = Arc::downgrade(new);
        new.inner.lock().expect("Never fails").earlier = Some(Arc::clone(old));
    }

    /// 直前の同期点を返す.
    ///
    /// 直前の同期点が完全に永続化されている場合には`None`が返される.
    pub fn earlier(&self) -> Option<Arc<SyncPoint>> {
        self.inner.lock().expect("Never fails").earlier.clone()
    }

    /// この同期点に属する書き込みを一つ数え上げる.
    pub fn account_write(&self, bytes: u64) {
        let mut inner = self.inner.lock().expect("Never fails");
        inner.writes += 1;
        inner.bytes += bytes;
    }

    /// この同期点に属する書き込みの完了を一つ数え上げる.
    pub fn account_write_completed(&self) {
        let mut inner = self.inner.lock().expect("Never fails");
        inner.writes_completed += 1;
    }

    /// `(writes, bytes, writes_completed)`カウンタの現在値を返す.
    pub fn write_counts(&self) -> (u64, u64, u64) {
        let inner = self.inner.lock().expect("Never fails");
        (inner.writes, inner.bytes, inner.writes_completed)
    }

    /// 直前の同期点が閉じられた時点での、最後の操作シーケンス番号を記録する.
    pub fn set_final_op_sequence_num(&self, sequence_num: u64) {
        self.inner.lock().expect("Never fails").final_op_sequence_num = sequence_num;
    }

    /// 記録済みの最後の操作シーケンス番号を返す.
    pub fn final_op_sequence_num(&self) -> u64 {
        self.inner.lock().expect("Never fails").final_op_sequence_num
    }

    /// この同期点のレコード追記が要求されたことを記録する.
    ///
    /// 既に要求済みだった場合には`false`が返される.
    pub fn mark_append_scheduled(&self) -> bool {
        let mut inner = self.inner.lock().expect("Never fails");
        if inner.append_scheduled {
            false
        } else {
            inner.append_scheduled = true;
            true
        }
    }

    /// レコード追記が要求済みかどうかを返す.
    pub fn is_append_scheduled(&self) -> bool {
        self.inner.lock().expect("Never fails").append_scheduled
    }

    /// この同期点のレコード追記が実際に発行されたことを記録する.
    ///
    /// `on_appending`に積まれていた継続群は`deferred`経由で発火される.
    /// 既に発行済みだった場合には`false`が返される.
    pub fn mark_appending(&self, deferred: &mut DeferredCallbacks) -> bool {
        let mut inner = self.inner.lock().expect("Never fails");
        if inner.appending {
            return false;
        }
        inner.appending = true;
        for callback in inner.on_appending.drain(..) {
            deferred.add(callback);
        }
        true
    }

    /// レコード追記が発行済みかどうかを返す.
    pub fn is_appending(&self) -> bool {
        self.inner.lock().expect("Never fails").appending
    }

    /// この同期点が追記発行状態(`appending`)に入った時点で発火する継続を登録する.
    ///
    /// 既に追記発行済みの場合には、`deferred`経由で即座に発火される.
    pub fn on_appending<F>(&self, deferred: &mut DeferredCallbacks, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.inner.lock().expect("Never fails");
        if inner.appending {
            deferred.add(callback);
        } else {
            inner.on_appending.push(Box::new(callback));
        }
    }

    /// self_persisted(この同期点自身のレコードの永続化)を待つ継続を登録する.
    ///
    /// 既に発火済みの場合には、`deferred`経由で即座に発火される.
    pub fn on_self_persisted(&self, deferred: &mut DeferredCallbacks, callback: Callback) {
        let mut inner = self.inner.lock().expect("Never fails");
        if inner.self_persisted {
            deferred.add(move || callback(Ok(())));
        } else {
            inner.on_self_persisted.push(callback);
        }
    }

    /// self_persistedの唯一のサブ完了(自身のレコード追記)を完了させる.
    ///
    /// `on_self_persisted`に積まれていた継続群が`deferred`経由で発火され、
    /// 直後の同期点が保持する「直前へのリンク」が切られる.
    pub fn complete_self_persisted(&self, result: &Result<()>, deferred: &mut DeferredCallbacks) {
        let later = {
            let mut inner = self.inner.lock().expect("Never fails");
            debug_assert!(!inner.self_persisted);
            inner.self_persisted = true;
            inner.earlier = None;
            for callback in inner.on_self_persisted.drain(..) {
                let result = result.clone();
                deferred.add(move || callback(result));
            }
            inner.later.clone()
        };
        if let Some(later) = later.upgrade() {
            later.inner.lock().expect("Never fails").earlier = None;
        }
    }

    /// self_persistedが発火済みかどうかを返す.
    pub fn is_self_persisted(&self) -> bool {
        self.inner.lock().expect("Never fails").self_persisted
    }

    /// この同期点に対応するログエントリを生成する.
    pub fn to_log_entry(&self) -> WriteLogEntry {
        WriteLogEntry::new_sync_point(self.sync_gen)
    }
}
impl std::fmt::Debug for SyncPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let inner = self.inner.lock().expect("Never fails");
        f.debug_struct("SyncPoint")
            .field("sync_gen", &self.sync_gen)
            .field("append_scheduled", &inner.append_scheduled)
            .field("appending", &inner.appending)
            .field("self_persisted", &inner.self_persisted)
            .field("writes", &inner.writes)
            .field("bytes", &inner.bytes)
            .field("writes_completed", &inner.writes_completed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::completion::DeferredCallbacks;

    #[test]
    fn chain_link_is_cut_on_persist() {
        let s1 = SyncPoint::new(1, Box::new(|_| {}));
        let s2 = SyncPoint::new(2, Box::new(|_| {}));
        SyncPoint::link_after(&s1, &s2);
        assert!(s2.earlier().map(|e| e.sync_gen()) == Some(1));

        let mut deferred = DeferredCallbacks::new();
        s1.complete_self_persisted(&Ok(()), &mut deferred);
        std::mem::drop(deferred);

        assert!(s1.is_self_persisted());
        assert!(s2.earlier().is_none());
    }

    #[test]
    fn on_appending_fires_once_appending_starts() {
        let s1 = SyncPoint::new(1, Box::new(|_| {}));
        let fired = Arc::new(AtomicUsize::new(0));

        let mut deferred = DeferredCallbacks::new();
        let fired_ = Arc::clone(&fired);
        s1.on_appending(&mut deferred, move || {
            fired_.fetch_add(1, Ordering::SeqCst);
        });
        std::mem::drop(deferred);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let mut deferred = DeferredCallbacks::new();
        assert!(s1.mark_appending(&mut deferred));
        std::mem::drop(deferred);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // 追記発行後の登録は即座に発火する
        let mut deferred = DeferredCallbacks::new();
        let fired_ = Arc::clone(&fired);
        s1.on_appending(&mut deferred, move || {
            fired_.fetch_add(1, Ordering::SeqCst);
        });
        std::mem::drop(deferred);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn self_persisted_fires_with_result() {
        let s1 = SyncPoint::new(1, Box::new(|_| {}));
        let fired = Arc::new(AtomicUsize::new(0));

        let mut deferred = DeferredCallbacks::new();
        let fired_ = Arc::clone(&fired);
        s1.on_self_persisted(
            &mut deferred,
            Box::new(move |result| {
                assert!(result.is_ok());
                fired_.fetch_add(1, Ordering::SeqCst);
            }),
        );
        std::mem::drop(deferred);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let mut deferred = DeferredCallbacks::new();
        s1.complete_self_persisted(&Ok(()), &mut deferred);
        std::mem::drop(deferred);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn write_accounting_works() {
        let s1 = SyncPoint::new(1, Box::new(|_| {}));
        s1.account_write(4096);
        s1.account_write(512);
        s1.account_write_completed();
        assert_eq!(s1.write_counts(), (2, 4608, 1));
    }
}
