//! 完了通知用のプリミティブ群.
//!
//! キャッシュの各操作は非同期に完了するため、その通知には以下の三種類の部品が使われる:
//!
//! - [AsyncResult]: 利用者に返される`Future`(内部的にはoneshotチャンネル)
//! - [Gather]: 複数のサブ完了を束ねるファンイン集約器
//! - [DeferredCallbacks]: ロック解放後に継続処理を発火させるためのスコープ付きコンテナ
//!
//! [AsyncResult]: ./struct.AsyncResult.html
//! [Gather]: ./struct.Gather.html
//! [DeferredCallbacks]: ./struct.DeferredCallbacks.html
use futures::channel::oneshot;
use futures::{Future, FutureExt};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use trackable::error::ErrorKindExt;

use crate::{ErrorKind, Result};

/// 操作完了時に発火されるコールバック.
pub type Callback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// キャッシュ操作の完了を受け取るための`Future`.
///
/// 各公開操作はこのFutureを返し、対になる[AsyncReply]がリクエストの
/// 状態機械を通じて持ち回られる. 応答が送信されるのは、
/// persist-on-writeモードでは`PERSISTED`到達時、persist-on-flushモードでは
/// `DISPATCHED`時点となる.
///
/// [AsyncReply]: ./struct.AsyncReply.html
#[derive(Debug)]
pub struct AsyncResult<T> {
    rx: oneshot::Receiver<Result<T>>,
}
impl<T> Future for AsyncResult<T> {
    type Output = Result<T>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match self.rx.poll_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(track!(result)),
            Poll::Ready(Err(oneshot::Canceled)) => {
                // 応答はリクエストが`COMPLETED`へ達するまで保持されるため、
                // 送信前に破棄されるのはキャッシュが停止した場合のみ
                let e = track!(ErrorKind::Terminated
                    .cause("the cache was shut down before the operation completed"));
                Poll::Ready(Err(e.into()))
            }
        }
    }
}

/// `AsyncResult`の送信側.
#[derive(Debug)]
pub struct AsyncReply<T> {
    tx: oneshot::Sender<Result<T>>,
}
impl<T> AsyncReply<T> {
    /// 結果を送信して、対になるFutureを完了させる.
    ///
    /// 利用者が結果を待たずにFutureを破棄していた場合、結果は単に捨てられる.
    pub fn send(self, result: Result<T>) {
        let _ = self.tx.send(result);
    }
}

/// `AsyncReply`と`AsyncResult`の組を生成する.
pub(crate) fn reply_pair<T>() -> (AsyncReply<T>, AsyncResult<T>) {
    let (tx, rx) = oneshot::channel();
    (AsyncReply { tx }, AsyncResult { rx })
}

struct GatherInner {
    outstanding: usize,
    activated: bool,
    fired: bool,
    result: Result<()>,
    finisher: Option<Callback>,
}
impl GatherInner {
    /// 発火条件が満たされていればfinisherを取り出す.
    fn take_finisher_if_ready(&mut self) -> Option<(Callback, Result<()>)> {
        if self.activated && self.outstanding == 0 && !self.fired {
            self.fired = true;
            let finisher = self.finisher.take().expect("Never fails");
            Some((finisher, self.result.clone()))
        } else {
            None
        }
    }
}

/// 複数のサブ完了を束ねるファンイン集約器.
///
/// ライフサイクルは三段階に分かれる:
///
/// 1. **生成**: サブ完了([GatherSub])をまだ追加できる
/// 2. **活性化**([Gather::activate]): 以後サブ完了は追加できず、
///    未完了のサブ完了数が0に達した時点でfinisherが発火する
/// 3. **完了**: finisher発火済み
///
/// いずれかのサブ完了がエラーで完了した場合、finisherには最初のエラーが渡される.
///
/// [GatherSub]: ./struct.GatherSub.html
/// [Gather::activate]: #method.activate
#[derive(Clone)]
pub struct Gather {
    inner: Arc<Mutex<GatherInner>>,
}
impl Gather {
    /// 新しい`Gather`インスタンスを生成する.
    ///
    /// `finisher`は、活性化後、全てのサブ完了が完了した時点で一度だけ呼び出される.
    pub fn new(finisher: Callback) -> Self {
        Gather {
            inner: Arc::new(Mutex::new(GatherInner {
                outstanding: 0,
                activated: false,
                fired: false,
                result: Ok(()),
                finisher: Some(finisher),
            })),
        }
    }

    /// サブ完了を一つ追加する.
    ///
    /// # パニック
    ///
    /// 活性化後に呼び出された場合にはパニックする.
    pub fn add_sub(&self) -> GatherSub {
        let mut inner = self.inner.lock().expect("Never fails");
        assert!(!inner.activated, "gather already activated");
        inner.outstanding += 1;
        GatherSub {
            inner: Arc::clone(&self.inner),
        }
    }

    /// 集約器を活性化する.
    ///
    /// 未完了のサブ完了が既に存在しない場合には、この呼び出しの中でfinisherが発火する.
    pub fn activate(&self) {
        let ready = {
            let mut inner = self.inner.lock().expect("Never fails");
            inner.activated = true;
            inner.take_finisher_if_ready()
        };
        if let Some((finisher, result)) = ready {
            finisher(result);
        }
    }

    /// 既に発火済みかどうかを返す.
    pub fn is_fired(&self) -> bool {
        self.inner.lock().expect("Never fails").fired
    }
}
impl std::fmt::Debug for Gather {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let inner = self.inner.lock().expect("Never fails");
        f.debug_struct("Gather")
            .field("outstanding", &inner.outstanding)
            .field("activated", &inner.activated)
            .field("fired", &inner.fired)
            .finish()
    }
}

/// [Gather]に属する単一のサブ完了.
///
/// 完了させるには[complete](#method.complete)を呼び出す.
/// 完了させずにドロップされたサブ完了は未完了のまま残り、
/// その集約器は発火しなくなる(キャッシュ停止時の後始末でのみ起こりうる).
///
/// [Gather]: ./struct.Gather.html
pub struct GatherSub {
    inner: Arc<Mutex<GatherInner>>,
}
impl GatherSub {
    /// このサブ完了を完了させる.
    pub fn complete(self, result: Result<()>) {
        let ready = {
            let mut inner = self.inner.lock().expect("Never fails");
            if let Err(e) = result {
                if inner.result.is_ok() {
                    inner.result = Err(e);
                }
            }
            inner.outstanding -= 1;
            inner.take_finisher_if_ready()
        };
        if let Some((finisher, result)) = ready {
            finisher(result);
        }
    }
}
impl std::fmt::Debug for GatherSub {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("GatherSub").finish()
    }
}

/// ロック解放後に継続処理を発火させるためのスコープ付きコンテナ.
///
/// ロックを保持したままコールバックを呼び出すとデッドロックや
/// ロック順序違反の危険があるため、そのような呼び出し箇所では
/// このコンテナに継続を積んでおき、ロックを手放した後の
/// ドロップ時点でまとめて発火させる.
#[derive(Default)]
pub struct DeferredCallbacks {
    callbacks: Vec<Box<dyn FnOnce() + Send + 'static>>,
}
impl DeferredCallbacks {
    /// 新しい`DeferredCallbacks`インスタンスを生成する.
    pub fn new() -> Self {
        DeferredCallbacks {
            callbacks: Vec::new(),
        }
    }

    /// 継続を一つ追加する.
    pub fn add<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.callbacks.push(Box::new(f));
    }

    /// 積まれている継続の数を返す.
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// 継続が一つも積まれていないかどうかを返す.
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}
impl Drop for DeferredCallbacks {
    fn drop(&mut self) {
        for callback in self.callbacks.drain(..) {
            callback();
        }
    }
}
impl std::fmt::Debug for DeferredCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("DeferredCallbacks")
            .field("len", &self.callbacks.len())
            .finish()
    }
}
