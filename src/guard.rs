//! ブロック範囲ガード.
//!
//! 範囲が重複する操作の発行順直列化と、`flush`のためのバリア順序付けを提供する.
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use crate::block::ImageExtent;
use crate::completion::DeferredCallbacks;

/// バリアが占有する範囲(イメージ全体).
fn barrier_extent() -> ImageExtent {
    ImageExtent::new(0, std::u64::MAX)
}

/// ガードを獲得した操作に渡されるセルハンドル.
///
/// 操作の完了時には、このセルを[BlockGuard::release]へ返却しなければならない.
///
/// [BlockGuard::release]: ./struct.BlockGuard.html#method.release
#[derive(Debug)]
pub struct GuardCell {
    id: u64,
    range: ImageExtent,
}
impl GuardCell {
    /// このセルが占有している範囲を返す.
    pub fn range(&self) -> ImageExtent {
        self.range
    }
}

/// ガードの獲得を待つリクエスト.
pub struct GuardedRequest {
    /// 占有したいイメージ範囲.
    ///
    /// バリアの場合、この値は無視されイメージ全体が占有される.
    pub range: ImageExtent,

    /// バリアかどうか.
    ///
    /// バリアは、先行する全ての操作の解放を待ち、
    /// かつ自身が解放されるまで後続の全ての操作を待たせる.
    pub barrier: bool,

    /// 獲得時に呼び出されるコールバック.
    ///
    /// 第二引数は、先行する操作との重複により待たされたかどうかを示す.
    pub on_grant: Box<dyn FnOnce(GuardCell, bool) + Send + 'static>,
}
impl std::fmt::Debug for GuardedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("GuardedRequest")
            .field("range", &self.range)
            .field("barrier", &self.barrier)
            .finish()
    }
}

#[derive(Debug)]
struct Waiter {
    range: ImageExtent,
    barrier: bool,
    request: Option<GuardedRequest>, // 獲得処理中のみ一時的にNoneとなる
}

#[derive(Debug, Default)]
struct GuardInner {
    next_cell_id: u64,
    // 獲得済みセル群. 範囲同士は重複しないため開始位置で引ける
    cells: BTreeMap<u64, (u64, ImageExtent)>, // 開始位置 => (セルID, 範囲)
    waiting: VecDeque<Waiter>,
    barrier_in_progress: bool,
    current_barrier_cell: Option<u64>,
}
impl GuardInner {
    fn overlaps_cell(&self, range: &ImageExtent) -> bool {
        self.cells
            .range(..range.end())
            .next_back()
            .map_or(false, |(_, (_, cell_range))| cell_range.end() > range.offset)
    }

    fn grant(&mut self, range: ImageExtent) -> GuardCell {
        let id = self.next_cell_id;
        self.next_cell_id += 1;
        self.cells.insert(range.offset, (id, range));
        GuardCell { id, range }
    }

    /// `waiting[index]`より前に、獲得を妨げる待機者が存在するかを判定する.
    fn blocked_by_earlier_waiter(&self, index: usize, range: &ImageExtent, barrier: bool) -> bool {
        self.waiting.iter().take(index).any(|earlier| {
            // バリアは全ての先行待機者を、先行するバリアは全ての後続を妨げる
            barrier || earlier.barrier || earlier.range.overlaps(range)
        })
    }

    fn can_grant(&self, index: usize, range: &ImageExtent, barrier: bool) -> bool {
        if barrier && (self.barrier_in_progress || !self.cells.is_empty()) {
            return false;
        }
        !self.overlaps_cell(range) && !self.blocked_by_earlier_waiter(index, range, barrier)
    }
}

/// 実行中の操作同士の重複直列化とバリア順序付けを行うガード.
///
/// リクエスト毎の状態遷移は以下の通り:
///
/// ```text
/// queued -> detained (実行中の操作と重複した場合) -> granted -> released
/// ```
///
/// 獲得したリクエストには[GuardCell]が渡され、そのセルの解放によって
/// 新たに獲得可能となったリクエスト群が順次発火される.
///
/// # バリアのプロトコル
///
/// バリアリクエストは、別のバリアが進行中であれば待機列に積まれる.
/// そうでなければバリア進行中フラグを立てて、イメージ全体を占有する
/// セルの獲得を試みる(i.e., 先行する全操作の解放を待つ).
/// 進行中のバリアのセルは記録され、そのセルが解放された時点で
/// フラグが下ろされ、待機列が次のバリアの手前まで排出される.
///
/// [GuardCell]: ./struct.GuardCell.html
#[derive(Debug, Default)]
pub struct BlockGuard {
    inner: Mutex<GuardInner>,
}
impl BlockGuard {
    /// 新しい`BlockGuard`インスタンスを生成する.
    pub fn new() -> Self {
        BlockGuard::default()
    }

    /// リクエストのガード獲得を試みる.
    ///
    /// 即座に獲得できた場合には、このメソッドの中で`on_grant`が呼び出される
    /// (その際の待機フラグは偽). 実行中の操作と重複した場合には待機列に積まれ、
    /// 妨げていた操作の解放時に`on_grant`が呼び出される(待機フラグは真).
    pub fn detain(&self, request: GuardedRequest) {
        let mut deferred = DeferredCallbacks::new();
        let mut inner = self.inner.lock().expect("Never fails");
        let range = if request.barrier {
            barrier_extent()
        } else {
            request.range
        };
        if inner.can_grant(inner.waiting.len(), &range, request.barrier) {
            let cell = inner.grant(range);
            if request.barrier {
                inner.barrier_in_progress = true;
                inner.current_barrier_cell = Some(cell.id);
            }
            let on_grant = request.on_grant;
            deferred.add(move || on_grant(cell, false));
        } else {
            inner.waiting.push_back(Waiter {
                range,
                barrier: request.barrier,
                request: Some(request),
            });
        }
        std::mem::drop(inner);
        // ロック解放後に`on_grant`を発火させる
        std::mem::drop(deferred);
    }

    /// 獲得済みのセルを解放して、新たに獲得可能となった待機リクエスト群を発火させる.
    pub fn release(&self, cell: GuardCell) {
        let mut deferred = DeferredCallbacks::new();
        let mut inner = self.inner.lock().expect("Never fails");

        let removed = inner.cells.remove(&cell.range.offset);
        debug_assert!(removed.map_or(false, |(id, _)| id == cell.id));
        if inner.current_barrier_cell == Some(cell.id) {
            inner.barrier_in_progress = false;
            inner.current_barrier_cell = None;
        }

        // 待機列を先頭から走査し、獲得可能になったものを順次取り出す
        let mut index = 0;
        while index < inner.waiting.len() {
            let (range, barrier) = {
                let waiter = &inner.waiting[index];
                (waiter.range, waiter.barrier)
            };
            if inner.can_grant(index, &range, barrier) {
                let mut waiter = inner.waiting.remove(index).expect("Never fails");
                let request = waiter.request.take().expect("Never fails");
                let granted_cell = inner.grant(range);
                if barrier {
                    inner.barrier_in_progress = true;
                    inner.current_barrier_cell = Some(granted_cell.id);
                }
                let on_grant = request.on_grant;
                deferred.add(move || on_grant(granted_cell, true));
            } else {
                index += 1;
            }
        }

        std::mem::drop(inner);
        std::mem::drop(deferred);
    }

    /// 現在獲得されているセルの数を返す.
    pub fn live_cells(&self) -> usize {
        self.inner.lock().expect("Never fails").cells.len()
    }

    /// 現在待機中のリクエストの数を返す.
    pub fn waiting_requests(&self) -> usize {
        self.inner.lock().expect("Never fails").waiting.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::block::ImageExtent;

    fn request(
        range: ImageExtent,
        barrier: bool,
        label: &'static str,
        log: &Arc<Mutex<Vec<(&'static str, bool)>>>,
        cells: &mpsc::Sender<(&'static str, GuardCell)>,
    ) -> GuardedRequest {
        let log = Arc::clone(log);
        let cells = cells.clone();
        GuardedRequest {
            range,
            barrier,
            on_grant: Box::new(move |cell, detained| {
                log.lock().unwrap().push((label, detained));
                cells.send((label, cell)).unwrap();
            }),
        }
    }

    #[test]
    fn non_overlapping_requests_are_granted_immediately() {
        let guard = Arc::new(BlockGuard::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();

        guard.detain(request(
            ImageExtent::new(0, 512),
            false,
            "a",
            &log,
            &tx,
        ));
        guard.detain(request(
            ImageExtent::new(512, 512),
            false,
            "b",
            &log,
            &tx,
        ));

        assert_eq!(
            log.lock().unwrap().clone(),
            vec![("a", false), ("b", false)]
        );
        assert_eq!(guard.live_cells(), 2);
        let _ = rx;
    }

    #[test]
    fn overlapping_requests_are_serialized_in_order() {
        let guard = Arc::new(BlockGuard::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();

        guard.detain(request(
            ImageExtent::new(0, 1024),
            false,
            "a",
            &log,
            &tx,
        ));
        guard.detain(request(
            ImageExtent::new(512, 1024),
            false,
            "b",
            &log,
            &tx,
        ));
        guard.detain(request(
            ImageExtent::new(1024, 512),
            false,
            "c",
            &log,
            &tx,
        ));

        // bはaと、cはbと重複するため、granted済みなのはaのみ
        assert_eq!(log.lock().unwrap().clone(), vec![("a", false)]);

        let (_, cell_a) = rx.recv().unwrap();
        guard.release(cell_a);
        assert_eq!(
            log.lock().unwrap().clone(),
            vec![("a", false), ("b", true)]
        );

        let (_, cell_b) = rx.recv().unwrap();
        guard.release(cell_b);
        assert_eq!(
            log.lock().unwrap().clone(),
            vec![("a", false), ("b", true), ("c", true)]
        );
    }

    #[test]
    fn barrier_waits_for_all_prior_operations() {
        let guard = Arc::new(BlockGuard::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();

        // 互いに重複しない5つの書き込み
        for (i, label) in ["w0", "w1", "w2", "w3", "w4"].iter().enumerate() {
            guard.detain(request(
                ImageExtent::new(i as u64 * 4096, 4096),
                false,
                label,
                &log,
                &tx,
            ));
        }
        assert_eq!(guard.live_cells(), 5);

        guard.detain(request(
            ImageExtent::new(0, 0),
            true,
            "barrier",
            &log,
            &tx,
        ));
        // バリアの後続は、バリアと重複しなくても待たされる
        guard.detain(request(
            ImageExtent::new(1 << 30, 512),
            false,
            "late",
            &log,
            &tx,
        ));

        assert_eq!(log.lock().unwrap().len(), 5);
        assert_eq!(guard.waiting_requests(), 2);

        // 5つ全てが解放されるまでバリアは待つ
        for _ in 0..5 {
            let (_, cell) = rx.recv().unwrap();
            guard.release(cell);
        }
        assert_eq!(log.lock().unwrap().last().cloned(), Some(("barrier", true)));
        assert_eq!(guard.waiting_requests(), 1); // "late"はまだ待機中

        let (label, barrier_cell) = rx.recv().unwrap();
        assert_eq!(label, "barrier");
        guard.release(barrier_cell);
        assert_eq!(log.lock().unwrap().last().cloned(), Some(("late", true)));
    }

    #[test]
    fn consecutive_barriers_are_sequenced() {
        let guard = Arc::new(BlockGuard::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();

        guard.detain(request(
            ImageExtent::new(0, 0),
            true,
            "b0",
            &log,
            &tx,
        ));
        guard.detain(request(
            ImageExtent::new(0, 0),
            true,
            "b1",
            &log,
            &tx,
        ));
        assert_eq!(log.lock().unwrap().clone(), vec![("b0", false)]);

        let (_, cell) = rx.recv().unwrap();
        guard.release(cell);
        assert_eq!(
            log.lock().unwrap().clone(),
            vec![("b0", false), ("b1", true)]
        );
    }
}
