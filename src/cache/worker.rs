//! キャッシュの実行スレッド群.
use slog::Logger;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

enum Job {
    Run(Box<dyn FnOnce() + Send + 'static>),
    Stop,
}

/// ワーカへジョブを発行するためのハンドル.
pub(crate) struct JobSender {
    tx: Mutex<Sender<Job>>,
}
impl JobSender {
    /// ジョブを一つ発行する.
    ///
    /// ワーカプールが既に停止している場合、ジョブは黙って捨てられる.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let tx = self.tx.lock().expect("Never fails");
        let _ = tx.send(Job::Run(Box::new(job)));
    }
}
impl std::fmt::Debug for JobSender {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("JobSender").finish()
    }
}

/// 有限個のスレッドでジョブ群を実行するワーカプール.
///
/// ジョブは発行順にデキューされるが、複数スレッドで並行に実行されるため、
/// 実行順序自体は保証されない. 順序が必要な処理は、各サブシステムの
/// ロックとキューによって直列化される.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    handles: Vec<thread::JoinHandle<()>>,
    tx: Sender<Job>,
}
impl WorkerPool {
    /// `count`個のワーカスレッドを起動する.
    pub fn spawn(count: usize, logger: &Logger) -> (WorkerPool, JobSender) {
        let (tx, rx) = mpsc::channel();
        let rx: Arc<Mutex<Receiver<Job>>> = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let rx = Arc::clone(&rx);
            let logger = logger.new(o!("worker" => i));
            handles.push(thread::spawn(move || loop {
                let job = {
                    let rx = rx.lock().expect("Never fails");
                    rx.recv()
                };
                match job {
                    Ok(Job::Run(job)) => job(),
                    Ok(Job::Stop) | Err(_) => {
                        debug!(logger, "Worker thread stopped");
                        break;
                    }
                }
            }));
        }
        let sender = JobSender {
            tx: Mutex::new(tx.clone()),
        };
        (WorkerPool { handles, tx }, sender)
    }

    /// 全ワーカスレッドを停止して回収する.
    pub fn stop(self) {
        for _ in &self.handles {
            let _ = self.tx.send(Job::Stop);
        }
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

/// 周期的な統計出力と補助処理を駆動するタイマスレッド.
#[derive(Debug)]
pub(crate) struct Timer {
    handle: Option<thread::JoinHandle<()>>,
    tx: Sender<()>,
}
impl Timer {
    /// `interval`毎に`tick`を呼び出すタイマスレッドを起動する.
    pub fn spawn<F>(interval: Duration, tick: F) -> Timer
    where
        F: Fn() + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || loop {
            match rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => tick(),
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });
        Timer {
            handle: Some(handle),
            tx,
        }
    }

    /// タイマスレッドを停止して回収する.
    pub fn stop(mut self) {
        let _ = self.tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
