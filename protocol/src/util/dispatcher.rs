//! Parallel topological execution over a [`Dag`].
//!
//! Zero-indegree nodes go into a bounded ready queue in index order. `C`
//! workers pop from it and run the callback on the blocking pool; when a
//! callback returns `Ok`, the in-degree of each child drops by one and the
//! children that reach zero are queued (again in index order). The first
//! callback error is stored, everybody is told to stop, and that error is
//! what `run` returns.
//!
//! Stopping is cooperative: [`Dispatcher::stop`] puts `C` tokens on a quit
//! channel and each worker exits on the first token it sees. A callback
//! already running is allowed to finish.

use std::hash::Hash as StdHash;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::dag::Dag;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError<E> {
    #[error("dependency graph is cyclic")]
    Cyclic,
    #[error("dispatcher already started")]
    AlreadyStarted,
    #[error("dispatch cancelled before every node ran")]
    Cancelled,
    #[error("dispatch timed out")]
    Timeout,
    #[error("dispatch worker failed: {0}")]
    Worker(String),
    #[error("callback failed: {0}")]
    Callback(E),
}

struct QuitChannel {
    tx: mpsc::Sender<()>,
    rx: AsyncMutex<mpsc::Receiver<()>>,
    tokens: usize,
    stopped: AtomicBool,
}

impl QuitChannel {
    fn new(tokens: usize) -> Self {
        let (tx, rx) = mpsc::channel(tokens);
        Self {
            tx,
            rx: AsyncMutex::new(rx),
            tokens,
            stopped: AtomicBool::new(false),
        }
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for _ in 0..self.tokens {
            // Capacity equals the token count, so this only fails once the
            // receiver is gone, and then nobody is listening anyway.
            let _ = self.tx.try_send(());
        }
    }
}

/// Per-run bookkeeping shared by the workers.
struct RunState<E> {
    remaining_parents: Mutex<Vec<usize>>,
    finished: AtomicUsize,
    error: Mutex<Option<DispatchError<E>>>,
    ready_tx: mpsc::Sender<usize>,
    ready_rx: AsyncMutex<mpsc::Receiver<usize>>,
}

pub struct Dispatcher<K: Clone + Eq + StdHash> {
    dag: Arc<Dag<K>>,
    concurrency: usize,
    timeout: Option<Duration>,
    quit: Arc<QuitChannel>,
    started: AtomicBool,
}

impl<K> Dispatcher<K>
where
    K: Clone + Eq + StdHash + Send + Sync + 'static,
{
    pub fn new(dag: Arc<Dag<K>>, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            dag,
            concurrency,
            timeout: None,
            quit: Arc::new(QuitChannel::new(concurrency)),
            started: AtomicBool::new(false),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Ask every worker to exit at its next observation point.
    pub fn stop(&self) {
        self.quit.stop();
    }

    /// Run `callback(index, key)` once per node, respecting every edge.
    pub async fn run<E, F>(&self, callback: F) -> Result<(), DispatchError<E>>
    where
        E: Send + 'static,
        F: Fn(usize, &K) -> Result<(), E> + Send + Sync + 'static,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DispatchError::AlreadyStarted);
        }
        let total = self.dag.len();
        if total == 0 {
            return Ok(());
        }
        if self.dag.is_cyclic() {
            return Err(DispatchError::Cyclic);
        }

        // Every node enters the ready queue exactly once.
        let (ready_tx, ready_rx) = mpsc::channel(total);
        let state = Arc::new(RunState {
            remaining_parents: Mutex::new(self.dag.nodes().iter().map(|n| n.parent_count).collect()),
            finished: AtomicUsize::new(0),
            error: Mutex::new(None),
            ready_tx,
            ready_rx: AsyncMutex::new(ready_rx),
        });
        for root in self.dag.roots() {
            let _ = state.ready_tx.try_send(root.index);
        }

        let callback = Arc::new(callback);
        let mut workers = JoinSet::new();
        for worker_id in 0..self.concurrency {
            workers.spawn(worker(
                worker_id,
                self.dag.clone(),
                state.clone(),
                self.quit.clone(),
                callback.clone(),
            ));
        }

        let join_all = async {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "dispatch worker aborted");
                    state
                        .error
                        .lock()
                        .get_or_insert(DispatchError::Worker(e.to_string()));
                    self.quit.stop();
                }
            }
        };

        match self.timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, join_all).await.is_err() {
                    self.quit.stop();
                    return Err(DispatchError::Timeout);
                }
            }
            None => join_all.await,
        }

        if let Some(err) = state.error.lock().take() {
            return Err(err);
        }
        if state.finished.load(Ordering::SeqCst) < total {
            return Err(DispatchError::Cancelled);
        }
        Ok(())
    }
}

async fn worker<K, E, F>(
    worker_id: usize,
    dag: Arc<Dag<K>>,
    state: Arc<RunState<E>>,
    quit: Arc<QuitChannel>,
    callback: Arc<F>,
) where
    K: Clone + Eq + StdHash + Send + Sync + 'static,
    E: Send + 'static,
    F: Fn(usize, &K) -> Result<(), E> + Send + Sync + 'static,
{
    let total = dag.len();
    loop {
        let next = tokio::select! {
            biased;
            _ = async { quit.rx.lock().await.recv().await } => None,
            idx = async { state.ready_rx.lock().await.recv().await } => idx,
        };
        let Some(idx) = next else {
            debug!(worker_id, "dispatch worker exiting");
            return;
        };

        let key = dag.nodes()[idx].key.clone();
        let cb = callback.clone();
        match tokio::task::spawn_blocking(move || cb(idx, &key)).await {
            Ok(Ok(())) => {
                let mut newly_ready = Vec::new();
                {
                    let mut remaining = state.remaining_parents.lock();
                    for &child in &dag.nodes()[idx].children {
                        remaining[child] -= 1;
                        if remaining[child] == 0 {
                            newly_ready.push(child);
                        }
                    }
                }
                newly_ready.sort_unstable();
                for child in newly_ready {
                    let _ = state.ready_tx.try_send(child);
                }
                if state.finished.fetch_add(1, Ordering::SeqCst) + 1 == total {
                    quit.stop();
                }
            }
            Ok(Err(e)) => {
                state.error.lock().get_or_insert(DispatchError::Callback(e));
                quit.stop();
                return;
            }
            Err(join_err) => {
                state
                    .error
                    .lock()
                    .get_or_insert(DispatchError::Worker(join_err.to_string()));
                quit.stop();
                return;
            }
        }
    }
}
