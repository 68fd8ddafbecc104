// Worker pool - explicitly owned task runner for discovery background work
//
// Every long-lived task (multicast announcer, responders, accept loops,
// per-connection handlers) is spawned through a pool handle that the
// owning component passes around. Shutting the pool down stops all of them.

use futures_util::future;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: Arc<str>,
    permits: Arc<Semaphore>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl WorkerPool {
    /// A pool that runs at most `workers` tasks at once; extra tasks wait
    /// for a free slot.
    pub fn new(name: &str, workers: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            name: Arc::from(name),
            permits: Arc::new(Semaphore::new(workers.max(1))),
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Runs `task` on the pool. The task is dropped at its next suspension
    /// point once the pool shuts down.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn_bounded(None, task)
    }

    /// Like [`spawn`](Self::spawn), but drops `task` unrun if no worker
    /// frees up within `wait`. `None` waits indefinitely.
    pub fn spawn_bounded<F>(&self, wait: Option<Duration>, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let name = Arc::clone(&self.name);
        let stopped = self.shutdown.subscribe();
        tokio::spawn(async move {
            let run = async move {
                let acquire = permits.acquire_owned();
                let permit = match wait {
                    Some(wait) => match tokio::time::timeout(wait, acquire).await {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!("{} pool busy for {:?}, dropping task", name, wait);
                            return;
                        }
                    },
                    None => acquire.await,
                };
                let Ok(_permit) = permit else {
                    return;
                };
                task.await;
            };
            until_shutdown(stopped, run).await;
        })
    }

    /// Runs a long-lived loop (receive loop, accept loop) that must not hold
    /// a worker slot for its whole lifetime.
    pub fn spawn_daemon<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(until_shutdown(self.shutdown.subscribe(), task))
    }

    /// Runs `task` once after `delay`.
    pub fn spawn_after<F>(&self, delay: Duration, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // The delay holds no permit
        let permits = Arc::clone(&self.permits);
        self.spawn_daemon(async move {
            tokio::time::sleep(delay).await;
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            task.await;
        })
    }

    /// Runs the task produced by `make` immediately and then every
    /// `period`. Each run completes before the next one is scheduled.
    pub fn spawn_periodic<M, F>(&self, period: Duration, mut make: M) -> JoinHandle<()>
    where
        M: FnMut() -> F + Send + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        // Periodic tasks hold no permit between runs
        let name = Arc::clone(&self.name);
        self.spawn_daemon(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                trace!("{} periodic tick", name);
                make().await;
            }
        })
    }

    /// Stops every task spawned on this pool or any of its clones.
    pub fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            debug!("Worker pool {} shut down", self.name);
        }
    }

    /// Resolves once the pool has been shut down.
    pub async fn stopped(&self) {
        let mut stopped = self.shutdown.subscribe();
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }
}

async fn until_shutdown<F: Future<Output = ()>>(mut stopped: watch::Receiver<bool>, task: F) {
    if *stopped.borrow() {
        return;
    }
    let wait = pin!(async move {
        let _ = stopped.wait_for(|stopped| *stopped).await;
    });
    let task = pin!(task);
    let _ = future::select(task, wait).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_spawn_runs_task() {
        let pool = WorkerPool::new("test", 2);
        let count = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..5)
            .map(|_| {
                let count = Arc::clone(&count);
                pool.spawn(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_shutdown_stops_periodic() {
        let pool = WorkerPool::new("test", 1);
        let count = Arc::new(AtomicUsize::new(0));
        let handle = {
            let count = Arc::clone(&count);
            pool.spawn_periodic(Duration::from_millis(5), move || {
                let count = Arc::clone(&count);
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.shutdown();
        handle.await.unwrap();

        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
        assert!(pool.is_shut_down());
    }

    #[tokio::test]
    async fn test_spawn_after_cancelled_by_shutdown() {
        let pool = WorkerPool::new("test", 1);
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = {
            let fired = Arc::clone(&fired);
            pool.spawn_after(Duration::from_secs(60), async move {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };
        pool.shutdown();
        handle.await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_delayed_task_does_not_block_spawn() {
        let pool = WorkerPool::new("test", 1);
        let _delayed = pool.spawn_after(Duration::from_secs(60), async {});

        let (sender, receiver) = tokio::sync::oneshot::channel();
        pool.spawn(async move {
            let _ = sender.send(());
        });
        tokio::time::timeout(Duration::from_secs(2), receiver)
            .await
            .expect("spawned task starved by a delayed one")
            .unwrap();
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_spawn_after_runs_once_delay_passes() {
        let pool = WorkerPool::new("test", 1);
        let (sender, receiver) = tokio::sync::oneshot::channel();
        pool.spawn_after(Duration::from_millis(10), async move {
            let _ = sender.send(());
        });
        tokio::time::timeout(Duration::from_secs(2), receiver)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_bounded_spawn_gives_up_when_busy() {
        let pool = WorkerPool::new("test", 1);
        let (release, held) = tokio::sync::oneshot::channel::<()>();
        pool.spawn(async move {
            let _ = held.await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let ran = Arc::new(AtomicUsize::new(0));
        let handle = {
            let ran = Arc::clone(&ran);
            pool.spawn_bounded(Some(Duration::from_millis(20)), async move {
                ran.fetch_add(1, Ordering::SeqCst);
            })
        };
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        let _ = release.send(());
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_spawn_after_shutdown_is_noop() {
        let pool = WorkerPool::new("test", 1);
        pool.shutdown();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        pool.spawn(async move {
            ran2.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        pool.stopped().await;
    }
}
