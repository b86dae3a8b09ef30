use std::{fmt, future::Future, pin::pin};

use async_channel::{Receiver, Sender};
use futures_util::future::{select, Either};
use parking_lot::Mutex;

use crate::runtime::{global_executor, Executor};

/// A group of tasks that can be cancelled together.
///
/// Each task reports its outcome to a callback, as a [`TaskResult`]. Tasks
/// are tracked through channel handles rather than join handles, so the
/// group can host an unbounded stream of short-lived tasks, one per RPC
/// call for example. After [`TaskGroup::cancel`] returns every callback has
/// run and the group can be used again.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use muddle_core::{runtime::{block_on, sleep}, task_group::TaskGroup};
///
/// block_on(async {
///     let group = TaskGroup::new();
///     group.spawn(sleep(Duration::MAX), |_| async {});
///     group.cancel().await;
///     assert!(group.is_empty());
/// });
/// ```
pub struct TaskGroup {
    generation: Mutex<Generation>,
    executor: Executor,
}

/// Channels shared by the tasks spawned between two cancellations.
///
/// Closing `stop_tx` wakes every task, and `done_rx` yields an error once
/// every task has dropped its `done_tx` clone.
struct Generation {
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
    done_tx: Sender<()>,
    done_rx: Receiver<()>,
}

impl Generation {
    fn new() -> Self {
        let (stop_tx, stop_rx) = async_channel::bounded(1);
        let (done_tx, done_rx) = async_channel::bounded(1);
        Self {
            stop_tx,
            stop_rx,
            done_tx,
            done_rx,
        }
    }
}

impl TaskGroup {
    /// Creates a group running its tasks on the global executor.
    pub fn new() -> Self {
        Self::with_executor(global_executor())
    }

    pub fn with_executor(executor: Executor) -> Self {
        Self {
            generation: Mutex::new(Generation::new()),
            executor,
        }
    }

    /// Spawns `fut` and hands its outcome to `callback`, either its output
    /// or [`TaskResult::Cancelled`] if the group was cancelled first.
    pub fn spawn<T, Fut, CallbackF, CallbackFut>(&self, fut: Fut, callback: CallbackF)
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        CallbackF: FnOnce(TaskResult<T>) -> CallbackFut + Send + 'static,
        CallbackFut: Future<Output = ()> + Send + 'static,
    {
        let (stop, done) = {
            let generation = self.generation.lock();
            (generation.stop_rx.clone(), generation.done_tx.clone())
        };

        self.executor.spawn_detached(async move {
            let result = match select(pin!(stop.recv()), pin!(fut)).await {
                Either::Left(_) => TaskResult::Cancelled,
                Either::Right((output, _)) => TaskResult::Completed(output),
            };
            callback(result).await;
            drop(done);
        });
    }

    /// Returns the number of tasks whose callback has not run yet.
    pub fn len(&self) -> usize {
        // The group itself holds one sender.
        self.generation.lock().done_tx.sender_count() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancels every running task and waits for their callbacks.
    pub async fn cancel(&self) {
        let Generation {
            stop_tx, done_rx, ..
        } = std::mem::replace(&mut *self.generation.lock(), Generation::new());

        stop_tx.close();
        // Nothing is ever sent, this returns once all senders are gone.
        let _ = done_rx.recv().await;
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// The outcome of a task spawned in a [`TaskGroup`].
#[derive(Debug)]
pub enum TaskResult<T> {
    Completed(T),
    Cancelled,
}

impl<T: fmt::Debug> fmt::Display for TaskResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TaskResult::Cancelled => write!(f, "Task cancelled"),
            TaskResult::Completed(res) => write!(f, "Task completed: {:?}", res),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use crate::runtime::{block_on, sleep};

    use super::*;

    #[test]
    fn test_task_group() {
        block_on(async {
            let group = Arc::new(TaskGroup::new());
            let cancelled = Arc::new(AtomicUsize::new(0));

            group.spawn(future::ready(0), |res| async move {
                assert!(matches!(res, TaskResult::Completed(0)));
            });

            group.spawn(future::pending::<()>(), {
                let cancelled = cancelled.clone();
                |res| async move {
                    assert!(matches!(res, TaskResult::Cancelled));
                    cancelled.fetch_add(1, Ordering::SeqCst);
                }
            });

            let nested = group.clone();
            let nested_cancelled = cancelled.clone();
            group.spawn(
                async move {
                    nested.spawn(future::pending::<()>(), |res| async move {
                        assert!(matches!(res, TaskResult::Cancelled));
                        nested_cancelled.fetch_add(1, Ordering::SeqCst);
                    });
                },
                |res| async move {
                    assert!(matches!(res, TaskResult::Completed(_)));
                },
            );

            sleep(Duration::from_millis(50)).await;
            assert_eq!(group.len(), 2);
            group.cancel().await;

            assert_eq!(cancelled.load(Ordering::SeqCst), 2);
            assert!(group.is_empty());
        });
    }

    #[test]
    fn test_task_group_reuse_after_cancel() {
        block_on(async {
            let group = TaskGroup::new();
            group.spawn(future::pending::<()>(), |_| async {});
            group.cancel().await;

            let done = Arc::new(AtomicUsize::new(0));
            group.spawn(future::ready(7), {
                let done = done.clone();
                |res| async move {
                    if let TaskResult::Completed(7) = res {
                        done.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });

            sleep(Duration::from_millis(50)).await;
            assert_eq!(done.load(Ordering::SeqCst), 1);
            assert!(group.is_empty());
        });
    }

    #[test]
    fn test_cancel_empty_group() {
        block_on(async {
            let group = TaskGroup::new();
            group.cancel().await;
            group.cancel().await;
            assert!(group.is_empty());
        });
    }
}
