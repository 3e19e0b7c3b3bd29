//! Async record processing with a fixed number of workers.
//!
//! The key concepts here are borrowed from ["Queues Don't Fix
//! Overload"](https://ferd.ca/queues-don-t-fix-overload.html). We limit the
//! number of work items that may be in flight, and once that limit is reached,
//! submitting more items blocks until one of the in-flight items completes.
//!
//! Every item sent to the queue goes to exactly one worker. Workers never share
//! a mutable collection: each one receives its item, and returns its result on
//! a dedicated one-shot channel.

use std::sync::Arc;

use futures::{
    SinkExt as _, StreamExt as _,
    channel::{mpsc, oneshot},
    stream,
};
use tokio::task::JoinHandle;

use crate::{async_utils::BoxedFuture, prelude::*};

/// An input, plus the channel on which to return its result.
struct WorkItem<Input, Output> {
    input: Input,
    tx: oneshot::Sender<Result<Output>>,
}

/// An async work function.
pub type WorkFn<Input, Output> =
    Arc<dyn Fn(Input) -> BoxedFuture<Result<Output>> + Send + Sync + 'static>;

/// A handle to a [`WorkQueue`]. Cheap to clone.
pub struct WorkQueueHandle<Input, Output> {
    tx: mpsc::Sender<WorkItem<Input, Output>>,
}

// Written by hand so that `Input` and `Output` need not be `Clone`.
impl<Input, Output> Clone for WorkQueueHandle<Input, Output> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<Input, Output> WorkQueueHandle<Input, Output>
where
    Input: Send + 'static,
    Output: Send + 'static,
{
    /// Process one input and wait for its output.
    pub async fn process(&self, input: Input) -> Result<Output> {
        let (tx, rx) = oneshot::channel();
        // `send` needs a mutable sender.
        let mut sender = self.tx.clone();
        sender
            .send(WorkItem { input, tx })
            .await
            .context("failed to send work item")?;
        rx.await.context("failed to receive work item result")?
    }

    /// Process a batch of inputs, waiting for every one of them to finish.
    /// Results are returned in completion order, not input order.
    ///
    /// One item failing doesn't stop the others.
    pub async fn process_batch(&self, inputs: Vec<Input>) -> Vec<Result<Output>> {
        let count = inputs.len().max(1);
        // The queue enforces the real concurrency limit; here we just need to
        // keep it fed.
        stream::iter(inputs)
            .map(|input| self.process(input))
            .buffer_unordered(count)
            .collect()
            .await
    }
}

/// A fixed pool of workers pulling from a bounded queue.
pub struct WorkQueue<Input, Output> {
    tx: mpsc::Sender<WorkItem<Input, Output>>,
    worker_handle: JoinHandle<()>,
}

impl<Input, Output> WorkQueue<Input, Output>
where
    Input: Send + 'static,
    Output: Send + 'static,
{
    /// Create a new queue running at most `concurrency_limit` items at once.
    pub fn new(concurrency_limit: usize, work_fn: WorkFn<Input, Output>) -> Self {
        let concurrency_limit = concurrency_limit.max(1);
        let (tx, rx) = mpsc::channel(concurrency_limit);
        let worker_handle = tokio::spawn(async move {
            rx.for_each_concurrent(concurrency_limit, |item: WorkItem<Input, Output>| {
                let work_fn = work_fn.clone();
                async move {
                    let result = work_fn(item.input).await;
                    if item.tx.send(result).is_err() {
                        debug!("Dropping work item result because receiver is gone");
                    }
                }
            })
            .await;
        });
        Self { tx, worker_handle }
    }

    /// Get a handle for submitting items.
    pub fn handle(&self) -> WorkQueueHandle<Input, Output> {
        WorkQueueHandle {
            tx: self.tx.clone(),
        }
    }

    /// Stop accepting work and wait for in-flight items. Blocks until every
    /// handle has been dropped.
    pub async fn close(self) -> Result<()> {
        let Self { tx, worker_handle } = self;
        drop(tx);
        worker_handle
            .await
            .context("failed to join worker task")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use futures::FutureExt as _;

    use super::*;

    #[tokio::test]
    async fn test_respects_concurrency_limit() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let work_fn: WorkFn<usize, usize> = {
            let running = running.clone();
            let peak = peak.clone();
            Arc::new(move |n| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(n * 2)
                }
                .boxed()
            })
        };
        let queue = WorkQueue::new(3, work_fn);
        let mut results = queue
            .handle()
            .process_batch((0..20).collect())
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        results.sort();
        assert_eq!(results, (0..20).map(|n| n * 2).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 3);
        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let work_fn: WorkFn<u32, u32> = Arc::new(|n| {
            async move {
                if n == 2 {
                    Err(anyhow!("item {n} failed"))
                } else {
                    Ok(n)
                }
            }
            .boxed()
        });
        let queue = WorkQueue::new(2, work_fn);
        let results = queue.handle().process_batch(vec![1, 2, 3]).await;
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
        queue.close().await.unwrap();
    }
}
