//! Per-connection work queues.
//!
//! Two queues exist per connection: a writer queue that serializes
//! asynchronous write submissions (FIFO, concurrency 1) and a dispatch queue
//! that bounds how many `on_message` invocations may run in parallel when
//! async reads are enabled.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

use crate::{frame::OpCode, Result, WebSocketError};

/// Completion callback for an asynchronous write.
pub type WriteCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// One queued write submission.
pub(crate) struct WriteJob {
    pub opcode: OpCode,
    pub payload: Bytes,
    pub callback: Option<WriteCallback>,
}

impl WriteJob {
    /// Invokes the completion callback, if any.
    pub fn complete(self, result: Result<()>) {
        if let Some(callback) = self.callback {
            callback(result);
        }
    }
}

/// Submission side of the serialized writer queue.
///
/// A single worker task drains the receiving side, so jobs run strictly in
/// submission order and never concurrently. Once the receiver is gone
/// (connection torn down), further submissions fail their callback with
/// [`WebSocketError::ConnectionClosed`].
pub(crate) struct WriterQueue {
    tx: mpsc::UnboundedSender<WriteJob>,
}

impl WriterQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WriteJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn submit(&self, job: WriteJob) {
        if let Err(rejected) = self.tx.send(job) {
            rejected.0.complete(Err(WebSocketError::ConnectionClosed));
        }
    }
}

/// Bounded admission for parallel `on_message` dispatch.
pub(crate) struct DispatchQueue {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl DispatchQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Acquires one dispatch slot, waiting while the limit is saturated.
    /// The reader calls this before pulling the next frame, which is what
    /// produces backpressure on the transport.
    pub async fn admit(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| WebSocketError::ConnectionClosed)
    }

    /// Waits until every admitted dispatch has finished.
    pub async fn drain(&self) {
        if let Ok(all) = Arc::clone(&self.semaphore)
            .acquire_many_owned(self.limit as u32)
            .await
        {
            drop(all);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn job(opcode: OpCode, callback: Option<WriteCallback>) -> WriteJob {
        WriteJob {
            opcode,
            payload: Bytes::new(),
            callback,
        }
    }

    #[tokio::test]
    async fn test_writer_queue_preserves_fifo() {
        let (queue, mut rx) = WriterQueue::new();

        queue.submit(job(OpCode::Text, None));
        queue.submit(job(OpCode::Binary, None));
        queue.submit(job(OpCode::Ping, None));

        assert_eq!(rx.recv().await.unwrap().opcode, OpCode::Text);
        assert_eq!(rx.recv().await.unwrap().opcode, OpCode::Binary);
        assert_eq!(rx.recv().await.unwrap().opcode, OpCode::Ping);
    }

    #[tokio::test]
    async fn test_writer_queue_fails_jobs_after_shutdown() {
        let (queue, rx) = WriterQueue::new();
        drop(rx);

        let (tx, mut done) = mpsc::unbounded_channel();
        queue.submit(job(
            OpCode::Text,
            Some(Box::new(move |res| {
                tx.send(matches!(res, Err(WebSocketError::ConnectionClosed)))
                    .unwrap();
            })),
        ));

        assert!(done.recv().await.unwrap());
    }

    #[tokio::test]
    async fn test_dispatch_queue_bounds_concurrency() {
        let queue = Arc::new(DispatchQueue::new(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let permit = queue.admit().await.unwrap();
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_dispatch_drain_waits_for_inflight() {
        let queue = Arc::new(DispatchQueue::new(4));
        let finished = Arc::new(AtomicUsize::new(0));

        let permit = queue.admit().await.unwrap();
        let finished2 = Arc::clone(&finished);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            finished2.store(1, Ordering::SeqCst);
            drop(permit);
        });

        queue.drain().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
