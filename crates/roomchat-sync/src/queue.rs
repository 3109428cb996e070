//! Single client-side event queue.
//!
//! Every subscription callback runs on one dispatcher task, in the order the
//! deliveries were enqueued. Producers never block: enqueueing is a plain
//! unbounded channel send, so it is safe while holding the store lock.

use std::panic::AssertUnwindSafe;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum QueueItem {
    Deliver(Job),
    Flush(oneshot::Sender<()>),
}

/// Handle used to enqueue callback deliveries.
#[derive(Clone)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<QueueItem>,
}

impl EventQueue {
    /// Spawn the dispatcher task on the current tokio runtime.
    pub fn start() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueueItem>();

        tokio::spawn(async move {
            debug!("event queue dispatcher started");
            while let Some(item) = rx.recv().await {
                match item {
                    QueueItem::Deliver(job) => {
                        // A panicking callback must not take the queue down with it.
                        if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            warn!("subscription callback panicked");
                        }
                    }
                    QueueItem::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("event queue dispatcher stopped");
        });

        Self { tx }
    }

    /// Enqueue a delivery. Dropped with a warning if the dispatcher is gone.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        if self.tx.send(QueueItem::Deliver(Box::new(job))).is_err() {
            warn!("event queue closed, delivery dropped");
        }
    }

    /// Wait until every delivery enqueued before this call has run.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(QueueItem::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}
