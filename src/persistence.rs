//! Background I/O lane between a layered cache and its persistent store.
//!
//! Every store operation of one cache goes through a single task, in submission order. Writes,
//! removes and clears are fire-and-forget; reads and flushes wait for their turn in the queue.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::entry::StoredBytes;
use crate::error::CacheError;
use crate::observability::{EventSink, FetchEvent};
use crate::store::PersistentStore;

enum LaneOp {
    Read {
        key: String,
        reply: oneshot::Sender<Option<StoredBytes>>,
    },
    Write {
        key: String,
        bytes: StoredBytes,
    },
    Remove {
        key: String,
    },
    Clear,
    Flush {
        reply: oneshot::Sender<()>,
    },
}

impl LaneOp {
    fn name(&self) -> &'static str {
        match self {
            LaneOp::Read { .. } => "read",
            LaneOp::Write { .. } => "write",
            LaneOp::Remove { .. } => "remove",
            LaneOp::Clear => "clear",
            LaneOp::Flush { .. } => "flush",
        }
    }
}

/// Handle to the lane task. The task exits once every handle is dropped.
#[derive(Clone)]
pub(crate) struct PersistenceLane {
    tx: mpsc::UnboundedSender<LaneOp>,
    namespace: Arc<str>,
}

impl PersistenceLane {
    /// Spawn the lane task on the current tokio runtime.
    pub(crate) fn spawn(
        store: Arc<dyn PersistentStore>,
        namespace: &str,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let namespace: Arc<str> = Arc::from(namespace);
        tokio::spawn(run(store, Arc::clone(&namespace), sink, rx));
        PersistenceLane { tx, namespace }
    }

    /// Read through the lane. Any failure is reported as a miss.
    pub(crate) async fn read(&self, key: String) -> Option<StoredBytes> {
        let (reply, rx) = oneshot::channel();
        self.submit(LaneOp::Read { key, reply });
        rx.await.ok().flatten()
    }

    pub(crate) fn write(&self, key: String, bytes: StoredBytes) {
        self.submit(LaneOp::Write { key, bytes });
    }

    pub(crate) fn remove(&self, key: String) {
        self.submit(LaneOp::Remove { key });
    }

    pub(crate) fn clear(&self) {
        self.submit(LaneOp::Clear);
    }

    /// Wait until every operation submitted before this call has been applied.
    pub(crate) async fn flush(&self) {
        let (reply, rx) = oneshot::channel();
        self.submit(LaneOp::Flush { reply });
        let _ = rx.await;
    }

    fn submit(&self, op: LaneOp) {
        if let Err(mpsc::error::SendError(op)) = self.tx.send(op) {
            tracing::warn!(
                "Persistence lane for '{}' is gone, dropping {}",
                self.namespace,
                op.name()
            );
        }
    }
}

async fn run(
    store: Arc<dyn PersistentStore>,
    namespace: Arc<str>,
    sink: Arc<dyn EventSink>,
    mut rx: mpsc::UnboundedReceiver<LaneOp>,
) {
    let report = |operation: &'static str, err: CacheError| {
        tracing::warn!(
            "[{}] persistent {} failed for '{}': {}",
            store.name(),
            operation,
            namespace,
            err
        );
        sink.emit(FetchEvent::PersistenceFailed {
            cache: namespace.to_string(),
            operation,
            message: err.to_string(),
        });
    };

    while let Some(op) = rx.recv().await {
        match op {
            LaneOp::Read { key, reply } => {
                let stored = match store.get(&namespace, &key).await {
                    Ok(stored) => stored,
                    Err(e) => {
                        report("read", e);
                        None
                    }
                };
                let _ = reply.send(stored);
            }
            LaneOp::Write { key, bytes } => {
                if let Err(e) = store.set(&namespace, &key, bytes).await {
                    report("write", e);
                }
            }
            LaneOp::Remove { key } => {
                if let Err(e) = store.remove(&namespace, &[key.as_str()]).await {
                    report("remove", e);
                }
            }
            LaneOp::Clear => {
                if let Err(e) = store.clear(&namespace).await {
                    report("clear", e);
                }
            }
            LaneOp::Flush { reply } => {
                let _ = reply.send(());
            }
        }
    }

    tracing::debug!("Persistence lane for '{}' stopped", namespace);
}
