//! Trade-record sink: append-only, best-effort, never blocks the caller.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::db::Database;
use crate::models::{MasterEvent, ReplicaOrder};

/// One entry of the trade record.
#[derive(Debug, Clone)]
pub enum TradeRecord {
    Master(MasterEvent),
    Replica(ReplicaOrder),
}

pub trait TradeSink: Send + Sync {
    /// Queue a record. Must return without waiting on I/O.
    fn record(&self, record: TradeRecord);
}

enum WriterMsg {
    Record(TradeRecord),
    Flush(oneshot::Sender<()>),
}

/// Sink feeding a background SQLite writer.
pub struct DbSink {
    tx: mpsc::UnboundedSender<WriterMsg>,
}

impl DbSink {
    /// Start the writer task. It exits once every sender is dropped and the
    /// queue has drained.
    pub fn spawn(db: Arc<Database>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriterMsg>();

        let handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let record = match msg {
                    WriterMsg::Record(record) => record,
                    WriterMsg::Flush(done) => {
                        let _ = done.send(());
                        continue;
                    }
                };
                let result = match &record {
                    TradeRecord::Master(event) => db.insert_master_event(event).await,
                    TradeRecord::Replica(replica) => db.insert_replica_order(replica).await,
                };
                if let Err(e) = result {
                    warn!(error = %e, "Failed to persist trade record");
                }
            }
            debug!("Trade record writer stopped");
        });

        (Self { tx }, handle)
    }

    /// Wait until everything queued before this call has been written.
    pub async fn flush(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(WriterMsg::Flush(done)).is_ok() {
            let _ = rx.await;
        }
    }
}

impl TradeSink for DbSink {
    fn record(&self, record: TradeRecord) {
        if self.tx.send(WriterMsg::Record(record)).is_err() {
            warn!("Trade record writer is gone, dropping record");
        }
    }
}
