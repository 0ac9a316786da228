use crate::types::TransactionRecord;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Destination for completed transactions (history storage lives elsewhere)
#[async_trait]
pub trait TransactionSink: Send + Sync {
    async fn record_transaction(&self, record: TransactionRecord) -> anyhow::Result<()>;
}

/// Keeps records in memory, newest last
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<RwLock<Vec<TransactionRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<TransactionRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl TransactionSink for MemorySink {
    async fn record_transaction(&self, record: TransactionRecord) -> anyhow::Result<()> {
        self.records.write().await.push(record);
        Ok(())
    }
}
