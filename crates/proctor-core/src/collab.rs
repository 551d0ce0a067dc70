//! Fire-and-forget collaborators: cost accounting and notifications.
//! Their failures are logged and swallowed; they must never change the
//! outcome of the run they accompany.

use std::future::Future;

use async_trait::async_trait;

use crate::errors::EngineError;
use crate::model::{CostRecord, NotificationEvent};
use crate::storage::Store;

#[async_trait]
pub trait CostLedger: Send + Sync {
    async fn record(&self, record: &CostRecord) -> Result<(), EngineError>;
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn create(&self, event: &NotificationEvent) -> Result<(), EngineError>;
}

pub struct StoreCostLedger {
    pub store: Store,
}

#[async_trait]
impl CostLedger for StoreCostLedger {
    async fn record(&self, record: &CostRecord) -> Result<(), EngineError> {
        self.store.record_cost(record)
    }
}

pub struct StoreNotificationSink {
    pub store: Store,
}

#[async_trait]
impl NotificationSink for StoreNotificationSink {
    async fn create(&self, event: &NotificationEvent) -> Result<(), EngineError> {
        self.store.insert_notification(event).map(|_| ())
    }
}

/// Await a side effect, logging any failure instead of returning it.
pub async fn best_effort<Fut>(what: &str, fut: Fut)
where
    Fut: Future<Output = Result<(), EngineError>>,
{
    if let Err(e) = fut.await {
        tracing::warn!(side_effect = what, error = %e, "side effect failed");
    }
}
