use crate::domain::ports::PaymentProcessor;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// How many cancellation requests a [`RecordingProcessor`] keeps.
pub const RECORDING_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelRequest {
    pub external_ref: String,
    pub at_period_end: bool,
}

/// Processor adapter that only logs cancellation requests.
///
/// The final state always arrives through the webhook, so a deployment that
/// forwards these requests elsewhere only needs another `PaymentProcessor`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingProcessor;

#[async_trait]
impl PaymentProcessor for LoggingProcessor {
    async fn cancel_subscription(&self, external_ref: &str, at_period_end: bool) -> Result<()> {
        info!(external_ref, at_period_end, "cancellation forwarded to payment processor");
        Ok(())
    }
}

/// Keeps the most recent cancellation requests for inspection, dropping the
/// oldest past [`RECORDING_CAPACITY`].
#[derive(Default, Clone)]
pub struct RecordingProcessor {
    requests: Arc<RwLock<VecDeque<CancelRequest>>>,
}

impl RecordingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn requests(&self) -> Vec<CancelRequest> {
        self.requests.read().await.iter().cloned().collect()
    }
}

#[async_trait]
impl PaymentProcessor for RecordingProcessor {
    async fn cancel_subscription(&self, external_ref: &str, at_period_end: bool) -> Result<()> {
        LoggingProcessor
            .cancel_subscription(external_ref, at_period_end)
            .await?;
        let mut requests = self.requests.write().await;
        if requests.len() == RECORDING_CAPACITY {
            requests.pop_front();
        }
        requests.push_back(CancelRequest {
            external_ref: external_ref.to_string(),
            at_period_end,
        });
        Ok(())
    }
}
