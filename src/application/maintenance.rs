use super::ledger::{ReconcileReport, TrialLedger};
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub reconciled: ReconcileReport,
}

/// One pass: expire lapsed tokens (pending ones included), then promote
/// what is left pending.
pub async fn run_once(ledger: &TrialLedger) -> Result<MaintenanceReport> {
    let expired = ledger.expire_sweep().await?;
    let reconciled = ledger.reconcile_pending().await?;
    Ok(MaintenanceReport {
        expired,
        reconciled,
    })
}

/// Runs [`run_once`] every `every` until `shutdown` fires. A failed pass is
/// logged and retried on the next tick.
pub fn spawn(
    ledger: Arc<TrialLedger>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match run_once(&ledger).await {
                        Ok(report) => debug!(?report, "maintenance pass complete"),
                        Err(e) => error!(error = %e, "maintenance pass failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("maintenance task stopping");
                    break;
                }
            }
        }
    })
}
