//! Top-Up Reconciler Worker
//!
//! Periodic safety net behind the request path:
//! - finishes wallet credits left in COMPLETED_PENDING_CREDIT after a ledger failure
//! - stores provider correlation ids whose write failed at initiation
//! - polls providers for PENDING top-ups whose callback never arrived
//!
//! Every action goes through the orchestrator, so the usual compare-and-set guards apply
//! and the worker can run next to live traffic and on several replicas.

use crate::error::AppError;
use crate::services::topup_orchestrator::TopUpOrchestrator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How often a cycle runs (seconds)
    pub poll_interval_secs: u64,
    /// PENDING top-ups younger than this are left to the webhook path (seconds)
    pub stale_after_secs: i64,
    /// Upper bound on records handled per stage per cycle
    pub batch_size: i64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            stale_after_secs: 120,
            batch_size: 50,
        }
    }
}

impl ReconcilerConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.poll_interval_secs = std::env::var("TOPUP_RECONCILE_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v| *v > 0)
            .unwrap_or(cfg.poll_interval_secs);
        cfg.stale_after_secs = std::env::var("TOPUP_RECONCILE_STALE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(cfg.stale_after_secs);
        cfg.batch_size = std::env::var("TOPUP_RECONCILE_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v| *v > 0)
            .unwrap_or(cfg.batch_size);
        cfg
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcilerError {
    #[error("credit recovery failed: {0}")]
    CreditRecovery(#[source] AppError),

    #[error("pending status poll failed: {0}")]
    StatusPoll(#[source] AppError),
}

/// Counts from one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub credits_recovered: usize,
    pub intents_reattached: usize,
    pub pending_settled: usize,
}

pub struct TopUpReconciler {
    orchestrator: Arc<TopUpOrchestrator>,
    config: ReconcilerConfig,
}

impl TopUpReconciler {
    pub fn new(orchestrator: Arc<TopUpOrchestrator>, config: ReconcilerConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Main worker loop, until the shutdown signal flips
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            stale_after_secs = self.config.stale_after_secs,
            batch_size = self.config.batch_size,
            "Top-up reconciler started"
        );

        let mut ticker = interval(Duration::from_secs(self.config.poll_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("Shutdown signal received, stopping top-up reconciler");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "Error in reconciler cycle");
                    }
                }
            }
        }

        info!("Top-up reconciler stopped");
    }

    /// Single reconciliation cycle
    #[instrument(skip(self), fields(worker = "topup_reconciler"))]
    pub async fn run_cycle(&self) -> Result<CycleReport, ReconcilerError> {
        debug!("Starting reconciler cycle");

        let credits_recovered = self
            .orchestrator
            .recover_pending_credits(self.config.batch_size)
            .await
            .map_err(ReconcilerError::CreditRecovery)?;

        let intents_reattached = self.orchestrator.reattach_intents().await;

        let pending_settled = self
            .orchestrator
            .poll_stale_pending(
                chrono::Duration::seconds(self.config.stale_after_secs),
                self.config.batch_size,
            )
            .await
            .map_err(ReconcilerError::StatusPoll)?;

        let report = CycleReport {
            credits_recovered,
            intents_reattached,
            pending_settled,
        };
        debug!(?report, "Reconciler cycle completed");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.poll_interval_secs, 30);
        assert_eq!(config.stale_after_secs, 120);
        assert_eq!(config.batch_size, 50);
    }
}
