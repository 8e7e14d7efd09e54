//! Services module for top-up business logic

pub mod fee_policy;
pub mod notifier;
pub mod topup_orchestrator;

pub use fee_policy::{compute_fee, quote, validate_amount, FeePolicy, Quote, RailRules};
pub use notifier::{LoggingNotifier, TopUpNotifier};
pub use topup_orchestrator::{
    HistoryPage, InitiatedTopUp, OrchestratorConfig, ReconcileOutcome, TopUpOrchestrator,
};
