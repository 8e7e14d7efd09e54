//! Background workers

pub mod topup_reconciler;

pub use topup_reconciler::{ReconcilerConfig, TopUpReconciler};
