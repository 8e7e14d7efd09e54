//! Post-completion notification hook
//!
//! Invoked once a top-up is durably COMPLETED. Delivery is fire-and-forget: the
//! orchestrator spawns the call and never waits on it or fails because of it.

use crate::database::topup_repository::TopUpTransaction;
use crate::database::wallet_repository::Wallet;
use crate::log_transaction;
use async_trait::async_trait;

#[async_trait]
pub trait TopUpNotifier: Send + Sync {
    /// `wallet` is the balance snapshot right after the credit
    async fn topup_completed(&self, transaction: &TopUpTransaction, wallet: &Wallet);
}

/// Writes a completion event to the log stream
#[derive(Debug, Default, Clone)]
pub struct LoggingNotifier;

#[async_trait]
impl TopUpNotifier for LoggingNotifier {
    async fn topup_completed(&self, transaction: &TopUpTransaction, wallet: &Wallet) {
        log_transaction!(
            event = "topup_completed",
            transaction_id = transaction.id,
            reference = transaction.reference,
            user_id = transaction.user_id,
            rail = transaction.rail,
            amount = transaction.amount,
            new_balance = wallet.balance,
        );
    }
}
