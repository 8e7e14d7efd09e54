//! Top-Up Orchestrator
//!
//! Drives a top-up from initiation to a credited wallet:
//! - validates, prices and limit-checks the request
//! - opens a payment intent on the rail adapter under a bounded timeout
//! - settles through either client verification (status polling) or provider webhooks
//! - credits the wallet exactly once through the ledger
//!
//! `verify` and `reconcile` can race on the same transaction. The only serialization point
//! is the PENDING -> COMPLETED_PENDING_CREDIT compare-and-set in [`TopUpOrchestrator::complete`];
//! whoever loses it returns the current record and credits nothing. The ledger then flips
//! COMPLETED_PENDING_CREDIT -> COMPLETED under the wallet lock, so a credit that failed part
//! way can be finished later by any caller without double counting.
//!
//! Money the provider reports outside that happy path is never dropped silently: settlements
//! for closed or short-paid top-ups are written into the record's metadata and logged with
//! `event_type = "reconciliation"`, and a correlation id that could not be stored at initiation
//! is held in memory and re-attached by callbacks, verification or the reconciler.

use crate::database::repository::{
    CreditOutcome, StatusChange, TopUpStore, TransitionOutcome, WalletLedger,
};
use crate::database::topup_repository::{
    generate_reference, NewTopUp, TopUpStatus, TopUpTransaction,
};
use crate::error::{AppError, AppErrorKind, AppResult, DomainError, ExternalError, ValidationError};
use crate::log_transaction;
use crate::payments::traits::PaymentProvider;
use crate::payments::types::{
    IntentRequest, PaymentInstructions, PaymentStatus, Rail, RailInput, Settlement,
};
use crate::services::fee_policy::{self, FeePolicy};
use crate::services::notifier::{LoggingNotifier, TopUpNotifier};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Largest page `list_history` will return
pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Currency every top-up is denominated in
    pub currency: String,
    /// How long after creation a PENDING top-up may still be cancelled
    pub cancel_grace: chrono::Duration,
    /// Upper bound on any single provider call
    pub provider_timeout: Duration,
    /// Retries of a failed ledger credit or intent write after the first attempt
    pub credit_max_retries: u32,
    /// First retry delay, doubled on each further attempt
    pub credit_retry_base_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            currency: "KES".to_string(),
            cancel_grace: chrono::Duration::minutes(30),
            provider_timeout: Duration::from_secs(30),
            credit_max_retries: 3,
            credit_retry_base_delay: Duration::from_millis(200),
        }
    }
}

impl From<&crate::config::TopUpConfig> for OrchestratorConfig {
    fn from(config: &crate::config::TopUpConfig) -> Self {
        Self {
            currency: config.currency.clone(),
            cancel_grace: chrono::Duration::minutes(config.cancel_grace_minutes),
            provider_timeout: config.provider_timeout(),
            credit_max_retries: config.credit_max_retries,
            ..Self::default()
        }
    }
}

/// A freshly initiated top-up and what the payer has to do next
#[derive(Debug, Clone, Serialize)]
pub struct InitiatedTopUp {
    pub transaction: TopUpTransaction,
    pub instructions: PaymentInstructions,
}

/// What a verified webhook led to. Every variant is acknowledged to the provider.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// The callback settled or failed the matching transaction (or it already had)
    Applied(TopUpTransaction),
    /// No transaction carries this correlation id
    Unmatched { correlation_id: String },
    /// Matched, but left as is
    Ignored { transaction_id: Uuid, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub items: Vec<TopUpTransaction>,
    pub page: i64,
    pub limit: i64,
    pub total: i64,
}

/// A provider intent whose correlation id is not yet stored on its record
#[derive(Debug, Clone)]
struct UnattachedIntent {
    rail: Rail,
    correlation_id: String,
    metadata: Value,
}

pub struct TopUpOrchestrator {
    topups: Arc<dyn TopUpStore>,
    wallets: Arc<dyn WalletLedger>,
    providers: HashMap<Rail, Arc<dyn PaymentProvider>>,
    notifier: Arc<dyn TopUpNotifier>,
    policy: FeePolicy,
    config: OrchestratorConfig,
    unattached: Mutex<HashMap<Uuid, UnattachedIntent>>,
}

impl TopUpOrchestrator {
    pub fn new(
        topups: Arc<dyn TopUpStore>,
        wallets: Arc<dyn WalletLedger>,
        policy: FeePolicy,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            topups,
            wallets,
            providers: HashMap::new(),
            notifier: Arc::new(LoggingNotifier),
            policy,
            config,
            unattached: Mutex::new(HashMap::new()),
        }
    }

    /// Register the adapter for its rail, replacing any previous one
    pub fn with_provider(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.providers.insert(provider.rail(), provider);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn TopUpNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn rails(&self) -> Vec<Rail> {
        self.providers.keys().copied().collect()
    }

    fn provider(&self, rail: Rail) -> AppResult<&Arc<dyn PaymentProvider>> {
        self.providers.get(&rail).ok_or_else(|| {
            AppError::domain(DomainError::RailUnavailable {
                rail: rail.to_string(),
            })
        })
    }

    /// Start a top-up.
    ///
    /// Nothing is persisted unless the amount, rail input, wallet and daily limit all pass.
    /// Once the PENDING record exists a provider failure or timeout marks it FAILED.
    /// If the provider accepted but its correlation id cannot be stored, the top-up is still
    /// returned (the payer may already be paying) and the id is kept for re-attachment.
    #[instrument(skip_all, fields(user_id = %user_id, rail = %rail, amount = %amount))]
    pub async fn initiate(
        &self,
        user_id: &str,
        rail: Rail,
        amount: Decimal,
        rail_input: RailInput,
    ) -> AppResult<InitiatedTopUp> {
        let quote = fee_policy::quote(rail, amount)?;
        let rail_input = rail_input.normalize(rail)?;
        let provider = self.provider(rail)?.clone();

        let wallet = self.wallets.find_wallet(user_id).await?.ok_or_else(|| {
            AppError::domain(DomainError::WalletNotFound {
                user_id: user_id.to_string(),
            })
        })?;
        if let Some(reason) = wallet.unavailable_reason() {
            return Err(AppError::domain(DomainError::WalletUnavailable {
                user_id: user_id.to_string(),
                reason: reason.to_string(),
            }));
        }

        let now = Utc::now();
        let spent_today = self
            .topups
            .sum_completed_or_pending_for_user_on_day(user_id, self.policy.day_window(now))
            .await?;
        self.policy
            .check_daily_limit(user_id, amount, spent_today, Some(wallet.daily_limit))?;

        let record = self
            .topups
            .create(NewTopUp {
                reference: generate_reference(now),
                user_id: user_id.to_string(),
                rail,
                amount: quote.amount,
                fee: quote.fee,
                total_amount: quote.total,
                currency: self.config.currency.clone(),
            })
            .await?;

        debug!(tx_id = %record.id, reference = %record.reference, "Top-up record created");

        let request = IntentRequest {
            transaction_id: record.id,
            reference: record.reference.clone(),
            user_id: user_id.to_string(),
            amount: quote.total,
            currency: record.currency.clone(),
            rail_input,
        };

        let intent = match timeout(self.config.provider_timeout, provider.create_intent(request))
            .await
        {
            Ok(Ok(intent)) => intent,
            Ok(Err(e)) => {
                self.fail_after_provider_error(&record, &e.to_string()).await;
                return Err(e);
            }
            Err(_) => {
                let err = self.provider_timeout_error(rail);
                self.fail_after_provider_error(&record, "payment provider timed out")
                    .await;
                return Err(err);
            }
        };

        let transaction = match self
            .attach_with_retry(record.id, &intent.correlation_id, intent.metadata.clone())
            .await
        {
            Ok(tx) => tx,
            Err(e) => {
                error!(
                    event_type = "reconciliation",
                    tx_id = %record.id,
                    reference = %record.reference,
                    rail = %rail,
                    correlation_id = %intent.correlation_id,
                    error = %e,
                    "Provider intent created but its correlation id could not be stored"
                );
                self.unattached.lock().await.insert(
                    record.id,
                    UnattachedIntent {
                        rail,
                        correlation_id: intent.correlation_id.clone(),
                        metadata: intent.metadata.clone(),
                    },
                );
                record
            }
        };

        log_transaction!(
            event = "topup_initiated",
            transaction_id = transaction.id,
            reference = transaction.reference,
            rail = rail,
            amount = transaction.amount,
            fee = transaction.fee,
        );

        Ok(InitiatedTopUp {
            transaction,
            instructions: intent.instructions,
        })
    }

    /// Client-driven status check.
    ///
    /// Terminal records come back untouched. A record stuck between confirmation and credit
    /// is finished here. A PENDING record is refreshed from the provider.
    #[instrument(skip(self, transaction_id), fields(tx_id = %transaction_id))]
    pub async fn verify(&self, transaction_id: Uuid, user_id: &str) -> AppResult<TopUpTransaction> {
        let tx = self.load_owned(transaction_id, user_id).await?;

        match tx.status {
            status if status.is_terminal() => Ok(tx),
            TopUpStatus::CompletedPendingCredit => self.finish_credit(tx).await,
            _ => self.refresh_pending(tx).await,
        }
    }

    /// Handle a provider callback.
    ///
    /// Signature failures are returned as `InvalidSignature` and change nothing. Everything
    /// else, including callbacks for unknown transactions, is acknowledged.
    #[instrument(skip_all, fields(rail = %rail))]
    pub async fn reconcile(
        &self,
        rail: Rail,
        payload: &[u8],
        signature: &str,
    ) -> AppResult<ReconcileOutcome> {
        let provider = self.provider(rail)?;

        let event = provider.verify_callback(payload, signature).map_err(|e| {
            if e.is_invalid_signature() {
                warn!(
                    event_type = "security",
                    rail = %rail,
                    payload_len = payload.len(),
                    "Rejected callback with invalid signature"
                );
            }
            e
        })?;

        let matched = match self
            .topups
            .find_by_provider_reference(rail, &event.correlation_id)
            .await?
        {
            Some(tx) => Some(tx),
            None => self.reattach_by_correlation(rail, &event.correlation_id).await?,
        };

        let Some(tx) = matched else {
            info!(
                correlation_id = %event.correlation_id,
                "Callback does not match any top-up, acknowledging"
            );
            return Ok(ReconcileOutcome::Unmatched {
                correlation_id: event.correlation_id,
            });
        };

        match event.status {
            PaymentStatus::Pending => {
                debug!(tx_id = %tx.id, "Callback reports payment still in progress");
                Ok(ReconcileOutcome::Ignored {
                    transaction_id: tx.id,
                    reason: "payment still in progress".to_string(),
                })
            }
            PaymentStatus::Completed(settlement) => {
                if let Some((_, reason)) = self.flag_underpayment(&tx, &settlement).await? {
                    return Ok(ReconcileOutcome::Ignored {
                        transaction_id: tx.id,
                        reason,
                    });
                }
                let tx = self.complete(tx.id, settlement).await?;
                if matches!(tx.status, TopUpStatus::Failed | TopUpStatus::Cancelled) {
                    return Ok(ReconcileOutcome::Ignored {
                        transaction_id: tx.id,
                        reason: format!("settled after the top-up was {}", tx.status),
                    });
                }
                Ok(ReconcileOutcome::Applied(tx))
            }
            PaymentStatus::Failed { reason } => {
                let tx = self.fail(&tx, &reason).await?;
                Ok(ReconcileOutcome::Applied(tx))
            }
        }
    }

    /// Settle a confirmed payment and credit the wallet.
    ///
    /// Safe to call any number of times and from concurrent callers: only the caller that
    /// wins the PENDING -> COMPLETED_PENDING_CREDIT flip goes on to credit. A settlement for a
    /// FAILED or CANCELLED top-up is recorded on it for refund or review, never credited.
    #[instrument(skip_all, fields(tx_id = %transaction_id))]
    pub async fn complete(
        &self,
        transaction_id: Uuid,
        settlement: Settlement,
    ) -> AppResult<TopUpTransaction> {
        let change = StatusChange::with_metadata(json!({
            "settlement_reference": settlement.settlement_reference,
            "settled_amount": settlement.amount,
            "settlement": settlement.metadata,
        }));

        let tx = match self
            .topups
            .transition(
                transaction_id,
                TopUpStatus::Pending,
                TopUpStatus::CompletedPendingCredit,
                change,
            )
            .await?
        {
            TransitionOutcome::Applied(tx) => tx,
            TransitionOutcome::Conflict(current) => {
                if matches!(current.status, TopUpStatus::Failed | TopUpStatus::Cancelled) {
                    return self.record_late_settlement(current, &settlement).await;
                }
                debug!(
                    status = %current.status,
                    "Transaction already left PENDING, nothing to complete"
                );
                return Ok(current);
            }
        };

        info!(
            reference = %tx.reference,
            settlement_reference = tx.settlement_reference().unwrap_or_default(),
            "Payment confirmed, crediting wallet"
        );

        self.finish_credit(tx).await
    }

    /// Cancel a PENDING top-up within the grace window
    #[instrument(skip(self, transaction_id), fields(tx_id = %transaction_id))]
    pub async fn cancel(&self, transaction_id: Uuid, user_id: &str) -> AppResult<TopUpTransaction> {
        let tx = self.load_owned(transaction_id, user_id).await?;

        if tx.status != TopUpStatus::Pending {
            return Err(Self::not_cancellable(
                &tx,
                format!("transaction is {}", tx.status),
            ));
        }

        if Utc::now() - tx.created_at > self.config.cancel_grace {
            return Err(Self::not_cancellable(
                &tx,
                format!(
                    "the {} minute cancellation window has passed",
                    self.config.cancel_grace.num_minutes()
                ),
            ));
        }

        match self
            .topups
            .transition(
                tx.id,
                TopUpStatus::Pending,
                TopUpStatus::Cancelled,
                StatusChange::with_metadata(json!({ "cancelled_by": user_id })),
            )
            .await?
        {
            TransitionOutcome::Applied(tx) => {
                log_transaction!(
                    event = "topup_cancelled",
                    transaction_id = tx.id,
                    reference = tx.reference,
                );
                Ok(tx)
            }
            TransitionOutcome::Conflict(current) => Err(Self::not_cancellable(
                &current,
                format!("transaction is {}", current.status),
            )),
        }
    }

    /// One page of the user's top-ups, newest first. `page` starts at 1.
    pub async fn list_history(&self, user_id: &str, page: i64, limit: i64) -> AppResult<HistoryPage> {
        if page < 1 {
            return Err(AppError::validation(ValidationError::InvalidParameter {
                field: "page".to_string(),
                reason: "must be at least 1".to_string(),
            }));
        }
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let offset = (page - 1).saturating_mul(limit);

        let items = self.topups.list_for_user(user_id, limit, offset).await?;
        let total = self.topups.count_for_user(user_id).await?;

        Ok(HistoryPage {
            items,
            page,
            limit,
            total,
        })
    }

    /// Finish credits left in COMPLETED_PENDING_CREDIT. Returns how many were settled.
    pub async fn recover_pending_credits(&self, limit: i64) -> AppResult<usize> {
        let stuck = self
            .topups
            .find_by_status(TopUpStatus::CompletedPendingCredit, limit)
            .await?;

        let mut recovered = 0;
        for tx in stuck {
            let tx_id = tx.id;
            match self.finish_credit(tx).await {
                Ok(tx) if tx.status == TopUpStatus::Completed => recovered += 1,
                Ok(_) => {}
                Err(e) => warn!(tx_id = %tx_id, error = %e, "Credit recovery failed"),
            }
        }

        if recovered > 0 {
            info!(recovered, "Recovered pending wallet credits");
        }
        Ok(recovered)
    }

    /// Poll the provider for PENDING top-ups older than `age`. Returns how many changed status.
    pub async fn poll_stale_pending(&self, age: chrono::Duration, limit: i64) -> AppResult<usize> {
        let stale = self.topups.find_pending_older_than(age, limit).await?;

        let mut changed = 0;
        for tx in stale {
            let tx_id = tx.id;
            match self.refresh_pending(tx).await {
                Ok(tx) if tx.status != TopUpStatus::Pending => changed += 1,
                Ok(_) => {}
                Err(e) => debug!(tx_id = %tx_id, error = %e, "Status poll failed"),
            }
        }
        Ok(changed)
    }

    /// Retry storing correlation ids that could not be written at initiation.
    /// Returns how many were stored.
    pub async fn reattach_intents(&self) -> usize {
        let pending: Vec<Uuid> = self.unattached.lock().await.keys().copied().collect();

        let mut attached = 0;
        for transaction_id in pending {
            match self.reattach(transaction_id).await {
                Ok(Some(_)) => attached += 1,
                Ok(None) => {}
                Err(e) => warn!(tx_id = %transaction_id, error = %e, "Intent re-attachment failed"),
            }
        }
        attached
    }

    async fn load_owned(&self, transaction_id: Uuid, user_id: &str) -> AppResult<TopUpTransaction> {
        match self.topups.find_by_id(transaction_id).await? {
            Some(tx) if tx.user_id == user_id => Ok(tx),
            _ => Err(AppError::domain(DomainError::TransactionNotFound {
                transaction_id: transaction_id.to_string(),
            })),
        }
    }

    /// Ask the provider about a PENDING record and apply the answer
    async fn refresh_pending(&self, tx: TopUpTransaction) -> AppResult<TopUpTransaction> {
        let tx = match tx.provider_reference {
            Some(_) => tx,
            None => match self.reattach(tx.id).await? {
                Some(attached) => attached,
                None => {
                    warn!(
                        event_type = "reconciliation",
                        tx_id = %tx.id,
                        reference = %tx.reference,
                        "PENDING top-up has no provider correlation id, cannot query its status"
                    );
                    return Ok(tx);
                }
            },
        };
        let Some(correlation_id) = tx.provider_reference.clone() else {
            return Ok(tx);
        };
        let provider = self.provider(tx.rail)?;

        let status = timeout(
            self.config.provider_timeout,
            provider.query_status(&correlation_id),
        )
        .await
        .map_err(|_| self.provider_timeout_error(tx.rail))??;

        match status {
            PaymentStatus::Pending => Ok(tx),
            PaymentStatus::Completed(settlement) => {
                if let Some((flagged, _)) = self.flag_underpayment(&tx, &settlement).await? {
                    return Ok(flagged);
                }
                self.complete(tx.id, settlement).await
            }
            PaymentStatus::Failed { reason } => self.fail(&tx, &reason).await,
        }
    }

    /// Credit the wallet for a COMPLETED_PENDING_CREDIT record, retrying transient ledger errors.
    ///
    /// When retries run out the record stays in COMPLETED_PENDING_CREDIT and the error is
    /// returned; a later verify or the reconciler finishes it.
    async fn finish_credit(&self, tx: TopUpTransaction) -> AppResult<TopUpTransaction> {
        let business_date = self.policy.business_date(Utc::now());
        let mut attempt = 0;

        loop {
            match self
                .wallets
                .credit_once(&tx.user_id, tx.id, tx.amount, business_date)
                .await
            {
                Ok(CreditOutcome::Applied {
                    wallet,
                    transaction,
                }) => {
                    log_transaction!(
                        event = "topup_completed",
                        transaction_id = transaction.id,
                        reference = transaction.reference,
                        amount = transaction.amount,
                    );

                    let notifier = self.notifier.clone();
                    let notified = transaction.clone();
                    tokio::spawn(async move {
                        notifier.topup_completed(&notified, &wallet).await;
                    });

                    return Ok(transaction);
                }
                Ok(CreditOutcome::AlreadyApplied(current)) => {
                    debug!(tx_id = %current.id, status = %current.status, "Credit already applied");
                    return Ok(current);
                }
                Err(e) if e.is_retryable() && attempt < self.config.credit_max_retries => {
                    let delay = self.retry_delay(attempt);
                    attempt += 1;
                    warn!(
                        tx_id = %tx.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Wallet credit failed, retrying"
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        tx_id = %tx.id,
                        attempts = attempt + 1,
                        error = %e,
                        "Wallet credit failed, leaving transaction for recovery"
                    );
                    return Err(e.into());
                }
            }
        }
    }

    async fn fail(&self, tx: &TopUpTransaction, reason: &str) -> AppResult<TopUpTransaction> {
        let outcome = self
            .topups
            .transition(
                tx.id,
                TopUpStatus::Pending,
                TopUpStatus::Failed,
                StatusChange::failed(reason),
            )
            .await?;

        if outcome.is_applied() {
            log_transaction!(
                event = "topup_failed",
                transaction_id = tx.id,
                reference = tx.reference,
                reason = reason,
            );
        }
        Ok(outcome.into_inner())
    }

    /// Best effort: the provider error is what the caller sees either way
    async fn fail_after_provider_error(&self, tx: &TopUpTransaction, reason: &str) {
        if let Err(e) = self.fail(tx, reason).await {
            error!(tx_id = %tx.id, error = %e, "Could not mark top-up as failed");
        }
    }

    fn provider_timeout_error(&self, rail: Rail) -> AppError {
        AppError::new(AppErrorKind::External(ExternalError::Timeout {
            service: rail.to_string(),
            timeout_secs: self.config.provider_timeout.as_secs(),
        }))
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        self.config.credit_retry_base_delay * 2u32.pow(attempt)
    }

    /// Store the provider correlation id, retrying transient store errors with backoff
    async fn attach_with_retry(
        &self,
        transaction_id: Uuid,
        correlation_id: &str,
        metadata: Value,
    ) -> AppResult<TopUpTransaction> {
        let mut attempt = 0;

        loop {
            match self
                .topups
                .attach_intent(transaction_id, correlation_id, metadata.clone())
                .await
            {
                Ok(outcome) => return Ok(outcome.into_inner()),
                Err(e) if e.is_retryable() && attempt < self.config.credit_max_retries => {
                    let delay = self.retry_delay(attempt);
                    attempt += 1;
                    warn!(
                        tx_id = %transaction_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Storing provider correlation id failed, retrying"
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Attach a held intent to its record. `None` when nothing is held for `transaction_id`.
    async fn reattach(&self, transaction_id: Uuid) -> AppResult<Option<TopUpTransaction>> {
        let Some(held) = self.unattached.lock().await.get(&transaction_id).cloned() else {
            return Ok(None);
        };

        let tx = self
            .attach_with_retry(transaction_id, &held.correlation_id, held.metadata)
            .await?;
        self.unattached.lock().await.remove(&transaction_id);

        info!(
            event_type = "reconciliation",
            tx_id = %transaction_id,
            correlation_id = %held.correlation_id,
            "Provider correlation id re-attached"
        );
        Ok(Some(tx))
    }

    async fn reattach_by_correlation(
        &self,
        rail: Rail,
        correlation_id: &str,
    ) -> AppResult<Option<TopUpTransaction>> {
        let held = self
            .unattached
            .lock()
            .await
            .iter()
            .find(|(_, intent)| intent.rail == rail && intent.correlation_id == correlation_id)
            .map(|(id, _)| *id);

        match held {
            Some(transaction_id) => self.reattach(transaction_id).await,
            None => Ok(None),
        }
    }

    /// Keep a settlement that arrived after the top-up was closed
    async fn record_late_settlement(
        &self,
        current: TopUpTransaction,
        settlement: &Settlement,
    ) -> AppResult<TopUpTransaction> {
        error!(
            event_type = "reconciliation",
            tx_id = %current.id,
            reference = %current.reference,
            status = %current.status,
            settlement_reference = %settlement.settlement_reference,
            amount = ?settlement.amount,
            "Payment settled for a closed top-up, refund or review required"
        );

        let annotated = self
            .topups
            .annotate(
                current.id,
                json!({
                    "late_settlement": {
                        "settlement_reference": settlement.settlement_reference,
                        "settled_amount": settlement.amount,
                        "received_at": Utc::now(),
                        "settlement": settlement.metadata,
                    }
                }),
            )
            .await?;
        Ok(annotated)
    }

    /// When the provider collected less than the total charged, record it on the transaction
    /// and return the updated record with the reason. The status stays PENDING.
    async fn flag_underpayment(
        &self,
        tx: &TopUpTransaction,
        settlement: &Settlement,
    ) -> AppResult<Option<(TopUpTransaction, String)>> {
        let Some(paid) = settlement.amount.filter(|paid| *paid < tx.total_amount) else {
            return Ok(None);
        };

        warn!(
            event_type = "reconciliation",
            tx_id = %tx.id,
            expected = %tx.total_amount,
            paid = %paid,
            settlement_reference = %settlement.settlement_reference,
            "Provider reported an underpayment, leaving transaction for manual review"
        );

        let flagged = self
            .topups
            .annotate(
                tx.id,
                json!({
                    "underpayment": {
                        "expected": tx.total_amount,
                        "received": paid,
                        "settlement_reference": settlement.settlement_reference,
                    }
                }),
            )
            .await?;
        let reason = format!("underpaid: expected {}, received {}", tx.total_amount, paid);
        Ok(Some((flagged, reason)))
    }

    fn not_cancellable(tx: &TopUpTransaction, reason: String) -> AppError {
        AppError::domain(DomainError::NotCancellable {
            transaction_id: tx.id.to_string(),
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::{InMemoryTopUpStore, InMemoryWalletLedger};
    use crate::payments::types::{CallbackEvent, PaymentIntent};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    struct StaticProvider;

    #[async_trait]
    impl PaymentProvider for StaticProvider {
        fn rail(&self) -> Rail {
            Rail::BankTransfer
        }

        async fn create_intent(&self, request: IntentRequest) -> AppResult<PaymentIntent> {
            Ok(PaymentIntent {
                correlation_id: format!("REF-{}", request.reference),
                instructions: PaymentInstructions::BankTransfer {
                    bank_name: "Test Bank".to_string(),
                    account_number: "0001".to_string(),
                    account_name: "Wallet Top-ups".to_string(),
                    payment_reference: format!("REF-{}", request.reference),
                    amount: request.amount,
                    currency: request.currency,
                    expires_at: Utc::now(),
                },
                metadata: json!({}),
            })
        }

        async fn query_status(&self, _correlation_id: &str) -> AppResult<PaymentStatus> {
            Ok(PaymentStatus::Pending)
        }

        fn verify_callback(&self, _payload: &[u8], _signature: &str) -> AppResult<CallbackEvent> {
            Err(AppError::domain(DomainError::InvalidSignature {
                rail: "bank_transfer".to_string(),
            }))
        }
    }

    async fn orchestrator() -> (TopUpOrchestrator, InMemoryWalletLedger) {
        let topups = InMemoryTopUpStore::new();
        let wallets = InMemoryWalletLedger::new(topups.clone());
        wallets
            .open_wallet("user-1", "KES", dec!(1000000))
            .await
            .unwrap();

        let orchestrator = TopUpOrchestrator::new(
            Arc::new(topups),
            Arc::new(wallets.clone()),
            FeePolicy::new(dec!(1000000), 180).unwrap(),
            OrchestratorConfig::default(),
        )
        .with_provider(Arc::new(StaticProvider));

        (orchestrator, wallets)
    }

    #[tokio::test]
    async fn test_initiate_attaches_intent() {
        let (orchestrator, _) = orchestrator().await;
        let started = orchestrator
            .initiate("user-1", Rail::BankTransfer, dec!(5000), RailInput::BankTransfer)
            .await
            .unwrap();

        assert_eq!(started.transaction.status, TopUpStatus::Pending);
        assert_eq!(started.transaction.fee, dec!(25));
        assert_eq!(started.transaction.total_amount, dec!(5025));
        assert_eq!(
            started.transaction.provider_reference,
            Some(format!("REF-{}", started.transaction.reference))
        );
    }

    #[tokio::test]
    async fn test_unregistered_rail_is_unavailable() {
        let (orchestrator, _) = orchestrator().await;
        let err = orchestrator
            .initiate(
                "user-1",
                Rail::MobileMoney,
                dec!(1000),
                RailInput::MobileMoney {
                    phone_number: "0712345678".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "RAIL_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_history_paging() {
        let (orchestrator, _) = orchestrator().await;
        for _ in 0..3 {
            orchestrator
                .initiate("user-1", Rail::BankTransfer, dec!(1000), RailInput::BankTransfer)
                .await
                .unwrap();
        }

        let page = orchestrator.list_history("user-1", 2, 2).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 1);

        let clamped = orchestrator.list_history("user-1", 1, 500).await.unwrap();
        assert_eq!(clamped.limit, MAX_PAGE_SIZE);

        assert!(orchestrator.list_history("user-1", 0, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_other_users_cannot_see_transaction() {
        let (orchestrator, _) = orchestrator().await;
        let started = orchestrator
            .initiate("user-1", Rail::BankTransfer, dec!(1000), RailInput::BankTransfer)
            .await
            .unwrap();

        let err = orchestrator
            .verify(started.transaction.id, "user-2")
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "TRANSACTION_NOT_FOUND");
    }
}
