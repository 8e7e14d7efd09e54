//! Shared fixtures: a scriptable rail adapter, a ledger that can be made to fail,
//! and a fully wired in-memory orchestrator.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use topup_engine::database::error::{DatabaseError, DatabaseErrorKind, DbResult};
use topup_engine::database::memory::{InMemoryTopUpStore, InMemoryWalletLedger};
use topup_engine::database::repository::{
    CreditOutcome, DayWindow, StatusChange, TopUpStore, TransitionOutcome, WalletLedger,
};
use topup_engine::database::topup_repository::{NewTopUp, TopUpStatus, TopUpTransaction};
use topup_engine::database::wallet_repository::Wallet;
use topup_engine::error::{AppError, AppResult, DomainError};
use topup_engine::payments::signature::{sign_hmac_sha256, verify_hmac_sha256};
use topup_engine::payments::types::{
    CallbackEvent, IntentRequest, PaymentInstructions, PaymentIntent, PaymentStatus, Rail,
    RailInput, Settlement,
};
use topup_engine::payments::PaymentProvider;
use topup_engine::services::{FeePolicy, OrchestratorConfig, TopUpNotifier, TopUpOrchestrator};
use uuid::Uuid;

pub const CALLBACK_SECRET: &str = "test-callback-secret";
pub const USER: &str = "user-1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentMode {
    Succeed,
    Fail,
    Hang,
}

/// Rail adapter whose answers are set by the test
pub struct MockProvider {
    rail: Rail,
    intent_mode: Mutex<IntentMode>,
    status: Mutex<PaymentStatus>,
    pub intents_created: AtomicUsize,
    pub status_queries: AtomicUsize,
}

impl MockProvider {
    pub fn new(rail: Rail) -> Self {
        Self {
            rail,
            intent_mode: Mutex::new(IntentMode::Succeed),
            status: Mutex::new(PaymentStatus::Pending),
            intents_created: AtomicUsize::new(0),
            status_queries: AtomicUsize::new(0),
        }
    }

    pub fn set_intent_mode(&self, mode: IntentMode) {
        *self.intent_mode.lock().unwrap() = mode;
    }

    pub fn set_status(&self, status: PaymentStatus) {
        *self.status.lock().unwrap() = status;
    }
}

#[derive(Debug, Deserialize)]
struct MockCallback {
    correlation_id: String,
    status: String,
    #[serde(default)]
    settlement_reference: Option<String>,
    #[serde(default)]
    amount: Option<Decimal>,
    #[serde(default)]
    reason: Option<String>,
}

#[async_trait]
impl PaymentProvider for MockProvider {
    fn rail(&self) -> Rail {
        self.rail
    }

    async fn create_intent(&self, request: IntentRequest) -> AppResult<PaymentIntent> {
        let mode = *self.intent_mode.lock().unwrap();
        match mode {
            IntentMode::Succeed => {}
            IntentMode::Fail => {
                return Err(AppError::provider("mock", "upstream rejected the request", true))
            }
            IntentMode::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Err(AppError::provider("mock", "unreachable", true));
            }
        }

        self.intents_created.fetch_add(1, Ordering::SeqCst);
        let correlation_id = format!("MOCK-{}", request.reference);
        let instructions = match request.rail_input {
            RailInput::MobileMoney { phone_number } => PaymentInstructions::MobileMoneyPrompt {
                phone_number,
                message: "Enter your PIN to confirm".to_string(),
            },
            RailInput::BankTransfer => PaymentInstructions::BankTransfer {
                bank_name: "Test Bank".to_string(),
                account_number: "0011223344".to_string(),
                account_name: "Wallet Collections".to_string(),
                payment_reference: correlation_id.clone(),
                amount: request.amount,
                currency: request.currency,
                expires_at: Utc::now() + chrono::Duration::hours(24),
            },
        };

        Ok(PaymentIntent {
            correlation_id,
            instructions,
            metadata: json!({ "mock": true }),
        })
    }

    async fn query_status(&self, _correlation_id: &str) -> AppResult<PaymentStatus> {
        self.status_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.status.lock().unwrap().clone())
    }

    fn verify_callback(&self, payload: &[u8], signature: &str) -> AppResult<CallbackEvent> {
        let invalid = || {
            AppError::domain(DomainError::InvalidSignature {
                rail: self.rail.to_string(),
            })
        };
        if !verify_hmac_sha256(CALLBACK_SECRET, payload, signature) {
            return Err(invalid());
        }
        let callback: MockCallback = serde_json::from_slice(payload).map_err(|_| invalid())?;

        let status = match callback.status.as_str() {
            "completed" => PaymentStatus::Completed(Settlement {
                settlement_reference: callback
                    .settlement_reference
                    .unwrap_or_else(|| "RCPT-1".to_string()),
                amount: callback.amount,
                metadata: json!({}),
            }),
            "failed" => PaymentStatus::Failed {
                reason: callback.reason.unwrap_or_else(|| "declined".to_string()),
            },
            _ => PaymentStatus::Pending,
        };

        Ok(CallbackEvent {
            correlation_id: callback.correlation_id,
            status,
        })
    }
}

/// Body and signature for a mock callback
pub fn signed_callback(body: serde_json::Value) -> (Vec<u8>, String) {
    let payload = serde_json::to_vec(&body).unwrap();
    let signature = sign_hmac_sha256(CALLBACK_SECRET, &payload);
    (payload, signature)
}

pub fn settlement(reference: &str) -> Settlement {
    Settlement {
        settlement_reference: reference.to_string(),
        amount: None,
        metadata: json!({}),
    }
}

/// Ledger that fails its first `failures` credits, then delegates
pub struct FlakyLedger {
    inner: InMemoryWalletLedger,
    failures_left: AtomicU32,
    pub credit_calls: AtomicU32,
    pub credits_applied: AtomicU32,
}

impl FlakyLedger {
    pub fn new(inner: InMemoryWalletLedger, failures: u32) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(failures),
            credit_calls: AtomicU32::new(0),
            credits_applied: AtomicU32::new(0),
        }
    }

    pub fn heal(&self) {
        self.failures_left.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl WalletLedger for FlakyLedger {
    async fn find_wallet(&self, user_id: &str) -> DbResult<Option<Wallet>> {
        self.inner.find_wallet(user_id).await
    }

    async fn open_wallet(
        &self,
        user_id: &str,
        currency: &str,
        daily_limit: Decimal,
    ) -> DbResult<Wallet> {
        self.inner.open_wallet(user_id, currency, daily_limit).await
    }

    async fn credit_once(
        &self,
        user_id: &str,
        transaction_id: Uuid,
        amount: Decimal,
        business_date: NaiveDate,
    ) -> DbResult<CreditOutcome> {
        self.credit_calls.fetch_add(1, Ordering::SeqCst);

        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(DatabaseError::new(DatabaseErrorKind::ConnectionTimeout));
        }

        let outcome = self
            .inner
            .credit_once(user_id, transaction_id, amount, business_date)
            .await?;
        if matches!(outcome, CreditOutcome::Applied { .. }) {
            self.credits_applied.fetch_add(1, Ordering::SeqCst);
        }
        Ok(outcome)
    }
}

/// Top-up store whose `attach_intent` fails with pool exhaustion while failures remain
pub struct FlakyStore {
    inner: InMemoryTopUpStore,
    attach_failures_left: AtomicU32,
    pub attach_calls: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: InMemoryTopUpStore, attach_failures: u32) -> Self {
        Self {
            inner,
            attach_failures_left: AtomicU32::new(attach_failures),
            attach_calls: AtomicU32::new(0),
        }
    }

    pub fn heal(&self) {
        self.attach_failures_left.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl TopUpStore for FlakyStore {
    async fn create(&self, draft: NewTopUp) -> DbResult<TopUpTransaction> {
        self.inner.create(draft).await
    }

    async fn find_by_id(&self, id: Uuid) -> DbResult<Option<TopUpTransaction>> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_provider_reference(
        &self,
        rail: Rail,
        provider_reference: &str,
    ) -> DbResult<Option<TopUpTransaction>> {
        self.inner
            .find_by_provider_reference(rail, provider_reference)
            .await
    }

    async fn attach_intent(
        &self,
        id: Uuid,
        provider_reference: &str,
        metadata: Value,
    ) -> DbResult<TransitionOutcome> {
        self.attach_calls.fetch_add(1, Ordering::SeqCst);

        let should_fail = self
            .attach_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(DatabaseError::new(DatabaseErrorKind::PoolExhausted));
        }

        self.inner.attach_intent(id, provider_reference, metadata).await
    }

    async fn annotate(&self, id: Uuid, metadata: Value) -> DbResult<TopUpTransaction> {
        self.inner.annotate(id, metadata).await
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: TopUpStatus,
        next: TopUpStatus,
        change: StatusChange,
    ) -> DbResult<TransitionOutcome> {
        self.inner.transition(id, expected, next, change).await
    }

    async fn find_pending_older_than(
        &self,
        age: chrono::Duration,
        limit: i64,
    ) -> DbResult<Vec<TopUpTransaction>> {
        self.inner.find_pending_older_than(age, limit).await
    }

    async fn find_by_status(
        &self,
        status: TopUpStatus,
        limit: i64,
    ) -> DbResult<Vec<TopUpTransaction>> {
        self.inner.find_by_status(status, limit).await
    }

    async fn sum_completed_or_pending_for_user_on_day(
        &self,
        user_id: &str,
        day: DayWindow,
    ) -> DbResult<Decimal> {
        self.inner
            .sum_completed_or_pending_for_user_on_day(user_id, day)
            .await
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> DbResult<Vec<TopUpTransaction>> {
        self.inner.list_for_user(user_id, limit, offset).await
    }

    async fn count_for_user(&self, user_id: &str) -> DbResult<i64> {
        self.inner.count_for_user(user_id).await
    }
}

/// Collects the ids of completed top-ups
#[derive(Default)]
pub struct RecordingNotifier {
    pub completed: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl TopUpNotifier for RecordingNotifier {
    async fn topup_completed(&self, transaction: &TopUpTransaction, _wallet: &Wallet) {
        self.completed.lock().unwrap().push(transaction.id);
    }
}

pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        provider_timeout: Duration::from_millis(200),
        credit_max_retries: 2,
        credit_retry_base_delay: Duration::from_millis(1),
        ..OrchestratorConfig::default()
    }
}

pub struct Harness {
    pub orchestrator: Arc<TopUpOrchestrator>,
    pub topups: InMemoryTopUpStore,
    pub store: Arc<FlakyStore>,
    pub wallets: InMemoryWalletLedger,
    pub ledger: Arc<FlakyLedger>,
    pub mobile: Arc<MockProvider>,
    pub bank: Arc<MockProvider>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_ledger_failures(0).await
    }

    /// The first `failures` wallet credits fail with a retryable database error
    pub async fn with_ledger_failures(failures: u32) -> Self {
        Self::with_failures(failures, 0).await
    }

    /// The first `failures` correlation id writes fail with a retryable database error
    pub async fn with_intent_write_failures(failures: u32) -> Self {
        Self::with_failures(0, failures).await
    }

    async fn with_failures(ledger_failures: u32, attach_failures: u32) -> Self {
        let topups = InMemoryTopUpStore::new();
        let wallets = InMemoryWalletLedger::new(topups.clone());
        wallets
            .open_wallet(USER, "KES", dec!(1000000))
            .await
            .unwrap();

        let store = Arc::new(FlakyStore::new(topups.clone(), attach_failures));
        let ledger = Arc::new(FlakyLedger::new(wallets.clone(), ledger_failures));
        let mobile = Arc::new(MockProvider::new(Rail::MobileMoney));
        let bank = Arc::new(MockProvider::new(Rail::BankTransfer));
        let notifier = Arc::new(RecordingNotifier::default());

        let orchestrator = TopUpOrchestrator::new(
            store.clone(),
            ledger.clone(),
            FeePolicy::new(dec!(1000000), 180).unwrap(),
            test_config(),
        )
        .with_provider(mobile.clone())
        .with_provider(bank.clone())
        .with_notifier(notifier.clone());

        Self {
            orchestrator: Arc::new(orchestrator),
            topups,
            store,
            wallets,
            ledger,
            mobile,
            bank,
            notifier,
        }
    }

    pub async fn balance(&self, user_id: &str) -> Decimal {
        self.wallets
            .find_wallet(user_id)
            .await
            .unwrap()
            .map(|w| w.balance)
            .unwrap_or_default()
    }

    /// Start a mobile-money top-up for `USER`
    pub async fn start_mobile(&self, amount: Decimal) -> TopUpTransaction {
        self.orchestrator
            .initiate(
                USER,
                Rail::MobileMoney,
                amount,
                RailInput::MobileMoney {
                    phone_number: "0712345678".to_string(),
                },
            )
            .await
            .unwrap()
            .transaction
    }

    pub async fn start_bank(&self, amount: Decimal) -> TopUpTransaction {
        self.orchestrator
            .initiate(USER, Rail::BankTransfer, amount, RailInput::BankTransfer)
            .await
            .unwrap()
            .transaction
    }
}
