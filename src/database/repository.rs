use crate::database::error::{DatabaseError, DatabaseErrorKind, DbResult};
use crate::database::topup_repository::{NewTopUp, TopUpStatus, TopUpTransaction};
use crate::database::wallet_repository::Wallet;
use crate::payments::types::Rail;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use uuid::Uuid;

/// Half-open `[start, end)` UTC interval covering one calendar day in the reference timezone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DayWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// Side data written together with a status change
#[derive(Debug, Clone, Default)]
pub struct StatusChange {
    /// Shallow-merged into the transaction's metadata object
    pub metadata: Option<Value>,
    pub failure_reason: Option<String>,
}

impl StatusChange {
    pub fn with_metadata(metadata: Value) -> Self {
        Self {
            metadata: Some(metadata),
            failure_reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            metadata: None,
            failure_reason: Some(reason.into()),
        }
    }
}

/// Result of a compare-and-set. A conflict is an expected outcome, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(TopUpTransaction),
    Conflict(TopUpTransaction),
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }

    pub fn into_inner(self) -> TopUpTransaction {
        match self {
            TransitionOutcome::Applied(tx) | TransitionOutcome::Conflict(tx) => tx,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreditOutcome {
    /// Balance credited and the transaction flipped to COMPLETED in one unit of work
    Applied {
        wallet: Wallet,
        transaction: TopUpTransaction,
    },
    /// Another caller already finished this transaction; nothing was credited
    AlreadyApplied(TopUpTransaction),
}

/// Persistence for top-up lifecycle records
#[async_trait]
pub trait TopUpStore: Send + Sync {
    /// Insert a new PENDING record
    async fn create(&self, draft: NewTopUp) -> DbResult<TopUpTransaction>;

    async fn find_by_id(&self, id: Uuid) -> DbResult<Option<TopUpTransaction>>;

    /// Find the transaction a provider correlation id belongs to
    async fn find_by_provider_reference(
        &self,
        rail: Rail,
        provider_reference: &str,
    ) -> DbResult<Option<TopUpTransaction>>;

    /// Store the provider correlation id and intent metadata while the record is PENDING
    async fn attach_intent(
        &self,
        id: Uuid,
        provider_reference: &str,
        metadata: Value,
    ) -> DbResult<TransitionOutcome>;

    /// Shallow-merge `metadata` into the record whatever its status. Used to keep facts that
    /// arrive after a record stopped accepting transitions (late or short settlements).
    async fn annotate(&self, id: Uuid, metadata: Value) -> DbResult<TopUpTransaction>;

    /// Atomically move `id` from `expected` to `next`
    async fn transition(
        &self,
        id: Uuid,
        expected: TopUpStatus,
        next: TopUpStatus,
        change: StatusChange,
    ) -> DbResult<TransitionOutcome>;

    async fn find_pending_older_than(
        &self,
        age: Duration,
        limit: i64,
    ) -> DbResult<Vec<TopUpTransaction>>;

    async fn find_by_status(&self, status: TopUpStatus, limit: i64)
        -> DbResult<Vec<TopUpTransaction>>;

    /// Sum of requested amounts that count against the daily limit
    async fn sum_completed_or_pending_for_user_on_day(
        &self,
        user_id: &str,
        day: DayWindow,
    ) -> DbResult<Decimal>;

    /// Newest first
    async fn list_for_user(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> DbResult<Vec<TopUpTransaction>>;

    async fn count_for_user(&self, user_id: &str) -> DbResult<i64>;
}

/// Wallet balances. Every mutation runs under that wallet's exclusive lock.
#[async_trait]
pub trait WalletLedger: Send + Sync {
    async fn find_wallet(&self, user_id: &str) -> DbResult<Option<Wallet>>;

    /// Create the wallet that accompanies a newly registered user
    async fn open_wallet(
        &self,
        user_id: &str,
        currency: &str,
        daily_limit: Decimal,
    ) -> DbResult<Wallet>;

    /// Credit `amount` exactly once for `transaction_id`.
    ///
    /// Under the wallet lock the transaction is flipped
    /// COMPLETED_PENDING_CREDIT -> COMPLETED and the balance incremented, both or neither.
    async fn credit_once(
        &self,
        user_id: &str,
        transaction_id: Uuid,
        amount: Decimal,
        business_date: NaiveDate,
    ) -> DbResult<CreditOutcome>;
}

/// Rejects status changes the state machine does not allow
pub(crate) fn ensure_transition(expected: TopUpStatus, next: TopUpStatus) -> DbResult<()> {
    if expected.can_transition_to(next) {
        Ok(())
    } else {
        Err(DatabaseError::new(DatabaseErrorKind::InvalidTransition {
            from: expected.to_string(),
            to: next.to_string(),
        }))
    }
}

/// Shallow JSON object merge, same semantics as Postgres `jsonb || jsonb`
pub(crate) fn merge_metadata(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                existing.insert(key, value);
            }
        }
        (target, patch) => *target = patch,
    }
}
