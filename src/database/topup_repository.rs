use crate::database::error::{DatabaseError, DbResult};
use crate::database::repository::{
    ensure_transition, DayWindow, StatusChange, TopUpStore, TransitionOutcome,
};
use crate::payments::types::Rail;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{FromRow, PgConnection, PgPool};
use std::fmt;
use uuid::Uuid;

/// Top-up lifecycle
///
/// ```text
/// PENDING -> COMPLETED_PENDING_CREDIT -> COMPLETED
/// PENDING -> FAILED
/// PENDING -> CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "topup_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TopUpStatus {
    Pending,
    /// Payment confirmed by the provider, wallet credit not yet durable
    CompletedPendingCredit,
    Completed,
    Failed,
    Cancelled,
}

impl TopUpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopUpStatus::Pending => "PENDING",
            TopUpStatus::CompletedPendingCredit => "COMPLETED_PENDING_CREDIT",
            TopUpStatus::Completed => "COMPLETED",
            TopUpStatus::Failed => "FAILED",
            TopUpStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TopUpStatus::Completed | TopUpStatus::Failed | TopUpStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TopUpStatus) -> bool {
        matches!(
            (self, next),
            (TopUpStatus::Pending, TopUpStatus::CompletedPendingCredit)
                | (TopUpStatus::Pending, TopUpStatus::Failed)
                | (TopUpStatus::Pending, TopUpStatus::Cancelled)
                | (TopUpStatus::CompletedPendingCredit, TopUpStatus::Completed)
        )
    }

    /// Statuses whose amounts count against the daily limit
    pub fn counts_toward_daily_limit(&self) -> bool {
        matches!(
            self,
            TopUpStatus::Pending | TopUpStatus::CompletedPendingCredit | TopUpStatus::Completed
        )
    }
}

impl fmt::Display for TopUpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-up transaction entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TopUpTransaction {
    pub id: Uuid,
    pub reference: String,
    pub user_id: String,
    pub rail: Rail,
    pub amount: Decimal,
    pub fee: Decimal,
    pub total_amount: Decimal,
    pub currency: String,
    pub status: TopUpStatus,
    /// Provider correlation id (checkout request id, bank payment reference)
    pub provider_reference: Option<String>,
    pub metadata: Value,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TopUpTransaction {
    /// Settlement reference recorded when the provider confirmed the payment
    pub fn settlement_reference(&self) -> Option<&str> {
        self.metadata
            .get("settlement_reference")
            .and_then(Value::as_str)
    }
}

/// Values for a new PENDING record
#[derive(Debug, Clone)]
pub struct NewTopUp {
    pub reference: String,
    pub user_id: String,
    pub rail: Rail,
    pub amount: Decimal,
    pub fee: Decimal,
    pub total_amount: Decimal,
    pub currency: String,
}

impl NewTopUp {
    pub(crate) fn into_transaction(self, now: DateTime<Utc>) -> TopUpTransaction {
        TopUpTransaction {
            id: Uuid::new_v4(),
            reference: self.reference,
            user_id: self.user_id,
            rail: self.rail,
            amount: self.amount,
            fee: self.fee,
            total_amount: self.total_amount,
            currency: self.currency,
            status: TopUpStatus::Pending,
            provider_reference: None,
            metadata: json!({}),
            failure_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Human-readable reference, e.g. `TU-20240115-3F9A1C2B`
pub fn generate_reference(now: DateTime<Utc>) -> String {
    let random = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("TU-{}-{}", now.format("%Y%m%d"), &random[..8])
}

const COLUMNS: &str = "id, reference, user_id, rail, amount, fee, total_amount, currency, status, \
                       provider_reference, metadata, failure_reason, created_at, updated_at, completed_at";

/// Compare-and-set on an arbitrary connection so the wallet ledger can run it
/// inside its own database transaction.
pub(crate) async fn transition_on(
    conn: &mut PgConnection,
    id: Uuid,
    expected: TopUpStatus,
    next: TopUpStatus,
    change: StatusChange,
) -> DbResult<Option<TopUpTransaction>> {
    ensure_transition(expected, next)?;

    sqlx::query_as::<_, TopUpTransaction>(&format!(
        "UPDATE topup_transactions
         SET status = $3,
             metadata = metadata || $4,
             failure_reason = COALESCE($5, failure_reason),
             completed_at = CASE WHEN $3 = 'completed'::topup_status THEN NOW() ELSE completed_at END,
             updated_at = NOW()
         WHERE id = $1 AND status = $2
         RETURNING {}",
        COLUMNS
    ))
    .bind(id)
    .bind(expected)
    .bind(next)
    .bind(change.metadata.unwrap_or_else(|| json!({})))
    .bind(change.failure_reason)
    .fetch_optional(&mut *conn)
    .await
    .map_err(DatabaseError::from_sqlx)
}

pub(crate) async fn find_on(conn: &mut PgConnection, id: Uuid) -> DbResult<Option<TopUpTransaction>> {
    sqlx::query_as::<_, TopUpTransaction>(&format!(
        "SELECT {} FROM topup_transactions WHERE id = $1",
        COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(DatabaseError::from_sqlx)
}

/// Postgres-backed top-up store
#[derive(Clone)]
pub struct TopUpRepository {
    pool: PgPool,
}

impl TopUpRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn conflict_or_missing(&self, id: Uuid) -> DbResult<TransitionOutcome> {
        match self.find_by_id(id).await? {
            Some(current) => Ok(TransitionOutcome::Conflict(current)),
            None => Err(DatabaseError::not_found("TopUpTransaction", id)),
        }
    }
}

#[async_trait]
impl TopUpStore for TopUpRepository {
    async fn create(&self, draft: NewTopUp) -> DbResult<TopUpTransaction> {
        sqlx::query_as::<_, TopUpTransaction>(&format!(
            "INSERT INTO topup_transactions
                 (id, reference, user_id, rail, amount, fee, total_amount, currency, status, metadata)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', '{{}}'::jsonb)
             RETURNING {}",
            COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&draft.reference)
        .bind(&draft.user_id)
        .bind(draft.rail)
        .bind(draft.amount)
        .bind(draft.fee)
        .bind(draft.total_amount)
        .bind(&draft.currency)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn find_by_id(&self, id: Uuid) -> DbResult<Option<TopUpTransaction>> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from_sqlx)?;
        find_on(&mut conn, id).await
    }

    async fn find_by_provider_reference(
        &self,
        rail: Rail,
        provider_reference: &str,
    ) -> DbResult<Option<TopUpTransaction>> {
        sqlx::query_as::<_, TopUpTransaction>(&format!(
            "SELECT {} FROM topup_transactions WHERE rail = $1 AND provider_reference = $2",
            COLUMNS
        ))
        .bind(rail)
        .bind(provider_reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn attach_intent(
        &self,
        id: Uuid,
        provider_reference: &str,
        metadata: Value,
    ) -> DbResult<TransitionOutcome> {
        let updated = sqlx::query_as::<_, TopUpTransaction>(&format!(
            "UPDATE topup_transactions
             SET provider_reference = $2, metadata = metadata || $3, updated_at = NOW()
             WHERE id = $1 AND status = 'pending'
             RETURNING {}",
            COLUMNS
        ))
        .bind(id)
        .bind(provider_reference)
        .bind(metadata)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        match updated {
            Some(tx) => Ok(TransitionOutcome::Applied(tx)),
            None => self.conflict_or_missing(id).await,
        }
    }

    async fn annotate(&self, id: Uuid, metadata: Value) -> DbResult<TopUpTransaction> {
        sqlx::query_as::<_, TopUpTransaction>(&format!(
            "UPDATE topup_transactions
             SET metadata = metadata || $2, updated_at = NOW()
             WHERE id = $1
             RETURNING {}",
            COLUMNS
        ))
        .bind(id)
        .bind(metadata)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .ok_or_else(|| DatabaseError::not_found("TopUpTransaction", id))
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: TopUpStatus,
        next: TopUpStatus,
        change: StatusChange,
    ) -> DbResult<TransitionOutcome> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from_sqlx)?;

        match transition_on(&mut conn, id, expected, next, change).await? {
            Some(tx) => Ok(TransitionOutcome::Applied(tx)),
            None => match find_on(&mut conn, id).await? {
                Some(current) => Ok(TransitionOutcome::Conflict(current)),
                None => Err(DatabaseError::not_found("TopUpTransaction", id)),
            },
        }
    }

    async fn find_pending_older_than(
        &self,
        age: Duration,
        limit: i64,
    ) -> DbResult<Vec<TopUpTransaction>> {
        sqlx::query_as::<_, TopUpTransaction>(&format!(
            "SELECT {} FROM topup_transactions
             WHERE status = 'pending' AND created_at < $1
             ORDER BY created_at ASC LIMIT $2",
            COLUMNS
        ))
        .bind(Utc::now() - age)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn find_by_status(
        &self,
        status: TopUpStatus,
        limit: i64,
    ) -> DbResult<Vec<TopUpTransaction>> {
        sqlx::query_as::<_, TopUpTransaction>(&format!(
            "SELECT {} FROM topup_transactions
             WHERE status = $1
             ORDER BY updated_at ASC LIMIT $2",
            COLUMNS
        ))
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn sum_completed_or_pending_for_user_on_day(
        &self,
        user_id: &str,
        day: DayWindow,
    ) -> DbResult<Decimal> {
        sqlx::query_scalar::<_, Decimal>(
            "SELECT COALESCE(SUM(amount), 0) FROM topup_transactions
             WHERE user_id = $1
               AND status IN ('pending', 'completed_pending_credit', 'completed')
               AND created_at >= $2 AND created_at < $3",
        )
        .bind(user_id)
        .bind(day.start)
        .bind(day.end)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> DbResult<Vec<TopUpTransaction>> {
        sqlx::query_as::<_, TopUpTransaction>(&format!(
            "SELECT {} FROM topup_transactions
             WHERE user_id = $1
             ORDER BY created_at DESC LIMIT $2 OFFSET $3",
            COLUMNS
        ))
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn count_for_user(&self, user_id: &str) -> DbResult<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM topup_transactions WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
    }
}
