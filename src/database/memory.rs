//! In-process store and ledger
//!
//! Same contracts as the Postgres repositories, backed by maps behind async locks.
//! Used by the test-suite and for running the engine without a database.

use crate::database::error::{DatabaseError, DatabaseErrorKind, DbResult};
use crate::database::repository::{
    ensure_transition, merge_metadata, CreditOutcome, DayWindow, StatusChange, TopUpStore,
    TransitionOutcome, WalletLedger,
};
use crate::database::topup_repository::{NewTopUp, TopUpStatus, TopUpTransaction};
use crate::database::wallet_repository::Wallet;
use crate::payments::types::Rail;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

#[derive(Default, Clone)]
pub struct InMemoryTopUpStore {
    records: Arc<RwLock<HashMap<Uuid, TopUpTransaction>>>,
}

impl InMemoryTopUpStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shift a record's creation time into the past
    pub async fn backdate(&self, id: Uuid, by: Duration) -> DbResult<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::not_found("TopUpTransaction", id))?;
        record.created_at -= by;
        Ok(())
    }
}

#[async_trait]
impl TopUpStore for InMemoryTopUpStore {
    async fn create(&self, draft: NewTopUp) -> DbResult<TopUpTransaction> {
        let mut records = self.records.write().await;
        if records.values().any(|r| r.reference == draft.reference) {
            return Err(DatabaseError::new(
                DatabaseErrorKind::UniqueConstraintViolation {
                    constraint: "topup_transactions_reference_key".to_string(),
                },
            ));
        }

        let record = draft.into_transaction(Utc::now());
        records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn find_by_id(&self, id: Uuid) -> DbResult<Option<TopUpTransaction>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn find_by_provider_reference(
        &self,
        rail: Rail,
        provider_reference: &str,
    ) -> DbResult<Option<TopUpTransaction>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.rail == rail && r.provider_reference.as_deref() == Some(provider_reference))
            .cloned())
    }

    async fn attach_intent(
        &self,
        id: Uuid,
        provider_reference: &str,
        metadata: Value,
    ) -> DbResult<TransitionOutcome> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::not_found("TopUpTransaction", id))?;

        if record.status != TopUpStatus::Pending {
            return Ok(TransitionOutcome::Conflict(record.clone()));
        }

        record.provider_reference = Some(provider_reference.to_string());
        merge_metadata(&mut record.metadata, metadata);
        record.updated_at = Utc::now();
        Ok(TransitionOutcome::Applied(record.clone()))
    }

    async fn annotate(&self, id: Uuid, metadata: Value) -> DbResult<TopUpTransaction> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::not_found("TopUpTransaction", id))?;

        merge_metadata(&mut record.metadata, metadata);
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: TopUpStatus,
        next: TopUpStatus,
        change: StatusChange,
    ) -> DbResult<TransitionOutcome> {
        ensure_transition(expected, next)?;

        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::not_found("TopUpTransaction", id))?;

        if record.status != expected {
            return Ok(TransitionOutcome::Conflict(record.clone()));
        }

        let now = Utc::now();
        record.status = next;
        record.updated_at = now;
        if let Some(patch) = change.metadata {
            merge_metadata(&mut record.metadata, patch);
        }
        if change.failure_reason.is_some() {
            record.failure_reason = change.failure_reason;
        }
        if next == TopUpStatus::Completed {
            record.completed_at = Some(now);
        }

        Ok(TransitionOutcome::Applied(record.clone()))
    }

    async fn find_pending_older_than(
        &self,
        age: Duration,
        limit: i64,
    ) -> DbResult<Vec<TopUpTransaction>> {
        let cutoff = Utc::now() - age;
        let mut pending: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.status == TopUpStatus::Pending && r.created_at < cutoff)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn find_by_status(
        &self,
        status: TopUpStatus,
        limit: i64,
    ) -> DbResult<Vec<TopUpTransaction>> {
        let mut matching: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.updated_at);
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn sum_completed_or_pending_for_user_on_day(
        &self,
        user_id: &str,
        day: DayWindow,
    ) -> DbResult<Decimal> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| {
                r.user_id == user_id
                    && r.status.counts_toward_daily_limit()
                    && day.contains(r.created_at)
            })
            .map(|r| r.amount)
            .sum())
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> DbResult<Vec<TopUpTransaction>> {
        let mut history: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(history
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn count_for_user(&self, user_id: &str) -> DbResult<i64> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.user_id == user_id)
            .count() as i64)
    }
}

/// Wallet ledger over an [`InMemoryTopUpStore`]
///
/// Each wallet has its own async mutex; the credit and the status flip happen while it is held.
#[derive(Clone)]
pub struct InMemoryWalletLedger {
    wallets: Arc<RwLock<HashMap<String, Wallet>>>,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    topups: InMemoryTopUpStore,
}

impl InMemoryWalletLedger {
    pub fn new(topups: InMemoryTopUpStore) -> Self {
        Self {
            wallets: Arc::new(RwLock::new(HashMap::new())),
            locks: Arc::new(Mutex::new(HashMap::new())),
            topups,
        }
    }

    /// Flip the active/frozen flags, as an account-management collaborator would
    pub async fn set_flags(&self, user_id: &str, is_active: bool, is_frozen: bool) -> DbResult<()> {
        let mut wallets = self.wallets.write().await;
        let wallet = wallets
            .get_mut(user_id)
            .ok_or_else(|| DatabaseError::not_found("Wallet", user_id))?;
        wallet.is_active = is_active;
        wallet.is_frozen = is_frozen;
        Ok(())
    }

    async fn wallet_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl WalletLedger for InMemoryWalletLedger {
    async fn find_wallet(&self, user_id: &str) -> DbResult<Option<Wallet>> {
        Ok(self.wallets.read().await.get(user_id).cloned())
    }

    async fn open_wallet(
        &self,
        user_id: &str,
        currency: &str,
        daily_limit: Decimal,
    ) -> DbResult<Wallet> {
        let mut wallets = self.wallets.write().await;
        if wallets.contains_key(user_id) {
            return Err(DatabaseError::new(
                DatabaseErrorKind::UniqueConstraintViolation {
                    constraint: "wallets_user_id_key".to_string(),
                },
            ));
        }

        let wallet = Wallet::new(user_id, currency, daily_limit);
        wallets.insert(user_id.to_string(), wallet.clone());
        Ok(wallet)
    }

    async fn credit_once(
        &self,
        user_id: &str,
        transaction_id: Uuid,
        amount: Decimal,
        business_date: NaiveDate,
    ) -> DbResult<CreditOutcome> {
        let lock = self.wallet_lock(user_id).await;
        let _guard = lock.lock().await;

        if !self.wallets.read().await.contains_key(user_id) {
            return Err(DatabaseError::not_found("Wallet", user_id));
        }

        let transaction = match self
            .topups
            .transition(
                transaction_id,
                TopUpStatus::CompletedPendingCredit,
                TopUpStatus::Completed,
                StatusChange::default(),
            )
            .await?
        {
            TransitionOutcome::Applied(tx) => tx,
            TransitionOutcome::Conflict(current) => {
                return Ok(CreditOutcome::AlreadyApplied(current))
            }
        };

        let mut wallets = self.wallets.write().await;
        let wallet = wallets
            .get_mut(user_id)
            .ok_or_else(|| DatabaseError::not_found("Wallet", user_id))?;
        wallet.apply_credit(amount, business_date);

        Ok(CreditOutcome::Applied {
            wallet: wallet.clone(),
            transaction,
        })
    }
}
