use crate::database::error::{DatabaseError, DatabaseErrorKind, DbResult};
use crate::database::repository::{CreditOutcome, StatusChange, WalletLedger};
use crate::database::topup_repository::{find_on, transition_on, TopUpStatus};
use crate::database::transaction::DatabaseTransaction;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use tracing::{info, warn};
use uuid::Uuid;

#[cfg(feature = "cache")]
use crate::cache::{keys::wallet::BalanceKey, Cache, RedisCache};
#[cfg(feature = "cache")]
use tracing::debug;

#[cfg(feature = "cache")]
const BALANCE_TTL: std::time::Duration = std::time::Duration::from_secs(60);

/// Wallet entity, one per user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Wallet {
    pub id: Uuid,
    pub user_id: String,
    pub currency: String,
    pub balance: Decimal,
    /// Amount credited on `last_transaction_date`
    pub daily_spent: Decimal,
    pub daily_limit: Decimal,
    pub is_active: bool,
    pub is_frozen: bool,
    pub last_transaction_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(user_id: &str, currency: &str, daily_limit: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            currency: currency.to_string(),
            balance: Decimal::ZERO,
            daily_spent: Decimal::ZERO,
            daily_limit,
            is_active: true,
            is_frozen: false,
            last_transaction_date: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Why the wallet cannot take new top-ups, if it cannot
    pub fn unavailable_reason(&self) -> Option<&'static str> {
        if !self.is_active {
            Some("wallet is inactive")
        } else if self.is_frozen {
            Some("wallet is frozen")
        } else {
            None
        }
    }

    /// Apply a credit in memory, rolling the daily accumulator over on a new business date
    pub(crate) fn apply_credit(&mut self, amount: Decimal, business_date: NaiveDate) {
        self.balance += amount;
        if self.last_transaction_date == Some(business_date) {
            self.daily_spent += amount;
        } else {
            self.daily_spent = amount;
        }
        self.last_transaction_date = Some(business_date);
        self.updated_at = Utc::now();
    }
}

const COLUMNS: &str = "id, user_id, currency, balance, daily_spent, daily_limit, is_active, is_frozen, \
                       last_transaction_date, created_at, updated_at";

/// Postgres-backed wallet ledger
pub struct WalletRepository {
    pool: PgPool,
    #[cfg(feature = "cache")]
    cache: Option<RedisCache>,
}

impl WalletRepository {
    /// Create a new repository without caching
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            #[cfg(feature = "cache")]
            cache: None,
        }
    }

    /// Create a new repository with Redis balance caching enabled
    #[cfg(feature = "cache")]
    pub fn with_cache(pool: PgPool, cache: RedisCache) -> Self {
        Self {
            pool,
            cache: Some(cache),
        }
    }

    /// Current balance, served from the cache when one is configured
    pub async fn balance(&self, user_id: &str) -> DbResult<Option<Decimal>> {
        #[cfg(feature = "cache")]
        if let Some(ref cache) = self.cache {
            let key = BalanceKey::new(user_id).to_string();
            if let Ok(Some(balance)) = <RedisCache as Cache<Decimal>>::get(cache, &key).await {
                debug!("Cache hit for wallet balance: {}", user_id);
                return Ok(Some(balance));
            }
        }

        let balance = self.find_wallet(user_id).await?.map(|wallet| wallet.balance);

        #[cfg(feature = "cache")]
        if let (Some(cache), Some(balance)) = (self.cache.as_ref(), balance) {
            let key = BalanceKey::new(user_id).to_string();
            if let Err(e) =
                <RedisCache as Cache<Decimal>>::set(cache, &key, &balance, Some(BALANCE_TTL)).await
            {
                debug!("Failed to cache wallet balance: {}", e);
            }
        }

        Ok(balance)
    }

    #[cfg(feature = "cache")]
    async fn invalidate_balance(&self, user_id: &str) {
        if let Some(ref cache) = self.cache {
            let key = BalanceKey::new(user_id).to_string();
            if let Err(e) = <RedisCache as Cache<Decimal>>::delete(cache, &key).await {
                debug!("Failed to invalidate wallet balance cache: {}", e);
            }
        }
    }
}

#[async_trait]
impl WalletLedger for WalletRepository {
    async fn find_wallet(&self, user_id: &str) -> DbResult<Option<Wallet>> {
        sqlx::query_as::<_, Wallet>(&format!(
            "SELECT {} FROM wallets WHERE user_id = $1",
            COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn open_wallet(
        &self,
        user_id: &str,
        currency: &str,
        daily_limit: Decimal,
    ) -> DbResult<Wallet> {
        sqlx::query_as::<_, Wallet>(&format!(
            "INSERT INTO wallets (id, user_id, currency, balance, daily_spent, daily_limit, is_active, is_frozen)
             VALUES ($1, $2, $3, 0, 0, $4, TRUE, FALSE)
             RETURNING {}",
            COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(currency)
        .bind(daily_limit)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn credit_once(
        &self,
        user_id: &str,
        transaction_id: Uuid,
        amount: Decimal,
        business_date: NaiveDate,
    ) -> DbResult<CreditOutcome> {
        let mut db_tx = DatabaseTransaction::begin(&self.pool).await?;

        // Row lock serializes every credit to this wallet until commit
        let wallet = sqlx::query_as::<_, Wallet>(&format!(
            "SELECT {} FROM wallets WHERE user_id = $1 FOR UPDATE",
            COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(db_tx.conn()?)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .ok_or_else(|| DatabaseError::not_found("Wallet", user_id))?;

        if let Some(reason) = wallet.unavailable_reason() {
            warn!(user_id = %user_id, tx_id = %transaction_id, reason, "Crediting settled payment to restricted wallet");
        }

        let settled = transition_on(
            db_tx.conn()?,
            transaction_id,
            TopUpStatus::CompletedPendingCredit,
            TopUpStatus::Completed,
            StatusChange::default(),
        )
        .await?;

        let transaction = match settled {
            Some(tx) => tx,
            None => {
                let current = find_on(db_tx.conn()?, transaction_id)
                    .await?
                    .ok_or_else(|| DatabaseError::not_found("TopUpTransaction", transaction_id))?;
                db_tx.rollback().await?;
                return Ok(CreditOutcome::AlreadyApplied(current));
            }
        };

        if transaction.user_id != user_id {
            return Err(DatabaseError::new(DatabaseErrorKind::TransactionError {
                message: format!("transaction {} does not belong to {}", transaction_id, user_id),
                retryable: false,
            }));
        }

        let wallet = sqlx::query_as::<_, Wallet>(&format!(
            "UPDATE wallets
             SET balance = balance + $2,
                 daily_spent = CASE WHEN last_transaction_date = $3 THEN daily_spent + $2 ELSE $2 END,
                 last_transaction_date = $3,
                 updated_at = NOW()
             WHERE id = $1
             RETURNING {}",
            COLUMNS
        ))
        .bind(wallet.id)
        .bind(amount)
        .bind(business_date)
        .fetch_one(db_tx.conn()?)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        db_tx.commit().await?;

        info!(
            user_id = %user_id,
            tx_id = %transaction_id,
            amount = %amount,
            balance = %wallet.balance,
            "Wallet credited"
        );

        #[cfg(feature = "cache")]
        self.invalidate_balance(user_id).await;

        Ok(CreditOutcome::Applied {
            wallet,
            transaction,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_credit_accumulates_within_a_day() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let mut wallet = Wallet::new("user-1", "KES", dec!(1000000));

        wallet.apply_credit(dec!(1000), day);
        wallet.apply_credit(dec!(500), day);

        assert_eq!(wallet.balance, dec!(1500));
        assert_eq!(wallet.daily_spent, dec!(1500));
    }

    #[test]
    fn test_credit_resets_accumulator_on_new_day() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let mut wallet = Wallet::new("user-1", "KES", dec!(1000000));

        wallet.apply_credit(dec!(1000), day);
        wallet.apply_credit(dec!(200), day.succ_opt().unwrap());

        assert_eq!(wallet.balance, dec!(1200));
        assert_eq!(wallet.daily_spent, dec!(200));
    }

    #[test]
    fn test_unavailable_reason() {
        let mut wallet = Wallet::new("user-1", "KES", dec!(1000000));
        assert!(wallet.unavailable_reason().is_none());
        wallet.is_frozen = true;
        assert_eq!(wallet.unavailable_reason(), Some("wallet is frozen"));
        wallet.is_active = false;
        assert_eq!(wallet.unavailable_reason(), Some("wallet is inactive"));
    }
}
