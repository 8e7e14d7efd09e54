use crate::database::error::{DatabaseError, DatabaseErrorKind, DbResult};
use sqlx::{PgConnection, PgPool, Postgres, Transaction as SqlxTransaction};
use tracing::{debug, error as log_error};

/// Unit of work over a single Postgres transaction.
///
/// Dropping it without calling [`commit`](Self::commit) rolls everything back,
/// so an early `?` return inside a credit leaves balances and statuses untouched.
pub struct DatabaseTransaction {
    transaction: Option<SqlxTransaction<'static, Postgres>>,
}

impl DatabaseTransaction {
    pub async fn begin(pool: &PgPool) -> DbResult<Self> {
        debug!("Beginning database transaction");

        let transaction = pool.begin().await.map_err(|e| {
            log_error!("Failed to begin transaction: {}", e);
            DatabaseError::from_sqlx(e)
        })?;

        Ok(Self {
            transaction: Some(transaction),
        })
    }

    pub async fn commit(mut self) -> DbResult<()> {
        let tx = self.transaction.take().ok_or_else(finished)?;
        debug!("Committing transaction");

        tx.commit().await.map_err(|e| {
            log_error!("Failed to commit transaction: {}", e);
            DatabaseError::from_sqlx(e)
        })
    }

    pub async fn rollback(mut self) -> DbResult<()> {
        let tx = self.transaction.take().ok_or_else(finished)?;
        debug!("Rolling back transaction");

        tx.rollback().await.map_err(|e| {
            log_error!("Failed to rollback transaction: {}", e);
            DatabaseError::from_sqlx(e)
        })
    }

    /// Connection bound to the open transaction, for use as a query executor.
    pub fn conn(&mut self) -> DbResult<&mut PgConnection> {
        self.transaction.as_deref_mut().ok_or_else(finished)
    }
}

fn finished() -> DatabaseError {
    DatabaseError::new(DatabaseErrorKind::TransactionError {
        message: "Transaction already completed".to_string(),
        retryable: false,
    })
}
