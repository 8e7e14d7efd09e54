//! Integration tests for the PostgreSQL ledger and the Redis layer
//!
//! These tests require a running Redis instance and a migrated database.
//! Run with: REDIS_URL=redis://localhost:6379 DATABASE_URL=postgres://... cargo test --features cache --test cache_integration_test -- --ignored

#[cfg(feature = "cache")]
mod cache_tests {
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::time::Duration;
    use topup_engine::cache::{init_cache_pool, CacheConfig, RateLimiter, RedisCache};
    use topup_engine::database::repository::{
        CreditOutcome, StatusChange, TopUpStore, WalletLedger,
    };
    use topup_engine::database::topup_repository::{
        generate_reference, NewTopUp, TopUpRepository, TopUpStatus,
    };
    use topup_engine::database::wallet_repository::WalletRepository;
    use topup_engine::database::{init_pool, run_migrations, PoolConfig};
    use topup_engine::payments::types::Rail;
    use uuid::Uuid;

    async fn setup_cache() -> RedisCache {
        let config = CacheConfig {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            ..Default::default()
        };

        let pool = init_cache_pool(config)
            .await
            .expect("Failed to init cache pool");
        RedisCache::new(pool)
    }

    async fn setup_db() -> sqlx::PgPool {
        let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = init_pool(&database_url, Some(PoolConfig::default()))
            .await
            .expect("Failed to init DB pool");
        run_migrations(&pool)
            .await
            .expect("Failed to run migrations");
        pool
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL and Redis"]
    async fn test_credit_once_and_balance_cache() {
        let cache = setup_cache().await;
        let db_pool = setup_db().await;

        let wallets = WalletRepository::with_cache(db_pool.clone(), cache);
        let topups = TopUpRepository::new(db_pool);
        let user_id = format!("it-{}", Uuid::new_v4());

        wallets
            .open_wallet(&user_id, "KES", dec!(1000000))
            .await
            .expect("Failed to open wallet");

        // Prime the cache with the opening balance
        assert_eq!(wallets.balance(&user_id).await.unwrap(), Some(dec!(0)));

        let tx = topups
            .create(NewTopUp {
                reference: generate_reference(Utc::now()),
                user_id: user_id.clone(),
                rail: Rail::MobileMoney,
                amount: dec!(1000),
                fee: dec!(10),
                total_amount: dec!(1010),
                currency: "KES".to_string(),
            })
            .await
            .expect("Failed to create top-up");

        let settled = topups
            .transition(
                tx.id,
                TopUpStatus::Pending,
                TopUpStatus::CompletedPendingCredit,
                StatusChange::with_metadata(serde_json::json!({ "settlement_reference": "RCPT-IT" })),
            )
            .await
            .unwrap();
        assert!(settled.is_applied());

        let today = Utc::now().date_naive();
        let first = wallets
            .credit_once(&user_id, tx.id, tx.amount, today)
            .await
            .unwrap();
        assert!(matches!(first, CreditOutcome::Applied { .. }));

        let second = wallets
            .credit_once(&user_id, tx.id, tx.amount, today)
            .await
            .unwrap();
        assert!(matches!(second, CreditOutcome::AlreadyApplied(_)));

        // The credit invalidated the cached opening balance
        assert_eq!(wallets.balance(&user_id).await.unwrap(), Some(dec!(1000)));

        let stored = topups.find_by_id(tx.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TopUpStatus::Completed);
        assert_eq!(stored.settlement_reference(), Some("RCPT-IT"));
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL"]
    async fn test_concurrent_transition_has_one_winner() {
        let db_pool = setup_db().await;
        let topups = Arc::new(TopUpRepository::new(db_pool));

        let tx_id = topups
            .create(NewTopUp {
                reference: generate_reference(Utc::now()),
                user_id: format!("it-{}", Uuid::new_v4()),
                rail: Rail::BankTransfer,
                amount: dec!(5000),
                fee: dec!(25),
                total_amount: dec!(5025),
                currency: "KES".to_string(),
            })
            .await
            .unwrap()
            .id;

        let mut handles = Vec::new();
        for _ in 0..5 {
            let topups = topups.clone();
            handles.push(tokio::spawn(async move {
                topups
                    .transition(
                        tx_id,
                        TopUpStatus::Pending,
                        TopUpStatus::Cancelled,
                        StatusChange::failed("cancelled by user"),
                    )
                    .await
                    .unwrap()
                    .is_applied()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_rate_limiter_shares_redis_counters() {
        let cache = Arc::new(setup_cache().await);
        let subject = format!("it-{}", Uuid::new_v4());

        // Two limiters over one store behave like two replicas
        let first = RateLimiter::new(cache.clone(), "it", 2, Duration::from_secs(60));
        let second = RateLimiter::new(cache, "it", 2, Duration::from_secs(60));

        assert!(first.check(&subject).await.is_ok());
        assert!(second.check(&subject).await.is_ok());
        assert!(first.check(&subject).await.is_err());
    }
}
