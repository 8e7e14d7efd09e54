//! Fee & limit policy
//!
//! Pure rules: per-rail fee schedule, amount bounds and the per-user daily ceiling.
//! Nothing here touches storage; callers pass in what has already been spent today.

use crate::database::repository::DayWindow;
use crate::error::{AppError, AppResult, DomainError};
use crate::payments::types::Rail;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use tracing::debug;

/// Fee schedule and amount bounds for one rail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RailRules {
    /// Percentage fee, as a fraction (0.01 = 1%)
    pub fee_rate: Decimal,
    pub min_fee: Decimal,
    pub min_amount: Decimal,
    pub max_amount: Decimal,
}

impl RailRules {
    pub fn for_rail(rail: Rail) -> Self {
        match rail {
            Rail::MobileMoney => Self {
                fee_rate: Decimal::new(1, 2),
                min_fee: Decimal::from(10),
                min_amount: Decimal::from(10),
                max_amount: Decimal::from(150_000),
            },
            Rail::BankTransfer => Self {
                fee_rate: Decimal::new(5, 3),
                min_fee: Decimal::from(25),
                min_amount: Decimal::from(100),
                max_amount: Decimal::from(10_000_000),
            },
        }
    }
}

/// Deterministic fee for `amount` on `rail`.
///
/// The percentage part is rounded up to whole units so the total is always chargeable.
pub fn compute_fee(rail: Rail, amount: Decimal) -> Decimal {
    let rules = RailRules::for_rail(rail);
    let percentage =
        (amount * rules.fee_rate).round_dp_with_strategy(0, RoundingStrategy::AwayFromZero);
    percentage.max(rules.min_fee)
}

pub fn validate_amount(rail: Rail, amount: Decimal) -> AppResult<()> {
    let rules = RailRules::for_rail(rail);

    let reason = if amount <= Decimal::ZERO {
        Some("amount must be positive".to_string())
    } else if !amount.fract().is_zero() {
        Some("amount must be in whole units".to_string())
    } else if amount < rules.min_amount {
        Some(format!("below the {} minimum of {}", rail, rules.min_amount))
    } else if amount > rules.max_amount {
        Some(format!("above the {} maximum of {}", rail, rules.max_amount))
    } else {
        None
    };

    match reason {
        Some(reason) => Err(AppError::domain(DomainError::InvalidAmount {
            amount: amount.normalize().to_string(),
            reason,
        })),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Quote {
    pub amount: Decimal,
    pub fee: Decimal,
    pub total: Decimal,
}

/// Validate `amount` and price it
pub fn quote(rail: Rail, amount: Decimal) -> AppResult<Quote> {
    validate_amount(rail, amount)?;
    let fee = compute_fee(rail, amount);
    Ok(Quote {
        amount,
        fee,
        total: amount + fee,
    })
}

/// Daily ceiling evaluated in a fixed business timezone
#[derive(Debug, Clone, Copy)]
pub struct FeePolicy {
    daily_cap: Decimal,
    timezone: FixedOffset,
}

impl FeePolicy {
    pub fn new(daily_cap: Decimal, timezone_offset_minutes: i32) -> AppResult<Self> {
        let timezone = FixedOffset::east_opt(timezone_offset_minutes * 60).ok_or_else(|| {
            AppError::configuration(format!(
                "invalid timezone offset: {} minutes",
                timezone_offset_minutes
            ))
        })?;

        Ok(Self {
            daily_cap,
            timezone,
        })
    }

    pub fn daily_cap(&self) -> Decimal {
        self.daily_cap
    }

    /// Calendar date of `at` in the business timezone
    pub fn business_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.timezone).date_naive()
    }

    /// UTC bounds of the business day containing `at`
    pub fn day_window(&self, at: DateTime<Utc>) -> DayWindow {
        let local_midnight = self.business_date(at).and_time(NaiveTime::MIN);
        let offset = Duration::seconds(i64::from(self.timezone.local_minus_utc()));
        let start = Utc.from_utc_datetime(&(local_midnight - offset));

        DayWindow {
            start,
            end: start + Duration::days(1),
        }
    }

    /// Rejects `amount` when it would push today's total over the effective ceiling.
    ///
    /// The ceiling is the lower of the configured cap and the wallet's own limit.
    /// Concurrent initiations may both pass; the limit is soft.
    pub fn check_daily_limit(
        &self,
        user_id: &str,
        amount: Decimal,
        spent_today: Decimal,
        wallet_limit: Option<Decimal>,
    ) -> AppResult<()> {
        let limit = match wallet_limit {
            Some(wallet_limit) if wallet_limit < self.daily_cap => wallet_limit,
            _ => self.daily_cap,
        };

        if spent_today + amount > limit {
            debug!(
                user_id,
                %limit,
                %spent_today,
                %amount,
                "Daily top-up limit would be exceeded"
            );
            return Err(AppError::domain(DomainError::DailyLimitExceeded {
                limit: limit.normalize().to_string(),
                spent_today: spent_today.normalize().to_string(),
                attempted: amount.normalize().to_string(),
            }));
        }

        Ok(())
    }
}
