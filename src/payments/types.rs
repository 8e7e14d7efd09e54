//! Payment rail types and data structures
//!
//! Common types shared by the rail adapters and the top-up orchestrator.

use crate::error::{AppError, AppResult, ValidationError};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Channel through which external money enters a wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_rail", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Rail {
    MobileMoney,
    BankTransfer,
}

impl Rail {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rail::MobileMoney => "mobile_money",
            Rail::BankTransfer => "bank_transfer",
        }
    }

    /// HTTP header carrying the callback signature for this rail
    pub fn signature_header(&self) -> &'static str {
        match self {
            Rail::MobileMoney => "x-callback-signature",
            Rail::BankTransfer => "x-bank-signature",
        }
    }
}

impl fmt::Display for Rail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Rail {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mobile_money" | "mobile-money" | "mpesa" => Ok(Rail::MobileMoney),
            "bank_transfer" | "bank-transfer" | "bank" => Ok(Rail::BankTransfer),
            other => Err(AppError::validation(ValidationError::InvalidParameter {
                field: "rail".to_string(),
                reason: format!("unknown rail '{}'", other),
            })),
        }
    }
}

/// Rail-specific details supplied by the payer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rail", rename_all = "snake_case")]
pub enum RailInput {
    MobileMoney { phone_number: String },
    BankTransfer,
}

impl RailInput {
    pub fn rail(&self) -> Rail {
        match self {
            RailInput::MobileMoney { .. } => Rail::MobileMoney,
            RailInput::BankTransfer => Rail::BankTransfer,
        }
    }

    /// Checks the input belongs to `rail` and returns it in canonical form.
    pub fn normalize(self, rail: Rail) -> AppResult<Self> {
        if self.rail() != rail {
            return Err(AppError::validation(ValidationError::RailInputMismatch {
                rail: rail.to_string(),
            }));
        }

        match self {
            RailInput::MobileMoney { phone_number } => {
                let normalized = normalize_phone_number(&phone_number).ok_or_else(|| {
                    AppError::validation(ValidationError::InvalidPhoneNumber {
                        value: phone_number.clone(),
                    })
                })?;
                Ok(RailInput::MobileMoney {
                    phone_number: normalized,
                })
            }
            RailInput::BankTransfer => Ok(RailInput::BankTransfer),
        }
    }
}

/// Normalizes a Kenyan mobile number to the `2547XXXXXXXX` / `2541XXXXXXXX` form.
pub fn normalize_phone_number(raw: &str) -> Option<String> {
    let digits: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
        .collect();
    let digits = digits.strip_prefix('+').unwrap_or(&digits);

    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let subscriber = match digits.len() {
        12 if digits.starts_with("254") => &digits[3..],
        10 if digits.starts_with('0') => &digits[1..],
        9 => digits,
        _ => return None,
    };

    if subscriber.starts_with('7') || subscriber.starts_with('1') {
        Some(format!("254{}", subscriber))
    } else {
        None
    }
}

/// Reads a money amount that a provider may send as a JSON number or string.
pub(crate) fn decimal_from_json(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        serde_json::Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

/// Request handed to a rail adapter to open a payment intent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentRequest {
    pub transaction_id: Uuid,
    /// Human-readable transaction reference
    pub reference: String,
    pub user_id: String,
    /// Total to collect from the payer (amount + fee)
    pub amount: Decimal,
    pub currency: String,
    pub rail_input: RailInput,
}

/// Provider-side handle for a payment in flight
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    /// Identifier used to poll the provider and to match callbacks
    pub correlation_id: String,
    pub instructions: PaymentInstructions,
    /// Opaque provider data persisted on the transaction
    pub metadata: serde_json::Value,
}

/// What the payer has to do next
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentInstructions {
    MobileMoneyPrompt {
        phone_number: String,
        message: String,
    },
    BankTransfer {
        bank_name: String,
        account_number: String,
        account_name: String,
        payment_reference: String,
        amount: Decimal,
        currency: String,
        expires_at: DateTime<Utc>,
    },
}

/// Proof of payment reported by a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub settlement_reference: String,
    /// Amount the provider says it collected, when it reports one
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Payment status as seen by a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Completed(Settlement),
    Failed { reason: String },
}

/// Authenticated, parsed provider callback
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackEvent {
    pub correlation_id: String,
    pub status: PaymentStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phone_number_formats() {
        assert_eq!(normalize_phone_number("0712345678").as_deref(), Some("254712345678"));
        assert_eq!(normalize_phone_number("+254 712-345-678").as_deref(), Some("254712345678"));
        assert_eq!(normalize_phone_number("110345678").as_deref(), Some("254110345678"));
        assert_eq!(normalize_phone_number("254112345678").as_deref(), Some("254112345678"));
    }

    #[test]
    fn test_phone_number_rejects_garbage() {
        assert!(normalize_phone_number("").is_none());
        assert!(normalize_phone_number("0812345678").is_none());
        assert!(normalize_phone_number("07123abc78").is_none());
        assert!(normalize_phone_number("2557123456789").is_none());
    }

    #[test]
    fn test_rail_input_must_match_rail() {
        let input = RailInput::MobileMoney {
            phone_number: "0712345678".to_string(),
        };
        assert!(input.clone().normalize(Rail::BankTransfer).is_err());
        assert_eq!(
            input.normalize(Rail::MobileMoney).unwrap(),
            RailInput::MobileMoney {
                phone_number: "254712345678".to_string()
            }
        );
    }

    #[test]
    fn test_rail_input_wire_format() {
        let input: RailInput =
            serde_json::from_str(r#"{"rail":"mobile_money","phone_number":"0712345678"}"#).unwrap();
        assert_eq!(input.rail(), Rail::MobileMoney);

        let input: RailInput = serde_json::from_str(r#"{"rail":"bank_transfer"}"#).unwrap();
        assert_eq!(input, RailInput::BankTransfer);
    }

    #[test]
    fn test_rail_from_str() {
        assert_eq!("mobile_money".parse::<Rail>().unwrap(), Rail::MobileMoney);
        assert_eq!("bank".parse::<Rail>().unwrap(), Rail::BankTransfer);
        assert!("card".parse::<Rail>().is_err());
    }
}
