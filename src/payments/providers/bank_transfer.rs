//! Bank transfer adapter
//!
//! The payer pushes funds from their own bank to our collection account quoting a
//! generated payment reference. There is no status API: the collecting bank posts a
//! signed notification once the transfer lands.

use crate::error::{AppError, AppResult, DomainError, ValidationError};
use crate::payments::signature::verify_hmac_sha512;
use crate::payments::traits::PaymentProvider;
use crate::payments::types::{
    decimal_from_json, CallbackEvent, IntentRequest, PaymentInstructions, PaymentIntent,
    PaymentStatus, Rail, RailInput, Settlement,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

/// Collection account and notification settings
#[derive(Debug, Clone)]
pub struct BankTransferConfig {
    pub bank_name: String,
    pub account_number: String,
    pub account_name: String,
    /// Secret the bank uses to sign transfer notifications
    pub webhook_secret: String,
    pub reference_prefix: String,
    /// How long a generated payment reference is advertised as valid
    pub intent_ttl_hours: i64,
}

impl Default for BankTransferConfig {
    fn default() -> Self {
        Self {
            bank_name: String::new(),
            account_number: String::new(),
            account_name: String::new(),
            webhook_secret: String::new(),
            reference_prefix: "WTU".to_string(),
            intent_ttl_hours: 24,
        }
    }
}

impl BankTransferConfig {
    pub fn from_env() -> AppResult<Self> {
        let required = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| {
                    AppError::configuration(format!("{} environment variable is required", name))
                })
        };
        let defaults = Self::default();

        Ok(Self {
            bank_name: required("BANK_COLLECTION_BANK_NAME")?,
            account_number: required("BANK_COLLECTION_ACCOUNT_NUMBER")?,
            account_name: required("BANK_COLLECTION_ACCOUNT_NAME")?,
            webhook_secret: required("BANK_WEBHOOK_SECRET")?,
            reference_prefix: std::env::var("BANK_REFERENCE_PREFIX")
                .unwrap_or(defaults.reference_prefix),
            intent_ttl_hours: std::env::var("BANK_INTENT_TTL_HOURS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.intent_ttl_hours),
        })
    }
}

pub struct BankTransferProvider {
    config: BankTransferConfig,
}

impl BankTransferProvider {
    pub fn new(config: BankTransferConfig) -> Self {
        Self { config }
    }

    pub fn from_env() -> AppResult<Self> {
        Ok(Self::new(BankTransferConfig::from_env()?))
    }

    /// Prefix plus 12 upper-case hex characters drawn from a v4 UUID (48 random bits)
    fn generate_payment_reference(&self) -> String {
        let random = Uuid::new_v4().simple().to_string().to_uppercase();
        format!("{}{}", self.config.reference_prefix, &random[..12])
    }
}

fn invalid_signature() -> AppError {
    AppError::domain(DomainError::InvalidSignature {
        rail: Rail::BankTransfer.to_string(),
    })
}

#[async_trait]
impl PaymentProvider for BankTransferProvider {
    fn rail(&self) -> Rail {
        Rail::BankTransfer
    }

    async fn create_intent(&self, request: IntentRequest) -> AppResult<PaymentIntent> {
        if request.rail_input != RailInput::BankTransfer {
            return Err(AppError::validation(ValidationError::RailInputMismatch {
                rail: Rail::BankTransfer.to_string(),
            }));
        }

        let payment_reference = self.generate_payment_reference();
        let expires_at = Utc::now() + Duration::hours(self.config.intent_ttl_hours);

        info!(
            "Bank transfer intent created: reference={}, payment_reference={}, amount={} {}",
            request.reference, payment_reference, request.amount, request.currency
        );

        Ok(PaymentIntent {
            correlation_id: payment_reference.clone(),
            instructions: PaymentInstructions::BankTransfer {
                bank_name: self.config.bank_name.clone(),
                account_number: self.config.account_number.clone(),
                account_name: self.config.account_name.clone(),
                payment_reference: payment_reference.clone(),
                amount: request.amount,
                currency: request.currency.clone(),
                expires_at,
            },
            metadata: json!({
                "payment_reference": payment_reference,
                "destination": {
                    "bank_name": self.config.bank_name,
                    "account_number": self.config.account_number,
                },
                "expires_at": expires_at,
            }),
        })
    }

    async fn query_status(&self, _correlation_id: &str) -> AppResult<PaymentStatus> {
        Ok(PaymentStatus::Pending)
    }

    fn verify_callback(&self, payload: &[u8], signature: &str) -> AppResult<CallbackEvent> {
        if !verify_hmac_sha512(&self.config.webhook_secret, payload, signature) {
            warn!(rail = "bank_transfer", "Callback signature mismatch");
            return Err(invalid_signature());
        }

        let notification: TransferNotification = serde_json::from_slice(payload).map_err(|e| {
            warn!(rail = "bank_transfer", "Signed callback has unexpected shape: {}", e);
            invalid_signature()
        })?;
        let data = notification.data;

        let status = match notification.event.as_str() {
            "transfer.received" => {
                let session_id = data.session_id.clone().ok_or_else(|| {
                    warn!(rail = "bank_transfer", "Received transfer without session id");
                    invalid_signature()
                })?;
                PaymentStatus::Completed(Settlement {
                    settlement_reference: session_id,
                    amount: data.amount.as_ref().and_then(decimal_from_json),
                    metadata: json!({
                        "session_id": data.session_id,
                        "sender_name": data.sender_name,
                        "sender_account": data.sender_account,
                        "received_at": data.received_at,
                    }),
                })
            }
            "transfer.failed" | "transfer.reversed" => PaymentStatus::Failed {
                reason: data
                    .reason
                    .clone()
                    .unwrap_or_else(|| notification.event.clone()),
            },
            _ => PaymentStatus::Pending,
        };

        Ok(CallbackEvent {
            correlation_id: data.payment_reference,
            status,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TransferNotification {
    event: String,
    data: TransferData,
}

#[derive(Debug, Deserialize)]
struct TransferData {
    payment_reference: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    amount: Option<serde_json::Value>,
    #[serde(default)]
    sender_name: Option<String>,
    #[serde(default)]
    sender_account: Option<String>,
    #[serde(default)]
    received_at: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::signature::sign_hmac_sha512;
    use rust_decimal_macros::dec;

    fn create_test_provider() -> BankTransferProvider {
        BankTransferProvider::new(BankTransferConfig {
            bank_name: "Equity Bank".to_string(),
            account_number: "0123456789".to_string(),
            account_name: "Wallet Collections".to_string(),
            webhook_secret: "bank-secret".to_string(),
            ..BankTransferConfig::default()
        })
    }

    fn intent_request() -> IntentRequest {
        IntentRequest {
            transaction_id: Uuid::new_v4(),
            reference: "TU-20240101-ABCDEF12".to_string(),
            user_id: "user-1".to_string(),
            amount: dec!(5025),
            currency: "KES".to_string(),
            rail_input: RailInput::BankTransfer,
        }
    }

    #[tokio::test]
    async fn test_intent_has_unique_reference_and_instructions() {
        let provider = create_test_provider();
        let first = provider.create_intent(intent_request()).await.unwrap();
        let second = provider.create_intent(intent_request()).await.unwrap();

        assert_ne!(first.correlation_id, second.correlation_id);
        assert!(first.correlation_id.starts_with("WTU"));
        assert_eq!(first.correlation_id.len(), 15);

        match first.instructions {
            PaymentInstructions::BankTransfer {
                amount,
                payment_reference,
                expires_at,
                ..
            } => {
                assert_eq!(amount, dec!(5025));
                assert_eq!(payment_reference, first.correlation_id);
                assert!(expires_at > Utc::now() + Duration::hours(23));
            }
            other => panic!("unexpected instructions {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_status_query_is_always_pending() {
        let provider = create_test_provider();
        assert_eq!(
            provider.query_status("WTU000000000000").await.unwrap(),
            PaymentStatus::Pending
        );
    }

    #[test]
    fn test_received_notification() {
        let provider = create_test_provider();
        let payload = json!({
            "event": "transfer.received",
            "data": {
                "payment_reference": "WTU1A2B3C4D5E6F",
                "session_id": "000015240101120000123456789012",
                "amount": "5025.00",
                "sender_name": "JANE DOE"
            }
        })
        .to_string();
        let signature = sign_hmac_sha512("bank-secret", payload.as_bytes());

        let event = provider.verify_callback(payload.as_bytes(), &signature).unwrap();
        assert_eq!(event.correlation_id, "WTU1A2B3C4D5E6F");
        match event.status {
            PaymentStatus::Completed(settlement) => {
                assert_eq!(settlement.settlement_reference, "000015240101120000123456789012");
                assert_eq!(settlement.amount, Some(dec!(5025)));
            }
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_is_pending() {
        let provider = create_test_provider();
        let payload = r#"{"event":"transfer.initiated","data":{"payment_reference":"WTU1"}}"#;
        let signature = sign_hmac_sha512("bank-secret", payload.as_bytes());

        let event = provider.verify_callback(payload.as_bytes(), &signature).unwrap();
        assert_eq!(event.status, PaymentStatus::Pending);
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let provider = create_test_provider();
        let payload = r#"{"event":"transfer.received","data":{"payment_reference":"WTU1"}}"#;
        let signature = sign_hmac_sha512("not-the-secret", payload.as_bytes());

        let err = provider.verify_callback(payload.as_bytes(), &signature).unwrap_err();
        assert!(err.is_invalid_signature());
    }
}
