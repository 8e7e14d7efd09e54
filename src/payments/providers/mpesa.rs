//! M-Pesa mobile-money adapter
//!
//! Uses the Daraja STK push API: the payer receives a prompt on their handset,
//! confirms with their PIN, and Safaricom posts the result to our callback URL.

use crate::error::{AppError, AppErrorKind, AppResult, DomainError, ExternalError, ValidationError};
use crate::logging::{mask_phone_number, redact_sensitive_data};
use crate::payments::signature::verify_hmac_sha256;
use crate::payments::traits::PaymentProvider;
use crate::payments::types::{
    decimal_from_json, CallbackEvent, IntentRequest, PaymentInstructions, PaymentIntent,
    PaymentStatus, Rail, RailInput, Settlement,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{FixedOffset, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

const PROVIDER: &str = "M-Pesa";

/// Daraja answers a status query with this code while the payer has not acted yet
const STILL_PROCESSING_ERROR: &str = "500.001.1001";
const STILL_PROCESSING_RESULT: &str = "4999";

/// Daraja timestamps are East Africa Time
const EAT_OFFSET_SECS: i32 = 3 * 3600;

/// M-Pesa provider configuration
#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    /// Paybill / till number receiving the funds
    pub shortcode: String,
    /// Lipa na M-Pesa online passkey
    pub passkey: String,
    /// Public URL Daraja posts STK results to
    pub callback_url: String,
    /// Shared secret of the callback relay that signs result payloads
    pub callback_secret: String,
    pub base_url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Maximum number of retries for throttled or unreachable requests
    pub max_retries: u32,
}

impl Default for MpesaConfig {
    fn default() -> Self {
        Self {
            consumer_key: String::new(),
            consumer_secret: String::new(),
            shortcode: String::new(),
            passkey: String::new(),
            callback_url: String::new(),
            callback_secret: String::new(),
            base_url: "https://sandbox.safaricom.co.ke".to_string(),
            timeout_secs: 30,
            max_retries: 2,
        }
    }
}

impl MpesaConfig {
    pub fn from_env() -> AppResult<Self> {
        let defaults = Self::default();

        Ok(Self {
            consumer_key: required_env("MPESA_CONSUMER_KEY")?,
            consumer_secret: required_env("MPESA_CONSUMER_SECRET")?,
            shortcode: required_env("MPESA_SHORTCODE")?,
            passkey: required_env("MPESA_PASSKEY")?,
            callback_url: required_env("MPESA_CALLBACK_URL")?,
            callback_secret: required_env("MPESA_CALLBACK_SECRET")?,
            base_url: std::env::var("MPESA_BASE_URL").unwrap_or(defaults.base_url),
            timeout_secs: std::env::var("MPESA_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.timeout_secs),
            max_retries: std::env::var("MPESA_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
        })
    }
}

fn required_env(name: &str) -> AppResult<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AppError::configuration(format!("{} environment variable is required", name)))
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// STK push adapter for the mobile-money rail
pub struct MpesaProvider {
    config: MpesaConfig,
    client: Client,
    token: RwLock<Option<CachedToken>>,
}

impl MpesaProvider {
    pub fn new(config: MpesaConfig) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            client,
            token: RwLock::new(None),
        })
    }

    pub fn from_env() -> AppResult<Self> {
        Self::new(MpesaConfig::from_env()?)
    }

    /// base64(shortcode + passkey + timestamp)
    fn password(&self, timestamp: &str) -> String {
        STANDARD.encode(format!(
            "{}{}{}",
            self.config.shortcode, self.config.passkey, timestamp
        ))
    }

    fn timestamp() -> String {
        let now = Utc::now();
        match FixedOffset::east_opt(EAT_OFFSET_SECS) {
            Some(eat) => now.with_timezone(&eat).format("%Y%m%d%H%M%S").to_string(),
            None => now.format("%Y%m%d%H%M%S").to_string(),
        }
    }

    /// OAuth client-credentials token, cached until shortly before expiry
    async fn access_token(&self) -> AppResult<String> {
        if let Some(token) = self.token.read().await.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let url = format!(
            "{}/oauth/v1/generate?grant_type=client_credentials",
            self.config.base_url
        );
        let request = self
            .client
            .get(&url)
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret));

        let (status, body) = self.send_with_retry(request).await?;
        if !status.is_success() {
            error!(
                "M-Pesa OAuth failed: HTTP {}: {}",
                status,
                redact_sensitive_data(&body)
            );
            return Err(AppError::provider(
                PROVIDER,
                format!("OAuth failed: HTTP {}", status),
                status.is_server_error(),
            ));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| AppError::provider(PROVIDER, format!("Invalid OAuth response: {}", e), false))?;

        let lifetime = token.expires_in.parse::<u64>().unwrap_or(3599);
        let expires_at = Instant::now() + Duration::from_secs(lifetime.saturating_sub(60));

        *self.token.write().await = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at,
        });

        Ok(token.access_token)
    }

    /// Sends a request, retrying transport errors, 429 and 503 with exponential backoff.
    ///
    /// Returns the final status and body; interpreting non-2xx answers is left to the caller
    /// because Daraja reports "still processing" as an error response.
    async fn send_with_retry(&self, request: RequestBuilder) -> AppResult<(StatusCode, String)> {
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            let req = request.try_clone().ok_or_else(|| {
                AppError::provider(PROVIDER, "Failed to clone request", false)
            })?;

            match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();

                    let throttled = status == StatusCode::TOO_MANY_REQUESTS
                        || status == StatusCode::SERVICE_UNAVAILABLE;
                    if throttled && attempt < self.config.max_retries {
                        let backoff = 2_u64.pow(attempt);
                        warn!(
                            "M-Pesa returned {}, retrying after {} seconds (attempt {})",
                            status,
                            backoff,
                            attempt + 1
                        );
                        tokio::time::sleep(Duration::from_secs(backoff)).await;
                        continue;
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        return Err(AppError::new(AppErrorKind::External(ExternalError::RateLimit {
                            service: PROVIDER.to_string(),
                            retry_after: Some(60),
                        })));
                    }

                    return Ok((status, body));
                }
                Err(e) => {
                    if attempt < self.config.max_retries {
                        let backoff = 2_u64.pow(attempt);
                        warn!(
                            "M-Pesa request error, retrying after {} seconds (attempt {}): {}",
                            backoff,
                            attempt + 1,
                            e
                        );
                        tokio::time::sleep(Duration::from_secs(backoff)).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if e.is_timeout() => Err(AppError::new(AppErrorKind::External(
                ExternalError::Timeout {
                    service: PROVIDER.to_string(),
                    timeout_secs: self.config.timeout_secs,
                },
            ))),
            other => Err(AppError::provider(
                PROVIDER,
                format!(
                    "Request failed after {} retries: {}",
                    self.config.max_retries,
                    other
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "Unknown error".to_string())
                ),
                true,
            )),
        }
    }

    async fn post_authorized(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> AppResult<(StatusCode, String)> {
        let token = self.access_token().await?;
        let url = format!("{}{}", self.config.base_url, endpoint);
        let request = self.client.post(&url).bearer_auth(token).json(body);
        self.send_with_retry(request).await
    }

    fn rejected(status: StatusCode, body: &str) -> AppError {
        let message = serde_json::from_str::<DarajaError>(body)
            .map(|e| format!("{}: {}", e.error_code, e.error_message))
            .unwrap_or_else(|_| format!("HTTP {}: {}", status, redact_sensitive_data(body)));
        error!("M-Pesa API error: {}", message);
        AppError::provider(PROVIDER, message, status.is_server_error())
    }
}

fn invalid_signature() -> AppError {
    AppError::domain(DomainError::InvalidSignature {
        rail: Rail::MobileMoney.to_string(),
    })
}

/// Interpret an STK status-query answer.
///
/// The query API does not return the M-Pesa receipt number, so a completion confirmed this
/// way carries the checkout request id as its settlement reference. The metadata says so
/// explicitly; the receipt only ever arrives through the callback.
fn status_from_query(correlation_id: &str, response: StkQueryResponse) -> PaymentStatus {
    let code = response.result_code.as_ref().map(result_code);
    match code.as_deref() {
        Some("0") => PaymentStatus::Completed(Settlement {
            settlement_reference: correlation_id.to_string(),
            amount: None,
            metadata: json!({
                "confirmed_via": "status_query",
                "settlement_reference_kind": "checkout_request_id",
                "receipt_number": null,
                "result_desc": response.result_desc,
            }),
        }),
        None | Some(STILL_PROCESSING_RESULT) => PaymentStatus::Pending,
        Some(other) => PaymentStatus::Failed {
            reason: response
                .result_desc
                .unwrap_or_else(|| format!("M-Pesa result code {}", other)),
        },
    }
}

fn result_code(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl PaymentProvider for MpesaProvider {
    fn rail(&self) -> Rail {
        Rail::MobileMoney
    }

    async fn create_intent(&self, request: IntentRequest) -> AppResult<PaymentIntent> {
        let phone_number = match &request.rail_input {
            RailInput::MobileMoney { phone_number } => phone_number.clone(),
            _ => {
                return Err(AppError::validation(ValidationError::RailInputMismatch {
                    rail: Rail::MobileMoney.to_string(),
                }))
            }
        };

        let amount = request.amount.ceil().to_u64().ok_or_else(|| {
            AppError::provider(PROVIDER, format!("Unsupported amount {}", request.amount), false)
        })?;

        info!(
            "Initiating M-Pesa STK push: {} {} {} to {}",
            request.amount,
            request.currency,
            request.reference,
            mask_phone_number(&phone_number)
        );

        let timestamp = Self::timestamp();
        let payload = json!({
            "BusinessShortCode": self.config.shortcode,
            "Password": self.password(&timestamp),
            "Timestamp": timestamp,
            "TransactionType": "CustomerPayBillOnline",
            "Amount": amount,
            "PartyA": phone_number,
            "PartyB": self.config.shortcode,
            "PhoneNumber": phone_number,
            "CallBackURL": self.config.callback_url,
            "AccountReference": request.reference,
            "TransactionDesc": "Wallet top-up",
        });

        let (status, body) = self
            .post_authorized("/mpesa/stkpush/v1/processrequest", &payload)
            .await?;
        if !status.is_success() {
            return Err(Self::rejected(status, &body));
        }

        let response: StkPushResponse = serde_json::from_str(&body).map_err(|e| {
            AppError::provider(PROVIDER, format!("Invalid response format: {}", e), false)
        })?;

        if response.response_code != "0" {
            error!("M-Pesa STK push refused: {}", response.response_description);
            return Err(AppError::provider(PROVIDER, response.response_description, false));
        }

        info!(
            "M-Pesa STK push accepted: reference={}, checkout_request_id={}",
            request.reference, response.checkout_request_id
        );

        Ok(PaymentIntent {
            correlation_id: response.checkout_request_id.clone(),
            instructions: PaymentInstructions::MobileMoneyPrompt {
                phone_number: phone_number.clone(),
                message: response.customer_message.unwrap_or_else(|| {
                    "Enter your M-Pesa PIN on your phone to complete the payment".to_string()
                }),
            },
            metadata: json!({
                "merchant_request_id": response.merchant_request_id,
                "checkout_request_id": response.checkout_request_id,
                "phone_number": phone_number,
            }),
        })
    }

    async fn query_status(&self, correlation_id: &str) -> AppResult<PaymentStatus> {
        info!("Querying M-Pesa STK status: checkout_request_id={}", correlation_id);

        let timestamp = Self::timestamp();
        let payload = json!({
            "BusinessShortCode": self.config.shortcode,
            "Password": self.password(&timestamp),
            "Timestamp": timestamp,
            "CheckoutRequestID": correlation_id,
        });

        let (status, body) = self
            .post_authorized("/mpesa/stkpushquery/v1/query", &payload)
            .await?;

        if !status.is_success() {
            if let Ok(err) = serde_json::from_str::<DarajaError>(&body) {
                if err.error_code == STILL_PROCESSING_ERROR {
                    return Ok(PaymentStatus::Pending);
                }
            }
            return Err(Self::rejected(status, &body));
        }

        let response: StkQueryResponse = serde_json::from_str(&body).map_err(|e| {
            AppError::provider(PROVIDER, format!("Invalid response format: {}", e), false)
        })?;

        let code = response.result_code.as_ref().map(result_code);
        let outcome = status_from_query(correlation_id, response);
        info!(
            "M-Pesa STK status: checkout_request_id={}, result_code={:?}",
            correlation_id, code
        );

        Ok(outcome)
    }

    fn verify_callback(&self, payload: &[u8], signature: &str) -> AppResult<CallbackEvent> {
        if !verify_hmac_sha256(&self.config.callback_secret, payload, signature) {
            warn!(rail = "mobile_money", "Callback signature mismatch");
            return Err(invalid_signature());
        }

        let envelope: StkCallbackEnvelope = serde_json::from_slice(payload).map_err(|e| {
            warn!(rail = "mobile_money", "Signed callback has unexpected shape: {}", e);
            invalid_signature()
        })?;
        let callback = envelope.body.stk_callback;

        let status = if callback.result_code == 0 {
            let items = callback
                .callback_metadata
                .map(|m| m.items)
                .unwrap_or_default();
            let lookup = |name: &str| {
                items
                    .iter()
                    .find(|item| item.name == name)
                    .and_then(|item| item.value.clone())
            };

            let receipt = lookup("MpesaReceiptNumber")
                .and_then(|v| v.as_str().map(str::to_string))
                .ok_or_else(|| {
                    warn!(rail = "mobile_money", "Successful callback without receipt number");
                    invalid_signature()
                })?;

            PaymentStatus::Completed(Settlement {
                settlement_reference: receipt.clone(),
                amount: lookup("Amount").as_ref().and_then(decimal_from_json),
                metadata: json!({
                    "mpesa_receipt_number": receipt,
                    "phone_number": lookup("PhoneNumber"),
                    "transaction_date": lookup("TransactionDate"),
                    "result_desc": callback.result_desc,
                }),
            })
        } else {
            PaymentStatus::Failed {
                reason: callback.result_desc,
            }
        };

        Ok(CallbackEvent {
            correlation_id: callback.checkout_request_id,
            status,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: String,
}

#[derive(Debug, Deserialize)]
struct DarajaError {
    #[serde(rename = "errorCode")]
    error_code: String,
    #[serde(rename = "errorMessage")]
    error_message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    response_code: String,
    response_description: String,
    #[serde(default)]
    customer_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkQueryResponse {
    #[serde(default)]
    result_code: Option<serde_json::Value>,
    #[serde(default)]
    result_desc: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StkCallbackEnvelope {
    #[serde(rename = "Body")]
    body: StkCallbackBody,
}

#[derive(Debug, Deserialize)]
struct StkCallbackBody {
    #[serde(rename = "stkCallback")]
    stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkCallback {
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    result_code: i64,
    result_desc: String,
    #[serde(default)]
    callback_metadata: Option<StkCallbackMetadata>,
}

#[derive(Debug, Deserialize)]
struct StkCallbackMetadata {
    #[serde(rename = "Item", default)]
    items: Vec<StkCallbackItem>,
}

#[derive(Debug, Deserialize)]
struct StkCallbackItem {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value", default)]
    value: Option<serde_json::Value>,
}
