//! Payment rail adapter trait
//!
//! Defines the interface each rail (mobile-money push, bank transfer) implements.

use crate::error::AppResult;
use crate::payments::types::{CallbackEvent, IntentRequest, PaymentIntent, PaymentStatus, Rail};
use async_trait::async_trait;

/// Adapter between the top-up engine and one payment rail
///
/// Implementations keep all wire-format knowledge of their provider. The
/// orchestrator only ever sees [`PaymentIntent`], [`PaymentStatus`] and
/// [`CallbackEvent`].
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Rail served by this adapter
    fn rail(&self) -> Rail;

    /// Open a provider-side payment intent
    ///
    /// # Arguments
    /// * `request` - Transaction id, reference, total to collect and the payer's rail input
    ///
    /// # Returns
    /// * `PaymentIntent` - Correlation id used for polling and callback matching,
    ///   plus the instructions shown to the payer
    async fn create_intent(&self, request: IntentRequest) -> AppResult<PaymentIntent>;

    /// Ask the provider for the current state of a payment
    ///
    /// Rails without a status API answer `PaymentStatus::Pending` and rely on callbacks.
    async fn query_status(&self, correlation_id: &str) -> AppResult<PaymentStatus>;

    /// Authenticate and parse a provider callback
    ///
    /// Fails closed: a missing secret, a malformed or mismatched signature, or a body
    /// that does not parse yields `DomainError::InvalidSignature`.
    ///
    /// # Arguments
    /// * `payload` - Raw request body, exactly as received
    /// * `signature` - Value of the rail's signature header
    fn verify_callback(&self, payload: &[u8], signature: &str) -> AppResult<CallbackEvent>;
}
