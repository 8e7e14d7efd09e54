//! Payment rail integration
//!
//! A uniform adapter interface over the rails money can arrive through
//! (M-Pesa STK push, bank transfer), plus callback signature helpers.

pub mod providers;
pub mod signature;
pub mod traits;
pub mod types;

pub use traits::PaymentProvider;
pub use types::{CallbackEvent, PaymentIntent, PaymentStatus, Rail, RailInput, Settlement};
