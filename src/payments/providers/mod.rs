//! Payment rail adapters
//!
//! Concrete implementations of the PaymentProvider trait, one per rail.

pub mod bank_transfer;
pub mod mpesa;

pub use bank_transfer::{BankTransferConfig, BankTransferProvider};
pub use mpesa::{MpesaConfig, MpesaProvider};
