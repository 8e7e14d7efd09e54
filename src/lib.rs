//! Wallet top-up engine
//!
//! Moves external money into user wallets over two rails (mobile-money push and bank
//! transfer): fee and limit policy, rail adapters, an exactly-once wallet ledger, a
//! compare-and-set transaction store and the orchestrator that ties them together.

pub mod api;
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod payments;
pub mod services;
pub mod workers;

pub use error::{AppError, AppErrorKind, AppResult};
