//! Point wallets and their ledger.

mod error;
mod model;
mod service;

pub use error::WalletError;
pub use model::{TransactionKind, Wallet, WalletTransaction};
pub use service::WalletService;
