// Error types for the ledger

use sled::transaction::TransactionError;
use thiserror::Error;

/// Errors surfaced by chain, UTXO, wallet and network operations
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Proof-of-work exhausted or a block failed header checks
    #[error("Consensus failure: {0}")]
    ConsensusFailure(String),

    /// Mining aborted by the cancellation signal
    #[error("Mining cancelled")]
    MiningCancelled,

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Insufficient funds: have {available}, need {required}")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// Malformed wire message or unknown command
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Wallet error: {0}")]
    Wallet(String),
}

impl From<sled::Error> for LedgerError {
    fn from(e: sled::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(e: std::io::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

impl From<TransactionError<LedgerError>> for LedgerError {
    fn from(e: TransactionError<LedgerError>) -> Self {
        match e {
            TransactionError::Abort(inner) => inner,
            TransactionError::Storage(e) => e.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
