// Minimal proof-of-work UTXO ledger with a peer-to-peer relay

pub mod cli;
pub mod config;
pub mod consensus;
pub mod core;
pub mod error;
pub mod network;
pub mod storage;
pub mod wallet;

// Re-exports for convenience
pub use cli::{Cli, CliHandler, Commands};
pub use config::Config;
pub use consensus::{BlockValidator, ProofOfWork, Target, TransactionValidator};
pub use core::{Address, Block, Hash256, Transaction, TxInput, TxOutput};
pub use error::{LedgerError, Result};
pub use network::{Message, Node, Peer};
pub use storage::{Blockchain, OutPoint, Storage, UtxoSet};
pub use wallet::{KeyPair, TransactionBuilder, Wallets};
