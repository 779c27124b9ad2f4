// Wallet and transaction building

mod keystore;
mod tx_builder;

pub use keystore::{KeyPair, Wallets};
pub use tx_builder::TransactionBuilder;
