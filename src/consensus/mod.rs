// Consensus and validation logic

pub mod pow;
pub mod validation;

pub use pow::{MiningResult, ProofOfWork, Target};
pub use validation::{BlockValidator, TransactionValidator};
