// Transaction and block validation

use crate::consensus::pow::ProofOfWork;
use crate::core::{Block, Hash256, Transaction};
use crate::error::{LedgerError, Result};
use crate::storage::{OutPoint, UtxoSet};
use std::collections::{HashMap, HashSet};

/// Block validator for blocks received from peers
pub struct BlockValidator {
    pow: ProofOfWork,
}

impl BlockValidator {
    pub fn new(pow: ProofOfWork) -> Self {
        Self { pow }
    }

    /// Structural and proof-of-work checks; spends are checked on reindex
    pub fn validate_block(&self, block: &Block) -> Result<()> {
        if block.transactions.is_empty() {
            return Err(LedgerError::ConsensusFailure(format!("block {} has no transactions", block.hash)));
        }

        let coinbase_count = block.transactions.iter().filter(|tx| tx.is_coinbase()).count();
        if coinbase_count > 1 {
            return Err(LedgerError::ConsensusFailure(format!(
                "block {} has {} coinbase transactions",
                block.hash, coinbase_count
            )));
        }

        if let Some(tx) = block.transactions.iter().find(|tx| tx.id != tx.hash()) {
            return Err(LedgerError::ConsensusFailure(format!(
                "block {} carries transaction with forged id {}",
                block.hash, tx.id
            )));
        }

        if block.is_genesis() != (block.height == 0) {
            return Err(LedgerError::ConsensusFailure(format!(
                "block {} has inconsistent height {}",
                block.hash, block.height
            )));
        }

        if !self.pow.validate(block) {
            return Err(LedgerError::ConsensusFailure(format!("block {} has invalid proof of work", block.hash)));
        }

        Ok(())
    }
}

/// Validates spends against the UTXO index and the chain
pub struct TransactionValidator<'a> {
    utxo_set: &'a UtxoSet,
}

impl<'a> TransactionValidator<'a> {
    pub fn new(utxo_set: &'a UtxoSet) -> Self {
        Self { utxo_set }
    }

    /// Validate one transaction: id integrity, every input unspent, value
    /// conserved and every signature valid. Coinbase transactions pass.
    pub fn validate(&self, tx: &Transaction) -> Result<()> {
        if tx.is_coinbase() {
            return Ok(());
        }

        if tx.id != tx.hash() {
            return Err(LedgerError::InvalidTransaction(format!("{}: id does not match contents", tx.id)));
        }
        if tx.inputs.is_empty() || tx.outputs.is_empty() {
            return Err(LedgerError::InvalidTransaction(format!("{}: empty inputs or outputs", tx.id)));
        }

        let mut input_value = 0u64;
        let mut seen = HashSet::new();
        for input in &tx.inputs {
            let outpoint = OutPoint::new(input.txid, input.vout);
            if !seen.insert(outpoint.clone()) {
                return Err(LedgerError::InvalidTransaction(format!("{}: spends {} twice", tx.id, outpoint)));
            }

            let output = self.utxo_set.find_unspent_output(&outpoint)?.ok_or_else(|| {
                LedgerError::InvalidTransaction(format!("{}: output {} is spent or unknown", tx.id, outpoint))
            })?;
            input_value = input_value.saturating_add(output.value);
        }

        let output_value = tx.outputs.iter().try_fold(0u64, |acc, out| acc.checked_add(out.value));
        match output_value {
            Some(value) if value <= input_value => {}
            _ => {
                return Err(LedgerError::InvalidTransaction(format!(
                    "{}: outputs exceed inputs ({})",
                    tx.id, input_value
                )));
            }
        }

        let prev_txs = self.previous_transactions(tx)?;
        if !tx.verify(&prev_txs) {
            return Err(LedgerError::InvalidTransaction(format!("{}: signature verification failed", tx.id)));
        }

        Ok(())
    }

    /// Validate a candidate block's transactions, including conflicts
    /// between them. Fails on the first invalid transaction.
    pub fn validate_all(&self, txs: &[Transaction]) -> Result<()> {
        let mut spent = HashSet::new();
        let mut coinbase_seen = false;

        for tx in txs {
            if tx.is_coinbase() {
                if coinbase_seen {
                    return Err(LedgerError::InvalidTransaction(format!("{}: second coinbase", tx.id)));
                }
                coinbase_seen = true;
                continue;
            }

            self.validate(tx)?;
            for input in &tx.inputs {
                let outpoint = OutPoint::new(input.txid, input.vout);
                if !spent.insert(outpoint.clone()) {
                    return Err(LedgerError::InvalidTransaction(format!(
                        "{}: {} already spent in this block",
                        tx.id, outpoint
                    )));
                }
            }
        }

        Ok(())
    }

    /// Split pending transactions into a conflict-free valid set (first
    /// come wins) and the ids of everything rejected
    pub fn select_valid<'t, I>(&self, txs: I) -> (Vec<Transaction>, Vec<Hash256>)
    where
        I: IntoIterator<Item = &'t Transaction>,
    {
        let mut valid = Vec::new();
        let mut rejected = Vec::new();
        let mut spent = HashSet::new();

        for tx in txs {
            if tx.is_coinbase() {
                rejected.push(tx.id);
                continue;
            }

            if let Err(e) = self.validate(tx) {
                log::warn!("Dropping transaction {}: {}", tx.id, e);
                rejected.push(tx.id);
                continue;
            }

            let outpoints: Vec<OutPoint> = tx.inputs.iter().map(|i| OutPoint::new(i.txid, i.vout)).collect();
            if outpoints.iter().any(|o| spent.contains(o)) {
                log::warn!("Dropping transaction {}: conflicts with another pending spend", tx.id);
                rejected.push(tx.id);
                continue;
            }

            spent.extend(outpoints);
            valid.push(tx.clone());
        }

        (valid, rejected)
    }

    /// Transactions referenced by `tx`'s inputs, looked up on the chain
    pub fn previous_transactions(&self, tx: &Transaction) -> Result<HashMap<Hash256, Transaction>> {
        let mut prev_txs = HashMap::new();
        for input in &tx.inputs {
            if !prev_txs.contains_key(&input.txid) {
                let prev = self.utxo_set.blockchain().find_transaction(&input.txid)?;
                prev_txs.insert(input.txid, prev);
            }
        }
        Ok(prev_txs)
    }
}
