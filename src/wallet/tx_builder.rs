// Transaction builder

use crate::core::{Address, Hash256, Transaction, TxInput, TxOutput};
use crate::error::{LedgerError, Result};
use crate::storage::UtxoSet;
use crate::wallet::KeyPair;
use std::collections::HashMap;

/// Builds signed spends from the UTXO index
pub struct TransactionBuilder<'a> {
    utxo_set: &'a UtxoSet,
}

impl<'a> TransactionBuilder<'a> {
    /// Create a new transaction builder
    pub fn new(utxo_set: &'a UtxoSet) -> Self {
        Self { utxo_set }
    }

    /// Build and sign a transaction moving `amount` from `from` to `to`
    pub fn new_spend(from: &KeyPair, to: &Address, amount: u64, utxo_set: &UtxoSet) -> Result<Transaction> {
        TransactionBuilder::new(utxo_set).build(from, to, amount)
    }

    /// Select outputs covering `amount`, pay the recipient and return any
    /// change to the sender. A self-transfer pays the whole selection back
    /// in a single output.
    pub fn build(&self, from: &KeyPair, to: &Address, amount: u64) -> Result<Transaction> {
        if amount == 0 {
            return Err(LedgerError::InvalidTransaction("amount must be positive".to_string()));
        }

        let from_address = from.address();
        let (accumulated, spendable) = self.utxo_set.find_spendable_outputs(&from.key_hash(), amount)?;
        if accumulated < amount {
            return Err(LedgerError::InsufficientFunds {
                available: accumulated,
                required: amount,
            });
        }

        let inputs: Vec<TxInput> = spendable
            .iter()
            .flat_map(|(txid, indices)| {
                indices
                    .iter()
                    .map(|&vout| TxInput::new(*txid, vout, from.pub_key_bytes()))
            })
            .collect();

        let mut outputs = Vec::with_capacity(2);
        if &from_address == to {
            outputs.push(TxOutput::locked_to(accumulated, to));
        } else {
            outputs.push(TxOutput::locked_to(amount, to));
            if accumulated > amount {
                outputs.push(TxOutput::locked_to(accumulated - amount, &from_address));
            }
        }

        let mut tx = Transaction::new(inputs, outputs);
        let prev_txs = self.previous_transactions(spendable.keys())?;
        tx.sign(&from.secret_key, &prev_txs)?;

        log::info!("Built transaction {}: {} from {} to {}", tx.id, amount, from_address, to);
        Ok(tx)
    }

    fn previous_transactions<'t, I>(&self, ids: I) -> Result<HashMap<Hash256, Transaction>>
    where
        I: IntoIterator<Item = &'t Hash256>,
    {
        let blockchain = self.utxo_set.blockchain();
        let mut prev_txs = HashMap::new();
        for id in ids {
            prev_txs.insert(*id, blockchain.find_transaction(id)?);
        }
        Ok(prev_txs)
    }

    /// Get balance for address
    pub fn get_balance(&self, address: &Address) -> Result<u64> {
        self.utxo_set.balance(address.key_hash())
    }
}
