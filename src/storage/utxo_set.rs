// UTXO (Unspent Transaction Output) index over the chainstate tree

use crate::core::serialize::{read_len, read_u32, read_u64, write_varint};
use crate::core::{Block, Hash256, TxOutput, KEY_HASH_LEN};
use crate::error::{LedgerError, Result};
use crate::storage::Blockchain;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionalTree};
use sled::{Batch, Tree};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Cursor, Read};

/// Reference to a transaction output - transaction id + output index
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: i32,
}

impl OutPoint {
    pub fn new(txid: Hash256, vout: i32) -> Self {
        Self { txid, vout }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// Unspent output together with its index in the creating transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentOutput {
    pub index: i32,
    pub output: TxOutput,
}

impl UnspentOutput {
    pub fn new(index: i32, output: TxOutput) -> Self {
        Self { index, output }
    }

    /// Every output of a freshly confirmed transaction
    pub fn all_of(outputs: &[TxOutput]) -> Vec<Self> {
        outputs
            .iter()
            .enumerate()
            .map(|(index, output)| Self::new(index as i32, output.clone()))
            .collect()
    }
}

/// Encode the unspent outputs of one transaction as stored in the chainstate
pub fn encode_outputs(outputs: &[UnspentOutput]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + outputs.len() * (4 + 8 + KEY_HASH_LEN));
    write_varint(&mut buf, outputs.len() as u64);
    for unspent in outputs {
        buf.extend_from_slice(&unspent.index.to_le_bytes());
        buf.extend_from_slice(&unspent.output.value.to_le_bytes());
        buf.extend_from_slice(&unspent.output.key_hash);
    }
    buf
}

pub fn decode_outputs(data: &[u8]) -> Result<Vec<UnspentOutput>> {
    fn read_all(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Vec<UnspentOutput>> {
        let count = read_len(cursor)?;
        let mut outputs = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let index = read_u32(cursor)? as i32;
            let value = read_u64(cursor)?;
            let mut key_hash = [0u8; KEY_HASH_LEN];
            cursor.read_exact(&mut key_hash)?;
            outputs.push(UnspentOutput::new(index, TxOutput::new(value, key_hash)));
        }
        Ok(outputs)
    }

    let mut cursor = Cursor::new(data);
    let outputs = read_all(&mut cursor).map_err(|e| LedgerError::Storage(format!("corrupt UTXO entry: {}", e)))?;
    if cursor.position() as usize != data.len() {
        return Err(LedgerError::Storage("corrupt UTXO entry: trailing bytes".to_string()));
    }
    Ok(outputs)
}

fn decode_txid(key: &[u8]) -> Result<Hash256> {
    Hash256::from_slice(key).map_err(|e| LedgerError::Storage(format!("corrupt UTXO key: {}", e)))
}

/// Apply a block's effects inside a chainstate transaction: consume every
/// input of every non-coinbase transaction, then add the new outputs.
/// Spending an output that is not unspent aborts the transaction.
pub(crate) fn apply_block(
    chainstate: &TransactionalTree,
    block: &Block,
) -> ConflictableTransactionResult<(), LedgerError> {
    for tx in &block.transactions {
        if !tx.is_coinbase() {
            for input in &tx.inputs {
                let key = input.txid.as_bytes().as_slice();
                let not_unspent = || {
                    ConflictableTransactionError::Abort(LedgerError::InvalidTransaction(format!(
                        "{}: output {}:{} is not unspent",
                        tx.id, input.txid, input.vout
                    )))
                };

                let Some(data) = chainstate.get(key)? else {
                    return Err(not_unspent());
                };
                let mut outputs = decode_outputs(&data).map_err(ConflictableTransactionError::Abort)?;

                let before = outputs.len();
                outputs.retain(|unspent| unspent.index != input.vout);
                if outputs.len() == before {
                    return Err(not_unspent());
                }

                if outputs.is_empty() {
                    chainstate.remove(key)?;
                } else {
                    chainstate.insert(key, encode_outputs(&outputs))?;
                }
            }
        }

        let created = UnspentOutput::all_of(&tx.outputs);
        chainstate.insert(tx.id.as_bytes().as_slice(), encode_outputs(&created))?;
    }

    Ok(())
}

/// UTXO index: transaction id -> outputs of that transaction not yet spent
#[derive(Clone)]
pub struct UtxoSet {
    blockchain: Blockchain,
    chainstate: Tree,
}

impl UtxoSet {
    pub fn new(blockchain: Blockchain) -> Self {
        let chainstate = blockchain.chainstate().clone();
        Self { blockchain, chainstate }
    }

    /// Chain this index is derived from
    pub fn blockchain(&self) -> &Blockchain {
        &self.blockchain
    }

    /// Greedily accumulate outputs locked to `key_hash` until `amount` is
    /// covered or the index is exhausted. Returns the accumulated value and
    /// the chosen output indices per transaction.
    pub fn find_spendable_outputs(
        &self,
        key_hash: &[u8; KEY_HASH_LEN],
        amount: u64,
    ) -> Result<(u64, BTreeMap<Hash256, Vec<i32>>)> {
        let mut accumulated = 0u64;
        let mut spendable: BTreeMap<Hash256, Vec<i32>> = BTreeMap::new();

        'scan: for item in self.chainstate.iter() {
            let (key, value) = item?;
            let txid = decode_txid(&key)?;

            for unspent in decode_outputs(&value)? {
                if accumulated >= amount {
                    break 'scan;
                }
                if unspent.output.is_locked_with_key(key_hash) {
                    accumulated += unspent.output.value;
                    spendable.entry(txid).or_default().push(unspent.index);
                }
            }
        }

        Ok((accumulated, spendable))
    }

    /// All unspent outputs locked to `key_hash`
    pub fn find_unspent_outputs(&self, key_hash: &[u8; KEY_HASH_LEN]) -> Result<Vec<TxOutput>> {
        let mut found = Vec::new();

        for item in self.chainstate.iter().values() {
            let value = item?;
            found.extend(
                decode_outputs(&value)?
                    .into_iter()
                    .map(|unspent| unspent.output)
                    .filter(|output| output.is_locked_with_key(key_hash)),
            );
        }

        Ok(found)
    }

    /// Sum of all unspent outputs locked to `key_hash`
    pub fn balance(&self, key_hash: &[u8; KEY_HASH_LEN]) -> Result<u64> {
        Ok(self.find_unspent_outputs(key_hash)?.iter().map(|output| output.value).sum())
    }

    /// The output at `outpoint`, if it is still unspent
    pub fn find_unspent_output(&self, outpoint: &OutPoint) -> Result<Option<TxOutput>> {
        let Some(data) = self.chainstate.get(outpoint.txid.as_bytes())? else {
            return Ok(None);
        };

        Ok(decode_outputs(&data)?
            .into_iter()
            .find(|unspent| unspent.index == outpoint.vout)
            .map(|unspent| unspent.output))
    }

    /// Every entry of the index, ordered by transaction id
    pub fn entries(&self) -> Result<Vec<(Hash256, Vec<UnspentOutput>)>> {
        self.chainstate
            .iter()
            .map(|item| {
                let (key, value) = item?;
                Ok((decode_txid(&key)?, decode_outputs(&value)?))
            })
            .collect()
    }

    /// Number of transactions with at least one unspent output
    pub fn count_transactions(&self) -> Result<usize> {
        Ok(self.chainstate.len())
    }

    /// Apply one newly appended block to the index atomically
    pub fn update(&self, block: &Block) -> Result<()> {
        self.chainstate
            .transaction(|chainstate| -> ConflictableTransactionResult<(), LedgerError> {
                apply_block(chainstate, block)
            })?;

        log::debug!("UTXO index updated with block {}", block.hash);
        Ok(())
    }

    /// Rebuild the index from a full chain scan, replacing its contents in
    /// one atomic batch
    pub fn reindex(&self) -> Result<()> {
        let unspent = self.blockchain.find_utxo()?;

        let mut batch = Batch::default();
        for key in self.chainstate.iter().keys() {
            batch.remove(key?);
        }
        for (txid, outputs) in &unspent {
            batch.insert(txid.as_bytes().as_slice(), encode_outputs(outputs));
        }
        self.chainstate.apply_batch(batch)?;

        log::info!("Reindexed UTXO set: {} transactions with unspent outputs", unspent.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Address, Transaction};
    use crate::storage::Storage;
    use crate::wallet::{KeyPair, TransactionBuilder};

    const TEST_BITS: u32 = 8;

    fn ledger(owner: &Address) -> Storage {
        let storage = Storage::memory(TEST_BITS).unwrap();
        storage.blockchain.create_genesis(owner).unwrap();
        storage
    }

    #[test]
    fn test_outputs_encoding() {
        let outputs = vec![
            UnspentOutput::new(0, TxOutput::new(4, [1; KEY_HASH_LEN])),
            UnspentOutput::new(3, TxOutput::new(6, [2; KEY_HASH_LEN])),
        ];

        let bytes = encode_outputs(&outputs);
        assert_eq!(decode_outputs(&bytes).unwrap(), outputs);

        assert!(decode_outputs(&bytes[..bytes.len() - 1]).is_err());
        assert!(decode_outputs(&[bytes.clone(), vec![0]].concat()).is_err());
    }

    #[test]
    fn test_genesis_balance() {
        let owner = KeyPair::generate();
        let storage = ledger(&owner.address());

        assert_eq!(storage.utxo_set.balance(&owner.key_hash()).unwrap(), 10);
        assert_eq!(storage.utxo_set.count_transactions().unwrap(), 1);
        assert_eq!(storage.utxo_set.balance(&KeyPair::generate().key_hash()).unwrap(), 0);
    }

    #[test]
    fn test_find_spendable_outputs_is_greedy() {
        let owner = KeyPair::generate();
        let storage = ledger(&owner.address());
        for _ in 0..2 {
            let coinbase = Transaction::new_coinbase(&owner.address(), "");
            storage.blockchain.append(vec![coinbase], None).unwrap();
        }

        let (accumulated, outputs) = storage.utxo_set.find_spendable_outputs(&owner.key_hash(), 15).unwrap();
        assert_eq!(accumulated, 20);
        assert_eq!(outputs.values().map(Vec::len).sum::<usize>(), 2);

        let (accumulated, _) = storage.utxo_set.find_spendable_outputs(&owner.key_hash(), 100).unwrap();
        assert_eq!(accumulated, 30);

        let (accumulated, outputs) = storage.utxo_set.find_spendable_outputs(&owner.key_hash(), 0).unwrap();
        assert_eq!(accumulated, 0);
        assert!(outputs.is_empty());
    }

    #[test]
    fn test_update_consumes_and_creates() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let storage = ledger(&alice.address());

        let tx = TransactionBuilder::new_spend(&alice, &bob.address(), 4, &storage.utxo_set).unwrap();
        let spent = OutPoint::new(tx.inputs[0].txid, tx.inputs[0].vout);
        storage.blockchain.append(vec![tx.clone()], None).unwrap();

        assert_eq!(storage.utxo_set.find_unspent_output(&spent).unwrap(), None);
        assert_eq!(
            storage.utxo_set.find_unspent_output(&OutPoint::new(tx.id, 0)).unwrap(),
            Some(TxOutput::locked_to(4, &bob.address()))
        );
        assert_eq!(storage.utxo_set.balance(&alice.key_hash()).unwrap(), 6);
        assert_eq!(storage.utxo_set.balance(&bob.key_hash()).unwrap(), 4);

        // The fully spent genesis coinbase entry is gone
        assert_eq!(storage.utxo_set.count_transactions().unwrap(), 1);
    }

    #[test]
    fn test_reindex_matches_incremental_updates() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let storage = ledger(&alice.address());

        let tx = TransactionBuilder::new_spend(&alice, &bob.address(), 4, &storage.utxo_set).unwrap();
        let reward = Transaction::new_coinbase(&bob.address(), "");
        storage.blockchain.append(vec![reward, tx], None).unwrap();

        let tx = TransactionBuilder::new_spend(&bob, &alice.address(), 7, &storage.utxo_set).unwrap();
        storage.blockchain.append(vec![tx], None).unwrap();

        let incremental = storage.utxo_set.entries().unwrap();
        storage.utxo_set.reindex().unwrap();
        assert_eq!(storage.utxo_set.entries().unwrap(), incremental);

        assert_eq!(storage.utxo_set.balance(&alice.key_hash()).unwrap(), 13);
        assert_eq!(storage.utxo_set.balance(&bob.key_hash()).unwrap(), 7);
    }

    #[test]
    fn test_update_rejects_spent_output() {
        let alice = KeyPair::generate();
        let storage = ledger(&alice.address());

        let tx = TransactionBuilder::new_spend(&alice, &KeyPair::generate().address(), 4, &storage.utxo_set).unwrap();
        let block = storage.blockchain.append(vec![tx], None).unwrap();
        let before = storage.utxo_set.entries().unwrap();

        let result = storage.utxo_set.update(&block);
        assert!(matches!(result, Err(LedgerError::InvalidTransaction(_))));
        assert_eq!(storage.utxo_set.entries().unwrap(), before);
    }
}
