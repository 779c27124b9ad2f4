// Blockchain database using sled

use crate::config::GENESIS_COINBASE_DATA;
use crate::consensus::{BlockValidator, ProofOfWork, TransactionValidator};
use crate::core::{Address, Block, Hash256, Serializable, Transaction};
use crate::error::{LedgerError, Result};
use crate::storage::utxo_set::{apply_block, UnspentOutput, UtxoSet};
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionalTree};
use sled::{Transactional, Tree};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::AtomicBool;

/// Key of the tip pointer in the blocks tree
pub const TIP_KEY: &[u8] = b"l";

fn storage_error(e: String) -> LedgerError {
    LedgerError::Storage(e)
}

fn load_block(blocks: &Tree, hash: &Hash256) -> Result<Block> {
    let data = blocks
        .get(hash.as_bytes())?
        .ok_or_else(|| LedgerError::NotFound(format!("block {}", hash)))?;
    Block::deserialize(&data).map_err(storage_error)
}

/// Height of the current tip as seen inside a transaction
fn tip_height(blocks: &TransactionalTree) -> ConflictableTransactionResult<Option<u64>, LedgerError> {
    let Some(tip) = blocks.get(TIP_KEY)? else {
        return Ok(None);
    };
    let Some(data) = blocks.get(&tip)? else {
        return Err(ConflictableTransactionError::Abort(LedgerError::Storage(
            "tip points to a missing block".to_string(),
        )));
    };
    let block = Block::deserialize(&data)
        .map_err(|e| ConflictableTransactionError::Abort(storage_error(e)))?;
    Ok(Some(block.height))
}

/// Block store: blocks keyed by hash plus the tip pointer. Shares the
/// chainstate tree with the UTXO index so appends commit atomically.
#[derive(Clone)]
pub struct Blockchain {
    blocks: Tree,
    chainstate: Tree,
    pow: ProofOfWork,
}

impl Blockchain {
    pub fn new(blocks: Tree, chainstate: Tree, pow: ProofOfWork) -> Self {
        Self { blocks, chainstate, pow }
    }

    pub fn pow(&self) -> &ProofOfWork {
        &self.pow
    }

    pub(crate) fn chainstate(&self) -> &Tree {
        &self.chainstate
    }

    /// UTXO index view over this chain
    pub fn utxo_set(&self) -> UtxoSet {
        UtxoSet::new(self.clone())
    }

    /// Hash of the best block, if a chain exists
    pub fn tip(&self) -> Result<Option<Hash256>> {
        match self.blocks.get(TIP_KEY)? {
            Some(data) => Ok(Some(Hash256::from_slice(&data).map_err(storage_error)?)),
            None => Ok(None),
        }
    }

    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.tip()?.is_some())
    }

    /// Mine the genesis block paying the subsidy to `address` and index it
    pub fn create_genesis(&self, address: &Address) -> Result<Block> {
        if self.is_initialized()? {
            return Err(LedgerError::Storage("blockchain already exists".to_string()));
        }

        let coinbase = Transaction::new_coinbase(address, GENESIS_COINBASE_DATA);
        let mut genesis = Block::genesis_candidate(coinbase);
        let solution = self.pow.solve(&genesis, None)?;
        genesis.seal(solution.nonce, solution.hash);

        self.commit(&genesis)?;
        log::info!("Created blockchain with genesis block {}", genesis.hash);
        Ok(genesis)
    }

    /// Validate `transactions`, mine them into a block on top of the tip and
    /// persist the block, the new tip and the UTXO effects in one transaction
    pub fn append(&self, transactions: Vec<Transaction>, cancel: Option<&AtomicBool>) -> Result<Block> {
        if transactions.is_empty() {
            return Err(LedgerError::InvalidTransaction("block has no transactions".to_string()));
        }

        let utxo_set = self.utxo_set();
        TransactionValidator::new(&utxo_set).validate_all(&transactions)?;

        let tip = self
            .tip()?
            .ok_or_else(|| LedgerError::NotFound("blockchain (create one first)".to_string()))?;
        let height = self.get_block(&tip)?.height + 1;

        let mut block = Block::candidate(transactions, tip, height);
        let solution = self.pow.solve(&block, cancel)?;
        block.seal(solution.nonce, solution.hash);

        self.commit(&block)?;
        log::info!("Appended block {} at height {}", block.hash, block.height);
        Ok(block)
    }

    /// Store a locally mined block as the new tip and apply its UTXO effects.
    /// Fails without writing if the tip has reached the block's height.
    fn commit(&self, block: &Block) -> Result<()> {
        let key = block.hash.as_bytes().as_slice();
        let bytes = block.serialize();

        (&self.blocks, &self.chainstate).transaction(
            |(blocks, chainstate)| -> ConflictableTransactionResult<(), LedgerError> {
                if tip_height(blocks)?.is_some_and(|height| height >= block.height) {
                    return Err(ConflictableTransactionError::Abort(LedgerError::ConsensusFailure(format!(
                        "chain tip moved past height {} while mining",
                        block.height
                    ))));
                }

                blocks.insert(key, bytes.as_slice())?;
                blocks.insert(TIP_KEY, key)?;
                apply_block(chainstate, block)
            },
        )?;

        Ok(())
    }

    /// Store a block received from a peer. Idempotent: returns false when
    /// the block is already known. The tip moves when the block is higher.
    pub fn add_block(&self, block: &Block) -> Result<bool> {
        BlockValidator::new(self.pow).validate_block(block)?;

        let key = block.hash.as_bytes().as_slice();
        let bytes = block.serialize();

        let stored = self
            .blocks
            .transaction(|blocks| -> ConflictableTransactionResult<bool, LedgerError> {
                if blocks.get(key)?.is_some() {
                    return Ok(false);
                }

                blocks.insert(key, bytes.as_slice())?;
                if tip_height(blocks)?.is_none_or(|height| block.height > height) {
                    blocks.insert(TIP_KEY, key)?;
                }
                Ok(true)
            })?;

        if stored {
            log::info!("Added block {} at height {}", block.hash, block.height);
        }
        Ok(stored)
    }

    pub fn has_block(&self, hash: &Hash256) -> Result<bool> {
        Ok(self.blocks.contains_key(hash.as_bytes())?)
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Block> {
        load_block(&self.blocks, hash)
    }

    /// Height of the tip block
    pub fn best_height(&self) -> Result<u64> {
        let tip = self
            .tip()?
            .ok_or_else(|| LedgerError::NotFound("blockchain has no blocks".to_string()))?;
        Ok(self.get_block(&tip)?.height)
    }

    /// Hashes of every block from tip to genesis
    pub fn block_hashes(&self) -> Result<Vec<Hash256>> {
        self.iter()?.map(|block| block.map(|block| block.hash)).collect()
    }

    /// Walk the chain from tip to genesis
    pub fn iter(&self) -> Result<BlockchainIterator> {
        Ok(BlockchainIterator {
            blocks: self.blocks.clone(),
            current: self.tip()?,
        })
    }

    /// Locate a confirmed transaction by id
    pub fn find_transaction(&self, id: &Hash256) -> Result<Transaction> {
        for block in self.iter()? {
            if let Some(tx) = block?.transactions.into_iter().find(|tx| tx.id == *id) {
                return Ok(tx);
            }
        }
        Err(LedgerError::NotFound(format!("transaction {}", id)))
    }

    /// Unspent outputs of the whole chain, by transaction id. Blocks are
    /// replayed tip to genesis and transactions within a block in reverse,
    /// so every spend is seen before the output it consumes.
    pub fn find_utxo(&self) -> Result<BTreeMap<Hash256, Vec<UnspentOutput>>> {
        let mut unspent: BTreeMap<Hash256, Vec<UnspentOutput>> = BTreeMap::new();
        let mut spent: HashMap<Hash256, HashSet<i32>> = HashMap::new();

        for block in self.iter()? {
            for tx in block?.transactions.iter().rev() {
                let spent_here = spent.get(&tx.id);
                let outputs: Vec<UnspentOutput> = UnspentOutput::all_of(&tx.outputs)
                    .into_iter()
                    .filter(|output| !spent_here.is_some_and(|indices| indices.contains(&output.index)))
                    .collect();
                if !outputs.is_empty() {
                    unspent.insert(tx.id, outputs);
                }

                if !tx.is_coinbase() {
                    for input in &tx.inputs {
                        spent.entry(input.txid).or_default().insert(input.vout);
                    }
                }
            }
        }

        Ok(unspent)
    }
}

/// Lazy walk from the tip back to genesis
pub struct BlockchainIterator {
    blocks: Tree,
    current: Option<Hash256>,
}

impl Iterator for BlockchainIterator {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.current.take()?;

        match load_block(&self.blocks, &hash) {
            Ok(block) => {
                if !block.is_genesis() {
                    self.current = Some(block.prev_block_hash);
                }
                Some(Ok(block))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::wallet::{KeyPair, TransactionBuilder};

    const TEST_BITS: u32 = 8;

    fn ledger(owner: &Address) -> Storage {
        let storage = Storage::memory(TEST_BITS).unwrap();
        storage.blockchain.create_genesis(owner).unwrap();
        storage
    }

    fn reward_block(storage: &Storage) -> Block {
        let coinbase = Transaction::new_coinbase(&KeyPair::generate().address(), "");
        storage.blockchain.append(vec![coinbase], None).unwrap()
    }

    #[test]
    fn test_empty_chain() {
        let storage = Storage::memory(TEST_BITS).unwrap();

        assert!(!storage.blockchain.is_initialized().unwrap());
        assert!(matches!(storage.blockchain.best_height(), Err(LedgerError::NotFound(_))));
        assert!(storage.blockchain.block_hashes().unwrap().is_empty());
        assert!(matches!(
            storage.blockchain.get_block(&Hash256::new([1; 32])),
            Err(LedgerError::NotFound(_))
        ));
    }

    #[test]
    fn test_create_genesis() {
        let owner = KeyPair::generate();
        let storage = Storage::memory(TEST_BITS).unwrap();
        let genesis = storage.blockchain.create_genesis(&owner.address()).unwrap();

        assert!(genesis.is_genesis());
        assert!(storage.blockchain.pow().validate(&genesis));
        assert_eq!(storage.blockchain.tip().unwrap(), Some(genesis.hash));
        assert_eq!(storage.blockchain.best_height().unwrap(), 0);
        assert_eq!(storage.blockchain.get_block(&genesis.hash).unwrap(), genesis);
        assert_eq!(
            genesis.transactions[0].inputs[0].pub_key,
            GENESIS_COINBASE_DATA.as_bytes()
        );
    }

    #[test]
    fn test_create_genesis_twice_fails() {
        let owner = KeyPair::generate();
        let storage = ledger(&owner.address());

        assert!(storage.blockchain.create_genesis(&owner.address()).is_err());
        assert_eq!(storage.blockchain.block_hashes().unwrap().len(), 1);
    }

    #[test]
    fn test_append_links_blocks() {
        let storage = ledger(&KeyPair::generate().address());
        let genesis_hash = storage.blockchain.tip().unwrap().unwrap();

        let block1 = reward_block(&storage);
        let block2 = reward_block(&storage);

        assert_eq!(block1.prev_block_hash, genesis_hash);
        assert_eq!(block2.prev_block_hash, block1.hash);
        assert_eq!(block2.height, 2);
        assert_eq!(storage.blockchain.best_height().unwrap(), 2);
        assert_eq!(
            storage.blockchain.block_hashes().unwrap(),
            vec![block2.hash, block1.hash, genesis_hash]
        );
    }

    #[test]
    fn test_append_without_chain_fails() {
        let storage = Storage::memory(TEST_BITS).unwrap();
        let coinbase = Transaction::new_coinbase(&KeyPair::generate().address(), "");

        let result = storage.blockchain.append(vec![coinbase], None);
        assert!(matches!(result, Err(LedgerError::NotFound(_))));
    }

    #[test]
    fn test_append_rejects_double_spend() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let storage = ledger(&alice.address());

        let tx = TransactionBuilder::new_spend(&alice, &bob.address(), 4, &storage.utxo_set).unwrap();
        storage.blockchain.append(vec![tx.clone()], None).unwrap();
        let height = storage.blockchain.best_height().unwrap();

        let result = storage.blockchain.append(vec![tx], None);
        assert!(matches!(result, Err(LedgerError::InvalidTransaction(_))));
        assert_eq!(storage.blockchain.best_height().unwrap(), height);
        assert_eq!(storage.utxo_set.balance(&bob.key_hash()).unwrap(), 4);
    }

    #[test]
    fn test_append_rejects_conflicting_spends_in_one_block() {
        let alice = KeyPair::generate();
        let storage = ledger(&alice.address());

        let tx1 = TransactionBuilder::new_spend(&alice, &KeyPair::generate().address(), 4, &storage.utxo_set).unwrap();
        let tx2 = TransactionBuilder::new_spend(&alice, &KeyPair::generate().address(), 5, &storage.utxo_set).unwrap();

        let result = storage.blockchain.append(vec![tx1, tx2], None);
        assert!(matches!(result, Err(LedgerError::InvalidTransaction(_))));
        assert_eq!(storage.blockchain.best_height().unwrap(), 0);
    }

    #[test]
    fn test_append_rejects_forged_signature() {
        let alice = KeyPair::generate();
        let storage = ledger(&alice.address());

        let mut tx = TransactionBuilder::new_spend(&alice, &KeyPair::generate().address(), 4, &storage.utxo_set).unwrap();
        tx.inputs[0].signature[0] ^= 0x01;

        let result = storage.blockchain.append(vec![tx], None);
        assert!(matches!(result, Err(LedgerError::InvalidTransaction(_))));
    }

    #[test]
    fn test_append_rejects_inflation() {
        let alice = KeyPair::generate();
        let storage = ledger(&alice.address());

        let mut tx = TransactionBuilder::new_spend(&alice, &KeyPair::generate().address(), 4, &storage.utxo_set).unwrap();
        tx.outputs[0].value = 100;
        tx.id = tx.hash();

        let result = storage.blockchain.append(vec![tx], None);
        assert!(matches!(result, Err(LedgerError::InvalidTransaction(_))));
    }

    #[test]
    fn test_append_cancelled() {
        let storage = ledger(&KeyPair::generate().address());
        let coinbase = Transaction::new_coinbase(&KeyPair::generate().address(), "");
        let cancel = AtomicBool::new(true);

        let result = storage.blockchain.append(vec![coinbase], Some(&cancel));
        assert!(matches!(result, Err(LedgerError::MiningCancelled)));
        assert_eq!(storage.blockchain.best_height().unwrap(), 0);
    }

    #[test]
    fn test_find_transaction() {
        let alice = KeyPair::generate();
        let storage = ledger(&alice.address());
        let tx = TransactionBuilder::new_spend(&alice, &KeyPair::generate().address(), 3, &storage.utxo_set).unwrap();
        storage.blockchain.append(vec![tx.clone()], None).unwrap();

        assert_eq!(storage.blockchain.find_transaction(&tx.id).unwrap(), tx);
        assert!(matches!(
            storage.blockchain.find_transaction(&Hash256::new([5; 32])),
            Err(LedgerError::NotFound(_))
        ));
    }

    #[test]
    fn test_add_block_is_idempotent_and_moves_tip() {
        let source = ledger(&KeyPair::generate().address());
        let block1 = reward_block(&source);
        let genesis = source.blockchain.get_block(&block1.prev_block_hash).unwrap();

        let replica = Storage::memory(TEST_BITS).unwrap();
        assert!(replica.blockchain.add_block(&genesis).unwrap());
        assert!(!replica.blockchain.add_block(&genesis).unwrap());
        assert_eq!(replica.blockchain.tip().unwrap(), Some(genesis.hash));

        assert!(replica.blockchain.add_block(&block1).unwrap());
        assert_eq!(replica.blockchain.best_height().unwrap(), 1);

        // A lower block never moves the tip back
        let fork = Storage::memory(TEST_BITS).unwrap();
        let other_genesis = fork.blockchain.create_genesis(&KeyPair::generate().address()).unwrap();
        assert!(replica.blockchain.add_block(&other_genesis).unwrap());
        assert_eq!(replica.blockchain.tip().unwrap(), Some(block1.hash));
    }

    #[test]
    fn test_commit_refuses_block_not_above_tip() {
        let source = ledger(&KeyPair::generate().address());
        let genesis = source.blockchain.get_block(&source.blockchain.tip().unwrap().unwrap()).unwrap();
        reward_block(&source);
        let block2 = reward_block(&source);

        let replica = Storage::memory(TEST_BITS).unwrap();
        replica.blockchain.add_block(&genesis).unwrap();
        replica.utxo_set.reindex().unwrap();
        replica.blockchain.add_block(&block2).unwrap();
        assert_eq!(replica.blockchain.tip().unwrap(), Some(block2.hash));
        let entries = replica.utxo_set.entries().unwrap();

        for height in [1, 2] {
            let coinbase = Transaction::new_coinbase(&KeyPair::generate().address(), "");
            let mut block = Block::candidate(vec![coinbase], genesis.hash, height);
            let solution = replica.blockchain.pow().solve(&block, None).unwrap();
            block.seal(solution.nonce, solution.hash);

            let result = replica.blockchain.commit(&block);
            assert!(matches!(result, Err(LedgerError::ConsensusFailure(_))));
            assert!(!replica.blockchain.has_block(&block.hash).unwrap());
        }

        assert_eq!(replica.blockchain.tip().unwrap(), Some(block2.hash));
        assert_eq!(replica.utxo_set.entries().unwrap(), entries);
    }

    #[test]
    fn test_add_block_rejects_bad_proof_of_work() {
        let source = ledger(&KeyPair::generate().address());
        let mut block = reward_block(&source);
        block.nonce += 1;

        let replica = Storage::memory(TEST_BITS).unwrap();
        let result = replica.blockchain.add_block(&block);
        assert!(matches!(result, Err(LedgerError::ConsensusFailure(_))));
        assert!(!replica.blockchain.has_block(&block.hash).unwrap());
    }

    #[test]
    fn test_find_utxo_after_spends() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let storage = ledger(&alice.address());

        let tx = TransactionBuilder::new_spend(&alice, &bob.address(), 4, &storage.utxo_set).unwrap();
        storage.blockchain.append(vec![tx.clone()], None).unwrap();

        let unspent = storage.blockchain.find_utxo().unwrap();
        assert_eq!(unspent.len(), 1);
        assert_eq!(unspent[&tx.id], UnspentOutput::all_of(&tx.outputs));
    }
}
