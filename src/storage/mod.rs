// Storage layer for blockchain and UTXO set

mod blockchain_db;
mod utxo_set;

pub use blockchain_db::{Blockchain, BlockchainIterator, TIP_KEY};
pub use utxo_set::{decode_outputs, encode_outputs, OutPoint, UnspentOutput, UtxoSet};

use crate::consensus::ProofOfWork;
use crate::error::Result;
use sled::Db;
use std::path::Path;

/// Tree holding blocks by hash and the tip pointer
pub const BLOCKS_TREE: &str = "blocks";
/// Tree holding the UTXO index
pub const CHAINSTATE_TREE: &str = "chainstate";

/// Storage manager - one sled database with the block and chainstate trees
#[derive(Clone)]
pub struct Storage {
    db: Db,
    pub blockchain: Blockchain,
    pub utxo_set: UtxoSet,
}

impl Storage {
    /// Open (or create) the database at `path`
    pub fn open<P: AsRef<Path>>(path: P, difficulty_bits: u32) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        log::debug!("Opened database at {}", path.as_ref().display());
        Self::from_db(db, difficulty_bits)
    }

    /// Create an in-memory storage (for testing)
    pub fn memory(difficulty_bits: u32) -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, difficulty_bits)
    }

    fn from_db(db: Db, difficulty_bits: u32) -> Result<Self> {
        let blocks = db.open_tree(BLOCKS_TREE)?;
        let chainstate = db.open_tree(CHAINSTATE_TREE)?;
        let blockchain = Blockchain::new(blocks, chainstate, ProofOfWork::new(difficulty_bits)?);
        let utxo_set = blockchain.utxo_set();

        Ok(Self {
            db,
            blockchain,
            utxo_set,
        })
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
