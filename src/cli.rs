// CLI commands

use crate::config::{Config, DEFAULT_DIFFICULTY_BITS};
use crate::core::{Address, Transaction};
use crate::error::{LedgerError, Result};
use crate::network::{self, Message, Node};
use crate::storage::Storage;
use crate::wallet::{TransactionBuilder, Wallets};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "utxo-ledger")]
#[command(about = "Minimal proof-of-work UTXO ledger", long_about = None)]
pub struct Cli {
    /// Node identity; also the port this node listens on
    #[arg(long, env = "NODE_ID", default_value = "3000")]
    pub node_id: String,

    /// Directory holding the database and wallet files
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// Leading zero bits required of a block hash
    #[arg(long, default_value_t = DEFAULT_DIFFICULTY_BITS)]
    pub difficulty: u32,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a blockchain and pay the genesis reward to ADDRESS
    CreateBlockchain {
        #[arg(long)]
        address: String,
    },

    /// Generate a key pair and store it in the wallet file
    CreateWallet,

    /// List addresses in the wallet file
    ListAddresses,

    /// Get balance for an address
    GetBalance {
        #[arg(long)]
        address: String,
    },

    /// Send coins from one address to another
    Send {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: u64,
        /// Mine the transaction on this node instead of relaying it
        #[arg(long)]
        mine: bool,
        /// Pay a block reward to this address when mining
        #[arg(long, requires = "mine")]
        reward: Option<String>,
    },

    /// Print all blocks from tip to genesis
    PrintChain,

    /// Rebuild the UTXO index from the chain
    ReindexUtxo,

    /// Start a network node
    StartNode {
        /// Mine relayed transactions and pay rewards to this address
        #[arg(long)]
        miner: Option<String>,
    },
}

/// CLI handler
pub struct CliHandler {
    config: Config,
}

impl CliHandler {
    /// Create a new CLI handler
    pub fn new(cli: &Cli) -> Self {
        let mut config = Config::for_node(&cli.node_id);
        config.data_dir = cli.data_dir.clone();
        config.difficulty_bits = cli.difficulty;

        Self { config }
    }

    fn open_storage(&self) -> Result<Storage> {
        Storage::open(self.config.db_path(), self.config.difficulty_bits)
    }

    /// Storage of a chain that must already exist
    fn open_chain(&self) -> Result<Storage> {
        let storage = self.open_storage()?;
        if !storage.blockchain.is_initialized()? {
            return Err(LedgerError::NotFound(
                "no blockchain found; create one with 'create-blockchain'".to_string(),
            ));
        }
        Ok(storage)
    }

    fn load_wallets(&self) -> Result<Wallets> {
        Wallets::load(self.config.wallet_path())
    }

    /// Handle CLI command
    pub async fn handle(&self, command: Commands) -> Result<()> {
        match command {
            Commands::CreateBlockchain { address } => self.create_blockchain(&address),
            Commands::CreateWallet => self.create_wallet(),
            Commands::ListAddresses => self.list_addresses(),
            Commands::GetBalance { address } => self.get_balance(&address),
            Commands::Send {
                from,
                to,
                amount,
                mine,
                reward,
            } => self.send(&from, &to, amount, mine, reward.as_deref()).await,
            Commands::PrintChain => self.print_chain(),
            Commands::ReindexUtxo => self.reindex_utxo(),
            Commands::StartNode { miner } => self.start_node(miner.as_deref()).await,
        }
    }

    fn create_blockchain(&self, address: &str) -> Result<()> {
        let address = Address::parse(address)?;
        let storage = self.open_storage()?;

        println!("Mining genesis block...");
        let genesis = storage.blockchain.create_genesis(&address)?;
        storage.flush()?;

        println!("✓ Blockchain created");
        println!("  Genesis: {}", genesis.hash);
        println!("  Reward to: {}", address);
        Ok(())
    }

    fn create_wallet(&self) -> Result<()> {
        let path = self.config.wallet_path();
        let mut wallets = self.load_wallets()?;
        let address = wallets.create_wallet();
        wallets.save(&path)?;

        println!("New address: {}", address);
        Ok(())
    }

    fn list_addresses(&self) -> Result<()> {
        let wallets = self.load_wallets()?;
        println!("Addresses ({}):", wallets.len());
        for address in wallets.addresses() {
            println!("  {}", address);
        }
        Ok(())
    }

    fn get_balance(&self, address: &str) -> Result<()> {
        let address = Address::parse(address)?;
        let storage = self.open_chain()?;
        let balance = TransactionBuilder::new(&storage.utxo_set).get_balance(&address)?;

        println!("Balance of '{}': {}", address, balance);
        Ok(())
    }

    async fn send(&self, from: &str, to: &str, amount: u64, mine: bool, reward: Option<&str>) -> Result<()> {
        let from = Address::parse(from)?;
        let to = Address::parse(to)?;
        let reward = reward.map(Address::parse).transpose()?;

        let storage = self.open_chain()?;
        let wallets = self.load_wallets()?;
        let keypair = wallets.require(&from)?;
        let tx = TransactionBuilder::new_spend(keypair, &to, amount, &storage.utxo_set)?;

        if mine {
            let mut transactions = vec![tx];
            if let Some(reward) = &reward {
                transactions.push(Transaction::new_coinbase(reward, ""));
            }

            let block = storage.blockchain.append(transactions, None)?;
            storage.flush()?;
            println!("✓ Mined block {} at height {}", block.hash, block.height);
        } else {
            let message = Message::tx(&tx, &self.config.node_address);
            network::send_message(&self.config.central_node, &message, self.config.connect_timeout).await?;
            println!("✓ Transaction {} sent to {}", tx.id, self.config.central_node);
        }

        Ok(())
    }

    fn print_chain(&self) -> Result<()> {
        let storage = self.open_chain()?;
        let pow = storage.blockchain.pow();

        for block in storage.blockchain.iter()? {
            let block = block?;
            println!("============ Block {} ============", block.hash);
            println!("  Height: {}", block.height);
            println!("  Previous: {}", block.prev_block_hash);
            println!("  Timestamp: {}", block.timestamp);
            println!("  Nonce: {}", block.nonce);
            println!("  PoW valid: {}", pow.validate(&block));
            println!("  Transactions: {}", block.transactions.len());

            for (i, tx) in block.transactions.iter().enumerate() {
                let kind = if tx.is_coinbase() { "coinbase" } else { "transfer" };
                println!("    [{}] {} ({})", i, tx.id, kind);
                for input in tx.inputs.iter().filter(|input| !input.is_coinbase()) {
                    println!("        in  {}:{}", input.txid, input.vout);
                }
                for (index, output) in tx.outputs.iter().enumerate() {
                    println!(
                        "        out {}: {} to {}",
                        index,
                        output.value,
                        Address::from_key_hash(&output.key_hash)
                    );
                }
            }
            println!();
        }
        Ok(())
    }

    fn reindex_utxo(&self) -> Result<()> {
        let storage = self.open_chain()?;
        storage.utxo_set.reindex()?;
        storage.flush()?;

        let count = storage.utxo_set.count_transactions()?;
        println!("✓ Reindexed; {} transactions in the UTXO set", count);
        Ok(())
    }

    async fn start_node(&self, miner: Option<&str>) -> Result<()> {
        let miner = miner.map(Address::parse).transpose()?;
        let storage = self.open_storage()?;

        println!("Starting node {}", self.config.node_address);
        Node::new(self.config.clone(), storage, miner).start().await
    }
}
