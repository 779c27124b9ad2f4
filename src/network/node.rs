// Network node - request dispatch, relay and mining policy

use crate::config::{Config, PROTOCOL_VERSION};
use crate::consensus::TransactionValidator;
use crate::core::{Address, Block, Hash256, Transaction};
use crate::error::{LedgerError, Result};
use crate::network::message::{InvType, Message};
use crate::network::peer::{self, Peer};
use crate::storage::Storage;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// Pending transactions in arrival order
#[derive(Debug, Default)]
pub struct Mempool {
    transactions: Vec<Transaction>,
}

impl Mempool {
    pub fn contains(&self, id: &Hash256) -> bool {
        self.transactions.iter().any(|tx| tx.id == *id)
    }

    pub fn get(&self, id: &Hash256) -> Option<&Transaction> {
        self.transactions.iter().find(|tx| tx.id == *id)
    }

    /// Add a transaction; false if it is already pending
    pub fn insert(&mut self, tx: Transaction) -> bool {
        if self.contains(&tx.id) {
            return false;
        }
        self.transactions.push(tx);
        true
    }

    pub fn remove(&mut self, id: &Hash256) -> Option<Transaction> {
        let index = self.transactions.iter().position(|tx| tx.id == *id)?;
        Some(self.transactions.remove(index))
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

/// State shared by every connection handler
#[derive(Debug, Default)]
struct NodeState {
    /// Known peers; the relay root comes first
    known_nodes: Vec<String>,
    mempool: Mempool,
    /// Announced blocks not yet requested, in announcement order
    blocks_in_transit: VecDeque<Hash256>,
    mining: bool,
    /// Threshold reached again while a run was active
    mining_requested: bool,
    /// Height of the candidate block being mined
    mining_height: Option<u64>,
}

impl NodeState {
    /// Ask for a mining run; true when the caller has to start one
    fn request_mining(&mut self) -> bool {
        if self.mining {
            self.mining_requested = true;
            return false;
        }
        self.mining = true;
        true
    }

    /// End the active run; true when a request arrived meanwhile and the
    /// run has to go on
    fn finish_mining(&mut self) -> bool {
        self.mining_height = None;
        if std::mem::take(&mut self.mining_requested) {
            return true;
        }
        self.mining = false;
        false
    }
}

/// Network node
#[derive(Clone)]
pub struct Node {
    config: Arc<Config>,
    storage: Storage,
    miner_address: Option<Address>,
    state: Arc<Mutex<NodeState>>,
    cancel_mining: Arc<AtomicBool>,
    /// Serializes appends and reindexes of the chainstate
    ledger_lock: Arc<std::sync::Mutex<()>>,
}

impl Node {
    /// Create a new node
    pub fn new(config: Config, storage: Storage, miner_address: Option<Address>) -> Self {
        let state = NodeState {
            known_nodes: vec![config.central_node.clone()],
            ..Default::default()
        };

        Self {
            config: Arc::new(config),
            storage,
            miner_address,
            state: Arc::new(Mutex::new(state)),
            cancel_mining: Arc::new(AtomicBool::new(false)),
            ledger_lock: Arc::new(std::sync::Mutex::new(())),
        }
    }

    /// Address this node listens on
    pub fn address(&self) -> &str {
        &self.config.node_address
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn is_central(&self) -> bool {
        self.config.is_central()
    }

    pub async fn known_nodes(&self) -> Vec<String> {
        self.state.lock().await.known_nodes.clone()
    }

    pub async fn mempool_size(&self) -> usize {
        self.state.lock().await.mempool.len()
    }

    /// Bind the configured address and serve until the process exits
    pub async fn start(self) -> Result<()> {
        let listener = TcpListener::bind(self.address())
            .await
            .map_err(|e| LedgerError::Protocol(format!("Failed to bind {}: {}", self.address(), e)))?;
        self.run(listener).await
    }

    /// Announce this node to the relay root, then handle one request per
    /// accepted connection, each in its own task
    pub async fn run(self, listener: TcpListener) -> Result<()> {
        log::info!("Node listening on {}", self.address());
        if let Some(miner) = &self.miner_address {
            log::info!("Mining is on; rewards go to {}", miner);
        }

        if !self.is_central() {
            let version = Message::version(self.best_height()?, self.address());
            self.send(&self.config.central_node, &version).await;
        }

        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let node = self.clone();
            tokio::spawn(async move {
                if let Err(e) = node.handle_connection(stream, remote.to_string()).await {
                    log::error!("Connection from {} failed: {}", remote, e);
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, remote: String) -> Result<()> {
        let mut peer = Peer::new(stream, remote);
        let message = peer.receive_message(self.config.read_timeout).await?;

        log::debug!("Received {} from {}", message.message_type().as_str(), message.addr_from());
        self.dispatch(message).await
    }

    async fn dispatch(&self, message: Message) -> Result<()> {
        match message {
            Message::Version {
                version,
                best_height,
                addr_from,
            } => self.handle_version(version, best_height, addr_from).await,
            Message::GetBlocks { addr_from } => self.handle_get_blocks(addr_from).await,
            Message::Inv { addr_from, kind, items } => self.handle_inv(addr_from, kind, items).await,
            Message::GetData {
                addr_from,
                addr_to,
                kind,
                id,
            } => self.handle_get_data(addr_from, addr_to, kind, id).await,
            Message::Block { addr_from, block } => self.handle_block(addr_from, &block).await,
            Message::Tx { addr_from, transaction } => self.handle_tx(addr_from, &transaction).await,
        }
    }

    /// Tip height, or None before the first block is stored
    fn best_height(&self) -> Result<Option<u64>> {
        if !self.storage.blockchain.is_initialized()? {
            return Ok(None);
        }
        Ok(Some(self.storage.blockchain.best_height()?))
    }

    /// Run chain work on the blocking pool
    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(Storage) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || work(storage))
            .await
            .map_err(|e| LedgerError::Storage(format!("Ledger task failed: {}", e)))?
    }

    /// Deliver `message`; an unreachable peer is dropped from the known list
    async fn send(&self, addr: &str, message: &Message) {
        if let Err(e) = peer::send_message(addr, message, self.config.connect_timeout).await {
            log::warn!("Peer {} is not reachable, forgetting it: {}", addr, e);
            self.state.lock().await.known_nodes.retain(|node| node != addr);
        }
    }

    async fn handle_version(&self, version: u32, best_height: Option<u64>, addr_from: String) -> Result<()> {
        if version != PROTOCOL_VERSION {
            return Err(LedgerError::Protocol(format!(
                "{} speaks protocol version {}, expected {}",
                addr_from, version, PROTOCOL_VERSION
            )));
        }

        let is_new = {
            let mut state = self.state.lock().await;
            let is_new = addr_from != self.address() && !state.known_nodes.contains(&addr_from);
            if is_new {
                log::info!("New peer {}", addr_from);
                state.known_nodes.push(addr_from.clone());
            }
            is_new
        };

        let my_height = self.best_height()?;
        if my_height > best_height {
            self.send(&addr_from, &Message::version(my_height, self.address())).await;
        }
        if best_height > my_height || is_new {
            log::info!("Requesting blocks from {} (height {:?}, mine {:?})", addr_from, best_height, my_height);
            let request = Message::GetBlocks {
                addr_from: self.address().to_string(),
            };
            self.send(&addr_from, &request).await;
        }

        Ok(())
    }

    async fn handle_get_blocks(&self, addr_from: String) -> Result<()> {
        let inventory = Message::Inv {
            addr_from: self.address().to_string(),
            kind: InvType::Block,
            items: self.blocking(|storage| storage.blockchain.block_hashes()).await?,
        };
        self.send(&addr_from, &inventory).await;
        Ok(())
    }

    async fn handle_inv(&self, addr_from: String, kind: InvType, items: Vec<Hash256>) -> Result<()> {
        log::info!("Received inventory with {} {:?} item(s) from {}", items.len(), kind, addr_from);

        let mut wanted = Vec::new();
        match kind {
            InvType::Block => {
                let missing = self
                    .blocking(move |storage| {
                        let mut missing = VecDeque::new();
                        for hash in items {
                            if !storage.blockchain.has_block(&hash)? {
                                missing.push_back(hash);
                            }
                        }
                        Ok(missing)
                    })
                    .await?;

                if missing.is_empty() {
                    log::debug!("Already have every block announced by {}", addr_from);
                    return Ok(());
                }

                let mut state = self.state.lock().await;
                state.blocks_in_transit = missing;
                wanted.extend(state.blocks_in_transit.pop_front());
            }
            InvType::Tx => {
                let state = self.state.lock().await;
                wanted.extend(items.into_iter().filter(|id| !state.mempool.contains(id)));
            }
        }

        for id in wanted {
            let request = Message::GetData {
                addr_from: self.address().to_string(),
                addr_to: addr_from.clone(),
                kind,
                id,
            };
            self.send(&addr_from, &request).await;
        }
        Ok(())
    }

    async fn handle_get_data(&self, addr_from: String, addr_to: String, kind: InvType, id: Hash256) -> Result<()> {
        if addr_to != self.address() {
            log::debug!("getdata from {} was addressed to {}", addr_from, addr_to);
        }

        let reply = match kind {
            InvType::Block => {
                let block = self
                    .blocking(move |storage| match storage.blockchain.get_block(&id) {
                        Ok(block) => Ok(Some(block)),
                        Err(LedgerError::NotFound(_)) => Ok(None),
                        Err(e) => Err(e),
                    })
                    .await?;
                block.map(|block| Message::block(&block, self.address()))
            }
            InvType::Tx => {
                let state = self.state.lock().await;
                state.mempool.get(&id).map(|tx| Message::tx(tx, self.address()))
            }
        };

        match reply {
            Some(message) => self.send(&addr_from, &message).await,
            None => log::debug!("{} asked for unknown {:?} {}", addr_from, kind, id),
        }
        Ok(())
    }

    async fn handle_block(&self, addr_from: String, bytes: &[u8]) -> Result<()> {
        let block = Message::decode_block(bytes)?;

        {
            let state = self.state.lock().await;
            if state.mining_height.is_some_and(|height| block.height >= height) {
                log::info!("Competing block at height {} arrived; cancelling mining", block.height);
                self.cancel_mining.store(true, Ordering::SeqCst);
            }
        }

        let candidate = block.clone();
        let added = self
            .blocking(move |storage| storage.blockchain.add_block(&candidate))
            .await;

        let next = {
            let mut state = self.state.lock().await;
            match added {
                Ok(_) => {
                    for tx in &block.transactions {
                        state.mempool.remove(&tx.id);
                    }
                }
                Err(e) => log::warn!("Rejected block {} from {}: {}", block.hash, addr_from, e),
            }
            state.blocks_in_transit.retain(|hash| *hash != block.hash);
            state.blocks_in_transit.pop_front()
        };

        match next {
            Some(id) => {
                let request = Message::GetData {
                    addr_from: self.address().to_string(),
                    addr_to: addr_from.clone(),
                    kind: InvType::Block,
                    id,
                };
                self.send(&addr_from, &request).await;
                Ok(())
            }
            None => self.reindex().await,
        }
    }

    async fn handle_tx(&self, addr_from: String, bytes: &[u8]) -> Result<()> {
        let tx = Message::decode_transaction(bytes)?;
        if tx.is_coinbase() {
            return Err(LedgerError::InvalidTransaction(format!("{}: coinbase is not relayed", tx.id)));
        }
        if tx.id != tx.hash() {
            return Err(LedgerError::InvalidTransaction(format!("{}: id does not match contents", tx.id)));
        }

        let (pending, peers, start_mining) = {
            let mut state = self.state.lock().await;
            if !state.mempool.insert(tx.clone()) {
                log::debug!("Transaction {} already pending", tx.id);
                return Ok(());
            }

            let pending = state.mempool.len();
            let start_mining = self.is_central()
                && self.miner_address.is_some()
                && pending >= self.config.mining_threshold
                && state.request_mining();
            (pending, state.known_nodes.clone(), start_mining)
        };
        log::info!("Transaction {} added to mempool ({} pending)", tx.id, pending);

        if !self.is_central() {
            let inventory = Message::Inv {
                addr_from: self.address().to_string(),
                kind: InvType::Tx,
                items: vec![tx.id],
            };
            for node in peers.iter().filter(|node| *node != self.address() && **node != addr_from) {
                self.send(node, &inventory).await;
            }
        } else if start_mining {
            tokio::spawn(self.clone().mine_pending());
        }
        Ok(())
    }

    /// Rebuild the UTXO index off the async runtime
    async fn reindex(&self) -> Result<()> {
        let utxo_set = self.storage.utxo_set.clone();
        let ledger_lock = self.ledger_lock.clone();

        tokio::task::spawn_blocking(move || {
            let _guard = ledger_lock.lock().unwrap_or_else(|e| e.into_inner());
            utxo_set.reindex()
        })
        .await
        .map_err(|e| LedgerError::Storage(format!("Reindex task failed: {}", e)))?
    }

    /// Drive a mining run claimed through `NodeState::request_mining`.
    /// Requests that arrive while it runs keep it going.
    async fn mine_pending(self) {
        loop {
            if let Err(e) = self.mining_loop().await {
                log::error!("Mining stopped: {}", e);
            }

            if !self.state.lock().await.finish_mining() {
                return;
            }
            log::debug!("Mining requested again during the run; resuming");
        }
    }

    /// Mine while enough pending transactions remain. Stops when nothing
    /// valid is left or a competing block wins the height.
    async fn mining_loop(&self) -> Result<()> {
        let Some(miner) = self.miner_address.clone() else {
            return Ok(());
        };

        loop {
            let pending = self.state.lock().await.mempool.transactions().to_vec();
            if pending.len() < self.config.mining_threshold {
                return Ok(());
            }

            let utxo_set = self.storage.utxo_set.clone();
            let (valid, rejected) =
                tokio::task::spawn_blocking(move || TransactionValidator::new(&utxo_set).select_valid(&pending))
                    .await
                    .map_err(|e| LedgerError::ConsensusFailure(format!("Validation task failed: {}", e)))?;

            if !rejected.is_empty() {
                let mut state = self.state.lock().await;
                for id in &rejected {
                    state.mempool.remove(id);
                }
            }
            if valid.is_empty() {
                log::info!("No valid pending transactions; waiting for more");
                return Ok(());
            }

            let height = self.best_height()?.map_or(0, |height| height + 1);
            self.state.lock().await.mining_height = Some(height);
            self.cancel_mining.store(false, Ordering::SeqCst);

            let mut transactions = valid;
            transactions.push(Transaction::new_coinbase(&miner, ""));

            let blockchain = self.storage.blockchain.clone();
            let utxo_set = self.storage.utxo_set.clone();
            let cancel = self.cancel_mining.clone();
            let ledger_lock = self.ledger_lock.clone();
            let result = tokio::task::spawn_blocking(move || -> Result<Block> {
                let _guard = ledger_lock.lock().unwrap_or_else(|e| e.into_inner());
                let block = blockchain.append(transactions, Some(&cancel))?;
                utxo_set.reindex()?;
                Ok(block)
            })
            .await
            .map_err(|e| LedgerError::ConsensusFailure(format!("Mining task failed: {}", e)))?;

            self.state.lock().await.mining_height = None;

            let block = match result {
                Ok(block) => block,
                Err(e) => {
                    if let Some(reason) = lost_height_reason(&e, height, self.best_height()?) {
                        log::info!("Mining at height {} {}", height, reason);
                        return Ok(());
                    }
                    return Err(e);
                }
            };

            let peers = {
                let mut state = self.state.lock().await;
                for tx in &block.transactions {
                    state.mempool.remove(&tx.id);
                }
                state.known_nodes.clone()
            };
            log::info!("Mined block {} at height {}", block.hash, block.height);

            let inventory = Message::Inv {
                addr_from: self.address().to_string(),
                kind: InvType::Block,
                items: vec![block.hash],
            };
            for node in peers.iter().filter(|node| *node != self.address()) {
                self.send(node, &inventory).await;
            }
        }
    }
}

/// Why a failed attempt at `height` gave the height up to another block,
/// given the tip height afterwards. None for a genuine failure such as an
/// exhausted nonce space.
fn lost_height_reason(error: &LedgerError, height: u64, tip: Option<u64>) -> Option<&'static str> {
    match error {
        LedgerError::MiningCancelled => Some("cancelled by a competing block"),
        LedgerError::ConsensusFailure(_) if tip.is_some_and(|tip| tip >= height) => {
            Some("lost to a competing block")
        }
        _ => None,
    }
}
