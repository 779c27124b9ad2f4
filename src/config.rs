// Protocol constants and per-node configuration

use std::path::PathBuf;
use std::time::Duration;

/// Reward paid by every coinbase transaction
pub const SUBSIDY: u64 = 10;

/// Leading zero bits required of a block hash
pub const DEFAULT_DIFFICULTY_BITS: u32 = 24;

pub const PROTOCOL_VERSION: u32 = 1;

/// Width of the null-padded command name in every frame
pub const COMMAND_LENGTH: usize = 12;

/// Relay root every non-central node reports to on startup
pub const DEFAULT_CENTRAL_NODE: &str = "localhost:3000";

/// Pending transactions needed before the relay root mines
pub const DEFAULT_MINING_THRESHOLD: usize = 2;

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub const GENESIS_COINBASE_DATA: &str =
    "The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

/// Node configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub node_id: String,
    pub data_dir: PathBuf,
    /// Address this node advertises and listens on
    pub node_address: String,
    /// Relay root (first known peer)
    pub central_node: String,
    pub difficulty_bits: u32,
    pub mining_threshold: usize,
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Config {
    /// Defaults for a node identified by its port number
    pub fn for_node(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            data_dir: PathBuf::from("./data"),
            node_address: format!("localhost:{}", node_id),
            central_node: DEFAULT_CENTRAL_NODE.to_string(),
            difficulty_bits: DEFAULT_DIFFICULTY_BITS,
            mining_threshold: DEFAULT_MINING_THRESHOLD,
            read_timeout: DEFAULT_READ_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Database directory of this node
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(format!("blockchain_{}", self.node_id))
    }

    /// Wallet file of this node
    pub fn wallet_path(&self) -> PathBuf {
        self.data_dir.join(format!("wallet_{}.json", self.node_id))
    }

    /// Whether this node is the relay root
    pub fn is_central(&self) -> bool {
        self.node_address == self.central_node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_for_node() {
        let config = Config::for_node("3001");

        assert_eq!(config.node_address, "localhost:3001");
        assert_eq!(config.difficulty_bits, DEFAULT_DIFFICULTY_BITS);
        assert!(!config.is_central());
        assert!(config.db_path().ends_with("blockchain_3001"));
        assert!(config.wallet_path().ends_with("wallet_3001.json"));
    }

    #[test]
    fn test_central_node() {
        let config = Config::for_node("3000");
        assert!(config.is_central());
    }
}
