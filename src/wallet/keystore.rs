// Key management

use crate::core::{hash_pub_key, Address, KEY_HASH_LEN};
use crate::error::{LedgerError, Result};
use rand::rngs::OsRng;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Serializable key pair (for storage)
#[derive(Serialize, Deserialize)]
struct SerializableKeyPair {
    /// Hex-encoded 32-byte secret scalar
    secret_key: String,
}

/// secp256k1 key pair
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generate a new key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);

        Self { secret_key, public_key }
    }

    /// Create from secret key bytes
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let secp = Secp256k1::new();
        let secret_key =
            SecretKey::from_slice(bytes).map_err(|e| LedgerError::Wallet(format!("Invalid secret key: {}", e)))?;
        let public_key = secret_key.public_key(&secp);

        Ok(Self { secret_key, public_key })
    }

    /// Public key as raw x || y coordinates (64 bytes)
    pub fn pub_key_bytes(&self) -> Vec<u8> {
        self.public_key.serialize_uncompressed()[1..].to_vec()
    }

    pub fn key_hash(&self) -> [u8; KEY_HASH_LEN] {
        hash_pub_key(&self.pub_key_bytes())
    }

    pub fn address(&self) -> Address {
        Address::from_key_hash(&self.key_hash())
    }

    fn to_serializable(&self) -> SerializableKeyPair {
        SerializableKeyPair {
            secret_key: hex::encode(self.secret_key.secret_bytes()),
        }
    }

    fn from_serializable(stored: &SerializableKeyPair) -> Result<Self> {
        let bytes = hex::decode(&stored.secret_key)
            .map_err(|e| LedgerError::Wallet(format!("Invalid secret key encoding: {}", e)))?;
        Self::from_secret_bytes(&bytes)
    }
}

#[derive(Serialize, Deserialize, Default)]
struct SerializableWallets {
    wallets: BTreeMap<String, SerializableKeyPair>,
}

/// Wallet collection - key pairs indexed by their address
#[derive(Default)]
pub struct Wallets {
    keys: BTreeMap<String, KeyPair>,
}

impl Wallets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a key pair, store it and return its address
    pub fn create_wallet(&mut self) -> Address {
        let keypair = KeyPair::generate();
        let address = keypair.address();

        self.keys.insert(address.to_string(), keypair);
        log::debug!("Created wallet {}", address);
        address
    }

    /// Get key pair for address
    pub fn get(&self, address: &Address) -> Option<&KeyPair> {
        self.keys.get(address.as_str())
    }

    /// Key pair for `address`, or a wallet error naming it
    pub fn require(&self, address: &Address) -> Result<&KeyPair> {
        self.get(address)
            .ok_or_else(|| LedgerError::Wallet(format!("no key for address {} in this wallet file", address)))
    }

    /// All stored addresses, sorted
    pub fn addresses(&self) -> Vec<String> {
        self.keys.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Save all wallets as JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let data = SerializableWallets {
            wallets: self
                .keys
                .iter()
                .map(|(address, keypair)| (address.clone(), keypair.to_serializable()))
                .collect(),
        };

        let json = serde_json::to_string_pretty(&data)
            .map_err(|e| LedgerError::Wallet(format!("Failed to serialize wallets: {}", e)))?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path.as_ref(), json)?;
        Ok(())
    }

    /// Load wallets from a JSON file. A missing file is an empty collection.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new());
        }

        let json = fs::read_to_string(path)?;
        let data: SerializableWallets = serde_json::from_str(&json)
            .map_err(|e| LedgerError::Wallet(format!("Failed to parse {}: {}", path.display(), e)))?;

        let mut keys = BTreeMap::new();
        for (address, stored) in &data.wallets {
            let keypair = KeyPair::from_serializable(stored)?;
            if keypair.address().as_str() != address {
                return Err(LedgerError::Wallet(format!("key does not match address {}", address)));
            }
            keys.insert(address.clone(), keypair);
        }

        Ok(Self { keys })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ledger-{}-{:016x}.json", name, rand::random::<u64>()))
    }

    #[test]
    fn test_keypair_generation() {
        let kp = KeyPair::generate();

        assert_eq!(kp.pub_key_bytes().len(), 64);
        assert_eq!(kp.key_hash(), hash_pub_key(&kp.pub_key_bytes()));
        assert!(Address::validate(kp.address().as_str()));
    }

    #[test]
    fn test_keypair_from_secret_bytes() {
        let kp = KeyPair::generate();
        let restored = KeyPair::from_secret_bytes(&kp.secret_key.secret_bytes()).unwrap();

        assert_eq!(restored.public_key, kp.public_key);
        assert_eq!(restored.address(), kp.address());
        assert!(KeyPair::from_secret_bytes(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_wallets() {
        let mut wallets = Wallets::new();
        assert!(wallets.is_empty());

        let addr1 = wallets.create_wallet();
        let addr2 = wallets.create_wallet();
        assert_eq!(wallets.len(), 2);

        assert_eq!(wallets.get(&addr1).unwrap().address(), addr1);
        assert!(wallets.require(&addr2).is_ok());
        assert!(wallets.require(&KeyPair::generate().address()).is_err());

        let addresses = wallets.addresses();
        assert!(addresses.contains(&addr1.to_string()));
        assert!(addresses.contains(&addr2.to_string()));
    }

    #[test]
    fn test_save_and_load() {
        let path = temp_path("wallets");
        let mut wallets = Wallets::new();
        let address = wallets.create_wallet();
        wallets.save(&path).unwrap();

        let loaded = Wallets::load(&path).unwrap();
        assert_eq!(loaded.addresses(), wallets.addresses());
        assert_eq!(
            loaded.get(&address).unwrap().secret_key,
            wallets.get(&address).unwrap().secret_key
        );

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let wallets = Wallets::load(temp_path("missing")).unwrap();
        assert!(wallets.is_empty());
    }

    #[test]
    fn test_load_rejects_mismatched_address() {
        let path = temp_path("mismatch");
        let json = format!(
            r#"{{"wallets": {{"{}": {{"secret_key": "{}"}}}}}}"#,
            KeyPair::generate().address(),
            hex::encode(KeyPair::generate().secret_key.secret_bytes())
        );
        fs::write(&path, json).unwrap();

        assert!(Wallets::load(&path).is_err());
        fs::remove_file(&path).unwrap();
    }
}
