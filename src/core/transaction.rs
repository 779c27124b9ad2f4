// Transaction data structures, signing and verification

use crate::config::SUBSIDY;
use crate::core::hash::KEY_HASH_LEN;
use crate::core::serialize::{
    read_hash, read_len, read_u32, read_u64, read_var_bytes, write_var_bytes, write_varint,
};
use crate::core::{hash_pub_key, sha256, Address, Hash256, Serializable};
use crate::error::{LedgerError, Result};
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use std::collections::HashMap;
use std::fmt;
use std::io::{Cursor, Read};
use std::time::{SystemTime, UNIX_EPOCH};

/// Output index carried by the coinbase input
pub const COINBASE_VOUT: i32 = -1;

/// Transaction input - references a previous transaction output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    /// Id of the previous transaction (zero for coinbase)
    pub txid: Hash256,
    /// Index of the output in the previous transaction (-1 for coinbase)
    pub vout: i32,
    /// Compact ECDSA signature, r || s
    pub signature: Vec<u8>,
    /// Signer public key as x || y (memo bytes for coinbase)
    pub pub_key: Vec<u8>,
}

impl TxInput {
    /// Create a new unsigned input spending `txid:vout`
    pub fn new(txid: Hash256, vout: i32, pub_key: Vec<u8>) -> Self {
        Self {
            txid,
            vout,
            signature: Vec::new(),
            pub_key,
        }
    }

    /// Create a coinbase input carrying the memo as filler
    pub fn coinbase(memo: &[u8]) -> Self {
        Self {
            txid: Hash256::zero(),
            vout: COINBASE_VOUT,
            signature: Vec::new(),
            pub_key: memo.to_vec(),
        }
    }

    /// Check if this is a coinbase input
    pub fn is_coinbase(&self) -> bool {
        self.txid.is_zero() && self.vout == COINBASE_VOUT
    }

    /// Whether this input was signed by the owner of `key_hash`
    pub fn uses_key(&self, key_hash: &[u8; KEY_HASH_LEN]) -> bool {
        &hash_pub_key(&self.pub_key) == key_hash
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.txid.as_bytes());
        buf.extend_from_slice(&self.vout.to_le_bytes());
        write_var_bytes(buf, &self.signature);
        write_var_bytes(buf, &self.pub_key);
    }

    fn read_from<R: Read + ?Sized>(reader: &mut R) -> std::io::Result<Self> {
        Ok(Self {
            txid: read_hash(reader)?,
            vout: read_u32(reader)? as i32,
            signature: read_var_bytes(reader)?,
            pub_key: read_var_bytes(reader)?,
        })
    }
}

/// Transaction output - an amount locked to a key-hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub value: u64,
    pub key_hash: [u8; KEY_HASH_LEN],
}

impl TxOutput {
    pub fn new(value: u64, key_hash: [u8; KEY_HASH_LEN]) -> Self {
        Self { value, key_hash }
    }

    /// Output of `value` locked to `address`
    pub fn locked_to(value: u64, address: &Address) -> Self {
        Self::new(value, *address.key_hash())
    }

    pub fn is_locked_with_key(&self, key_hash: &[u8; KEY_HASH_LEN]) -> bool {
        &self.key_hash == key_hash
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.value.to_le_bytes());
        buf.extend_from_slice(&self.key_hash);
    }

    fn read_from<R: Read + ?Sized>(reader: &mut R) -> std::io::Result<Self> {
        let value = read_u64(reader)?;
        let mut key_hash = [0u8; KEY_HASH_LEN];
        reader.read_exact(&mut key_hash)?;
        Ok(Self { value, key_hash })
    }
}

/// Transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Hash of the transaction with id and signatures cleared
    pub id: Hash256,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Create a transaction and assign its id
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        let mut tx = Self {
            id: Hash256::zero(),
            inputs,
            outputs,
        };
        tx.id = tx.hash();
        tx
    }

    /// Create a coinbase transaction paying the subsidy to `to`.
    /// An empty memo is replaced by one unique to this call so that two
    /// rewards to the same address never share an id.
    pub fn new_coinbase(to: &Address, memo: &str) -> Self {
        let memo = if memo.is_empty() {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default();
            format!("Reward to '{}' at {} #{:016x}", to, nanos, rand::random::<u64>())
        } else {
            memo.to_string()
        };

        log::debug!("New coinbase to {}", to);
        Self::new(
            vec![TxInput::coinbase(memo.as_bytes())],
            vec![TxOutput::locked_to(SUBSIDY, to)],
        )
    }

    /// Check if this is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_coinbase()
    }

    /// Identity hash: SHA256 of the serialization with id and signatures cleared
    pub fn hash(&self) -> Hash256 {
        let mut copy = self.clone();
        copy.id = Hash256::zero();
        for input in &mut copy.inputs {
            input.signature.clear();
        }
        sha256(&copy.serialize())
    }

    /// Total output value
    pub fn total_output_value(&self) -> u64 {
        self.outputs.iter().map(|out| out.value).sum()
    }

    /// Copy with every signature and public key removed
    pub fn trimmed_copy(&self) -> Self {
        let inputs = self
            .inputs
            .iter()
            .map(|input| TxInput::new(input.txid, input.vout, Vec::new()))
            .collect();

        Self {
            id: self.id,
            inputs,
            outputs: self.outputs.clone(),
        }
    }

    /// Digest signed for input `index` of a trimmed copy: the input's key
    /// slot temporarily holds the hash of the transaction it spends from.
    fn signing_digest(&mut self, index: usize, prev_tx: &Transaction) -> Hash256 {
        self.inputs[index].pub_key = prev_tx.hash().as_bytes().to_vec();
        let digest = self.hash();
        self.inputs[index].pub_key.clear();
        digest
    }

    /// Sign every input. Coinbase transactions are never signed.
    pub fn sign(
        &mut self,
        secret_key: &SecretKey,
        prev_txs: &HashMap<Hash256, Transaction>,
    ) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }

        let secp = Secp256k1::signing_only();
        let mut trimmed = self.trimmed_copy();

        for index in 0..self.inputs.len() {
            let prev_txid = self.inputs[index].txid;
            let prev_tx = prev_txs.get(&prev_txid).ok_or_else(|| {
                LedgerError::NotFound(format!("previous transaction {}", prev_txid))
            })?;

            let digest = trimmed.signing_digest(index, prev_tx);
            let message = Message::from_digest(digest.0);
            let signature = secp.sign_ecdsa(&message, secret_key);

            self.inputs[index].signature = signature.serialize_compact().to_vec();
        }

        Ok(())
    }

    /// Verify every input signature against the outputs it spends.
    /// Any failing input fails the whole transaction.
    pub fn verify(&self, prev_txs: &HashMap<Hash256, Transaction>) -> bool {
        if self.is_coinbase() {
            return true;
        }

        let secp = Secp256k1::verification_only();
        let mut trimmed = self.trimmed_copy();

        for (index, input) in self.inputs.iter().enumerate() {
            let Some(prev_tx) = prev_txs.get(&input.txid) else {
                log::debug!("tx {}: previous transaction {} missing", self.id, input.txid);
                return false;
            };

            let spent = usize::try_from(input.vout)
                .ok()
                .and_then(|vout| prev_tx.outputs.get(vout));
            match spent {
                Some(output) if input.uses_key(&output.key_hash) => {}
                _ => {
                    log::debug!("tx {}: input {} does not unlock its output", self.id, index);
                    return false;
                }
            }

            let Ok(signature) = Signature::from_compact(&input.signature) else {
                return false;
            };
            let Ok(public_key) = public_key_from_raw(&input.pub_key) else {
                return false;
            };

            let digest = trimmed.signing_digest(index, prev_tx);
            let message = Message::from_digest(digest.0);
            if secp.verify_ecdsa(&message, &signature, &public_key).is_err() {
                log::debug!("tx {}: bad signature on input {}", self.id, index);
                return false;
            }
        }

        true
    }

    /// Deserialize from a reader
    pub fn from_reader<R: Read + ?Sized>(reader: &mut R) -> std::io::Result<Self> {
        let id = read_hash(reader)?;

        let input_count = read_len(reader)?;
        let mut inputs = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            inputs.push(TxInput::read_from(reader)?);
        }

        let output_count = read_len(reader)?;
        let mut outputs = Vec::with_capacity(output_count.min(1024));
        for _ in 0..output_count {
            outputs.push(TxOutput::read_from(reader)?);
        }

        Ok(Self { id, inputs, outputs })
    }

    pub(crate) fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.id.as_bytes());

        write_varint(buf, self.inputs.len() as u64);
        for input in &self.inputs {
            input.write_to(buf);
        }

        write_varint(buf, self.outputs.len() as u64);
        for output in &self.outputs {
            output.write_to(buf);
        }
    }
}

/// Rebuild a public key from its raw x || y coordinates
pub fn public_key_from_raw(raw: &[u8]) -> std::result::Result<PublicKey, secp256k1::Error> {
    let mut uncompressed = Vec::with_capacity(65);
    uncompressed.push(0x04);
    uncompressed.extend_from_slice(raw);
    PublicKey::from_slice(&uncompressed)
}

impl Serializable for Transaction {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_to(&mut buf);
        buf
    }

    fn deserialize(data: &[u8]) -> std::result::Result<Self, String> {
        let mut cursor = Cursor::new(data);
        let tx = Self::from_reader(&mut cursor).map_err(|e| e.to_string())?;
        if cursor.position() as usize != data.len() {
            return Err("Trailing bytes after transaction".to_string());
        }
        Ok(tx)
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "--- Transaction {}:", self.id)?;
        for (i, input) in self.inputs.iter().enumerate() {
            writeln!(f, "     Input {}:", i)?;
            writeln!(f, "       TXID:      {}", input.txid)?;
            writeln!(f, "       Out:       {}", input.vout)?;
            writeln!(f, "       Signature: {}", hex::encode(&input.signature))?;
            writeln!(f, "       PubKey:    {}", hex::encode(&input.pub_key))?;
        }
        for (i, output) in self.outputs.iter().enumerate() {
            writeln!(f, "     Output {}:", i)?;
            writeln!(f, "       Value:  {}", output.value)?;
            writeln!(f, "       KeyHash: {}", hex::encode(output.key_hash))?;
        }
        Ok(())
    }
}
