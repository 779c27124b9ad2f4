// Network protocol messages

use crate::config::{COMMAND_LENGTH, PROTOCOL_VERSION};
use crate::core::serialize::{
    read_hash, read_len, read_u32, read_var_bytes, read_var_str, read_varint, write_var_bytes, write_var_str,
    write_varint, MAX_VAR_LEN,
};
use crate::core::{Block, Hash256, Serializable, Transaction};
use crate::error::{LedgerError, Result};
use std::io::{Cursor, Read};

/// Frame header: command name + payload length (u32 LE)
pub const HEADER_LENGTH: usize = COMMAND_LENGTH + 4;

/// Largest payload accepted from a peer
pub const MAX_PAYLOAD_LENGTH: usize = MAX_VAR_LEN as usize;

/// Network message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Version,
    GetBlocks,
    Inv,
    GetData,
    Block,
    Tx,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Version => "version",
            MessageType::GetBlocks => "getblocks",
            MessageType::Inv => "inv",
            MessageType::GetData => "getdata",
            MessageType::Block => "block",
            MessageType::Tx => "tx",
        }
    }

    pub fn from_command(s: &str) -> Option<Self> {
        match s {
            "version" => Some(MessageType::Version),
            "getblocks" => Some(MessageType::GetBlocks),
            "inv" => Some(MessageType::Inv),
            "getdata" => Some(MessageType::GetData),
            "block" => Some(MessageType::Block),
            "tx" => Some(MessageType::Tx),
            _ => None,
        }
    }

    /// Null-padded fixed-width command name
    pub fn command_bytes(&self) -> [u8; COMMAND_LENGTH] {
        let mut bytes = [0u8; COMMAND_LENGTH];
        let name = self.as_str().as_bytes();
        bytes[..name.len()].copy_from_slice(name);
        bytes
    }

    pub fn from_command_bytes(bytes: &[u8]) -> Result<Self> {
        let name = std::str::from_utf8(bytes)
            .map_err(|e| LedgerError::Protocol(format!("Invalid command name: {}", e)))?
            .trim_end_matches('\0');

        Self::from_command(name).ok_or_else(|| LedgerError::Protocol(format!("Unknown command: {:?}", name)))
    }
}

/// Inventory type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvType {
    Block,
    Tx,
}

impl InvType {
    fn to_byte(self) -> u8 {
        match self {
            InvType::Block => 1,
            InvType::Tx => 2,
        }
    }

    fn from_byte(byte: u8) -> std::io::Result<Self> {
        match byte {
            1 => Ok(InvType::Block),
            2 => Ok(InvType::Tx),
            other => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown inventory type {}", other),
            )),
        }
    }
}

/// Network message. Every message names the address the sender listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake; `best_height` is None for a node without a chain
    Version {
        version: u32,
        best_height: Option<u64>,
        addr_from: String,
    },
    GetBlocks {
        addr_from: String,
    },
    Inv {
        addr_from: String,
        kind: InvType,
        items: Vec<Hash256>,
    },
    /// Request for one item; the reply goes to `addr_from`
    GetData {
        addr_from: String,
        addr_to: String,
        kind: InvType,
        id: Hash256,
    },
    Block {
        addr_from: String,
        block: Vec<u8>,
    },
    Tx {
        addr_from: String,
        transaction: Vec<u8>,
    },
}

impl Message {
    pub fn version(best_height: Option<u64>, addr_from: &str) -> Self {
        Message::Version {
            version: PROTOCOL_VERSION,
            best_height,
            addr_from: addr_from.to_string(),
        }
    }

    pub fn block(block: &Block, addr_from: &str) -> Self {
        Message::Block {
            addr_from: addr_from.to_string(),
            block: block.serialize(),
        }
    }

    pub fn tx(tx: &Transaction, addr_from: &str) -> Self {
        Message::Tx {
            addr_from: addr_from.to_string(),
            transaction: tx.serialize(),
        }
    }

    /// Get message type
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Version { .. } => MessageType::Version,
            Message::GetBlocks { .. } => MessageType::GetBlocks,
            Message::Inv { .. } => MessageType::Inv,
            Message::GetData { .. } => MessageType::GetData,
            Message::Block { .. } => MessageType::Block,
            Message::Tx { .. } => MessageType::Tx,
        }
    }

    /// Listening address of the sender
    pub fn addr_from(&self) -> &str {
        match self {
            Message::Version { addr_from, .. }
            | Message::GetBlocks { addr_from }
            | Message::Inv { addr_from, .. }
            | Message::GetData { addr_from, .. }
            | Message::Block { addr_from, .. }
            | Message::Tx { addr_from, .. } => addr_from,
        }
    }

    /// Serialize message to a frame: command, payload length, payload
    pub fn serialize(&self) -> Vec<u8> {
        let payload = self.serialize_payload();

        let mut bytes = Vec::with_capacity(HEADER_LENGTH + payload.len());
        bytes.extend_from_slice(&self.message_type().command_bytes());
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&payload);
        bytes
    }

    /// Serialize message payload
    fn serialize_payload(&self) -> Vec<u8> {
        let mut bytes = Vec::new();

        match self {
            Message::Version {
                version,
                best_height,
                addr_from,
            } => {
                bytes.extend_from_slice(&version.to_le_bytes());
                write_varint(&mut bytes, best_height.map_or(0, |height| height.saturating_add(1)));
                write_var_str(&mut bytes, addr_from);
            }
            Message::GetBlocks { addr_from } => {
                write_var_str(&mut bytes, addr_from);
            }
            Message::Inv { addr_from, kind, items } => {
                write_var_str(&mut bytes, addr_from);
                bytes.push(kind.to_byte());
                write_varint(&mut bytes, items.len() as u64);
                for hash in items {
                    bytes.extend_from_slice(hash.as_bytes());
                }
            }
            Message::GetData {
                addr_from,
                addr_to,
                kind,
                id,
            } => {
                write_var_str(&mut bytes, addr_from);
                write_var_str(&mut bytes, addr_to);
                bytes.push(kind.to_byte());
                bytes.extend_from_slice(id.as_bytes());
            }
            Message::Block { addr_from, block } => {
                write_var_str(&mut bytes, addr_from);
                write_var_bytes(&mut bytes, block);
            }
            Message::Tx { addr_from, transaction } => {
                write_var_str(&mut bytes, addr_from);
                write_var_bytes(&mut bytes, transaction);
            }
        }

        bytes
    }

    /// Decode a payload for a known message type; the whole payload must
    /// be consumed
    pub fn from_payload(message_type: MessageType, payload: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(payload);
        let message = Self::read_payload(message_type, &mut cursor)
            .map_err(|e| LedgerError::Protocol(format!("Malformed {} payload: {}", message_type.as_str(), e)))?;

        if cursor.position() as usize != payload.len() {
            return Err(LedgerError::Protocol(format!(
                "Trailing bytes after {} payload",
                message_type.as_str()
            )));
        }
        Ok(message)
    }

    fn read_payload<R: Read + ?Sized>(message_type: MessageType, reader: &mut R) -> std::io::Result<Self> {
        let read_kind = |reader: &mut R| -> std::io::Result<InvType> {
            let mut byte = [0u8; 1];
            reader.read_exact(&mut byte)?;
            InvType::from_byte(byte[0])
        };

        let message = match message_type {
            MessageType::Version => {
                let version = read_u32(reader)?;
                let best_height = read_varint(reader)?.checked_sub(1);
                Message::Version {
                    version,
                    best_height,
                    addr_from: read_var_str(reader)?,
                }
            }
            MessageType::GetBlocks => Message::GetBlocks {
                addr_from: read_var_str(reader)?,
            },
            MessageType::Inv => {
                let addr_from = read_var_str(reader)?;
                let kind = read_kind(reader)?;
                let count = read_len(reader)?;
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(read_hash(reader)?);
                }
                Message::Inv { addr_from, kind, items }
            }
            MessageType::GetData => Message::GetData {
                addr_from: read_var_str(reader)?,
                addr_to: read_var_str(reader)?,
                kind: read_kind(reader)?,
                id: read_hash(reader)?,
            },
            MessageType::Block => Message::Block {
                addr_from: read_var_str(reader)?,
                block: read_var_bytes(reader)?,
            },
            MessageType::Tx => Message::Tx {
                addr_from: read_var_str(reader)?,
                transaction: read_var_bytes(reader)?,
            },
        };

        Ok(message)
    }

    /// Parse the frame header into the message type and payload length
    pub fn parse_header(header: &[u8; HEADER_LENGTH]) -> Result<(MessageType, usize)> {
        let message_type = MessageType::from_command_bytes(&header[..COMMAND_LENGTH])?;

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&header[COMMAND_LENGTH..]);
        let payload_len = u32::from_le_bytes(len_bytes) as usize;

        if payload_len > MAX_PAYLOAD_LENGTH {
            return Err(LedgerError::Protocol(format!("Payload too large: {} bytes", payload_len)));
        }
        Ok((message_type, payload_len))
    }

    /// Deserialize one complete frame
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let header: &[u8; HEADER_LENGTH] = data
            .get(..HEADER_LENGTH)
            .and_then(|h| h.try_into().ok())
            .ok_or_else(|| LedgerError::Protocol("Message too short".to_string()))?;

        let (message_type, payload_len) = Self::parse_header(header)?;
        if data.len() != HEADER_LENGTH + payload_len {
            return Err(LedgerError::Protocol(format!(
                "Frame length mismatch: header says {}, got {}",
                payload_len,
                data.len() - HEADER_LENGTH
            )));
        }

        Self::from_payload(message_type, &data[HEADER_LENGTH..])
    }

    /// Decode the block carried by a `block` message
    pub fn decode_block(bytes: &[u8]) -> Result<Block> {
        Block::deserialize(bytes).map_err(|e| LedgerError::Protocol(format!("Malformed block: {}", e)))
    }

    /// Decode the transaction carried by a `tx` message
    pub fn decode_transaction(bytes: &[u8]) -> Result<Transaction> {
        Transaction::deserialize(bytes).map_err(|e| LedgerError::Protocol(format!("Malformed transaction: {}", e)))
    }
}
