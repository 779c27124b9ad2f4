// P2P networking

mod message;
mod node;
mod peer;

pub use message::{InvType, Message, MessageType, HEADER_LENGTH, MAX_PAYLOAD_LENGTH};
pub use node::{Mempool, Node};
pub use peer::{send_message, Peer};
