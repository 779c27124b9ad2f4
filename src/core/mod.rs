// Core ledger data structures

mod types;
mod transaction;
mod block;
pub mod serialize;
mod merkle;
mod address;
pub mod hash;

pub use types::*;
pub use transaction::*;
pub use block::*;
pub use serialize::*;
pub use merkle::merkle_root;
pub use address::{Address, ADDRESS_VERSION};
pub use hash::{sha256, hash_pub_key, checksum, KEY_HASH_LEN};
