// Core chain data structures and primitives

mod block;
mod coin;
mod hash;
pub mod serialize;
mod transaction;
mod types;

pub mod script;

pub use block::*;
pub use coin::{Coin, CoinError};
pub use hash::*;
pub use serialize::{CodecError, Serializable};
pub use transaction::*;
pub use types::*;
