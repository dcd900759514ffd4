// Consensus rules: parameters, proof of work, validation, and the chain
// engine

pub mod chain;
pub mod params;
pub mod pow;
pub mod validation;

pub use chain::{AddBlockResult, ChainEngine, ChainError};
pub use params::{Network, NetworkParams, MAX_BLOCK_SIZE, MAX_MONEY};
pub use pow::{next_retarget, Target, Uint256};
pub use validation::{check_block, check_transaction, VerificationError};
