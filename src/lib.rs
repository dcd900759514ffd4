//! Full-validation chain engine for the Crown (CRW) network.
//!
//! The crate ingests blocks from the peer-to-peer wire, verifies them
//! against consensus rules, maintains a pruned UTXO-backed block store
//! with reorganization support, and exposes the resulting state to
//! listeners such as wallets.
//!
//! The pieces, leaves first: [`core`] holds hashes, amounts, the
//! transaction/block model, canonical serialization, and the script
//! engine. [`consensus`] holds network parameters, proof-of-work
//! arithmetic, context-free validation, and the [`ChainEngine`] that
//! connects, disconnects, and reorganizes blocks. [`storage`] is the
//! persistent store behind the engine, and [`network`] speaks the wire
//! protocol with remote peers. [`events`] fans chain changes out to
//! observers.

pub mod consensus;
pub mod core;
pub mod events;
pub mod network;
pub mod storage;

pub use consensus::{AddBlockResult, ChainEngine, ChainError, NetworkParams, VerificationError};
pub use core::{Block, BlockHeader, Coin, Hash256, OutPoint, Transaction, TxInput, TxOutput};
pub use events::{BlockOrigin, ChainListener, ListenerRegistry};
pub use network::Node;
pub use storage::{ChainStore, SledChainStore, StoredBlock, UtxoEntry};
