// Network parameters: consensus constants, activation heights, genesis.
//
// Every component receives these explicitly through its constructor; there
// is no process-wide network state.

use crate::core::script::flags;
use crate::core::{Block, BlockHeader, Coin, Hash256, Transaction, TxOutput};

/// Largest serialized base block size, also the per-transaction bound
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

/// Cap on valid network money: 21,000,000 CRW in satoshis
pub const MAX_MONEY: Coin = Coin::from_sat(21_000_000 * 100_000_000);

/// Block timestamps may run at most this far ahead of network time
pub const MAX_FUTURE_DRIFT: u32 = 2 * 60 * 60;

/// Headers considered for the median-time-past rule
pub const MEDIAN_TIME_SPAN: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

/// Consensus parameters for one network
#[derive(Debug, Clone)]
pub struct NetworkParams {
    pub network: Network,
    /// Wire magic identifying the network
    pub magic: u32,
    /// Protocol version advertised in handshakes
    pub protocol_version: u32,
    /// Weakest allowed difficulty, compact form
    pub pow_limit_bits: u32,
    /// Blocks between difficulty retargets
    pub retarget_interval: u32,
    /// Intended seconds between blocks
    pub target_spacing: u32,
    /// Difficulty never retargets on this network (regtest)
    pub no_retargeting: bool,
    /// Blocks between subsidy halvings
    pub halving_interval: u32,
    /// Subsidy of the first era
    pub initial_subsidy: Coin,
    /// Confirmations before a coinbase output may be spent
    pub coinbase_maturity: u32,
    /// Undo data is kept for this many blocks; deeper reorgs are refused
    pub max_reorg_depth: u32,
    /// Soft-fork activation heights
    pub p2sh_height: u32,
    pub strict_der_height: u32,
    pub cltv_height: u32,
    pub csv_height: u32,
    pub segwit_height: u32,
    /// Genesis header fields
    genesis_time: u32,
    genesis_bits: u32,
    genesis_nonce: u32,
}

impl NetworkParams {
    pub fn mainnet() -> Self {
        Self {
            network: Network::Mainnet,
            magic: 0xb8eb_b3cd,
            protocol_version: 70_015,
            pow_limit_bits: 0x1d00ffff,
            retarget_interval: 2016,
            target_spacing: 600,
            no_retargeting: false,
            halving_interval: 210_000,
            initial_subsidy: Coin::FIFTY_COINS,
            coinbase_maturity: 100,
            max_reorg_depth: 500,
            p2sh_height: 0,
            strict_der_height: 0,
            cltv_height: 0,
            csv_height: 0,
            segwit_height: 0,
            genesis_time: 1_412_760_826,
            genesis_bits: 0x1d00ffff,
            genesis_nonce: 1_095_408,
        }
    }

    pub fn testnet() -> Self {
        Self {
            network: Network::Testnet,
            magic: 0x0709_110b,
            ..Self::mainnet()
        }
    }

    pub fn regtest() -> Self {
        Self {
            network: Network::Regtest,
            magic: 0xdab5_bffa,
            pow_limit_bits: 0x207fffff,
            no_retargeting: true,
            max_reorg_depth: 100,
            genesis_time: 1_296_688_602,
            genesis_bits: 0x207fffff,
            genesis_nonce: 2,
            ..Self::mainnet()
        }
    }

    /// Script verification flags active at the given height
    pub fn script_flags(&self, height: u32) -> u32 {
        let mut result = flags::NONE;
        if height >= self.p2sh_height {
            result |= flags::P2SH;
        }
        if height >= self.strict_der_height {
            result |= flags::STRICT_DER | flags::LOW_S;
        }
        if height >= self.cltv_height {
            result |= flags::CHECK_LOCKTIME;
        }
        if height >= self.csv_height {
            result |= flags::CHECK_SEQUENCE;
        }
        if height >= self.segwit_height {
            result |= flags::WITNESS;
        }
        result
    }

    /// Relative lock-times (BIP-68) are enforced from the CSV activation
    pub fn sequence_locks_active(&self, height: u32) -> bool {
        height >= self.csv_height
    }

    /// Coinbase subsidy at a height, halving every `halving_interval`
    pub fn block_subsidy(&self, height: u32) -> Coin {
        let halvings = height / self.halving_interval;
        if halvings >= 64 {
            return Coin::ZERO;
        }
        Coin::from_sat(self.initial_subsidy.value >> halvings)
    }

    /// The network's fixed first block
    pub fn genesis_block(&self) -> Block {
        let coinbase_sig =
            b"The Times 03/Jan/2009 Chancellor on brink of second bailout for banks".to_vec();
        let coinbase = Transaction::coinbase(
            coinbase_sig,
            vec![TxOutput::new(self.initial_subsidy, Vec::new())],
        );
        let merkle_root = Block::calculate_merkle_root(std::slice::from_ref(&coinbase));
        let header = BlockHeader::new(
            1,
            Hash256::zero(),
            merkle_root,
            self.genesis_time,
            self.genesis_bits,
            self.genesis_nonce,
        );
        Block::new(header, vec![coinbase])
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis_block().hash()
    }

    /// Seconds a full retarget period should take
    pub fn target_timespan(&self) -> u32 {
        self.retarget_interval * self.target_spacing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subsidy_halves() {
        let params = NetworkParams::mainnet();
        assert_eq!(params.block_subsidy(0), Coin::FIFTY_COINS);
        assert_eq!(params.block_subsidy(209_999), Coin::FIFTY_COINS);
        assert_eq!(
            params.block_subsidy(210_000),
            Coin::from_sat(25 * 100_000_000)
        );
        assert_eq!(
            params.block_subsidy(420_000),
            Coin::from_sat(1_250_000_000)
        );
        assert_eq!(params.block_subsidy(64 * 210_000), Coin::ZERO);
    }

    #[test]
    fn test_genesis_is_stable() {
        let params = NetworkParams::regtest();
        let genesis = params.genesis_block();
        assert!(genesis.is_genesis());
        assert!(genesis.transactions[0].is_coinbase());
        assert_eq!(genesis.hash(), params.genesis_hash());
        assert_eq!(
            genesis.header.merkle_root,
            Block::calculate_merkle_root(&genesis.transactions)
        );
    }

    #[test]
    fn test_regtest_activates_everything_at_zero() {
        let params = NetworkParams::regtest();
        let active = params.script_flags(0);
        assert_ne!(active & flags::P2SH, 0);
        assert_ne!(active & flags::WITNESS, 0);
        assert_ne!(active & flags::CHECK_SEQUENCE, 0);
    }

    #[test]
    fn test_networks_have_distinct_magic() {
        assert_ne!(NetworkParams::mainnet().magic, NetworkParams::testnet().magic);
        assert_ne!(NetworkParams::mainnet().magic, NetworkParams::regtest().magic);
    }
}
