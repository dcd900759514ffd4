// End-to-end chain engine scenarios against a temporary store

use crown_core::consensus::chain::{AddBlockResult, ChainEngine, ChainError};
use crown_core::consensus::params::NetworkParams;
use crown_core::consensus::pow::Target;
use crown_core::consensus::VerificationError;
use crown_core::core::script::{
    legacy_signature_hash, p2pkh_script, p2pkh_script_sig, SIGHASH_ALL,
};
use crown_core::core::{hash160, Coin, Hash256, OutPoint, Transaction, TxInput, TxOutput};
use crown_core::events::{BlockOrigin, ChainListener};
use crown_core::storage::{ChainStore, SledChainStore, StoredBlock};
use crown_core::{Block, BlockHeader};
use secp256k1::{Message as SecpMessage, Secp256k1, SecretKey};
use std::sync::{Arc, Mutex};

/// Everything the engine told its listeners, in order
#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    NewBest(Hash256),
    Reorganize {
        old_tip: Hash256,
        new_tip: Hash256,
        disconnected: Vec<Hash256>,
        connected: Vec<Hash256>,
    },
    TxInBlock {
        txid: Hash256,
        origin: BlockOrigin,
        index: usize,
    },
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn best_blocks(&self) -> Vec<Hash256> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::NewBest(hash) => Some(hash),
                _ => None,
            })
            .collect()
    }

    fn reorgs(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|event| matches!(event, Event::Reorganize { .. }))
            .collect()
    }
}

impl ChainListener for Recorder {
    fn new_best_block(&self, block: &StoredBlock) {
        self.events.lock().unwrap().push(Event::NewBest(block.hash()));
    }

    fn reorganize(
        &self,
        old_tip: &StoredBlock,
        new_tip: &StoredBlock,
        disconnected: &[Transaction],
        connected: &[Transaction],
    ) {
        self.events.lock().unwrap().push(Event::Reorganize {
            old_tip: old_tip.hash(),
            new_tip: new_tip.hash(),
            disconnected: disconnected.iter().map(|tx| tx.txid()).collect(),
            connected: connected.iter().map(|tx| tx.txid()).collect(),
        });
    }

    fn transaction_in_block(
        &self,
        tx: &Transaction,
        _block: &StoredBlock,
        origin: BlockOrigin,
        index: usize,
    ) {
        self.events.lock().unwrap().push(Event::TxInBlock {
            txid: tx.txid(),
            origin,
            index,
        });
    }
}

struct Harness {
    engine: ChainEngine<SledChainStore>,
    recorder: Arc<Recorder>,
    params: NetworkParams,
}

impl Harness {
    fn new() -> Self {
        let params = NetworkParams::regtest();
        let store = SledChainStore::temporary(params.max_reorg_depth).unwrap();
        let mut engine = ChainEngine::new(params.clone(), store).unwrap();
        engine.set_clock(Arc::new(|| 2_000_000_000));
        let recorder = Arc::new(Recorder::default());
        engine.register_listener(recorder.clone());
        Self {
            engine,
            recorder,
            params,
        }
    }

    fn genesis(&self) -> StoredBlock {
        StoredBlock::genesis(self.params.genesis_block().header)
    }

    /// Build a mined child of `parent` carrying `extra` transactions after
    /// the coinbase. `salt` keeps otherwise-identical coinbases distinct.
    fn make_block(&self, parent: &StoredBlock, extra: Vec<Transaction>, salt: u8) -> Block {
        self.make_block_paying(parent, extra, salt, vec![0x51])
    }

    fn make_block_paying(
        &self,
        parent: &StoredBlock,
        extra: Vec<Transaction>,
        salt: u8,
        coinbase_script: Vec<u8>,
    ) -> Block {
        let height = parent.height + 1;
        let coinbase = Transaction::coinbase(
            vec![salt, height as u8, (height >> 8) as u8],
            vec![TxOutput::new(self.params.block_subsidy(height), coinbase_script)],
        );
        let mut txs = vec![coinbase];
        txs.extend(extra);
        let merkle = Block::calculate_merkle_root(&txs);
        let mut header = BlockHeader::new(
            1,
            parent.hash(),
            merkle,
            parent.header.timestamp + 60,
            self.params.pow_limit_bits,
            0,
        );
        let target = Target::from_bits(header.bits);
        while !target.is_met_by(&header.hash()) {
            header.nonce += 1;
        }
        Block::new(header, txs)
    }

    fn add(&mut self, block: Block) -> AddBlockResult {
        self.engine.add_block(block).unwrap()
    }

    /// Extend the active chain by `count` anyone-can-spend blocks
    fn extend(&mut self, mut parent: StoredBlock, count: u32, salt: u8) -> StoredBlock {
        for _ in 0..count {
            let block = self.make_block(&parent, vec![], salt);
            assert_eq!(self.add(block.clone()), AddBlockResult::NewBest);
            parent = parent.build_next(block.header);
        }
        parent
    }
}

#[test]
fn scenario_genesis_only() {
    let harness = Harness::new();
    let head = harness.engine.chain_head().unwrap();
    assert_eq!(head.height, 0);
    assert_eq!(head.hash(), harness.params.genesis_hash());

    // The UTXO set holds exactly the genesis coinbase
    let genesis = harness.params.genesis_block();
    let coinbase_out = OutPoint::new(genesis.transactions[0].txid(), 0);
    let entry = harness
        .engine
        .store()
        .get_utxo(&coinbase_out)
        .unwrap()
        .expect("genesis coinbase in UTXO set");
    assert!(entry.is_coinbase);
    assert_eq!(entry.height, 0);
}

#[test]
fn scenario_linear_extension() {
    let mut harness = Harness::new();
    let genesis = harness.genesis();

    let b1 = harness.make_block(&genesis, vec![], 1);
    let stored1 = genesis.build_next(b1.header);
    let b2 = harness.make_block(&stored1, vec![], 2);

    assert_eq!(harness.add(b1.clone()), AddBlockResult::NewBest);
    assert_eq!(harness.add(b2.clone()), AddBlockResult::NewBest);

    assert_eq!(harness.engine.chain_head().unwrap().hash(), b2.hash());
    assert_eq!(harness.recorder.best_blocks(), vec![b1.hash(), b2.hash()]);

    // B1's subsidy is immature for another 100 blocks
    let reward = OutPoint::new(b1.transactions[0].txid(), 0);
    let premature_spend = Transaction::new(
        vec![TxInput::new(reward, vec![])],
        vec![TxOutput::new(Coin::FIFTY_COINS, vec![0x51])],
    );
    let stored2 = stored1.build_next(b2.header);
    let bad = harness.make_block(&stored2, vec![premature_spend], 3);
    match harness.engine.add_block(bad) {
        Err(ChainError::Verification(VerificationError::ImmatureCoinbase { depth, maturity })) => {
            assert_eq!(depth, 2);
            assert_eq!(maturity, 100);
        }
        other => panic!("expected immature coinbase, got {other:?}"),
    }
}

#[test]
fn scenario_orphan_then_connect() {
    let mut harness = Harness::new();
    let genesis = harness.genesis();

    let b1 = harness.make_block(&genesis, vec![], 1);
    let stored1 = genesis.build_next(b1.header);
    let b2 = harness.make_block(&stored1, vec![], 2);

    // B2 first: buffered as an orphan
    match harness.engine.add_block(b2.clone()) {
        Err(ChainError::Orphan { missing_parent, .. }) => {
            assert_eq!(missing_parent, b1.hash());
        }
        other => panic!("expected orphan, got {other:?}"),
    }

    // B1 arrives; B2 connects automatically behind it
    assert_eq!(harness.add(b1.clone()), AddBlockResult::NewBest);
    assert_eq!(harness.engine.chain_head().unwrap().hash(), b2.hash());

    // Offering B2 again changes nothing
    assert_eq!(harness.add(b2.clone()), AddBlockResult::Unchanged);

    // Exactly one new-best event per block
    assert_eq!(harness.recorder.best_blocks(), vec![b1.hash(), b2.hash()]);
}

#[test]
fn scenario_side_chain_without_reorg() {
    let mut harness = Harness::new();
    let genesis = harness.genesis();

    let b1 = harness.make_block(&genesis, vec![], 1);
    let stored1 = genesis.build_next(b1.header);
    let b2 = harness.make_block(&stored1, vec![], 2);
    let stored2 = stored1.build_next(b2.header);
    harness.add(b1);
    harness.add(b2.clone());

    // A competitor at the same height: equal work, first seen wins
    let b2_prime = harness.make_block(&stored1, vec![], 99);
    assert_eq!(harness.add(b2_prime.clone()), AddBlockResult::SideChain);
    assert_eq!(harness.engine.chain_head().unwrap().hash(), b2.hash());
    assert_ne!(b2.hash(), b2_prime.hash());

    // No best-block or reorganize notifications for the side branch
    assert_eq!(
        harness.recorder.best_blocks(),
        vec![b2.header.prev_block_hash, b2.hash()]
    );
    assert!(harness.recorder.reorgs().is_empty());
    let _ = stored2;
}

#[test]
fn scenario_reorganize_to_heavier_branch() {
    let mut harness = Harness::new();
    let genesis = harness.genesis();

    let b1 = harness.make_block(&genesis, vec![], 1);
    let stored1 = genesis.build_next(b1.header);
    let b2 = harness.make_block(&stored1, vec![], 2);
    let b2_prime = harness.make_block(&stored1, vec![], 99);
    let stored2_prime = stored1.build_next(b2_prime.header);
    let b3_prime = harness.make_block(&stored2_prime, vec![], 100);

    harness.add(b1);
    harness.add(b2.clone());
    assert_eq!(harness.add(b2_prime.clone()), AddBlockResult::SideChain);

    // The third block tips the balance to the side branch
    assert_eq!(harness.add(b3_prime.clone()), AddBlockResult::NewBest);
    assert_eq!(
        harness.engine.chain_head().unwrap().hash(),
        b3_prime.hash()
    );

    // One reorganize event, no per-block new-best for the switch
    let reorgs = harness.recorder.reorgs();
    assert_eq!(reorgs.len(), 1);
    match &reorgs[0] {
        Event::Reorganize {
            old_tip,
            new_tip,
            disconnected,
            connected,
        } => {
            assert_eq!(*old_tip, b2.hash());
            assert_eq!(*new_tip, b3_prime.hash());
            assert_eq!(
                disconnected,
                &vec![b2.transactions[0].txid()]
            );
            assert_eq!(
                connected,
                &vec![
                    b2_prime.transactions[0].txid(),
                    b3_prime.transactions[0].txid()
                ]
            );
        }
        other => panic!("unexpected event {other:?}"),
    }
    // New-best events only for the straight-line extensions
    assert_eq!(harness.recorder.best_blocks().len(), 2);

    // The UTXO set matches a fresh replay along genesis, B1, B2', B3'
    let store = harness.engine.store();
    for block in [&b2_prime, &b3_prime] {
        let out = OutPoint::new(block.transactions[0].txid(), 0);
        assert!(store.has_utxo(&out).unwrap());
    }
    let orphaned_reward = OutPoint::new(b2.transactions[0].txid(), 0);
    assert!(!store.has_utxo(&orphaned_reward).unwrap());
}

#[test]
fn scenario_double_spend_rejected() {
    let mut harness = Harness::new();
    let genesis = harness.genesis();

    // Mature a reward far enough to spend it
    let b1 = harness.make_block(&genesis, vec![], 1);
    let stored1 = genesis.build_next(b1.header);
    harness.add(b1.clone());
    let tip = harness.extend(stored1.clone(), 100, 7);

    let reward = OutPoint::new(b1.transactions[0].txid(), 0);
    let spend_a = Transaction::new(
        vec![TxInput::new(reward, vec![])],
        vec![TxOutput::new(Coin::FIFTY_COINS, vec![0x51])],
    );
    let spend_b = Transaction::new(
        vec![TxInput::new(reward, vec![])],
        vec![TxOutput::new(Coin::FIFTY_COINS, vec![0x52])],
    );

    let head_before = harness.engine.chain_head().unwrap();
    let bad = harness.make_block(&tip, vec![spend_a, spend_b], 8);
    match harness.engine.add_block(bad) {
        Err(ChainError::Verification(VerificationError::DoubleSpend(outpoint))) => {
            assert_eq!(outpoint, reward);
        }
        other => panic!("expected double spend, got {other:?}"),
    }
    // Store state is untouched by the rejected block
    assert_eq!(harness.engine.chain_head().unwrap(), head_before);
    assert!(harness.engine.store().has_utxo(&reward).unwrap());
}

#[test]
fn scenario_signed_spend_after_maturity() {
    let mut harness = Harness::new();
    let genesis = harness.genesis();

    let secp = Secp256k1::new();
    let secret = SecretKey::new(&mut secp256k1::rand::rngs::OsRng);
    let pubkey = secret.public_key(&secp).serialize().to_vec();
    let script_pubkey = p2pkh_script(&hash160(&pubkey));

    // B1 pays its subsidy to our key
    let b1 = harness.make_block_paying(&genesis, vec![], 1, script_pubkey.clone());
    let stored1 = genesis.build_next(b1.header);
    harness.add(b1.clone());
    let tip = harness.extend(stored1, 100, 9);

    // Spend it with a real signature, paying a fee
    let reward = OutPoint::new(b1.transactions[0].txid(), 0);
    let mut spend = Transaction::new(
        vec![TxInput::new(reward, vec![])],
        vec![TxOutput::new(
            Coin::FIFTY_COINS.checked_sub(Coin::CENT).unwrap(),
            vec![0x51],
        )],
    );
    let digest = legacy_signature_hash(&spend, 0, &script_pubkey, SIGHASH_ALL);
    let message = SecpMessage::from_digest_slice(digest.as_bytes()).unwrap();
    let mut signature = secp.sign_ecdsa(&message, &secret).serialize_der().to_vec();
    signature.push(SIGHASH_ALL as u8);
    spend.inputs[0].script_sig = p2pkh_script_sig(&signature, &pubkey);

    let block = harness.make_block(&tip, vec![spend.clone()], 10);
    assert_eq!(harness.add(block), AddBlockResult::NewBest);
    assert!(harness
        .engine
        .store()
        .has_utxo(&OutPoint::new(spend.txid(), 0))
        .unwrap());
    assert!(!harness.engine.store().has_utxo(&reward).unwrap());

    // Events carried the spend with its in-block position
    let saw_spend = harness.recorder.events().iter().any(|event| {
        matches!(
            event,
            Event::TxInBlock { txid, origin: BlockOrigin::BestChain, index: 1 }
                if *txid == spend.txid()
        )
    });
    assert!(saw_spend);
}
