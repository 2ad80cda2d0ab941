//! Shared helpers for the integration tests: regtest configuration, block
//! and transaction builders, and nonce grinding for the easy regtest target

#![allow(dead_code)]

use ledger_core::economic::get_block_subsidy;
use ledger_core::hash::{block_merkle_root, calculate_block_hash, calculate_tx_id, hash_to_hex};
use ledger_core::pow::check_proof_of_work;
use ledger_core::*;
use std::path::Path;

/// Coinbase outputs mature after this many blocks in tests
pub const TEST_MATURITY: u32 = 2;

/// Locking script anyone can satisfy with an empty unlocking script
pub const OP_TRUE: u8 = 0x51;

pub fn params() -> ChainParams {
    let mut params = ChainParams::regtest();
    params.coinbase_maturity = TEST_MATURITY;
    params
}

pub fn config(dir: &Path) -> NodeConfig {
    let mut config = NodeConfig::new(dir, params());
    config.lock_timeout_ms = 200;
    config.flush_interval_ms = 50;
    config.sync_on_commit = false;
    config
}

pub fn open_chain(dir: &Path) -> ChainState {
    ChainState::open(&config(dir), Box::new(Sha256dPow)).unwrap()
}

pub fn genesis() -> Block {
    params().genesis_block()
}

pub fn block_hash(block: &Block) -> Hash {
    calculate_block_hash(&block.header)
}

pub fn txid(tx: &Transaction) -> Hash {
    calculate_tx_id(tx)
}

/// Coinbase paying `value` to OP_TRUE; `tag` keeps rival branches' coinbases distinct
pub fn coinbase(height: u32, value: Amount, tag: u8) -> Transaction {
    let mut script_sig = vec![0x04];
    script_sig.extend_from_slice(&height.to_le_bytes());
    script_sig.extend_from_slice(&[0x01, tag]);
    Transaction {
        version: 1,
        inputs: vec![TransactionInput {
            prevout: OutPoint::null(),
            script_sig,
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TransactionOutput {
            value,
            script_pubkey: vec![OP_TRUE],
        }],
        lock_time: 0,
    }
}

/// Spend output `index` of `prev` into one OP_TRUE output worth `value`
pub fn spend(prev: &Transaction, index: u32, value: Amount) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TransactionInput {
            prevout: OutPoint {
                hash: txid(prev),
                index,
            },
            script_sig: vec![],
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TransactionOutput {
            value,
            script_pubkey: vec![OP_TRUE],
        }],
        lock_time: 0,
    }
}

/// Grind the nonce until the header meets its own target
pub fn mine(header: &mut BlockHeader) {
    let params = params();
    while check_proof_of_work(&calculate_block_hash(header), header.bits, &params).is_err() {
        header.nonce += 1;
    }
}

/// Recompute the Merkle root and grind again after editing a block
pub fn remine(block: &mut Block) {
    block.header.merkle_root = block_merkle_root(&block.transactions);
    block.header.nonce = 0;
    mine(&mut block.header);
}

/// Mined child of `parent` at `height` carrying a full-subsidy coinbase
/// and `txs`
pub fn child(parent: &Block, height: u32, txs: Vec<Transaction>, tag: u8) -> Block {
    let value = get_block_subsidy(height, &params());
    let mut transactions = vec![coinbase(height, value, tag)];
    transactions.extend(txs);
    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_block_hash: block_hash(parent),
            merkle_root: block_merkle_root(&transactions),
            timestamp: parent.header.timestamp + 60,
            bits: parent.header.bits,
            nonce: 0,
        },
        transactions,
    };
    mine(&mut block.header);
    block
}

/// Build `count` empty blocks on `parent` (at `parent_height`)
pub fn branch(parent: &Block, parent_height: u32, count: u32, tag: u8) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::new();
    for n in 1..=count {
        let prev = blocks.last().unwrap_or(parent).clone();
        blocks.push(child(&prev, parent_height + n, vec![], tag));
    }
    blocks
}

pub fn submit_all(chain: &mut ChainState, blocks: &[Block]) {
    for block in blocks {
        let outcome = chain.process_block(block.clone()).unwrap();
        assert_eq!(outcome, SubmitBlockOutcome::Accepted, "block {}", hash_to_hex(&block_hash(block)));
    }
}

pub fn assert_rejected(outcome: SubmitBlockOutcome, code: &str) {
    match outcome {
        SubmitBlockOutcome::Rejected(reason) => assert_eq!(reason.code, code, "{reason}"),
        other => panic!("expected rejection {code}, got {other:?}"),
    }
}
