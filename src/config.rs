//! Configuration for the ledger node
//!
//! `ChainParams` carries the consensus parameters every node on a network must
//! agree on; `NodeConfig` carries local operational settings. Both load from
//! JSON, with serde defaults for every operational field.

use crate::constants::{COIN, MAX_BLOCK_SIZE};
use crate::types::*;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Parameters of the genesis block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisParams {
    pub version: i32,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    /// Arbitrary data carried by the genesis coinbase input
    #[serde(with = "hex::serde")]
    pub coinbase_data: ByteString,
    #[serde(with = "hex::serde")]
    pub output_script: ByteString,
    pub reward: Amount,
}

/// Consensus parameters consumed from configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainParams {
    pub name: String,
    /// Magic bytes framing each record in the block files
    pub message_start: [u8; 4],
    pub genesis: GenesisParams,
    /// Expected hash of the genesis block; checked at startup
    #[serde(with = "crate::hash::serde_hex")]
    pub genesis_hash: Hash,
    /// Easiest permitted target, compact form
    pub pow_limit_bits: u32,
    pub subsidy_halving_interval: u32,
    pub initial_subsidy: Amount,
    pub max_money: Amount,
    pub max_block_size: usize,
    pub coinbase_maturity: u32,
    /// Target seconds between blocks
    pub target_spacing: u32,
    /// Target seconds per retarget interval
    pub target_timespan: u32,
    /// Keep the previous block's difficulty forever
    #[serde(default)]
    pub no_retargeting: bool,
    #[serde(default = "default_max_future_block_time")]
    pub max_future_block_time: u32,
    #[serde(default = "default_median_time_span")]
    pub median_time_span: usize,
}

fn default_max_future_block_time() -> u32 {
    2 * 60 * 60
}

fn default_median_time_span() -> usize {
    11
}

const GENESIS_COINBASE_DATA: &str = "04ffff001d0104404e592054696d65732030352f4f63742f32303131205374657665204a6f62732c204170706c65e280997320566973696f6e6172792c2044696573206174203536";
const GENESIS_OUTPUT_SCRIPT: &str = "41040184710fa689ad5023690c80f3a49c8f13f8d45b8c857fbcbc8bc4a8e4d3eb4b10f4d4604fa08dce601aaf0f470216fe1b51850b4acf21b179c45070ac7b03a9ac";

fn decode_const(hex_str: &str) -> ByteString {
    // Compile-time constants; covered by the genesis hash tests.
    hex::decode(hex_str).unwrap_or_default()
}

fn hash_const(display_hex: &str) -> Hash {
    crate::hash::hash_from_hex(display_hex).unwrap_or([0u8; 32])
}

impl ChainParams {
    /// Main network
    pub fn main() -> Self {
        ChainParams {
            name: "main".to_string(),
            message_start: [0xfb, 0xc0, 0xb6, 0xdb],
            genesis: GenesisParams {
                version: 1,
                time: 1317972665,
                bits: 0x1e0ffff0,
                nonce: 2084524493,
                coinbase_data: decode_const(GENESIS_COINBASE_DATA),
                output_script: decode_const(GENESIS_OUTPUT_SCRIPT),
                reward: 50 * COIN,
            },
            genesis_hash: hash_const(
                "12a765e31ffd4059bada1e25190f6e98c99d9714d334efa41a195a7e7e04bfe2",
            ),
            pow_limit_bits: 0x1e0fffff,
            subsidy_halving_interval: 840_000,
            initial_subsidy: 50 * COIN,
            max_money: 84_000_000 * COIN,
            max_block_size: MAX_BLOCK_SIZE,
            coinbase_maturity: 100,
            target_spacing: 150,
            target_timespan: 302_400,
            no_retargeting: false,
            max_future_block_time: default_max_future_block_time(),
            median_time_span: default_median_time_span(),
        }
    }

    /// Local regression-test network with a trivially easy target
    pub fn regtest() -> Self {
        ChainParams {
            name: "regtest".to_string(),
            message_start: [0xfa, 0xbf, 0xb5, 0xda],
            genesis: GenesisParams {
                time: 1296688602,
                bits: 0x207fffff,
                nonce: 0,
                ..ChainParams::main().genesis
            },
            genesis_hash: hash_const(
                "530827f38f93b43ed12af0b3ad25a288dc02ed74d6d7857862df51fc56c416f9",
            ),
            pow_limit_bits: 0x207fffff,
            subsidy_halving_interval: 150,
            no_retargeting: true,
            ..ChainParams::main()
        }
    }

    /// Blocks between difficulty adjustments
    pub fn retarget_interval(&self) -> u32 {
        (self.target_timespan / self.target_spacing).max(1)
    }

    /// Maximum signature operations per block
    pub fn max_block_sigops(&self) -> usize {
        self.max_block_size / 50
    }

    /// Build the genesis block from its parameters
    pub fn genesis_block(&self) -> Block {
        let coinbase = Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout: OutPoint::null(),
                script_sig: self.genesis.coinbase_data.clone(),
                sequence: u32::MAX,
            }],
            outputs: vec![TransactionOutput {
                value: self.genesis.reward,
                script_pubkey: self.genesis.output_script.clone(),
            }],
            lock_time: 0,
        };
        let merkle_root = crate::hash::block_merkle_root(std::slice::from_ref(&coinbase));
        Block {
            header: BlockHeader {
                version: self.genesis.version,
                prev_block_hash: [0u8; 32],
                merkle_root,
                timestamp: self.genesis.time,
                bits: self.genesis.bits,
                nonce: self.genesis.nonce,
            },
            transactions: vec![coinbase],
        }
    }
}

/// Local node settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,

    #[serde(default = "ChainParams::main")]
    pub params: ChainParams,

    /// Depth of the startup verification walk (`-checkblocks`)
    #[serde(default = "default_check_blocks")]
    pub check_blocks: u32,

    /// Verify every block at startup regardless of `check_blocks`
    #[serde(default)]
    pub check_all_blocks: bool,

    /// Background checkpoint period
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Bounded wait for the main lock by external callers
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    #[serde(default = "default_max_orphan_blocks")]
    pub max_orphan_blocks: usize,

    #[serde(default = "default_max_mempool_txs")]
    pub max_mempool_txs: usize,

    /// Page cache size of the store, bytes
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,

    /// Force every commit to disk before returning
    #[serde(default = "default_true")]
    pub sync_on_commit: bool,
}

fn default_check_blocks() -> u32 {
    2500
}

fn default_flush_interval_ms() -> u64 {
    500
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

fn default_max_orphan_blocks() -> usize {
    750
}

fn default_max_mempool_txs() -> usize {
    50_000
}

fn default_cache_capacity() -> u64 {
    64 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

impl NodeConfig {
    pub fn new(data_dir: impl Into<PathBuf>, params: ChainParams) -> Self {
        NodeConfig {
            data_dir: data_dir.into(),
            params,
            check_blocks: default_check_blocks(),
            check_all_blocks: false,
            flush_interval_ms: default_flush_interval_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            max_orphan_blocks: default_max_orphan_blocks(),
            max_mempool_txs: default_max_mempool_txs(),
            cache_capacity: default_cache_capacity(),
            sync_on_commit: true,
        }
    }

    /// Load settings from a JSON file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: NodeConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let p = &self.params;
        anyhow::ensure!(p.target_spacing > 0, "target_spacing must be positive");
        anyhow::ensure!(p.subsidy_halving_interval > 0, "subsidy_halving_interval must be positive");
        anyhow::ensure!(p.median_time_span > 0, "median_time_span must be positive");
        anyhow::ensure!(p.max_block_size >= 1000, "max_block_size too small");
        anyhow::ensure!(self.lock_timeout_ms > 0, "lock_timeout_ms must be positive");
        Ok(())
    }
}
