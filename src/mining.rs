//! Block templates for collaborators that search for a nonce
//!
//! The core never grinds nonces. It assembles a template on the current
//! tip and leaves the search to the caller; `TemplateCache` is the state a
//! template issuer keeps between requests.

use crate::chain::{unix_time, ChainState};
use crate::economic::get_block_value;
use crate::error::{LedgerError, Result};
use crate::hash::block_merkle_root;
use crate::script::{encode_num, push_data};
use crate::serialization::serialize;
use crate::transaction::{is_final, legacy_sig_op_count};
use crate::types::*;
use tracing::debug;

/// Seconds a cached template may lag behind a changed mempool
const TEMPLATE_REFRESH_SECS: u32 = 60;

/// A block ready for nonce search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTemplate {
    pub block: Block,
    pub height: u32,
    pub fees: Amount,
}

/// CreateNewBlock: 𝒯𝒳* × tip → ℬ
///
/// 1. Take pool transactions parents first, skipping any that are not
///    final at the next height or would break the size or sigop limits
/// 2. Coinbase pays subsidy plus fees to `payout_script`
/// 3. Header commits to the Merkle root, required bits and a timestamp
///    after the median time past
pub fn create_block_template(chain: &ChainState, payout_script: &[u8], extra_nonce: u32) -> Result<BlockTemplate> {
    let params = chain.params();
    let index = chain.index();
    let tip = index
        .best()
        .ok_or_else(|| LedgerError::NotFound("no active chain".to_string()))?;
    let ctx = index.context_for(Some(tip), params);
    let time = unix_time().max(ctx.median_time_past + 1);

    // 2. Coinbase, built first so its size counts against the limit
    let mut coinbase_script = push_data(&ctx.required_bits.to_le_bytes());
    coinbase_script.extend(push_data(&encode_num(extra_nonce as i64)));
    let mut coinbase = Transaction {
        version: 1,
        inputs: vec![TransactionInput {
            prevout: OutPoint::null(),
            script_sig: coinbase_script,
            sequence: u32::MAX,
        }],
        outputs: vec![TransactionOutput {
            value: 0,
            script_pubkey: payout_script.to_vec(),
        }],
        lock_time: 0,
    };

    // 1. Transactions
    let mut size = 80 + 9 + serialize(&coinbase).len();
    let mut sigops = legacy_sig_op_count(&coinbase);
    let mut fees: Amount = 0;
    let mut selected = Vec::new();
    let mut skipped = std::collections::HashSet::new();
    for (txid, tx, fee) in chain.mempool().ordered_transactions() {
        if tx.inputs.iter().any(|input| skipped.contains(&input.prevout.hash)) {
            skipped.insert(txid);
            continue;
        }
        let tx_size = serialize(tx).len();
        let tx_sigops = legacy_sig_op_count(tx);
        if !is_final(tx, ctx.height, time)
            || size + tx_size >= params.max_block_size
            || sigops + tx_sigops >= params.max_block_sigops()
        {
            skipped.insert(txid);
            continue;
        }
        size += tx_size;
        sigops += tx_sigops;
        fees += fee;
        selected.push(tx.clone());
    }

    coinbase.outputs[0].value = get_block_value(ctx.height, fees, params);
    let mut transactions = Vec::with_capacity(selected.len() + 1);
    transactions.push(coinbase);
    transactions.extend(selected);

    // 3. Header
    let header = BlockHeader {
        version: 1,
        prev_block_hash: index.get(tip).hash,
        merkle_root: block_merkle_root(&transactions),
        timestamp: time,
        bits: ctx.required_bits,
        nonce: 0,
    };
    debug!(
        "CreateNewBlock: height {} with {} transactions, {} fees",
        ctx.height,
        transactions.len(),
        fees
    );
    Ok(BlockTemplate {
        block: Block { header, transactions },
        height: ctx.height,
        fees,
    })
}

/// Template reused across requests until the tip changes, or the
/// mempool changed and the template is a minute old
#[derive(Debug, Default)]
pub struct TemplateCache {
    tip: Option<Hash>,
    transactions_updated: u64,
    created: u32,
    extra_nonce: u32,
    template: Option<BlockTemplate>,
}

impl TemplateCache {
    pub fn new() -> Self {
        TemplateCache::default()
    }

    /// Current template, rebuilt when stale
    pub fn get(&mut self, chain: &ChainState, payout_script: &[u8]) -> Result<&BlockTemplate> {
        let tip = chain.best_hash();
        let updated = chain.mempool().transactions_updated();
        let now = unix_time();
        let stale = match &self.template {
            None => true,
            Some(_) => {
                self.tip != Some(tip)
                    || (updated != self.transactions_updated
                        && now.saturating_sub(self.created) > TEMPLATE_REFRESH_SECS)
            }
        };
        if stale {
            if self.tip != Some(tip) {
                self.extra_nonce = 0;
            }
            self.extra_nonce += 1;
            let template = create_block_template(chain, payout_script, self.extra_nonce)?;
            self.tip = Some(tip);
            self.transactions_updated = updated;
            self.created = now;
            self.template = Some(template);
        }
        self.template
            .as_ref()
            .ok_or_else(|| LedgerError::NotFound("block template".to_string()))
    }

    /// Forget the cached template
    pub fn clear(&mut self) {
        self.template = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::check_block;
    use crate::config::{ChainParams, NodeConfig};
    use crate::pow::Sha256dPow;
    use crate::transaction::check_transaction;

    fn open_chain(dir: &std::path::Path) -> ChainState {
        let config = NodeConfig::new(dir, ChainParams::regtest());
        ChainState::open(&config, Box::new(Sha256dPow)).unwrap()
    }

    #[test]
    fn test_template_extends_tip() {
        let dir = tempfile::tempdir().unwrap();
        let chain = open_chain(dir.path());
        let template = create_block_template(&chain, &[0x51], 1).unwrap();

        assert_eq!(template.height, 1);
        assert_eq!(template.fees, 0);
        assert_eq!(template.block.header.prev_block_hash, chain.best_hash());
        assert_eq!(template.block.header.bits, 0x207fffff);
        let coinbase = &template.block.transactions[0];
        assert_eq!(coinbase.outputs[0].value, chain.params().initial_subsidy);
        assert!(check_transaction(coinbase, chain.params()).is_ok());
    }

    #[test]
    fn test_ground_template_passes_check_block() {
        let dir = tempfile::tempdir().unwrap();
        let chain = open_chain(dir.path());
        let mut block = create_block_template(&chain, &[0x51], 1).unwrap().block;
        let now = unix_time();
        while check_block(&block, chain.params(), &Sha256dPow, now).is_err() {
            block.header.nonce += 1;
        }
        assert!(block.header.nonce < 1000);
    }

    #[test]
    fn test_cache_reuses_until_tip_changes() {
        let dir = tempfile::tempdir().unwrap();
        let chain = open_chain(dir.path());
        let mut cache = TemplateCache::new();
        let first = cache.get(&chain, &[0x51]).unwrap().clone();
        let second = cache.get(&chain, &[0x51]).unwrap().clone();
        assert_eq!(first, second);

        cache.clear();
        let third = cache.get(&chain, &[0x51]).unwrap().clone();
        assert_ne!(first.block.transactions[0], third.block.transactions[0]);
    }
}
