//! Block validation: context-free checks, contextual header rules, and
//! connecting or disconnecting a block against the transaction index

use crate::blockstore::{tx_positions, BlockFiles};
use crate::config::ChainParams;
use crate::economic::get_block_value;
use crate::error::{LedgerError, Result, ValidationError, ValidationKind};
use crate::hash::{block_merkle_root, calculate_tx_id};
use crate::pow::{check_proof_of_work, PowHash};
use crate::serialization::serialize;
use crate::transaction::{
    check_transaction, check_tx_inputs, is_coinbase, is_final, legacy_sig_op_count, p2sh_sig_op_count, SpentOutput,
};
use crate::txdb::{mark_spent, ChainDb};
use crate::types::*;
use std::collections::HashSet;
use tracing::debug;

/// What a block's position in the chain demands of its header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockContext {
    pub height: u32,
    pub median_time_past: u32,
    pub required_bits: u32,
}

/// CheckBlockHeader: ℋ → {valid, invalid}
///
/// 1. PoW hash ≤ target decoded from bits, target within the network limit
/// 2. timestamp ≤ now + future drift
pub fn check_block_header(
    header: &BlockHeader,
    params: &ChainParams,
    pow: &dyn PowHash,
    now: u32,
) -> std::result::Result<(), ValidationError> {
    check_proof_of_work(&pow.pow_hash(header), header.bits, params)?;

    if header.timestamp as u64 > now as u64 + params.max_future_block_time as u64 {
        return Err(ValidationError::new(
            ValidationKind::Timestamp,
            "time-too-new",
            format!("block timestamp {} too far past {}", header.timestamp, now),
        ));
    }
    Ok(())
}

/// CheckBlock: ℬ → {valid, invalid}
///
/// Context-free checks, short-circuiting in this order:
/// 1. At least one transaction, serialized size within the limit
/// 2. First transaction is the only coinbase
/// 3. Merkle root matches, no duplicate transaction ids
/// 4. Header proof of work and future-time bound
/// 5. Every transaction passes CheckTransaction
/// 6. Legacy signature operations within the limit
pub fn check_block(
    block: &Block,
    params: &ChainParams,
    pow: &dyn PowHash,
    now: u32,
) -> std::result::Result<(), ValidationError> {
    // 1. Size limits
    if block.transactions.is_empty() {
        return Err(structure("bad-blk-length", "block has no transactions"));
    }
    let size = serialize(block).len();
    if size > params.max_block_size {
        return Err(structure("bad-blk-length", format!("block is {size} bytes")));
    }

    // 2. Coinbase placement
    if !is_coinbase(&block.transactions[0]) {
        return Err(structure("bad-cb-missing", "first transaction is not a coinbase"));
    }
    if block.transactions[1..].iter().any(is_coinbase) {
        return Err(structure("bad-cb-multiple", "more than one coinbase"));
    }

    // 3. Merkle root and duplicates
    let txids: Vec<Hash> = block.transactions.iter().map(calculate_tx_id).collect();
    let unique: HashSet<&Hash> = txids.iter().collect();
    if unique.len() != txids.len() {
        return Err(ValidationError::new(
            ValidationKind::Duplicate,
            "bad-txns-duplicate",
            "duplicate transaction in block",
        ));
    }
    if crate::hash::calculate_merkle_root(&txids) != block.header.merkle_root {
        return Err(structure("bad-txnmrklroot", "merkle root mismatch"));
    }

    // 4. Header
    check_block_header(&block.header, params, pow, now)?;

    // 5. Transactions
    for (i, tx) in block.transactions.iter().enumerate() {
        check_transaction(tx, params).map_err(|e| {
            ValidationError::new(e.kind, e.code, format!("transaction {i}: {}", e.detail))
        })?;
    }

    // 6. Signature operations
    let sigops: usize = block.transactions.iter().map(legacy_sig_op_count).sum();
    if sigops > params.max_block_sigops() {
        return Err(structure("bad-blk-sigops", format!("{sigops} signature operations")));
    }

    Ok(())
}

/// ContextualCheckBlockHeader: ℋ × context → {valid, invalid}
///
/// 1. bits equal the difficulty required after the parent
/// 2. timestamp > median time past of the preceding blocks
pub fn contextual_check_header(header: &BlockHeader, ctx: &BlockContext) -> std::result::Result<(), ValidationError> {
    if header.bits != ctx.required_bits {
        return Err(ValidationError::new(
            ValidationKind::Context,
            "bad-diffbits",
            format!("bits {:#010x}, required {:#010x}", header.bits, ctx.required_bits),
        ));
    }
    if header.timestamp <= ctx.median_time_past {
        return Err(ValidationError::new(
            ValidationKind::Timestamp,
            "time-too-old",
            format!("timestamp {} not after median {}", header.timestamp, ctx.median_time_past),
        ));
    }
    Ok(())
}

/// Every transaction must be final at the block's height and time
pub fn contextual_check_block(block: &Block, ctx: &BlockContext) -> std::result::Result<(), ValidationError> {
    for (i, tx) in block.transactions.iter().enumerate() {
        if !is_final(tx, ctx.height, block.header.timestamp) {
            return Err(ValidationError::new(
                ValidationKind::Context,
                "bad-txns-nonfinal",
                format!("transaction {i} is not final"),
            ));
        }
    }
    Ok(())
}

/// Look up one previous output in the index; `None` if the transaction or
/// the output does not exist
pub fn fetch_prevout(db: &ChainDb, files: &BlockFiles, prevout: &OutPoint) -> Result<Option<SpentOutput>> {
    let Some((prev_tx, index)) = db.read_disk_tx(&prevout.hash, files)? else {
        return Ok(None);
    };
    let Some(output) = prev_tx.outputs.get(prevout.index as usize).cloned() else {
        return Ok(None);
    };
    let spent = index
        .spent
        .get(prevout.index as usize)
        .map(Option::is_some)
        .unwrap_or(true);
    Ok(Some(SpentOutput {
        output,
        height: Some(index.height),
        from_coinbase: is_coinbase(&prev_tx),
        spent,
    }))
}

/// Resolve the outputs spent by `tx` from the index
///
/// A missing previous transaction or output index is a validation
/// failure; storage problems propagate as storage errors.
pub fn fetch_prevouts(db: &ChainDb, files: &BlockFiles, tx: &Transaction) -> Result<Vec<SpentOutput>> {
    let mut prevouts = Vec::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        let prev = fetch_prevout(db, files, &input.prevout)?.ok_or_else(|| missing_input(&input.prevout))?;
        prevouts.push(prev);
    }
    Ok(prevouts)
}

pub(crate) fn missing_input(prevout: &OutPoint) -> LedgerError {
    LedgerError::validation(
        ValidationKind::DoubleSpend,
        "bad-txns-inputs-missingorspent",
        format!("{}:{} not found", crate::hash::hash_to_hex(&prevout.hash), prevout.index),
    )
}

/// ConnectBlock: ℬ × TxIndex × ℕ → TxIndex' × ℤ | invalid
///
/// For block b stored at `pos`, connected at height h:
/// 1. No transaction may repeat a txid whose outputs are not all spent
/// 2. For each non-coinbase tx: CheckTxInputs against the index, then
///    mark every spent output with the spender's position
/// 3. Index every transaction; later transactions may spend earlier ones
/// 4. Total signature operations, P2SH included, within the limit
/// 5. Coinbase value ≤ subsidy(h) + fees
///
/// Writes go through `db`; the caller owns the surrounding store
/// transaction and aborts it on failure.
pub fn connect_block(
    block: &Block,
    pos: DiskBlockPos,
    height: u32,
    db: &mut ChainDb,
    files: &BlockFiles,
    params: &ChainParams,
) -> Result<Amount> {
    let positions = tx_positions(block, pos);
    let mut fees: Amount = 0;
    let mut sigops = 0usize;

    for (tx, tx_pos) in block.transactions.iter().zip(positions) {
        let txid = calculate_tx_id(tx);

        // 1. Duplicate transaction ids
        if let Some(existing) = db.read_tx_index(&txid)? {
            if !existing.is_fully_spent() {
                return Err(LedgerError::validation(
                    ValidationKind::Duplicate,
                    "bad-txns-BIP30",
                    format!("transaction {} already has unspent outputs", crate::hash::hash_to_hex(&txid)),
                ));
            }
        }

        sigops += legacy_sig_op_count(tx);
        if !is_coinbase(tx) {
            // 2. Inputs
            let prevouts = fetch_prevouts(db, files, tx)?;
            sigops += p2sh_sig_op_count(tx, &prevouts);
            if sigops > params.max_block_sigops() {
                return Err(LedgerError::validation(
                    ValidationKind::Structure,
                    "bad-blk-sigops",
                    format!("{sigops} signature operations"),
                ));
            }
            fees += check_tx_inputs(tx, &prevouts, height, params, true)?;
            for input in &tx.inputs {
                mark_spent(db, &input.prevout, tx_pos)?;
            }
        }

        // 3. Index
        db.add_tx_index(tx, tx_pos, height)?;
    }

    // 5. Coinbase value
    let claimed: Amount = block.transactions[0].outputs.iter().map(|o| o.value).sum();
    let allowed = get_block_value(height, fees, params);
    if claimed > allowed {
        return Err(LedgerError::validation(
            ValidationKind::ValueConservation,
            "bad-cb-amount",
            format!("coinbase pays {claimed}, limit {allowed}"),
        ));
    }

    debug!("Connected block at height {} with {} fees", height, fees);
    Ok(fees)
}

/// DisconnectBlock: undo ConnectBlock in reverse transaction order
///
/// Outputs consumed by the block become unspent again and the block's
/// transactions leave the index.
pub fn disconnect_block(block: &Block, db: &mut ChainDb) -> Result<()> {
    for tx in block.transactions.iter().rev() {
        if !is_coinbase(tx) {
            for input in &tx.inputs {
                let mut index = db.read_tx_index(&input.prevout.hash)?.ok_or_else(|| {
                    LedgerError::StorageCorrupt(format!(
                        "disconnect: missing index for {}",
                        crate::hash::hash_to_hex(&input.prevout.hash)
                    ))
                })?;
                let slot = index.spent.get_mut(input.prevout.index as usize).ok_or_else(|| {
                    LedgerError::StorageCorrupt(format!("disconnect: output {} out of range", input.prevout.index))
                })?;
                *slot = None;
                db.update_tx_index(&input.prevout.hash, &index)?;
            }
        }
        db.erase_tx_index(tx)?;
    }
    Ok(())
}

/// Recompute the Merkle root a block's header should carry
pub fn compute_merkle_root(block: &Block) -> Hash {
    block_merkle_root(&block.transactions)
}

fn structure(code: &'static str, detail: impl Into<String>) -> ValidationError {
    ValidationError::new(ValidationKind::Structure, code, detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{COIN, SEQUENCE_FINAL};
    use crate::pow::Sha256dPow;
    use crate::storage::{Environment, OpenMode};

    fn coinbase(tag: u8, value: Amount) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout: OutPoint::null(),
                script_sig: vec![tag, tag],
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TransactionOutput { value, script_pubkey: vec![0x51] }],
            lock_time: 0,
        }
    }

    fn mined(prev: Hash, transactions: Vec<Transaction>, time: u32) -> Block {
        let params = ChainParams::regtest();
        let mut block = Block {
            header: BlockHeader {
                version: 1,
                prev_block_hash: prev,
                merkle_root: [0; 32],
                timestamp: time,
                bits: params.pow_limit_bits,
                nonce: 0,
            },
            transactions,
        };
        block.header.merkle_root = compute_merkle_root(&block);
        while check_proof_of_work(&Sha256dPow.pow_hash(&block.header), block.header.bits, &params).is_err() {
            block.header.nonce += 1;
        }
        block
    }

    #[test]
    fn test_check_block_valid() {
        let params = ChainParams::regtest();
        let block = mined([1; 32], vec![coinbase(1, 50 * COIN)], 1000);
        assert!(check_block(&block, &params, &Sha256dPow, 1000).is_ok());
    }

    #[test]
    fn test_check_block_requires_coinbase_first() {
        let params = ChainParams::regtest();
        let mut spend = coinbase(2, 1);
        spend.inputs[0].prevout = OutPoint { hash: [3; 32], index: 0 };
        let block = mined([1; 32], vec![spend], 1000);
        assert_eq!(check_block(&block, &params, &Sha256dPow, 1000).unwrap_err().code, "bad-cb-missing");
    }

    #[test]
    fn test_check_block_rejects_second_coinbase() {
        let params = ChainParams::regtest();
        let block = mined([1; 32], vec![coinbase(1, 1), coinbase(2, 1)], 1000);
        assert_eq!(check_block(&block, &params, &Sha256dPow, 1000).unwrap_err().code, "bad-cb-multiple");
    }

    #[test]
    fn test_check_block_merkle_mismatch_is_mutation() {
        let params = ChainParams::regtest();
        let mut block = mined([1; 32], vec![coinbase(1, 50 * COIN)], 1000);
        block.transactions[0].outputs[0].value -= 1;
        let err = check_block(&block, &params, &Sha256dPow, 1000).unwrap_err();
        assert_eq!(err.code, "bad-txnmrklroot");
        assert!(err.is_possible_mutation());
    }

    #[test]
    fn test_check_block_duplicate_transactions() {
        let params = ChainParams::regtest();
        let mut spend = coinbase(2, 1);
        spend.inputs[0].prevout = OutPoint { hash: [3; 32], index: 0 };
        let block = mined([1; 32], vec![coinbase(1, 1), spend.clone(), spend], 1000);
        assert_eq!(check_block(&block, &params, &Sha256dPow, 1000).unwrap_err().code, "bad-txns-duplicate");
    }

    #[test]
    fn test_check_block_future_timestamp() {
        let params = ChainParams::regtest();
        let block = mined([1; 32], vec![coinbase(1, 1)], 10_000);
        let now = 10_000 - params.max_future_block_time - 1;
        let err = check_block(&block, &params, &Sha256dPow, now).unwrap_err();
        assert_eq!(err.kind, ValidationKind::Timestamp);
        assert!(check_block(&block, &params, &Sha256dPow, now + 1).is_ok());
    }

    #[test]
    fn test_check_block_sigop_limit() {
        let mut params = ChainParams::regtest();
        params.max_block_size = 50 * 10;
        let mut cb = coinbase(1, 1);
        cb.outputs[0].script_pubkey = vec![0xac; 11];
        let block = mined([1; 32], vec![cb], 1000);
        assert_eq!(check_block(&block, &params, &Sha256dPow, 1000).unwrap_err().code, "bad-blk-sigops");
    }

    #[test]
    fn test_contextual_checks() {
        let header = mined([1; 32], vec![coinbase(1, 1)], 1000).header;
        let ctx = BlockContext { height: 1, median_time_past: 999, required_bits: header.bits };
        assert!(contextual_check_header(&header, &ctx).is_ok());

        let late = BlockContext { median_time_past: 1000, ..ctx };
        assert_eq!(contextual_check_header(&header, &late).unwrap_err().code, "time-too-old");

        let harder = BlockContext { required_bits: 0x1d00ffff, ..ctx };
        assert_eq!(contextual_check_header(&header, &harder).unwrap_err().code, "bad-diffbits");
    }

    #[test]
    fn test_connect_and_disconnect_block() {
        let dir = tempfile::tempdir().unwrap();
        let params = ChainParams::regtest();
        let env = Environment::open(dir.path(), 8 * 1024 * 1024, false).unwrap();
        let mut files = BlockFiles::open(&dir.path().join("blocks"), params.message_start).unwrap();
        let mut db = ChainDb::open(&env, OpenMode::Create).unwrap();

        let first = mined([1; 32], vec![coinbase(1, 50 * COIN)], 1000);
        let (pos, _) = files.write_block(&first).unwrap();
        connect_block(&first, pos, 1, &mut db, &files, &params).unwrap();
        let cb_id = calculate_tx_id(&first.transactions[0]);

        // Spend the coinbase once it is mature, paying a 10 unit fee.
        let spend = Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout: OutPoint { hash: cb_id, index: 0 },
                script_sig: vec![],
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TransactionOutput { value: 50 * COIN - 10, script_pubkey: vec![0x51] }],
            lock_time: 0,
        };
        let height = 1 + params.coinbase_maturity;
        let second = mined([2; 32], vec![coinbase(2, 50 * COIN + 10), spend.clone()], 1001);
        let (pos2, _) = files.write_block(&second).unwrap();
        let fees = connect_block(&second, pos2, height, &mut db, &files, &params).unwrap();
        assert_eq!(fees, 10);
        assert!(db.read_tx_index(&cb_id).unwrap().unwrap().is_fully_spent());

        disconnect_block(&second, &mut db).unwrap();
        assert_eq!(db.read_tx_index(&cb_id).unwrap().unwrap().spent, vec![None]);
        assert!(!db.contains_tx(&calculate_tx_id(&spend)).unwrap());
    }

    #[test]
    fn test_connect_block_coinbase_overpays() {
        let dir = tempfile::tempdir().unwrap();
        let params = ChainParams::regtest();
        let env = Environment::open(dir.path(), 8 * 1024 * 1024, false).unwrap();
        let mut files = BlockFiles::open(&dir.path().join("blocks"), params.message_start).unwrap();
        let mut db = ChainDb::open(&env, OpenMode::Create).unwrap();

        let block = mined([1; 32], vec![coinbase(1, 50 * COIN + 1)], 1000);
        let (pos, _) = files.write_block(&block).unwrap();
        let err = connect_block(&block, pos, 1, &mut db, &files, &params).unwrap_err();
        assert_eq!(err.as_validation().unwrap().code, "bad-cb-amount");
    }

    #[test]
    fn test_connect_block_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let params = ChainParams::regtest();
        let env = Environment::open(dir.path(), 8 * 1024 * 1024, false).unwrap();
        let mut files = BlockFiles::open(&dir.path().join("blocks"), params.message_start).unwrap();
        let mut db = ChainDb::open(&env, OpenMode::Create).unwrap();

        let mut spend = coinbase(3, 1);
        spend.inputs[0].prevout = OutPoint { hash: [9; 32], index: 0 };
        let block = mined([1; 32], vec![coinbase(1, 1), spend], 1000);
        let (pos, _) = files.write_block(&block).unwrap();
        let err = connect_block(&block, pos, 1, &mut db, &files, &params).unwrap_err();
        let validation = err.as_validation().unwrap();
        assert_eq!(validation.kind, ValidationKind::DoubleSpend);
    }
}
