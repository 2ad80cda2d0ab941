//! Transaction validation: context-free checks and input checks

use crate::config::ChainParams;
use crate::constants::*;
use crate::economic::money_range;
use crate::error::{ValidationError, ValidationKind};
use crate::script::{get_p2sh_sig_op_count, get_sig_op_count, verify_script, TransactionSignatureChecker};
use crate::serialization::serialize;
use crate::types::*;
use std::collections::HashSet;

/// A previous output as seen by the transaction spending it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpentOutput {
    pub output: TransactionOutput,
    /// Height of the confirming block; `None` while unconfirmed
    pub height: Option<u32>,
    pub from_coinbase: bool,
    /// Already consumed on the chain (or in the pool) being checked against
    pub spent: bool,
}

/// CheckTransaction: 𝒯𝒳 → {valid, invalid}
///
/// A transaction tx = (v, ins, outs, lt) is valid if and only if:
/// 1. |ins| > 0 ∧ |outs| > 0
/// 2. |tx| ≤ M_max_block_size
/// 3. ∀o ∈ outs: 0 ≤ o.value ≤ M_max ∧ Σ o.value ≤ M_max
/// 4. No two inputs spend the same outpoint
/// 5. Coinbase: 2 ≤ |script_sig| ≤ 100; otherwise no null prevouts
pub fn check_transaction(tx: &Transaction, params: &ChainParams) -> Result<(), ValidationError> {
    // 1. Check inputs and outputs are not empty
    if tx.inputs.is_empty() {
        return Err(structure("bad-txns-vin-empty", "transaction has no inputs"));
    }
    if tx.outputs.is_empty() {
        return Err(structure("bad-txns-vout-empty", "transaction has no outputs"));
    }

    // 2. Check size limit
    let size = serialize(tx).len();
    if size > params.max_block_size {
        return Err(structure("bad-txns-oversize", format!("transaction is {size} bytes")));
    }

    // 3. Check output values are valid
    let mut total: Amount = 0;
    for (i, output) in tx.outputs.iter().enumerate() {
        if output.value < 0 {
            return Err(value_error("bad-txns-vout-negative", format!("output {i} is negative")));
        }
        if output.value > params.max_money {
            return Err(value_error("bad-txns-vout-toolarge", format!("output {i} above max money")));
        }
        total += output.value;
        if !money_range(total, params) {
            return Err(value_error("bad-txns-txouttotal-toolarge", "output total above max money"));
        }
    }

    // 4. Check for duplicate inputs
    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input.prevout) {
            return Err(structure("bad-txns-inputs-duplicate", "input spent twice"));
        }
    }

    // 5. Coinbase script size, or no null prevouts
    if is_coinbase(tx) {
        let len = tx.inputs[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_SIZE..=MAX_COINBASE_SCRIPT_SIZE).contains(&len) {
            return Err(structure("bad-cb-length", format!("coinbase script is {len} bytes")));
        }
    } else if tx.inputs.iter().any(|input| input.prevout.is_null()) {
        return Err(structure("bad-txns-prevout-null", "non-coinbase input with null prevout"));
    }

    Ok(())
}

/// Check if transaction is coinbase
pub fn is_coinbase(tx: &Transaction) -> bool {
    tx.inputs.len() == 1 && tx.inputs[0].prevout.is_null()
}

/// IsFinal: lock time is zero, already passed, or every input is final
pub fn is_final(tx: &Transaction, height: u32, block_time: u32) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let threshold = if tx.lock_time < LOCKTIME_THRESHOLD { height } else { block_time };
    if tx.lock_time < threshold {
        return true;
    }
    tx.inputs.iter().all(|input| input.sequence == SEQUENCE_FINAL)
}

/// Signature operations counted without looking at previous outputs
pub fn legacy_sig_op_count(tx: &Transaction) -> usize {
    tx.inputs
        .iter()
        .map(|input| get_sig_op_count(&input.script_sig, false))
        .chain(tx.outputs.iter().map(|output| get_sig_op_count(&output.script_pubkey, false)))
        .sum()
}

/// Redeem-script signature operations of a transaction's P2SH inputs
pub fn p2sh_sig_op_count(tx: &Transaction, prevouts: &[SpentOutput]) -> usize {
    tx.inputs
        .iter()
        .zip(prevouts)
        .map(|(input, prev)| get_p2sh_sig_op_count(&prev.output.script_pubkey, &input.script_sig))
        .sum()
}

/// CheckTxInputs: 𝒯𝒳 × [𝒪] × ℕ → ℤ | invalid
///
/// For transaction tx spending `prevouts` (one per input) at height h:
/// 1. Every previous output exists and is unspent
/// 2. Coinbase outputs are spent only after the maturity depth
/// 3. Every input value and the running total lie in the money range
/// 4. Σ inputs ≥ Σ outputs
/// 5. Scripts verify (when `verify_scripts`)
/// 6. Return the fee Σ inputs − Σ outputs
pub fn check_tx_inputs(
    tx: &Transaction,
    prevouts: &[SpentOutput],
    height: u32,
    params: &ChainParams,
    verify_scripts: bool,
) -> Result<Amount, ValidationError> {
    if is_coinbase(tx) {
        return Ok(0);
    }
    if prevouts.len() != tx.inputs.len() {
        return Err(ValidationError::new(
            ValidationKind::DoubleSpend,
            "bad-txns-inputs-missingorspent",
            format!("{} of {} inputs found", prevouts.len(), tx.inputs.len()),
        ));
    }

    let mut total_in: Amount = 0;
    for (i, prev) in prevouts.iter().enumerate() {
        // 1. Unspent
        if prev.spent {
            return Err(ValidationError::new(
                ValidationKind::DoubleSpend,
                "bad-txns-inputs-missingorspent",
                format!("input {i} already spent"),
            ));
        }

        // 2. Coinbase maturity
        if prev.from_coinbase {
            let confirmed_at = prev.height.unwrap_or(height);
            if height.saturating_sub(confirmed_at) < params.coinbase_maturity {
                return Err(ValidationError::new(
                    ValidationKind::Context,
                    "bad-txns-premature-spend-of-coinbase",
                    format!("input {i} spends coinbase at depth {}", height.saturating_sub(confirmed_at)),
                ));
            }
        }

        // 3. Value range
        total_in += prev.output.value;
        if !money_range(prev.output.value, params) || !money_range(total_in, params) {
            return Err(value_error("bad-txns-inputvalues-outofrange", format!("input {i} out of range")));
        }
    }

    // 4. Value conservation
    let total_out: Amount = tx.outputs.iter().map(|o| o.value).sum();
    if total_in < total_out {
        return Err(value_error(
            "bad-txns-in-belowout",
            format!("inputs {total_in} below outputs {total_out}"),
        ));
    }
    let fee = total_in - total_out;
    if !money_range(fee, params) {
        return Err(value_error("bad-txns-fee-outofrange", format!("fee {fee} out of range")));
    }

    // 5. Scripts
    if verify_scripts {
        for (i, (input, prev)) in tx.inputs.iter().zip(prevouts).enumerate() {
            let checker = TransactionSignatureChecker::new(tx, i);
            verify_script(&input.script_sig, &prev.output.script_pubkey, &checker).map_err(|e| {
                ValidationError::new(ValidationKind::Script, e.code, format!("input {i}: {}", e.detail))
            })?;
        }
    }

    Ok(fee)
}

fn structure(code: &'static str, detail: impl Into<String>) -> ValidationError {
    ValidationError::new(ValidationKind::Structure, code, detail)
}

fn value_error(code: &'static str, detail: impl Into<String>) -> ValidationError {
    ValidationError::new(ValidationKind::ValueConservation, code, detail)
}
