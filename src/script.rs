//! Script execution engine
//!
//! A stack machine evaluated once over the unlocking script and once over
//! the locking script. Signature checks go through `SignatureChecker` so the
//! interpreter itself stays free of transaction context.

use crate::constants::*;
use crate::error::{ValidationError, ValidationKind};
use crate::hash::double_sha256;
use crate::serialization::serialize;
use crate::types::*;
use bitcoin_hashes::{sha1, Hash as BitcoinHash};
use ripemd::Ripemd160;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, Verification};
use sha2::{Digest, Sha256};

pub type ScriptResult<T> = std::result::Result<T, ValidationError>;

// Opcodes referenced outside the interpreter match
pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_IF: u8 = 0x63;
pub const OP_ENDIF: u8 = 0x68;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CODESEPARATOR: u8 = 0xab;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

fn script_error(code: &'static str, detail: impl Into<String>) -> ValidationError {
    ValidationError::new(ValidationKind::Script, code, detail)
}

// ============================================================================
// SIGNATURE CHECKING
// ============================================================================

/// Verifies a signature against the data a script commits to
pub trait SignatureChecker {
    /// `signature` includes the trailing hash-type byte; `script_code` is
    /// the executing script from the last OP_CODESEPARATOR with the
    /// signature itself removed.
    fn check_sig(&self, signature: &[u8], pubkey: &[u8], script_code: &[u8]) -> bool;
}

/// Rejects every signature; for evaluating scripts outside a transaction
pub struct NoSignatureChecker;

impl SignatureChecker for NoSignatureChecker {
    fn check_sig(&self, _signature: &[u8], _pubkey: &[u8], _script_code: &[u8]) -> bool {
        false
    }
}

/// Checks signatures over input `input_index` of `tx`
pub struct TransactionSignatureChecker<'a> {
    tx: &'a Transaction,
    input_index: usize,
    secp: Secp256k1<secp256k1::VerifyOnly>,
}

impl<'a> TransactionSignatureChecker<'a> {
    pub fn new(tx: &'a Transaction, input_index: usize) -> Self {
        TransactionSignatureChecker {
            tx,
            input_index,
            secp: Secp256k1::verification_only(),
        }
    }
}

impl<'a> SignatureChecker for TransactionSignatureChecker<'a> {
    fn check_sig(&self, signature: &[u8], pubkey: &[u8], script_code: &[u8]) -> bool {
        let Some((&hash_type, der)) = signature.split_last() else {
            return false;
        };
        let sighash = signature_hash(script_code, self.tx, self.input_index, hash_type as u32);
        verify_signature(&self.secp, pubkey, der, &sighash)
    }
}

/// Verify an ECDSA signature over `digest`
///
/// DER is parsed leniently and high-S signatures are normalized, matching
/// what historical consensus accepted.
fn verify_signature<C: Verification>(secp: &Secp256k1<C>, pubkey_bytes: &[u8], der: &[u8], digest: &Hash) -> bool {
    let pubkey = match PublicKey::from_slice(pubkey_bytes) {
        Ok(pk) => pk,
        Err(_) => return false,
    };

    let mut signature = match Signature::from_der_lax(der) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    signature.normalize_s();

    let message = match Message::from_digest_slice(digest) {
        Ok(m) => m,
        Err(_) => return false,
    };

    secp.verify_ecdsa(&message, &signature, &pubkey).is_ok()
}

/// SignatureHash: 𝕊 × 𝒯𝒳 × ℕ × ℕ → ℍ
///
/// Legacy signature hash:
/// 1. Copy the transaction; blank every input script
/// 2. Put `script_code` (minus OP_CODESEPARATORs) into the signed input
/// 3. NONE drops all outputs; SINGLE keeps outputs up to the input's index,
///    blanking earlier ones; both zero other inputs' sequences
/// 4. ANYONECANPAY keeps only the signed input
/// 5. Hash the copy followed by the 4-byte hash type
///
/// An out-of-range input, or SINGLE without a matching output, hashes to
/// the number one.
pub fn signature_hash(script_code: &[u8], tx: &Transaction, input_index: usize, hash_type: u32) -> Hash {
    let mut one = [0u8; 32];
    one[0] = 1;
    if input_index >= tx.inputs.len() {
        return one;
    }

    let mut tx_copy = tx.clone();
    let code = remove_codeseparators(script_code);
    for input in tx_copy.inputs.iter_mut() {
        input.script_sig.clear();
    }
    tx_copy.inputs[input_index].script_sig = code;

    match hash_type & 0x1f {
        SIGHASH_NONE => {
            tx_copy.outputs.clear();
            zero_other_sequences(&mut tx_copy, input_index);
        }
        SIGHASH_SINGLE => {
            if input_index >= tx_copy.outputs.len() {
                return one;
            }
            tx_copy.outputs.truncate(input_index + 1);
            for output in tx_copy.outputs.iter_mut().take(input_index) {
                output.value = -1;
                output.script_pubkey.clear();
            }
            zero_other_sequences(&mut tx_copy, input_index);
        }
        _ => {}
    }

    if hash_type & SIGHASH_ANYONECANPAY != 0 {
        let input = tx_copy.inputs.swap_remove(input_index);
        tx_copy.inputs = vec![input];
    }

    let mut data = serialize(&tx_copy);
    data.extend_from_slice(&hash_type.to_le_bytes());
    double_sha256(&data)
}

fn zero_other_sequences(tx: &mut Transaction, input_index: usize) {
    for (i, input) in tx.inputs.iter_mut().enumerate() {
        if i != input_index {
            input.sequence = 0;
        }
    }
}

fn remove_codeseparators(script: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(script.len());
    let mut pc = 0;
    while pc < script.len() {
        let start = pc;
        match get_op(script, &mut pc) {
            Ok((OP_CODESEPARATOR, _)) => {}
            Ok(_) => out.extend_from_slice(&script[start..pc]),
            Err(_) => {
                out.extend_from_slice(&script[start..]);
                break;
            }
        }
    }
    out
}

/// Remove every opcode-aligned occurrence of `pattern` from `script`
pub fn find_and_delete(script: &[u8], pattern: &[u8]) -> Vec<u8> {
    if pattern.is_empty() {
        return script.to_vec();
    }
    let mut out = Vec::with_capacity(script.len());
    let mut pc = 0;
    while pc < script.len() {
        if script[pc..].starts_with(pattern) {
            pc += pattern.len();
            continue;
        }
        let start = pc;
        if get_op(script, &mut pc).is_err() {
            out.extend_from_slice(&script[start..]);
            break;
        }
        out.extend_from_slice(&script[start..pc]);
    }
    out
}

/// Encode `data` as the minimal-length push a signature would appear as
pub fn push_data(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 5);
    let len = data.len();
    if len < OP_PUSHDATA1 as usize {
        out.push(len as u8);
    } else if len <= 0xff {
        out.push(OP_PUSHDATA1);
        out.push(len as u8);
    } else if len <= 0xffff {
        out.push(OP_PUSHDATA2);
        out.extend_from_slice(&(len as u16).to_le_bytes());
    } else {
        out.push(OP_PUSHDATA4);
        out.extend_from_slice(&(len as u32).to_le_bytes());
    }
    out.extend_from_slice(data);
    out
}

// ============================================================================
// PARSING
// ============================================================================

/// Read the opcode at `pc`, returning push data for push opcodes
pub fn get_op<'s>(script: &'s [u8], pc: &mut usize) -> ScriptResult<(u8, Option<&'s [u8]>)> {
    let opcode = *script
        .get(*pc)
        .ok_or_else(|| script_error("script-bad-opcode", "read past end of script"))?;
    *pc += 1;
    if opcode > OP_PUSHDATA4 {
        return Ok((opcode, None));
    }

    let len = match opcode {
        OP_PUSHDATA1 => read_le(script, pc, 1)?,
        OP_PUSHDATA2 => read_le(script, pc, 2)?,
        OP_PUSHDATA4 => read_le(script, pc, 4)?,
        n => n as usize,
    };
    let end = pc
        .checked_add(len)
        .filter(|&end| end <= script.len())
        .ok_or_else(|| script_error("script-bad-opcode", "push past end of script"))?;
    let data = &script[*pc..end];
    *pc = end;
    Ok((opcode, Some(data)))
}

fn read_le(script: &[u8], pc: &mut usize, width: usize) -> ScriptResult<usize> {
    let bytes = script
        .get(*pc..*pc + width)
        .ok_or_else(|| script_error("script-bad-opcode", "truncated push length"))?;
    *pc += width;
    Ok(bytes.iter().rev().fold(0usize, |acc, &b| (acc << 8) | b as usize))
}

/// True if the script contains only push operations
pub fn is_push_only(script: &[u8]) -> bool {
    let mut pc = 0;
    while pc < script.len() {
        match get_op(script, &mut pc) {
            Ok((opcode, _)) if opcode <= OP_16 => {}
            _ => return false,
        }
    }
    true
}

/// OP_HASH160 <20 bytes> OP_EQUAL
pub fn is_pay_to_script_hash(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

/// Address fingerprint of a pay-to-pubkey or pay-to-pubkey-hash script
pub fn extract_owner(script: &[u8]) -> Option<[u8; 20]> {
    // OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG
    if script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
    {
        let mut owner = [0u8; 20];
        owner.copy_from_slice(&script[3..23]);
        return Some(owner);
    }
    // <pubkey> OP_CHECKSIG
    let key_len = *script.first()? as usize;
    if (key_len == 33 || key_len == 65) && script.len() == key_len + 2 && script[key_len + 1] == OP_CHECKSIG {
        return Some(crate::hash::hash160(&script[1..=key_len]));
    }
    None
}

/// Count signature operations
///
/// With `accurate`, a CHECKMULTISIG preceded by OP_1..OP_16 counts that many
/// keys; otherwise it counts the maximum of 20.
pub fn get_sig_op_count(script: &[u8], accurate: bool) -> usize {
    let mut count = 0;
    let mut pc = 0;
    let mut last_opcode = 0xff;
    while pc < script.len() {
        let Ok((opcode, _)) = get_op(script, &mut pc) else {
            break;
        };
        match opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                if accurate && (OP_1..=OP_16).contains(&last_opcode) {
                    count += (last_opcode - OP_1 + 1) as usize;
                } else {
                    count += MAX_PUBKEYS_PER_MULTISIG;
                }
            }
            _ => {}
        }
        last_opcode = opcode;
    }
    count
}

/// Signature operations of the redeem script in a P2SH spend
pub fn get_p2sh_sig_op_count(script_pubkey: &[u8], script_sig: &[u8]) -> usize {
    if !is_pay_to_script_hash(script_pubkey) {
        return 0;
    }
    let mut pc = 0;
    let mut last_push: Option<&[u8]> = None;
    while pc < script_sig.len() {
        match get_op(script_sig, &mut pc) {
            Ok((opcode, data)) if opcode <= OP_16 => last_push = data,
            _ => return 0,
        }
    }
    last_push.map(|redeem| get_sig_op_count(redeem, true)).unwrap_or(0)
}

// ============================================================================
// NUMBERS
// ============================================================================

/// Decode a little-endian sign-magnitude number of at most `max_len` bytes
pub fn decode_num(bytes: &[u8], max_len: usize) -> ScriptResult<i64> {
    if bytes.len() > max_len {
        return Err(script_error("script-num-overflow", "numeric operand too long"));
    }
    let Some((&last, _)) = bytes.split_last() else {
        return Ok(0);
    };
    let mut value: i64 = 0;
    for (i, &b) in bytes.iter().enumerate() {
        value |= (b as i64) << (8 * i);
    }
    if last & 0x80 != 0 {
        let mask = !(0x80i64 << (8 * (bytes.len() - 1)));
        Ok(-(value & mask))
    } else {
        Ok(value)
    }
}

pub fn encode_num(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut out = Vec::new();
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if let Some(last) = out.last_mut() {
        if *last & 0x80 != 0 {
            out.push(if negative { 0x80 } else { 0x00 });
        } else if negative {
            *last |= 0x80;
        }
    }
    out
}

/// Truthiness of a stack element; negative zero is false
pub fn cast_to_bool(bytes: &[u8]) -> bool {
    for (i, &b) in bytes.iter().enumerate() {
        if b != 0 {
            return !(i == bytes.len() - 1 && b == 0x80);
        }
    }
    false
}

// ============================================================================
// EXECUTION
// ============================================================================

struct ExecState<'s> {
    script: &'s [u8],
    stack: Vec<ByteString>,
    altstack: Vec<ByteString>,
    exec_stack: Vec<bool>,
    op_count: usize,
    code_start: usize,
}

impl<'s> ExecState<'s> {
    fn pop(&mut self) -> ScriptResult<ByteString> {
        self.stack
            .pop()
            .ok_or_else(|| script_error("script-invalid-stack-operation", "pop from empty stack"))
    }

    fn pop_num(&mut self) -> ScriptResult<i64> {
        let item = self.pop()?;
        decode_num(&item, 4)
    }

    fn push_num(&mut self, value: i64) {
        self.stack.push(encode_num(value));
    }

    fn push_bool(&mut self, value: bool) {
        self.stack.push(if value { vec![1] } else { vec![] });
    }

    fn require(&self, depth: usize) -> ScriptResult<()> {
        if self.stack.len() < depth {
            return Err(script_error(
                "script-invalid-stack-operation",
                format!("needs {} stack items, has {}", depth, self.stack.len()),
            ));
        }
        Ok(())
    }

    /// Element `depth` from the top (1 = top)
    fn peek(&self, depth: usize) -> ScriptResult<&ByteString> {
        self.require(depth)?;
        Ok(&self.stack[self.stack.len() - depth])
    }

    fn executing(&self) -> bool {
        self.exec_stack.iter().all(|&b| b)
    }
}

fn is_disabled(opcode: u8) -> bool {
    matches!(
        opcode,
        // OP_CAT OP_SUBSTR OP_LEFT OP_RIGHT
        0x7e..=0x81
        // OP_INVERT OP_AND OP_OR OP_XOR
        | 0x83..=0x86
        // OP_2MUL OP_2DIV
        | 0x8d | 0x8e
        // OP_MUL OP_DIV OP_MOD OP_LSHIFT OP_RSHIFT
        | 0x95..=0x99
    )
}

/// EvalScript: 𝕊 × 𝕊𝕥* → 𝕊𝕥* | error
///
/// Executes `script` on `stack`:
/// 1. Pushes larger than 520 bytes fail
/// 2. More than 201 non-push operations fail
/// 3. Disabled opcodes fail even in unexecuted branches
/// 4. Main plus alt stack deeper than 1000 fails
/// 5. IF/ELSE/ENDIF must balance
pub fn eval_script(script: &[u8], stack: &mut Vec<ByteString>, checker: &dyn SignatureChecker) -> ScriptResult<()> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(script_error("script-size", "script exceeds maximum size"));
    }
    let mut state = ExecState {
        script,
        stack: std::mem::take(stack),
        altstack: Vec::new(),
        exec_stack: Vec::new(),
        op_count: 0,
        code_start: 0,
    };

    let result = run(&mut state, checker);
    *stack = std::mem::take(&mut state.stack);
    result
}

fn run(state: &mut ExecState<'_>, checker: &dyn SignatureChecker) -> ScriptResult<()> {
    let mut pc = 0;
    while pc < state.script.len() {
        let executing = state.executing();
        let (opcode, data) = get_op(state.script, &mut pc)?;

        if let Some(data) = data {
            if data.len() > MAX_SCRIPT_ELEMENT_SIZE {
                return Err(script_error("script-push-size", "push exceeds 520 bytes"));
            }
        }
        if opcode > OP_16 {
            state.op_count += 1;
            if state.op_count > MAX_SCRIPT_OPS {
                return Err(script_error("script-op-count", "operation limit exceeded"));
            }
        }
        if is_disabled(opcode) {
            return Err(script_error("script-disabled-opcode", format!("opcode {opcode:#04x} disabled")));
        }

        if let Some(data) = data {
            if executing {
                state.stack.push(data.to_vec());
            }
        } else if executing || (OP_IF..=OP_ENDIF).contains(&opcode) {
            execute_opcode(state, opcode, pc, checker)?;
        }

        if state.stack.len() + state.altstack.len() > MAX_STACK_SIZE {
            return Err(script_error("script-stack-size", "stack size limit exceeded"));
        }
    }

    if !state.exec_stack.is_empty() {
        return Err(script_error("script-unbalanced-conditional", "unterminated IF"));
    }
    Ok(())
}

/// Execute a single non-push opcode; `pc` points just past it
fn execute_opcode(
    state: &mut ExecState<'_>,
    opcode: u8,
    pc: usize,
    checker: &dyn SignatureChecker,
) -> ScriptResult<()> {
    match opcode {
        // OP_1NEGATE, OP_1 to OP_16 - push small numbers
        OP_1NEGATE => state.push_num(-1),
        OP_1..=OP_16 => state.push_num((opcode - OP_1 + 1) as i64),

        // OP_NOP, OP_NOP1-OP_NOP10 - do nothing
        0x61 | 0xb0..=0xb9 => {}

        // OP_IF / OP_NOTIF - conditional on top of stack
        0x63 | 0x64 => {
            let mut value = false;
            if state.executing() {
                let item = state.pop()?;
                value = cast_to_bool(&item);
                if opcode == 0x64 {
                    value = !value;
                }
            }
            state.exec_stack.push(value);
        }

        // OP_ELSE - flip the innermost branch
        0x67 => {
            let top = state
                .exec_stack
                .last_mut()
                .ok_or_else(|| script_error("script-unbalanced-conditional", "ELSE without IF"))?;
            *top = !*top;
        }

        // OP_ENDIF - close the innermost branch
        0x68 => {
            state
                .exec_stack
                .pop()
                .ok_or_else(|| script_error("script-unbalanced-conditional", "ENDIF without IF"))?;
        }

        // OP_VERIFY - fail unless top is true
        0x69 => {
            let item = state.pop()?;
            if !cast_to_bool(&item) {
                return Err(script_error("script-verify", "OP_VERIFY failed"));
            }
        }

        // OP_RETURN - always fail
        OP_RETURN => return Err(script_error("script-op-return", "OP_RETURN executed")),

        // OP_TOALTSTACK / OP_FROMALTSTACK
        0x6b => {
            let item = state.pop()?;
            state.altstack.push(item);
        }
        0x6c => {
            let item = state
                .altstack
                .pop()
                .ok_or_else(|| script_error("script-invalid-altstack-operation", "alt stack empty"))?;
            state.stack.push(item);
        }

        // OP_2DROP - drop top two items
        0x6d => {
            state.require(2)?;
            state.stack.truncate(state.stack.len() - 2);
        }

        // OP_2DUP / OP_3DUP - duplicate top two or three items
        0x6e | 0x6f => {
            let n = if opcode == 0x6e { 2 } else { 3 };
            state.require(n)?;
            let start = state.stack.len() - n;
            let items: Vec<ByteString> = state.stack[start..].to_vec();
            state.stack.extend(items);
        }

        // OP_2OVER - copy the pair below the top pair
        0x70 => {
            state.require(4)?;
            let start = state.stack.len() - 4;
            let items: Vec<ByteString> = state.stack[start..start + 2].to_vec();
            state.stack.extend(items);
        }

        // OP_2ROT - move the fifth and sixth items to the top
        0x71 => {
            state.require(6)?;
            let start = state.stack.len() - 6;
            let items: Vec<ByteString> = state.stack.drain(start..start + 2).collect();
            state.stack.extend(items);
        }

        // OP_2SWAP - swap the top two pairs
        0x72 => {
            state.require(4)?;
            let len = state.stack.len();
            state.stack.swap(len - 4, len - 2);
            state.stack.swap(len - 3, len - 1);
        }

        // OP_IFDUP - duplicate top if true
        0x73 => {
            let top = state.peek(1)?.clone();
            if cast_to_bool(&top) {
                state.stack.push(top);
            }
        }

        // OP_DEPTH - push stack size
        0x74 => {
            let depth = state.stack.len() as i64;
            state.push_num(depth);
        }

        // OP_DROP - remove top item
        0x75 => {
            state.pop()?;
        }

        // OP_DUP - duplicate top item
        OP_DUP => {
            let top = state.peek(1)?.clone();
            state.stack.push(top);
        }

        // OP_NIP - remove second item
        0x77 => {
            state.require(2)?;
            let idx = state.stack.len() - 2;
            state.stack.remove(idx);
        }

        // OP_OVER - copy second item to top
        0x78 => {
            let second = state.peek(2)?.clone();
            state.stack.push(second);
        }

        // OP_PICK / OP_ROLL - copy or move the nth item to top
        0x79 | 0x7a => {
            let n = state.pop_num()?;
            if n < 0 || n as usize >= state.stack.len() {
                return Err(script_error("script-invalid-stack-operation", "PICK/ROLL index out of range"));
            }
            let idx = state.stack.len() - 1 - n as usize;
            let item = if opcode == 0x7a {
                state.stack.remove(idx)
            } else {
                state.stack[idx].clone()
            };
            state.stack.push(item);
        }

        // OP_ROT - rotate top three items left
        0x7b => {
            state.require(3)?;
            let idx = state.stack.len() - 3;
            let item = state.stack.remove(idx);
            state.stack.push(item);
        }

        // OP_SWAP - swap top two items
        0x7c => {
            state.require(2)?;
            let len = state.stack.len();
            state.stack.swap(len - 2, len - 1);
        }

        // OP_TUCK - copy top below second
        0x7d => {
            state.require(2)?;
            let top = state.peek(1)?.clone();
            let idx = state.stack.len() - 2;
            state.stack.insert(idx, top);
        }

        // OP_SIZE - push size of top item
        0x82 => {
            let size = state.peek(1)?.len() as i64;
            state.push_num(size);
        }

        // OP_EQUAL / OP_EQUALVERIFY - byte equality
        OP_EQUAL | OP_EQUALVERIFY => {
            let a = state.pop()?;
            let b = state.pop()?;
            let equal = a == b;
            if opcode == OP_EQUALVERIFY {
                if !equal {
                    return Err(script_error("script-equalverify", "OP_EQUALVERIFY failed"));
                }
            } else {
                state.push_bool(equal);
            }
        }

        // Unary arithmetic: OP_1ADD OP_1SUB OP_NEGATE OP_ABS OP_NOT OP_0NOTEQUAL
        0x8b | 0x8c | 0x8f | 0x90 | 0x91 | 0x92 => {
            let n = state.pop_num()?;
            let result = match opcode {
                0x8b => n + 1,
                0x8c => n - 1,
                0x8f => -n,
                0x90 => n.abs(),
                0x91 => (n == 0) as i64,
                _ => (n != 0) as i64,
            };
            state.push_num(result);
        }

        // Binary arithmetic: OP_ADD .. OP_MAX
        0x93 | 0x94 | 0x9a..=0xa4 => {
            let b = state.pop_num()?;
            let a = state.pop_num()?;
            let result = match opcode {
                0x93 => a + b,
                0x94 => a - b,
                0x9a => (a != 0 && b != 0) as i64,
                0x9b => (a != 0 || b != 0) as i64,
                0x9c | 0x9d => (a == b) as i64,
                0x9e => (a != b) as i64,
                0x9f => (a < b) as i64,
                0xa0 => (a > b) as i64,
                0xa1 => (a <= b) as i64,
                0xa2 => (a >= b) as i64,
                0xa3 => a.min(b),
                _ => a.max(b),
            };
            if opcode == 0x9d {
                if result == 0 {
                    return Err(script_error("script-numequalverify", "OP_NUMEQUALVERIFY failed"));
                }
            } else {
                state.push_num(result);
            }
        }

        // OP_WITHIN - min <= x < max
        0xa5 => {
            let max = state.pop_num()?;
            let min = state.pop_num()?;
            let x = state.pop_num()?;
            state.push_bool(min <= x && x < max);
        }

        // OP_RIPEMD160 / OP_SHA1 / OP_SHA256 / OP_HASH160 / OP_HASH256
        0xa6..=0xaa => {
            let item = state.pop()?;
            let digest = match opcode {
                0xa6 => Ripemd160::digest(&item).to_vec(),
                0xa7 => sha1::Hash::hash(&item).to_vec(),
                0xa8 => Sha256::digest(&item).to_vec(),
                OP_HASH160 => crate::hash::hash160(&item).to_vec(),
                _ => double_sha256(&item).to_vec(),
            };
            state.stack.push(digest);
        }

        // OP_CODESEPARATOR - signatures commit to the script after this point
        OP_CODESEPARATOR => state.code_start = pc,

        // OP_CHECKSIG / OP_CHECKSIGVERIFY
        OP_CHECKSIG | OP_CHECKSIGVERIFY => {
            let pubkey = state.pop()?;
            let signature = state.pop()?;
            let script_code = find_and_delete(&state.script[state.code_start..], &push_data(&signature));
            let ok = checker.check_sig(&signature, &pubkey, &script_code);
            if opcode == OP_CHECKSIGVERIFY {
                if !ok {
                    return Err(script_error("script-checksigverify", "OP_CHECKSIGVERIFY failed"));
                }
            } else {
                state.push_bool(ok);
            }
        }

        // OP_CHECKMULTISIG / OP_CHECKMULTISIGVERIFY
        OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
            let ok = check_multisig(state, checker)?;
            if opcode == OP_CHECKMULTISIGVERIFY {
                if !ok {
                    return Err(script_error("script-checkmultisigverify", "OP_CHECKMULTISIGVERIFY failed"));
                }
            } else {
                state.push_bool(ok);
            }
        }

        // OP_RESERVED, OP_VER, OP_VERIF, OP_VERNOTIF, OP_RESERVED1/2 and unknown
        _ => {
            return Err(script_error("script-bad-opcode", format!("invalid opcode {opcode:#04x}")));
        }
    }
    Ok(())
}

/// m-of-n signature check; keys and signatures are matched in order
fn check_multisig(state: &mut ExecState<'_>, checker: &dyn SignatureChecker) -> ScriptResult<bool> {
    let key_count = state.pop_num()?;
    if key_count < 0 || key_count as usize > MAX_PUBKEYS_PER_MULTISIG {
        return Err(script_error("script-pubkey-count", "bad public key count"));
    }
    state.op_count += key_count as usize;
    if state.op_count > MAX_SCRIPT_OPS {
        return Err(script_error("script-op-count", "operation limit exceeded"));
    }
    state.require(key_count as usize)?;
    let keys: Vec<ByteString> = state.stack.split_off(state.stack.len() - key_count as usize);

    let sig_count = state.pop_num()?;
    if sig_count < 0 || sig_count > key_count {
        return Err(script_error("script-sig-count", "bad signature count"));
    }
    state.require(sig_count as usize)?;
    let sigs: Vec<ByteString> = state.stack.split_off(state.stack.len() - sig_count as usize);

    let mut script_code = state.script[state.code_start..].to_vec();
    for sig in &sigs {
        script_code = find_and_delete(&script_code, &push_data(sig));
    }

    // Stack order is bottom-to-top; matching runs from the first-pushed item.
    let mut key_iter = keys.iter().rev();
    let mut success = true;
    let mut remaining_keys = keys.len();
    for sig in sigs.iter().rev() {
        let mut matched = false;
        while remaining_keys > 0 {
            remaining_keys -= 1;
            if let Some(key) = key_iter.next() {
                if checker.check_sig(sig, key, &script_code) {
                    matched = true;
                    break;
                }
            }
        }
        if !matched {
            success = false;
            break;
        }
    }

    // Historical off-by-one: one extra element is consumed.
    state.pop()?;
    Ok(success)
}

/// VerifyScript: 𝕊 × 𝕊 → {valid, error}
///
/// 1. Run the unlocking script on an empty stack
/// 2. Run the locking script on the result; top must be true
/// 3. For pay-to-script-hash outputs the unlocking script must be
///    push-only, and the last pushed item runs as a script on the
///    remaining stack; its top must be true
pub fn verify_script(script_sig: &[u8], script_pubkey: &[u8], checker: &dyn SignatureChecker) -> ScriptResult<()> {
    let mut stack = Vec::new();
    eval_script(script_sig, &mut stack, checker)?;
    let stack_copy = stack.clone();
    eval_script(script_pubkey, &mut stack, checker)?;
    match stack.last() {
        Some(top) if cast_to_bool(top) => {}
        _ => return Err(script_error("script-eval-false", "script evaluated to false")),
    }

    if is_pay_to_script_hash(script_pubkey) {
        if !is_push_only(script_sig) {
            return Err(script_error("script-sig-pushonly", "P2SH spend must be push-only"));
        }
        let mut stack = stack_copy;
        let redeem = stack
            .pop()
            .ok_or_else(|| script_error("script-invalid-stack-operation", "missing redeem script"))?;
        eval_script(&redeem, &mut stack, checker)?;
        match stack.last() {
            Some(top) if cast_to_bool(top) => {}
            _ => return Err(script_error("script-eval-false", "redeem script evaluated to false")),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::SecretKey;

    fn run_script(script: &[u8]) -> ScriptResult<Vec<ByteString>> {
        let mut stack = Vec::new();
        eval_script(script, &mut stack, &NoSignatureChecker)?;
        Ok(stack)
    }

    #[test]
    fn test_push_and_equal() {
        let stack = run_script(&[0x02, 0xab, 0xcd, 0x02, 0xab, 0xcd, OP_EQUAL]).unwrap();
        assert_eq!(stack, vec![vec![1]]);
    }

    #[test]
    fn test_pushdata_forms() {
        let mut script = vec![OP_PUSHDATA1, 3, 1, 2, 3, OP_PUSHDATA2, 1, 0, 9];
        script.extend_from_slice(&[OP_PUSHDATA4, 1, 0, 0, 0, 7]);
        let stack = run_script(&script).unwrap();
        assert_eq!(stack, vec![vec![1, 2, 3], vec![9], vec![7]]);
    }

    #[test]
    fn test_truncated_push_fails() {
        assert!(run_script(&[0x05, 1, 2]).is_err());
    }

    #[test]
    fn test_arithmetic() {
        // 2 3 ADD 5 NUMEQUAL
        let stack = run_script(&[0x52, 0x53, 0x93, 0x55, 0x9c]).unwrap();
        assert_eq!(stack, vec![vec![1]]);
        // 1 NEGATE 1NEGATE NUMEQUAL
        let stack = run_script(&[0x51, 0x8f, OP_1NEGATE, 0x9c]).unwrap();
        assert_eq!(stack, vec![vec![1]]);
    }

    #[test]
    fn test_if_else_branches() {
        // 1 IF 2 ELSE 3 ENDIF
        let stack = run_script(&[0x51, 0x63, 0x52, 0x67, 0x53, 0x68]).unwrap();
        assert_eq!(stack, vec![vec![2]]);
        // 0 IF 2 ELSE 3 ENDIF
        let stack = run_script(&[OP_0, 0x63, 0x52, 0x67, 0x53, 0x68]).unwrap();
        assert_eq!(stack, vec![vec![3]]);
    }

    #[test]
    fn test_unbalanced_if_fails() {
        let err = run_script(&[0x51, 0x63]).unwrap_err();
        assert_eq!(err.code, "script-unbalanced-conditional");
        assert!(run_script(&[0x68]).is_err());
    }

    #[test]
    fn test_disabled_opcode_fails_in_unexecuted_branch() {
        // 0 IF CAT ENDIF
        let err = run_script(&[OP_0, 0x63, 0x7e, 0x68]).unwrap_err();
        assert_eq!(err.code, "script-disabled-opcode");
    }

    #[test]
    fn test_op_return_fails() {
        assert_eq!(run_script(&[OP_RETURN]).unwrap_err().code, "script-op-return");
    }

    #[test]
    fn test_op_count_limit() {
        let script = vec![0x61; MAX_SCRIPT_OPS + 1];
        assert_eq!(run_script(&script).unwrap_err().code, "script-op-count");
        assert!(run_script(&vec![0x61; MAX_SCRIPT_OPS]).is_ok());
    }

    #[test]
    fn test_stack_operations() {
        // 1 2 3 ROT -> 2 3 1
        let stack = run_script(&[0x51, 0x52, 0x53, 0x7b]).unwrap();
        assert_eq!(stack, vec![vec![2], vec![3], vec![1]]);
        // 1 2 SWAP -> 2 1
        let stack = run_script(&[0x51, 0x52, 0x7c]).unwrap();
        assert_eq!(stack, vec![vec![2], vec![1]]);
        // 1 2 3 2 PICK -> 1 2 3 1
        let stack = run_script(&[0x51, 0x52, 0x53, 0x52, 0x79]).unwrap();
        assert_eq!(stack, vec![vec![1], vec![2], vec![3], vec![1]]);
        // 1 2 TUCK -> 2 1 2
        let stack = run_script(&[0x51, 0x52, 0x7d]).unwrap();
        assert_eq!(stack, vec![vec![2], vec![1], vec![2]]);
    }

    #[test]
    fn test_pick_out_of_range() {
        assert!(run_script(&[0x51, 0x55, 0x79]).is_err());
    }

    #[test]
    fn test_hash_opcodes() {
        let stack = run_script(&[OP_0, OP_HASH160]).unwrap();
        assert_eq!(hex::encode(&stack[0]), "b472a266d0bd89c13706a4132ccfb16f7c3b9fcb");
        let stack = run_script(&[OP_0, 0xa7]).unwrap();
        assert_eq!(hex::encode(&stack[0]), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn test_num_encoding() {
        assert_eq!(encode_num(0), Vec::<u8>::new());
        assert_eq!(encode_num(127), vec![0x7f]);
        assert_eq!(encode_num(128), vec![0x80, 0x00]);
        assert_eq!(encode_num(-1), vec![0x81]);
        assert_eq!(encode_num(-128), vec![0x80, 0x80]);
        for v in [-70000i64, -255, -1, 0, 1, 255, 256, 70000] {
            assert_eq!(decode_num(&encode_num(v), 4).unwrap(), v);
        }
        assert!(decode_num(&[1, 2, 3, 4, 5], 4).is_err());
    }

    #[test]
    fn test_cast_to_bool_negative_zero() {
        assert!(!cast_to_bool(&[]));
        assert!(!cast_to_bool(&[0, 0]));
        assert!(!cast_to_bool(&[0, 0x80]));
        assert!(cast_to_bool(&[0x80, 0]));
        assert!(cast_to_bool(&[1]));
    }

    #[test]
    fn test_find_and_delete() {
        let sig = vec![0xaa, 0xbb];
        let pattern = push_data(&sig);
        let script = [&pattern[..], &[OP_DUP][..], &pattern[..]].concat();
        assert_eq!(find_and_delete(&script, &pattern), vec![OP_DUP]);
        // Not opcode-aligned: the pattern inside a larger push survives.
        let inner = [0x04, 0x02, 0xaa, 0xbb, 0x00];
        assert_eq!(find_and_delete(&inner, &pattern), inner.to_vec());
    }

    #[test]
    fn test_extract_owner_forms() {
        let hash = [0x11u8; 20];
        let mut p2pkh = vec![OP_DUP, OP_HASH160, 0x14];
        p2pkh.extend_from_slice(&hash);
        p2pkh.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
        assert_eq!(extract_owner(&p2pkh), Some(hash));

        let pubkey = [0x02u8; 33];
        let mut p2pk = vec![33];
        p2pk.extend_from_slice(&pubkey);
        p2pk.push(OP_CHECKSIG);
        assert_eq!(extract_owner(&p2pk), Some(crate::hash::hash160(&pubkey)));

        assert_eq!(extract_owner(&[0x51]), None);
    }

    #[test]
    fn test_sig_op_count() {
        let script = [OP_CHECKSIG, 0x52, OP_CHECKMULTISIG];
        assert_eq!(get_sig_op_count(&script, false), 1 + 20);
        assert_eq!(get_sig_op_count(&script, true), 1 + 2);
    }

    #[test]
    fn test_signature_hash_single_out_of_range_is_one() {
        let tx = Transaction {
            version: 1,
            inputs: vec![
                TransactionInput { prevout: OutPoint { hash: [1; 32], index: 0 }, script_sig: vec![], sequence: SEQUENCE_FINAL },
                TransactionInput { prevout: OutPoint { hash: [2; 32], index: 0 }, script_sig: vec![], sequence: SEQUENCE_FINAL },
            ],
            outputs: vec![TransactionOutput { value: 1, script_pubkey: vec![] }],
            lock_time: 0,
        };
        let mut one = [0u8; 32];
        one[0] = 1;
        assert_eq!(signature_hash(&[], &tx, 1, SIGHASH_SINGLE), one);
        assert_ne!(signature_hash(&[], &tx, 0, SIGHASH_SINGLE), one);
        assert_eq!(signature_hash(&[], &tx, 5, SIGHASH_ALL), one);
    }

    fn signed_spend(secret: &SecretKey, script_pubkey: &[u8]) -> (Transaction, ByteString) {
        let secp = Secp256k1::new();
        let mut tx = Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout: OutPoint { hash: [7; 32], index: 0 },
                script_sig: vec![],
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TransactionOutput { value: 10, script_pubkey: vec![0x51] }],
            lock_time: 0,
        };
        let sighash = signature_hash(script_pubkey, &tx, 0, SIGHASH_ALL);
        let message = Message::from_digest_slice(&sighash).unwrap();
        let mut sig = secp.sign_ecdsa(&message, secret).serialize_der().to_vec();
        sig.push(SIGHASH_ALL as u8);
        tx.inputs[0].script_sig = push_data(&sig);
        (tx, sig)
    }

    #[test]
    fn test_checksig_pay_to_pubkey() {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[0x42; 32]).unwrap();
        let pubkey = PublicKey::from_secret_key(&secp, &secret).serialize();
        let mut script_pubkey = push_data(&pubkey);
        script_pubkey.push(OP_CHECKSIG);

        let (tx, _) = signed_spend(&secret, &script_pubkey);
        let checker = TransactionSignatureChecker::new(&tx, 0);
        assert!(verify_script(&tx.inputs[0].script_sig, &script_pubkey, &checker).is_ok());

        // Changing an output invalidates the signature.
        let mut tampered = tx.clone();
        tampered.outputs[0].value = 11;
        let checker = TransactionSignatureChecker::new(&tampered, 0);
        let err = verify_script(&tampered.inputs[0].script_sig, &script_pubkey, &checker).unwrap_err();
        assert_eq!(err.code, "script-eval-false");
    }

    #[test]
    fn test_checkmultisig_one_of_two() {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[0x24; 32]).unwrap();
        let other = SecretKey::from_slice(&[0x25; 32]).unwrap();
        let key_a = PublicKey::from_secret_key(&secp, &secret).serialize();
        let key_b = PublicKey::from_secret_key(&secp, &other).serialize();
        let mut script_pubkey = vec![OP_1];
        script_pubkey.extend(push_data(&key_b));
        script_pubkey.extend(push_data(&key_a));
        script_pubkey.extend([0x52, OP_CHECKMULTISIG]);

        let (mut tx, sig) = signed_spend(&secret, &script_pubkey);
        tx.inputs[0].script_sig = [vec![OP_0], push_data(&sig)].concat();
        let checker = TransactionSignatureChecker::new(&tx, 0);
        assert!(verify_script(&tx.inputs[0].script_sig, &script_pubkey, &checker).is_ok());
    }

    #[test]
    fn test_p2sh_requires_push_only() {
        let redeem = vec![0x51];
        let mut script_pubkey = vec![OP_HASH160, 0x14];
        script_pubkey.extend_from_slice(&crate::hash::hash160(&redeem));
        script_pubkey.push(OP_EQUAL);

        let good = push_data(&redeem);
        assert!(verify_script(&good, &script_pubkey, &NoSignatureChecker).is_ok());

        let mut not_push_only = vec![0x61];
        not_push_only.extend(push_data(&redeem));
        let err = verify_script(&not_push_only, &script_pubkey, &NoSignatureChecker).unwrap_err();
        assert_eq!(err.code, "script-sig-pushonly");
    }
}
