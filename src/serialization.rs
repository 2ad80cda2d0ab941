//! Deterministic binary codec
//!
//! Every persisted record and every hashed structure goes through this codec.
//! Integers are little-endian and fixed width; variable-length items carry a
//! compact-size length prefix:
//!
//! - value < 0xfd: single byte
//! - value <= 0xffff: 0xfd prefix + 2 bytes
//! - value <= 0xffffffff: 0xfe prefix + 4 bytes
//! - otherwise: 0xff prefix + 8 bytes
//!
//! Decoding rejects non-minimal compact sizes so that a given value has
//! exactly one encoding, which keeps hashes and store keys stable.

use crate::types::*;
use thiserror::Error;

/// Upper bound on any decoded length prefix (32 MiB)
pub const MAX_SIZE: u64 = 0x0200_0000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of data: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("non-canonical compact size encoding")]
    NonCanonicalCompactSize,

    #[error("length {0} exceeds maximum")]
    OversizedLength(u64),

    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),

    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    #[error("invalid tag {0}")]
    InvalidTag(u8),
}

pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Types with a canonical binary encoding
pub trait Encodable {
    fn encode(&self, out: &mut Vec<u8>);
}

/// Types that can be rebuilt from their canonical encoding
pub trait Decodable: Sized {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self>;
}

/// Cursor over a borrowed byte slice
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEof {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.read_bytes(N)?);
        Ok(buf)
    }

    pub fn read_u8(&mut self) -> CodecResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_compact_size(&mut self) -> CodecResult<u64> {
        let first = self.read_u8()?;
        let value = match first {
            0xfd => {
                let v = u16::from_le_bytes(self.read_array()?) as u64;
                if v < 0xfd {
                    return Err(CodecError::NonCanonicalCompactSize);
                }
                v
            }
            0xfe => {
                let v = u32::from_le_bytes(self.read_array()?) as u64;
                if v <= 0xffff {
                    return Err(CodecError::NonCanonicalCompactSize);
                }
                v
            }
            0xff => {
                let v = u64::from_le_bytes(self.read_array()?);
                if v <= 0xffff_ffff {
                    return Err(CodecError::NonCanonicalCompactSize);
                }
                v
            }
            small => small as u64,
        };
        Ok(value)
    }

    /// Reads a compact-size length and bounds it by `MAX_SIZE`
    pub fn read_length(&mut self) -> CodecResult<usize> {
        let len = self.read_compact_size()?;
        if len > MAX_SIZE {
            return Err(CodecError::OversizedLength(len));
        }
        Ok(len as usize)
    }

    pub fn read_var_bytes(&mut self) -> CodecResult<Vec<u8>> {
        let len = self.read_length()?;
        Ok(self.read_bytes(len)?.to_vec())
    }
}

/// Append a compact-size integer
pub fn write_compact_size(out: &mut Vec<u8>, value: u64) {
    if value < 0xfd {
        out.push(value as u8);
    } else if value <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

/// Append a length-prefixed byte string
pub fn write_var_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_compact_size(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

/// Number of bytes a compact-size prefix occupies
pub fn compact_size_len(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Encode a value into a fresh buffer
pub fn serialize<T: Encodable + ?Sized>(value: &T) -> Vec<u8> {
    let mut out = Vec::new();
    value.encode(&mut out);
    out
}

/// Decode a value that must occupy the whole input
pub fn deserialize<T: Decodable>(bytes: &[u8]) -> CodecResult<T> {
    let mut reader = Reader::new(bytes);
    let value = T::decode(&mut reader)?;
    if !reader.is_empty() {
        return Err(CodecError::TrailingBytes(reader.remaining()));
    }
    Ok(value)
}

macro_rules! impl_int {
    ($($t:ty),*) => {$(
        impl Encodable for $t {
            fn encode(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        }

        impl Decodable for $t {
            fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
                Ok(<$t>::from_le_bytes(reader.read_array()?))
            }
        }
    )*};
}

impl_int!(u8, u16, u32, u64, i32, i64);

impl Encodable for bool {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(*self as u8);
    }
}

impl Decodable for bool {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        match reader.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidTag(other)),
        }
    }
}

impl<const N: usize> Encodable for [u8; N] {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

impl<const N: usize> Decodable for [u8; N] {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        reader.read_array()
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode(&self, out: &mut Vec<u8>) {
        write_compact_size(out, self.len() as u64);
        for item in self {
            item.encode(out);
        }
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        let len = reader.read_length()?;
        // Every item takes at least one byte, so the remaining input bounds
        // the allocation for hostile length prefixes.
        let mut items = Vec::with_capacity(len.min(reader.remaining()));
        for _ in 0..len {
            items.push(T::decode(reader)?);
        }
        Ok(items)
    }
}

impl<T: Encodable> Encodable for Option<T> {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            None => out.push(0),
            Some(value) => {
                out.push(1);
                value.encode(out);
            }
        }
    }
}

impl<T: Decodable> Decodable for Option<T> {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        match reader.read_u8()? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(reader)?)),
            other => Err(CodecError::InvalidTag(other)),
        }
    }
}

impl Encodable for str {
    fn encode(&self, out: &mut Vec<u8>) {
        write_var_bytes(out, self.as_bytes());
    }
}

impl Encodable for String {
    fn encode(&self, out: &mut Vec<u8>) {
        self.as_str().encode(out);
    }
}

impl Decodable for String {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        String::from_utf8(reader.read_var_bytes()?).map_err(|_| CodecError::InvalidUtf8)
    }
}

impl<T: Encodable + ?Sized> Encodable for &T {
    fn encode(&self, out: &mut Vec<u8>) {
        (**self).encode(out);
    }
}

impl<A: Encodable, B: Encodable> Encodable for (A, B) {
    fn encode(&self, out: &mut Vec<u8>) {
        self.0.encode(out);
        self.1.encode(out);
    }
}

impl<A: Decodable, B: Decodable> Decodable for (A, B) {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        Ok((A::decode(reader)?, B::decode(reader)?))
    }
}

impl<A: Encodable, B: Encodable, C: Encodable> Encodable for (A, B, C) {
    fn encode(&self, out: &mut Vec<u8>) {
        self.0.encode(out);
        self.1.encode(out);
        self.2.encode(out);
    }
}

impl<A: Decodable, B: Decodable, C: Decodable> Decodable for (A, B, C) {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        Ok((A::decode(reader)?, B::decode(reader)?, C::decode(reader)?))
    }
}

// ============================================================================
// WIRE FORMAT OF CHAIN STRUCTURES
// ============================================================================

impl Encodable for OutPoint {
    fn encode(&self, out: &mut Vec<u8>) {
        self.hash.encode(out);
        self.index.encode(out);
    }
}

impl Decodable for OutPoint {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(OutPoint {
            hash: Decodable::decode(reader)?,
            index: Decodable::decode(reader)?,
        })
    }
}

impl Encodable for TransactionInput {
    fn encode(&self, out: &mut Vec<u8>) {
        self.prevout.encode(out);
        write_var_bytes(out, &self.script_sig);
        self.sequence.encode(out);
    }
}

impl Decodable for TransactionInput {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(TransactionInput {
            prevout: OutPoint::decode(reader)?,
            script_sig: reader.read_var_bytes()?,
            sequence: u32::decode(reader)?,
        })
    }
}

impl Encodable for TransactionOutput {
    fn encode(&self, out: &mut Vec<u8>) {
        self.value.encode(out);
        write_var_bytes(out, &self.script_pubkey);
    }
}

impl Decodable for TransactionOutput {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(TransactionOutput {
            value: i64::decode(reader)?,
            script_pubkey: reader.read_var_bytes()?,
        })
    }
}

impl Encodable for Transaction {
    fn encode(&self, out: &mut Vec<u8>) {
        self.version.encode(out);
        self.inputs.encode(out);
        self.outputs.encode(out);
        self.lock_time.encode(out);
    }
}

impl Decodable for Transaction {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(Transaction {
            version: i32::decode(reader)?,
            inputs: Vec::decode(reader)?,
            outputs: Vec::decode(reader)?,
            lock_time: u32::decode(reader)?,
        })
    }
}

impl Encodable for BlockHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        self.version.encode(out);
        self.prev_block_hash.encode(out);
        self.merkle_root.encode(out);
        self.timestamp.encode(out);
        self.bits.encode(out);
        self.nonce.encode(out);
    }
}

impl Decodable for BlockHeader {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(BlockHeader {
            version: i32::decode(reader)?,
            prev_block_hash: Decodable::decode(reader)?,
            merkle_root: Decodable::decode(reader)?,
            timestamp: u32::decode(reader)?,
            bits: u32::decode(reader)?,
            nonce: u32::decode(reader)?,
        })
    }
}

impl Encodable for Block {
    fn encode(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        self.transactions.encode(out);
    }
}

impl Decodable for Block {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(Block {
            header: BlockHeader::decode(reader)?,
            transactions: Vec::decode(reader)?,
        })
    }
}

// ============================================================================
// INDEX RECORDS
// ============================================================================

impl Encodable for DiskBlockPos {
    fn encode(&self, out: &mut Vec<u8>) {
        self.file.encode(out);
        self.pos.encode(out);
    }
}

impl Decodable for DiskBlockPos {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(DiskBlockPos {
            file: u32::decode(reader)?,
            pos: u32::decode(reader)?,
        })
    }
}

impl Encodable for DiskTxPos {
    fn encode(&self, out: &mut Vec<u8>) {
        self.file.encode(out);
        self.block_pos.encode(out);
        self.tx_pos.encode(out);
    }
}

impl Decodable for DiskTxPos {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(DiskTxPos {
            file: u32::decode(reader)?,
            block_pos: u32::decode(reader)?,
            tx_pos: u32::decode(reader)?,
        })
    }
}

impl Encodable for TxIndex {
    fn encode(&self, out: &mut Vec<u8>) {
        self.pos.encode(out);
        self.height.encode(out);
        self.spent.encode(out);
    }
}

impl Decodable for TxIndex {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(TxIndex {
            pos: DiskTxPos::decode(reader)?,
            height: u32::decode(reader)?,
            spent: Vec::decode(reader)?,
        })
    }
}

impl Encodable for BlockStatus {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(*self as u8);
    }
}

impl Decodable for BlockStatus {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        let tag = reader.read_u8()?;
        BlockStatus::from_u8(tag).ok_or(CodecError::InvalidTag(tag))
    }
}

impl Encodable for DiskBlockIndex {
    fn encode(&self, out: &mut Vec<u8>) {
        self.client_version.encode(out);
        self.header.encode(out);
        self.hash_next.encode(out);
        self.pos.encode(out);
        self.height.encode(out);
        self.status.encode(out);
    }
}

impl Decodable for DiskBlockIndex {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(DiskBlockIndex {
            client_version: i32::decode(reader)?,
            header: BlockHeader::decode(reader)?,
            hash_next: Decodable::decode(reader)?,
            pos: Option::decode(reader)?,
            height: u32::decode(reader)?,
            status: BlockStatus::decode(reader)?,
        })
    }
}

impl Encodable for AccountingEntry {
    fn encode(&self, out: &mut Vec<u8>) {
        self.credit_debit.encode(out);
        self.time.encode(out);
        self.other_account.encode(out);
        self.comment.encode(out);
    }
}

impl Decodable for AccountingEntry {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(AccountingEntry {
            account: String::new(),
            entry_no: 0,
            credit_debit: i64::decode(reader)?,
            time: i64::decode(reader)?,
            other_account: String::decode(reader)?,
            comment: String::decode(reader)?,
        })
    }
}

impl Encodable for PeerAddress {
    fn encode(&self, out: &mut Vec<u8>) {
        self.services.encode(out);
        out.extend_from_slice(&self.ip);
        // Port is big-endian on the wire.
        out.extend_from_slice(&self.port.to_be_bytes());
        self.time.encode(out);
    }
}

impl Decodable for PeerAddress {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        let services = u64::decode(reader)?;
        let ip = reader.read_array::<16>()?;
        let port = u16::from_be_bytes(reader.read_array()?);
        let time = u32::decode(reader)?;
        Ok(PeerAddress {
            services,
            ip,
            port,
            time,
        })
    }
}
