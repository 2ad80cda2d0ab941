//! Append-only block files
//!
//! Full block bodies are appended to `blkNNNN.dat` files, each record framed
//! as `message_start (4) | size (u32 LE) | block bytes`. A block's position
//! is the offset of its first byte after the frame; a transaction's position
//! adds the offset of its bytes within that block.

use crate::constants::{MAX_BLOCKFILE_SIZE, MAX_BLOCK_SIZE};
use crate::error::{LedgerError, Result};
use crate::serialization::{compact_size_len, deserialize, serialize, Decodable, Reader};
use crate::types::*;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const FRAME_LEN: u32 = 8;
const HEADER_LEN: u32 = 80;

#[derive(Debug)]
pub struct BlockFiles {
    dir: PathBuf,
    message_start: [u8; 4],
    current_file: u32,
    max_block_size: usize,
}

impl BlockFiles {
    /// Open the block file directory, resuming at the last existing file
    pub fn open(dir: &Path, message_start: [u8; 4]) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut current_file = 1;
        while block_file_path(dir, current_file + 1).exists() {
            current_file += 1;
        }
        debug!("Block files at {:?}, current file {}", dir, current_file);
        Ok(BlockFiles {
            dir: dir.to_path_buf(),
            message_start,
            current_file,
            max_block_size: MAX_BLOCK_SIZE,
        })
    }

    /// Largest frame length accepted when reading
    pub fn with_max_block_size(mut self, max_block_size: usize) -> Self {
        self.max_block_size = max_block_size;
        self
    }

    fn path(&self, file: u32) -> PathBuf {
        block_file_path(&self.dir, file)
    }

    /// Append `block` and return its position plus the file offset of
    /// each of its transactions
    pub fn write_block(&mut self, block: &Block) -> Result<(DiskBlockPos, Vec<u32>)> {
        let bytes = serialize(block);
        let size = u32::try_from(bytes.len())
            .map_err(|_| LedgerError::StorageFatal("block too large for block file".to_string()))?;

        let mut file_len = file_size(&self.path(self.current_file))?;
        if file_len.saturating_add(FRAME_LEN).saturating_add(size) > MAX_BLOCKFILE_SIZE {
            self.current_file += 1;
            file_len = 0;
            info!("Starting block file {}", self.current_file);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(self.current_file))?;
        let mut record = Vec::with_capacity(bytes.len() + FRAME_LEN as usize);
        record.extend_from_slice(&self.message_start);
        record.extend_from_slice(&size.to_le_bytes());
        record.extend_from_slice(&bytes);
        file.write_all(&record)?;
        file.sync_data()?;

        let pos = DiskBlockPos {
            file: self.current_file,
            pos: file_len + FRAME_LEN,
        };
        let tx_offsets = tx_positions(block, pos).iter().map(|p| p.tx_pos).collect();
        Ok((pos, tx_offsets))
    }

    /// Read the block stored at `pos`, checking its frame
    pub fn read_block(&self, pos: DiskBlockPos) -> Result<Block> {
        Ok(deserialize(&self.read_block_bytes(pos)?)?)
    }

    /// Read the transaction stored at `pos`
    pub fn read_transaction(&self, pos: DiskTxPos) -> Result<Transaction> {
        let bytes = self.read_block_bytes(pos.block())?;
        let start = pos
            .tx_pos
            .checked_sub(pos.block_pos)
            .map(|offset| offset as usize)
            .filter(|&offset| offset < bytes.len())
            .ok_or_else(|| LedgerError::StorageCorrupt(format!("bad transaction position {pos:?}")))?;
        // Transactions are self-delimiting inside the block bytes.
        let mut reader = Reader::new(&bytes[start..]);
        Ok(Transaction::decode(&mut reader)?)
    }

    fn read_block_bytes(&self, pos: DiskBlockPos) -> Result<Vec<u8>> {
        if pos.pos < FRAME_LEN {
            return Err(LedgerError::StorageCorrupt(format!("bad block position {pos:?}")));
        }
        let mut file = self.open_for_read(pos.file)?;
        let file_len = file.metadata()?.len();
        file.seek(SeekFrom::Start((pos.pos - FRAME_LEN) as u64))?;
        let mut frame = [0u8; FRAME_LEN as usize];
        file.read_exact(&mut frame).map_err(|e| truncated(pos, e))?;
        if frame[..4] != self.message_start {
            return Err(LedgerError::StorageCorrupt(format!(
                "block file {} offset {}: bad magic",
                pos.file, pos.pos
            )));
        }
        let mut size_bytes = [0u8; 4];
        size_bytes.copy_from_slice(&frame[4..]);
        let size = u32::from_le_bytes(size_bytes) as usize;
        let available = file_len.saturating_sub(pos.pos as u64);
        if size > self.max_block_size || size as u64 > available {
            return Err(LedgerError::StorageCorrupt(format!(
                "block file {} offset {}: frame length {} with {} bytes left",
                pos.file, pos.pos, size, available
            )));
        }
        let mut bytes = vec![0u8; size];
        file.read_exact(&mut bytes).map_err(|e| truncated(pos, e))?;
        Ok(bytes)
    }

    fn open_for_read(&self, file: u32) -> Result<File> {
        File::open(self.path(file)).map_err(|e| {
            LedgerError::StorageCorrupt(format!("block file {} unreadable: {}", file, e))
        })
    }
}

/// Position of every transaction of `block` stored at `pos`
pub fn tx_positions(block: &Block, pos: DiskBlockPos) -> Vec<DiskTxPos> {
    let mut offset = pos.pos + HEADER_LEN + compact_size_len(block.transactions.len() as u64) as u32;
    let mut positions = Vec::with_capacity(block.transactions.len());
    for tx in &block.transactions {
        positions.push(DiskTxPos {
            file: pos.file,
            block_pos: pos.pos,
            tx_pos: offset,
        });
        offset += serialize(tx).len() as u32;
    }
    positions
}

fn truncated(pos: DiskBlockPos, err: std::io::Error) -> LedgerError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        LedgerError::StorageCorrupt(format!("block file {} offset {}: truncated", pos.file, pos.pos))
    } else {
        err.into()
    }
}

fn block_file_path(dir: &Path, file: u32) -> PathBuf {
    dir.join(format!("blk{file:04}.dat"))
}

fn file_size(path: &Path) -> Result<u32> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(u32::try_from(meta.len()).unwrap_or(u32::MAX)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainParams;

    #[test]
    fn test_write_then_read_block() {
        let dir = tempfile::tempdir().unwrap();
        let params = ChainParams::regtest();
        let mut files = BlockFiles::open(dir.path(), params.message_start).unwrap();
        let genesis = params.genesis_block();

        let (pos, offsets) = files.write_block(&genesis).unwrap();
        assert_eq!(pos, DiskBlockPos { file: 1, pos: 8 });
        assert_eq!(offsets, vec![8 + 80 + 1]);
        assert_eq!(files.read_block(pos).unwrap(), genesis);

        let tx_pos = DiskTxPos { file: pos.file, block_pos: pos.pos, tx_pos: offsets[0] };
        assert_eq!(files.read_transaction(tx_pos).unwrap(), genesis.transactions[0]);
    }

    #[test]
    fn test_second_block_follows_first() {
        let dir = tempfile::tempdir().unwrap();
        let params = ChainParams::regtest();
        let mut files = BlockFiles::open(dir.path(), params.message_start).unwrap();
        let genesis = params.genesis_block();
        let first_len = serialize(&genesis).len() as u32;

        files.write_block(&genesis).unwrap();
        let (pos, _) = files.write_block(&genesis).unwrap();
        assert_eq!(pos.pos, 8 + first_len + 8);
        assert_eq!(files.read_block(pos).unwrap(), genesis);
    }

    #[test]
    fn test_bad_magic_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let params = ChainParams::regtest();
        let mut files = BlockFiles::open(dir.path(), params.message_start).unwrap();
        let (pos, _) = files.write_block(&params.genesis_block()).unwrap();

        let other = BlockFiles::open(dir.path(), [0, 1, 2, 3]).unwrap();
        assert!(matches!(other.read_block(pos), Err(LedgerError::StorageCorrupt(_))));
    }

    #[test]
    fn test_reopen_resumes_last_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(block_file_path(dir.path(), 1), b"").unwrap();
        std::fs::write(block_file_path(dir.path(), 2), b"").unwrap();
        let files = BlockFiles::open(dir.path(), [0; 4]).unwrap();
        assert_eq!(files.current_file, 2);
    }

    #[test]
    fn test_truncated_body_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let params = ChainParams::regtest();
        let mut files = BlockFiles::open(dir.path(), params.message_start).unwrap();
        let (pos, _) = files.write_block(&params.genesis_block()).unwrap();

        let path = block_file_path(dir.path(), pos.file);
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..pos.pos as usize + 40]).unwrap();
        assert!(matches!(files.read_block(pos), Err(LedgerError::StorageCorrupt(_))));
    }

    #[test]
    fn test_oversized_frame_length_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let params = ChainParams::regtest();
        let mut files = BlockFiles::open(dir.path(), params.message_start).unwrap();
        let (pos, _) = files.write_block(&params.genesis_block()).unwrap();

        let path = block_file_path(dir.path(), pos.file);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[4..8].copy_from_slice(&u32::MAX.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(files.read_block(pos), Err(LedgerError::StorageCorrupt(_))));

        let strict = BlockFiles::open(dir.path(), params.message_start)
            .unwrap()
            .with_max_block_size(100);
        let body_len = (bytes.len() - 8) as u32;
        bytes[4..8].copy_from_slice(&body_len.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(strict.read_block(pos), Err(LedgerError::StorageCorrupt(_))));
    }
}
