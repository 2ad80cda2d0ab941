//! Peer address records
//!
//! The `addr` namespace holds either per-address records under
//! `("addr", key)` or a whole serialized address table under `"addrman"`.
//! Loading a namespace that has both drops the per-address records with a
//! namespace rewrite.

use crate::error::Result;
use crate::serialization::{deserialize, serialize};
use crate::storage::{Database, Environment, OpenMode};
use crate::types::PeerAddress;
use std::sync::Arc;
use tracing::{info, warn};

pub const ADDR_NAMESPACE: &str = "addr";

const ADDR_TAG: &str = "addr";
const ADDRMAN_KEY: &str = "addrman";

#[derive(Debug)]
pub struct AddrDb {
    db: Database,
}

impl AddrDb {
    pub fn open(env: &Arc<Environment>, mode: OpenMode) -> Result<Self> {
        Ok(AddrDb {
            db: env.open_database(ADDR_NAMESPACE, mode)?,
        })
    }

    pub fn write_address(&mut self, addr: &PeerAddress) -> Result<()> {
        Ok(self.db.write(&(ADDR_TAG, addr.key()), addr)?)
    }

    pub fn erase_address(&mut self, addr: &PeerAddress) -> Result<()> {
        Ok(self.db.erase(&(ADDR_TAG, addr.key()))?)
    }

    pub fn write_address_table(&mut self, table: &[PeerAddress]) -> Result<()> {
        Ok(self.db.write(ADDRMAN_KEY, &table.to_vec())?)
    }

    pub fn read_address_table(&self) -> Result<Option<Vec<PeerAddress>>> {
        Ok(self.db.read(ADDRMAN_KEY)?)
    }

    /// Every per-address record; undecodable ones are skipped
    pub fn read_addresses(&self) -> Result<Vec<PeerAddress>> {
        let mut addresses = Vec::new();
        for item in self.db.cursor_prefix(&serialize(ADDR_TAG)) {
            let (_, value) = item?;
            match deserialize::<PeerAddress>(&value) {
                Ok(addr) => addresses.push(addr),
                Err(e) => warn!("Skipping corrupt address record: {}", e),
            }
        }
        Ok(addresses)
    }
}

/// LoadAddresses: the address table if one was saved, else the
/// per-address records
///
/// When both exist the per-address records are obsolete and the namespace
/// is rewritten without them.
pub fn load_addresses(env: &Arc<Environment>) -> Result<Vec<PeerAddress>> {
    let db = AddrDb::open(env, OpenMode::Create)?;
    let table = db.read_address_table()?;
    let legacy = db.read_addresses()?;
    drop(db);

    match table {
        Some(table) => {
            if !legacy.is_empty() {
                info!("Dropping {} legacy address records", legacy.len());
                env.rewrite(ADDR_NAMESPACE, Some(&serialize(ADDR_TAG)))?;
            }
            info!("Loaded address table with {} entries", table.len());
            Ok(table)
        }
        None => {
            info!("Loaded {} address records", legacy.len());
            Ok(legacy)
        }
    }
}
