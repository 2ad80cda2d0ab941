//! Accounting entries: manual credits and debits between account labels
//!
//! Entries live in the `wallet` namespace under `("acentry", account, n)`
//! where `n` is a sequence number shared by all accounts. Entries are
//! append-only.

use crate::chain::unix_time;
use crate::error::{LedgerError, Result};
use crate::serialization::{deserialize, serialize};
use crate::storage::{Database, Environment, OpenMode};
use crate::types::*;
use std::sync::Arc;
use tracing::{debug, warn};

pub const WALLET_NAMESPACE: &str = "wallet";

const ACCOUNTING_TAG: &str = "acentry";

/// Account label that lists every account
pub const ALL_ACCOUNTS: &str = "*";

#[derive(Debug)]
pub struct WalletDb {
    db: Database,
    next_entry_no: u64,
}

impl WalletDb {
    /// Open the wallet namespace, resuming the entry sequence after the
    /// highest stored number
    pub fn open(env: &Arc<Environment>, mode: OpenMode) -> Result<Self> {
        let db = env.open_database(WALLET_NAMESPACE, mode)?;
        let mut wallet = WalletDb { db, next_entry_no: 0 };
        let highest = wallet
            .list_account_credit_debit(ALL_ACCOUNTS)?
            .iter()
            .map(|entry| entry.entry_no)
            .max();
        wallet.next_entry_no = highest.map_or(0, |n| n + 1);
        debug!("Wallet accounting sequence resumes at {}", wallet.next_entry_no);
        Ok(wallet)
    }

    /// Append an entry, assigning its sequence number
    pub fn write_accounting_entry(&mut self, entry: &AccountingEntry) -> Result<u64> {
        let entry_no = self.next_entry_no;
        self.db.write(&(ACCOUNTING_TAG, entry.account.as_str(), entry_no), entry)?;
        self.next_entry_no += 1;
        Ok(entry_no)
    }

    /// Move `amount` from one account to another: a debit and a matching
    /// credit written in one store transaction
    pub fn move_funds(&mut self, from: &str, to: &str, amount: Amount, comment: &str) -> Result<()> {
        if amount <= 0 {
            return Err(LedgerError::OutOfRange(format!("move amount {amount} must be positive")));
        }
        let time = unix_time() as i64;
        let debit = AccountingEntry {
            account: from.to_string(),
            entry_no: 0,
            credit_debit: -amount,
            time,
            other_account: to.to_string(),
            comment: comment.to_string(),
        };
        let credit = AccountingEntry {
            account: to.to_string(),
            credit_debit: amount,
            other_account: from.to_string(),
            ..debit.clone()
        };

        let start = self.next_entry_no;
        self.db.txn_begin()?;
        if let Err(err) = self.write_pair(&debit, &credit) {
            if self.db.in_txn() {
                self.db.txn_abort()?;
            }
            self.next_entry_no = start;
            return Err(err);
        }
        Ok(())
    }

    fn write_pair(&mut self, debit: &AccountingEntry, credit: &AccountingEntry) -> Result<()> {
        self.write_accounting_entry(debit)?;
        self.write_accounting_entry(credit)?;
        Ok(self.db.txn_commit()?)
    }

    /// Sum of every entry for `account`
    pub fn account_credit_debit(&self, account: &str) -> Result<Amount> {
        Ok(self
            .list_account_credit_debit(account)?
            .iter()
            .map(|entry| entry.credit_debit)
            .sum())
    }

    /// Entries of `account` (every account for `"*"`) in sequence order
    pub fn list_account_credit_debit(&self, account: &str) -> Result<Vec<AccountingEntry>> {
        let prefix = if account == ALL_ACCOUNTS {
            serialize(ACCOUNTING_TAG)
        } else {
            serialize(&(ACCOUNTING_TAG, account))
        };
        let mut entries = Vec::new();
        for item in self.db.cursor_prefix(&prefix) {
            let (key, value) = item?;
            let (_, account, entry_no) = match deserialize::<(String, String, u64)>(&key) {
                Ok(parts) => parts,
                Err(e) => {
                    warn!("Skipping accounting record with bad key: {}", e);
                    continue;
                }
            };
            let mut entry: AccountingEntry = deserialize(&value)?;
            entry.account = account;
            entry.entry_no = entry_no;
            entries.push(entry);
        }
        entries.sort_by_key(|entry| entry.entry_no);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(dir: &std::path::Path) -> Arc<Environment> {
        Environment::open(dir, 8 * 1024 * 1024, false).unwrap()
    }

    #[test]
    fn test_move_writes_balanced_pair() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(dir.path());
        let mut wallet = WalletDb::open(&env, OpenMode::Create).unwrap();
        wallet.move_funds("savings", "spending", 500, "rent").unwrap();

        assert_eq!(wallet.account_credit_debit("savings").unwrap(), -500);
        assert_eq!(wallet.account_credit_debit("spending").unwrap(), 500);
        let all = wallet.list_account_credit_debit(ALL_ACCOUNTS).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].entry_no, 0);
        assert_eq!(all[0].other_account, "spending");
        assert_eq!(all[1].comment, "rent");
    }

    #[test]
    fn test_account_prefix_does_not_match_longer_names() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(dir.path());
        let mut wallet = WalletDb::open(&env, OpenMode::Create).unwrap();
        wallet.move_funds("a", "ab", 10, "").unwrap();
        assert_eq!(wallet.list_account_credit_debit("a").unwrap().len(), 1);
        assert_eq!(wallet.account_credit_debit("ab").unwrap(), 10);
    }

    #[test]
    fn test_sequence_resumes_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(dir.path());
        {
            let mut wallet = WalletDb::open(&env, OpenMode::Create).unwrap();
            for _ in 0..6 {
                wallet.move_funds("x", "y", 1, "").unwrap();
            }
        }
        let mut wallet = WalletDb::open(&env, OpenMode::ReadWrite).unwrap();
        wallet.move_funds("y", "x", 3, "back").unwrap();
        let entries = wallet.list_account_credit_debit("y").unwrap();
        assert_eq!(entries.last().unwrap().entry_no, 12);
        assert_eq!(wallet.account_credit_debit("y").unwrap(), 3);
    }

    #[test]
    fn test_move_rejects_non_positive_amount() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(dir.path());
        let mut wallet = WalletDb::open(&env, OpenMode::Create).unwrap();
        assert!(matches!(wallet.move_funds("a", "b", 0, ""), Err(LedgerError::OutOfRange(_))));
        assert!(wallet.list_account_credit_debit(ALL_ACCOUNTS).unwrap().is_empty());
    }
}
