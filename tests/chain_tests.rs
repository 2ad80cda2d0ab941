//! Block acceptance, best-chain selection and invalid-block handling

mod common;

use common::*;
use ledger_core::block_index::BlockIndex;
use ledger_core::pow::U256;
use ledger_core::*;

#[test]
fn test_duplicate_block_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut chain = open_chain(dir.path());
    let b1 = child(&genesis(), 1, vec![], 0);

    assert_eq!(chain.process_block(b1.clone()).unwrap(), SubmitBlockOutcome::Accepted);
    assert_eq!(chain.height(), 1);
    assert_eq!(chain.best_hash(), block_hash(&b1));

    assert_eq!(chain.process_block(b1.clone()).unwrap(), SubmitBlockOutcome::DuplicateKnown);
    assert_eq!(chain.height(), 1);
    assert_eq!(chain.best_hash(), block_hash(&b1));
}

#[test]
fn test_equal_work_keeps_first_seen_until_outworked() {
    let dir = tempfile::tempdir().unwrap();
    let mut chain = open_chain(dir.path());
    let b1 = child(&genesis(), 1, vec![], 0);
    let b1_rival = child(&genesis(), 1, vec![], 1);
    assert_ne!(block_hash(&b1), block_hash(&b1_rival));

    submit_all(&mut chain, &[b1.clone(), b1_rival.clone()]);
    assert_eq!(chain.best_hash(), block_hash(&b1));
    let (_, confirmed_in) = chain.transaction(&txid(&b1.transactions[0])).unwrap();
    assert_eq!(confirmed_in, Some(block_hash(&b1)));

    // A child gives the rival strictly more work.
    let b2 = child(&b1_rival, 2, vec![], 1);
    submit_all(&mut chain, &[b2.clone()]);
    assert_eq!(chain.height(), 2);
    assert_eq!(chain.best_hash(), block_hash(&b2));
    assert_eq!(chain.hash_at_height(1).unwrap(), block_hash(&b1_rival));

    // B1's coinbase left the index; the rival's is confirmed.
    assert!(matches!(
        chain.transaction(&txid(&b1.transactions[0])),
        Err(LedgerError::NotFound(_))
    ));
    let (_, confirmed_in) = chain.transaction(&txid(&b1_rival.transactions[0])).unwrap();
    assert_eq!(confirmed_in, Some(block_hash(&b1_rival)));

    // The losing block stays retrievable by hash.
    assert_eq!(chain.block_by_hash(&block_hash(&b1)).unwrap(), b1);
}

#[test]
fn test_orphan_connected_when_parent_arrives() {
    let dir = tempfile::tempdir().unwrap();
    let mut chain = open_chain(dir.path());
    let blocks = branch(&genesis(), 0, 3, 0);

    assert_eq!(
        chain.process_block(blocks[2].clone()).unwrap(),
        SubmitBlockOutcome::AcceptedOrphan {
            missing_parent: block_hash(&blocks[1])
        }
    );
    assert_eq!(
        chain.process_block(blocks[1].clone()).unwrap(),
        SubmitBlockOutcome::AcceptedOrphan {
            missing_parent: block_hash(&blocks[0])
        }
    );
    assert_eq!(chain.process_block(blocks[2].clone()).unwrap(), SubmitBlockOutcome::DuplicateKnown);
    assert_eq!(chain.orphan_count(), 2);
    assert_eq!(chain.height(), 0);

    submit_all(&mut chain, &blocks[..1]);
    assert_eq!(chain.orphan_count(), 0);
    assert_eq!(chain.height(), 3);
    assert_eq!(chain.best_hash(), block_hash(&blocks[2]));
}

#[test]
fn test_overpaying_coinbase_is_invalid_and_sticky() {
    let dir = tempfile::tempdir().unwrap();
    let mut chain = open_chain(dir.path());
    let mut greedy = child(&genesis(), 1, vec![], 0);
    greedy.transactions[0].outputs[0].value += 1;
    remine(&mut greedy);

    assert_rejected(chain.process_block(greedy.clone()).unwrap(), "bad-cb-amount");
    assert_eq!(chain.height(), 0);
    assert_rejected(chain.process_block(greedy.clone()).unwrap(), "duplicate-invalid");

    // Descendants are rejected without validation.
    let descendant = child(&greedy, 2, vec![], 0);
    assert_rejected(chain.process_block(descendant).unwrap(), "bad-prevblk");
    assert_eq!(chain.height(), 0);
    assert!(chain.best_invalid_work() > U256::zero());
}

#[test]
fn test_mutated_block_is_not_remembered_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let mut chain = open_chain(dir.path());
    let b1 = child(&genesis(), 1, vec![], 0);

    // Same header, different body: the hash is unchanged but the Merkle
    // root no longer matches.
    let mut mutated = b1.clone();
    mutated.transactions[0].outputs[0].value -= 1;
    assert_rejected(chain.process_block(mutated).unwrap(), "bad-txnmrklroot");

    assert_eq!(chain.process_block(b1.clone()).unwrap(), SubmitBlockOutcome::Accepted);
    assert_eq!(chain.best_hash(), block_hash(&b1));
}

#[test]
fn test_insufficient_work_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut chain = open_chain(dir.path());
    let mut hard = child(&genesis(), 1, vec![], 0);
    hard.header.bits = 0x1d00ffff;
    hard.header.nonce = 0;
    assert_rejected(chain.process_block(hard.clone()).unwrap(), "high-hash");
    assert!(!chain.index().contains(&block_hash(&hard)));
}

#[test]
fn test_wrong_difficulty_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut chain = open_chain(dir.path());
    let mut block = child(&genesis(), 1, vec![], 0);
    block.header.bits = 0x207ffffe;
    block.header.nonce = 0;
    mine(&mut block.header);
    assert_rejected(chain.process_block(block).unwrap(), "bad-diffbits");
}

#[test]
fn test_timestamp_must_pass_median() {
    let dir = tempfile::tempdir().unwrap();
    let mut chain = open_chain(dir.path());
    let blocks = branch(&genesis(), 0, 3, 0);
    submit_all(&mut chain, &blocks);

    let mut stale = child(&blocks[2], 4, vec![], 0);
    // Median of the last blocks is blocks[1]'s timestamp.
    stale.header.timestamp = blocks[1].header.timestamp;
    stale.header.nonce = 0;
    mine(&mut stale.header);
    assert_rejected(chain.process_block(stale.clone()).unwrap(), "time-too-old");
    assert_rejected(chain.process_block(stale).unwrap(), "duplicate-invalid");
    assert_eq!(chain.height(), 3);
}

#[test]
fn test_double_spend_within_block_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut chain = open_chain(dir.path());
    let blocks = branch(&genesis(), 0, 3, 0);
    submit_all(&mut chain, &blocks);

    let coin = &blocks[0].transactions[0];
    let first = spend(coin, 0, 10 * COIN);
    let second = spend(coin, 0, 20 * COIN);
    let block = child(&blocks[2], 4, vec![first, second], 0);
    assert_rejected(chain.process_block(block).unwrap(), "bad-txns-inputs-missingorspent");
    assert_eq!(chain.height(), 3);
}

#[test]
fn test_immature_coinbase_spend_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut chain = open_chain(dir.path());
    let b1 = child(&genesis(), 1, vec![], 0);
    submit_all(&mut chain, &[b1.clone()]);

    let early = child(&b1, 2, vec![spend(&b1.transactions[0], 0, COIN)], 0);
    assert_rejected(chain.process_block(early).unwrap(), "bad-txns-premature-spend-of-coinbase");
}

#[test]
fn test_spend_confirms_and_pays_fee_to_coinbase() {
    let dir = tempfile::tempdir().unwrap();
    let mut chain = open_chain(dir.path());
    let blocks = branch(&genesis(), 0, 2, 0);
    submit_all(&mut chain, &blocks);

    let payment = spend(&blocks[0].transactions[0], 0, 49 * COIN);
    let mut block = child(&blocks[1], 3, vec![payment.clone()], 0);
    block.transactions[0].outputs[0].value += COIN;
    remine(&mut block);
    submit_all(&mut chain, &[block.clone()]);

    let (tx, confirmed_in) = chain.transaction(&txid(&payment)).unwrap();
    assert_eq!(tx, payment);
    assert_eq!(confirmed_in, Some(block_hash(&block)));
}

#[test]
fn test_header_first_then_body() {
    let dir = tempfile::tempdir().unwrap();
    let mut chain = open_chain(dir.path());
    let b1 = child(&genesis(), 1, vec![], 0);

    assert_eq!(chain.process_header(b1.header.clone()).unwrap(), SubmitBlockOutcome::Accepted);
    assert_eq!(chain.process_header(b1.header.clone()).unwrap(), SubmitBlockOutcome::DuplicateKnown);
    assert_eq!(
        chain.index().get_by_hash(&block_hash(&b1)).unwrap().status,
        BlockStatus::ValidHeader
    );
    assert_eq!(chain.height(), 0);

    assert_eq!(chain.process_block(b1.clone()).unwrap(), SubmitBlockOutcome::Accepted);
    assert_eq!(chain.best_hash(), block_hash(&b1));
}

#[test]
fn test_chain_work_grows_along_every_branch() {
    let dir = tempfile::tempdir().unwrap();
    let mut chain = open_chain(dir.path());
    let main = branch(&genesis(), 0, 4, 0);
    let side = branch(&main[0], 1, 2, 1);
    submit_all(&mut chain, &main);
    submit_all(&mut chain, &side);

    let index: &BlockIndex = chain.index();
    for block in main.iter().chain(side.iter()) {
        let entry = index.get_by_hash(&block_hash(block)).unwrap();
        let parent = index.get(entry.parent.unwrap());
        assert_eq!(entry.status, BlockStatus::ValidFull);
        assert!(entry.chain_work > parent.chain_work);
        assert_eq!(entry.height, parent.height + 1);
    }
}
