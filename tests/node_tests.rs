//! The external interface: wire submissions, queries, the main lock and
//! shutdown

mod common;

use common::*;
use ledger_core::mining::TemplateCache;
use ledger_core::serialization::serialize;
use ledger_core::*;
use std::time::{Duration, Instant};

fn open_node(dir: &std::path::Path) -> Node {
    Node::open(&config(dir)).unwrap()
}

fn submit(node: &Node, block: &Block) {
    assert_eq!(node.submit_block(&serialize(block)).unwrap(), SubmitBlockOutcome::Accepted);
}

#[test]
fn test_chain_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let blocks = branch(&genesis(), 0, 4, 0);
    {
        let node = open_node(dir.path());
        for block in &blocks {
            submit(&node, block);
        }
        node.shutdown().unwrap();
    }

    let node = open_node(dir.path());
    assert_eq!(node.height().unwrap(), 4);
    assert_eq!(node.best_chain_hash().unwrap(), block_hash(&blocks[3]));
    assert_eq!(node.block_hash_at_height(2).unwrap(), block_hash(&blocks[1]));
    assert_eq!(node.block_by_hash(&block_hash(&blocks[2])).unwrap(), blocks[2]);
    let (_, confirmed_in) = node.transaction(&txid(&blocks[0].transactions[0])).unwrap();
    assert_eq!(confirmed_in, Some(block_hash(&blocks[0])));
}

#[test]
fn test_queries_out_of_range_and_unknown() {
    let dir = tempfile::tempdir().unwrap();
    let node = open_node(dir.path());
    assert_eq!(node.block_hash_at_height(0).unwrap(), params().genesis_hash);
    assert!(matches!(node.block_hash_at_height(1), Err(LedgerError::OutOfRange(_))));
    assert!(matches!(node.block_by_hash(&[7u8; 32]), Err(LedgerError::NotFound(_))));
    assert!(matches!(node.transaction(&[7u8; 32]), Err(LedgerError::NotFound(_))));
}

#[test]
fn test_submit_header_then_block() {
    let dir = tempfile::tempdir().unwrap();
    let node = open_node(dir.path());
    let b1 = child(&genesis(), 1, vec![], 0);

    assert_eq!(
        node.submit_header(&serialize(&b1.header)).unwrap(),
        SubmitBlockOutcome::Accepted
    );
    assert_eq!(node.height().unwrap(), 0);
    submit(&node, &b1);
    assert_eq!(node.height().unwrap(), 1);
}

#[test]
fn test_transaction_submission_and_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let node = open_node(dir.path());
    let blocks = branch(&genesis(), 0, 3, 0);
    for block in &blocks {
        submit(&node, block);
    }

    let coin = &blocks[0].transactions[0];
    let payment = spend(coin, 0, 49 * COIN);
    assert_eq!(
        node.submit_transaction(&serialize(&payment)).unwrap(),
        SubmitTxOutcome::Accepted
    );
    assert_eq!(
        node.submit_transaction(&serialize(&payment)).unwrap(),
        SubmitTxOutcome::DuplicateKnown
    );
    assert_eq!(node.mempool_size().unwrap(), 1);
    assert_eq!(node.transaction(&txid(&payment)).unwrap(), (payment.clone(), None));

    match node.submit_transaction(&serialize(&spend(coin, 0, 48 * COIN))).unwrap() {
        SubmitTxOutcome::Rejected(reason) => assert_eq!(reason.code, "txn-mempool-conflict"),
        other => panic!("unexpected outcome {other:?}"),
    }

    // Chained spend of the pooled payment
    let onward = spend(&payment, 0, 48 * COIN);
    assert_eq!(
        node.submit_transaction(&serialize(&onward)).unwrap(),
        SubmitTxOutcome::Accepted
    );
    assert_eq!(node.mempool_size().unwrap(), 2);

    // The newest coinbase is not yet mature.
    match node
        .submit_transaction(&serialize(&spend(&blocks[2].transactions[0], 0, COIN)))
        .unwrap()
    {
        SubmitTxOutcome::Rejected(reason) => {
            assert_eq!(reason.code, "bad-txns-premature-spend-of-coinbase")
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn test_mined_template_confirms_pool() {
    let dir = tempfile::tempdir().unwrap();
    let node = open_node(dir.path());
    let blocks = branch(&genesis(), 0, 3, 0);
    for block in &blocks {
        submit(&node, block);
    }
    let payment = spend(&blocks[0].transactions[0], 0, 49 * COIN);
    node.submit_transaction(&serialize(&payment)).unwrap();

    let mut cache = TemplateCache::new();
    let template = node.block_template(&mut cache, &[OP_TRUE]).unwrap();
    assert_eq!(template.height, 4);
    assert_eq!(template.fees, COIN);
    assert_eq!(template.block.transactions.len(), 2);
    assert_eq!(template.block.header.prev_block_hash, block_hash(&blocks[2]));

    let mut block = template.block;
    mine(&mut block.header);
    submit(&node, &block);

    assert_eq!(node.height().unwrap(), 4);
    assert_eq!(node.mempool_size().unwrap(), 0);
    let (_, confirmed_in) = node.transaction(&txid(&payment)).unwrap();
    assert_eq!(confirmed_in, Some(block_hash(&block)));
}

#[test]
fn test_main_lock_is_reentrant_and_exclusive() {
    let dir = tempfile::tempdir().unwrap();
    let node = open_node(dir.path());

    let guard = node.lock().unwrap();
    // Same thread: nested calls pass through.
    assert_eq!(node.height().unwrap(), 0);
    submit(&node, &child(&genesis(), 1, vec![], 0));

    std::thread::scope(|s| {
        let waited = s
            .spawn(|| {
                let start = Instant::now();
                let result = node.best_chain_hash();
                (result, start.elapsed())
            })
            .join()
            .unwrap();
        assert!(matches!(waited.0, Err(LedgerError::ConcurrencyTimeout(_))));
        assert!(waited.1 >= Duration::from_millis(150));
    });

    drop(guard);
    std::thread::scope(|s| {
        let height = s.spawn(|| node.height()).join().unwrap();
        assert_eq!(height.unwrap(), 1);
    });
}

#[test]
fn test_wallet_and_addresses_through_node() {
    let dir = tempfile::tempdir().unwrap();
    let node = open_node(dir.path());

    let mut wallet = node.wallet().unwrap();
    wallet.move_funds("savings", "spending", 3 * COIN, "weekly").unwrap();
    assert_eq!(wallet.account_credit_debit("spending").unwrap(), 3 * COIN);
    assert_eq!(wallet.account_credit_debit("savings").unwrap(), -3 * COIN);
    assert_eq!(wallet.list_account_credit_debit("*").unwrap().len(), 2);
    drop(wallet);

    let peer = PeerAddress {
        services: 1,
        ip: [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 192, 168, 1, 9],
        port: 9333,
        time: 1_320_000_000,
    };
    let mut addresses = node.addresses().unwrap();
    addresses.write_address(&peer).unwrap();
    drop(addresses);
    assert_eq!(node.load_addresses().unwrap(), vec![peer]);
}

#[test]
fn test_shutdown_is_idempotent_and_final() {
    let dir = tempfile::tempdir().unwrap();
    let node = open_node(dir.path());
    node.shutdown().unwrap();
    node.shutdown().unwrap();

    assert!(matches!(node.height(), Err(LedgerError::ShuttingDown)));
    assert!(matches!(
        node.submit_block(&serialize(&child(&genesis(), 1, vec![], 0))),
        Err(LedgerError::ShuttingDown)
    ));
    assert!(matches!(node.wallet(), Err(LedgerError::ShuttingDown)));
}
