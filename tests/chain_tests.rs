// In-memory ledger tests
// Extension, fork switching, chain summaries and transaction admission.

use stakenode::block::Block;
use stakenode::chain::{summary_heights, ChainDelegate, ChainError};
use stakenode::config;
use stakenode::inventory::Item;
use stakenode::memory_chain::MemoryChain;
use stakenode::message::Message;
use stakenode::now_ms;
use stakenode::transaction::{ContractKind, Transaction};

fn chain_cfg(solidify_depth: u64) -> config::Chain {
    config::Chain { solidify_depth, ..config::Chain::default() }
}

fn extend(chain: &MemoryChain, count: usize, producer: u8) -> Vec<Block> {
    let mut out = Vec::new();
    let mut parent = chain.head_block();
    for i in 0..count {
        let block = parent.child(parent.header.timestamp_ms + 3_000 + i as u64, [producer; 32], Vec::new());
        chain.apply_block(&block, false).expect("block extends head");
        out.push(block.clone());
        parent = block;
    }
    out
}

fn transfer(nonce: u64) -> Transaction {
    Transaction::new(ContractKind::Transfer, [7; 32], vec![1, 2, 3], nonce, now_ms() + 60_000)
}

#[test]
fn test_summary_heights_are_logarithmic() {
    assert_eq!(summary_heights(0, 0), vec![0]);
    assert_eq!(summary_heights(0, 5), vec![0, 3, 5]);
    let heights = summary_heights(100, 1_100);
    assert_eq!(heights.first(), Some(&100));
    assert_eq!(heights.last(), Some(&1_100));
    assert!(heights.len() < 15, "got {} heights", heights.len());
    assert!(heights.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_extend_and_lookup() {
    let genesis = Block::genesis(0);
    let chain = MemoryChain::new(genesis.clone(), &chain_cfg(19));
    let blocks = extend(&chain, 5, 1);

    assert_eq!(chain.head_id(), blocks[4].id());
    assert_eq!(chain.genesis_id(), genesis.id());
    assert!(chain.contains_in_main(&blocks[2].id()));
    assert_eq!(chain.block_by_num(3).map(|b| b.id()), Some(blocks[2].id()));
    // head 5 with depth 19 leaves genesis solid
    assert_eq!(chain.solidified_id(), genesis.id());

    // replaying a known block is a no-op
    assert_eq!(chain.apply_block(&blocks[1], false), Ok(Vec::new()));
    assert_eq!(chain.head_id(), blocks[4].id());
}

#[test]
fn test_solidified_trails_head() {
    let chain = MemoryChain::new(Block::genesis(0), &chain_cfg(2));
    let blocks = extend(&chain, 6, 1);
    assert_eq!(chain.solidified_id(), blocks[3].id());

    // a block at or below the solidified height is refused
    let stale = blocks[2].child(99, [9; 32], Vec::new());
    assert!(matches!(chain.apply_block(&stale, false), Err(ChainError::BadBlock(_))));
}

#[test]
fn test_longer_fork_becomes_main() {
    let chain = MemoryChain::new(Block::genesis(0), &chain_cfg(19));
    let trunk = extend(&chain, 3, 1);
    let old = extend(&chain, 2, 1);

    let mut fork = Vec::new();
    let mut parent = trunk[2].clone();
    for i in 0..3 {
        let b = parent.child(50_000 + i, [2; 32], Vec::new());
        fork.push(b.clone());
        parent = b;
    }

    // the first two fork blocks are stored without moving the head
    assert_eq!(chain.apply_block(&fork[0], false), Ok(Vec::new()));
    assert_eq!(chain.apply_block(&fork[1], false), Ok(Vec::new()));
    assert_eq!(chain.head_id(), old[1].id());
    assert!(chain.contains_block(&fork[1].id()));
    assert!(!chain.contains_in_main(&fork[1].id()));

    // the third is longer and switches
    chain.apply_block(&fork[2], false).expect("fork switch");
    assert_eq!(chain.head_id(), fork[2].id());
    assert!(chain.contains_in_main(&fork[0].id()));
    assert!(!chain.contains_in_main(&old[0].id()));
    assert_eq!(chain.main_ids().len(), 7);
}

#[test]
fn test_unlinked_block_is_a_fork_error() {
    let chain = MemoryChain::new(Block::genesis(0), &chain_cfg(19));
    let detached = Block::new(4, [3; 32], 10, [1; 32], Vec::new());
    let err = chain.apply_block(&detached, false).expect_err("parent unknown");
    assert!(err.is_fork());
    assert_eq!(err.disconnect_reason(), None);
}

#[test]
fn test_tx_root_mismatch_is_bad_block() {
    let chain = MemoryChain::new(Block::genesis(0), &chain_cfg(19));
    let mut block = chain.head_block().child(10, [1; 32], vec![transfer(1)]);
    block.transactions.clear();
    let err = chain.apply_block(&block, false).expect_err("root mismatch");
    assert!(matches!(err, ChainError::BadBlock(_)));
    assert!(err.disconnect_reason().is_some());
}

#[test]
fn test_missing_block_ids_from_summary() {
    let genesis = Block::genesis(0);
    let chain = MemoryChain::new(genesis.clone(), &chain_cfg(19));
    let blocks = extend(&chain, 10, 1);

    let ids = chain.missing_block_ids(&[genesis.id(), blocks[3].id()], 2_000).expect("common block");
    assert_eq!(ids.first(), Some(&blocks[3].id()));
    assert_eq!(ids.last(), Some(&blocks[9].id()));
    assert_eq!(ids.len(), 7);

    let capped = chain.missing_block_ids(&[genesis.id()], 4).expect("common block");
    assert_eq!(capped.len(), 5);
    assert_eq!(capped[4], blocks[3].id());

    // a peer at our head gets just the head back
    let at_head = chain.missing_block_ids(&[blocks[9].id()], 2_000).expect("common block");
    assert_eq!(at_head, vec![blocks[9].id()]);

    let stranger = Block::new(3, [9; 32], 1, [9; 32], Vec::new());
    assert!(chain.missing_block_ids(&[stranger.id()], 10).is_err());
}

#[test]
fn test_chain_summary_covers_pending_ids() {
    let genesis = Block::genesis(0);
    let chain = MemoryChain::new(genesis.clone(), &chain_cfg(19));
    let blocks = extend(&chain, 5, 1);

    let summary = chain.build_chain_summary(&genesis.id(), &[]).expect("summary");
    assert_eq!(summary, vec![genesis.id(), blocks[2].id(), blocks[4].id()]);

    let summary = chain.build_chain_summary(&blocks[1].id(), &[]).expect("summary");
    assert_eq!(summary.first(), Some(&genesis.id()));
    assert_eq!(summary.last(), Some(&blocks[1].id()));

    // ids still queued for fetch extend the summary past our head
    let remote = blocks[4].child(99_000, [2; 32], Vec::new());
    let summary = chain.build_chain_summary(&blocks[4].id(), &[remote.id()]).expect("summary");
    assert_eq!(summary.last(), Some(&remote.id()));
}

#[test]
fn test_transaction_admission() {
    let chain = MemoryChain::new(Block::genesis(0), &chain_cfg(19));
    let tx = transfer(1);

    assert_eq!(chain.apply_transaction(&tx), Ok(true));
    assert_eq!(chain.apply_transaction(&tx), Ok(false));
    assert!(chain.contains_transaction(&tx.id()));
    assert_eq!(chain.pending_len(), 1);

    let expired = Transaction::new(ContractKind::Transfer, [7; 32], vec![], 2, 1);
    assert_eq!(chain.apply_transaction(&expired), Err(ChainError::ExpiredTransaction));

    let ownerless = Transaction::new(ContractKind::Vote, [0; 32], vec![], 3, now_ms() + 1_000);
    assert!(matches!(chain.apply_transaction(&ownerless), Err(ChainError::BadTransaction(_))));

    let heavy = Transaction::new(
        ContractKind::TriggerSmartContract,
        [7; 32],
        vec![0; 100 * 1024],
        4,
        now_ms() + 1_000,
    );
    let err = chain.apply_transaction(&heavy).expect_err("over the contract limit");
    assert!(matches!(err, ChainError::ResourceInsufficient(_)));
}

#[test]
fn test_produced_block_carries_pending_transactions() {
    let chain = MemoryChain::new(Block::genesis(0), &chain_cfg(19));
    let tx = transfer(1);
    chain.apply_transaction(&tx).expect("admitted");

    let block = chain.produce_block(now_ms(), [5; 32]).expect("produced");
    assert_eq!(block.transactions, vec![tx.clone()]);
    assert_eq!(chain.pending_len(), 0);
    assert!(chain.contains_transaction(&tx.id()));

    match chain.fetch(&Item::transaction(tx.id())) {
        Ok(Message::Transactions(found)) => assert_eq!(found, vec![tx]),
        other => panic!("expected the transaction, got {other:?}"),
    }
    assert!(matches!(chain.fetch(&Item::block(&block.id())), Ok(Message::Block(_))));
    assert!(matches!(
        chain.fetch(&Item::transaction([1; 32])),
        Err(ChainError::NotFound(_))
    ));
}

#[test]
fn test_block_repeating_applied_transaction_is_rejected() {
    let chain = MemoryChain::new(Block::genesis(0), &chain_cfg(19));
    let tx = transfer(1);
    chain.apply_transaction(&tx).expect("admitted");
    let first = chain.produce_block(now_ms(), [5; 32]).expect("produced");

    let replay = first.child(now_ms(), [5; 32], vec![tx]);
    let err = chain.apply_block(&replay, false).expect_err("duplicate");
    assert!(matches!(err, ChainError::BadBlock(_)));
    assert_eq!(chain.head_id(), first.id());
}
