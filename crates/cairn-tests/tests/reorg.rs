//! Reorganization tests: walker paths applied through the builder.

use cairn_core::types::{ChainedHeader, Transaction};
use cairn_core::walker::BlockchainWalker;
use cairn_tests::helpers::*;

/// Genesis, A1 (splits the genesis output), then A2..A3 on one branch and
/// B2..B4 on another, both forking after A1. Only genesis..A3 is added.
struct Forked {
    chain: TestChain,
    a1: ChainedHeader,
    a3: ChainedHeader,
    b_blocks: Vec<ChainedHeader>,
}

fn forked() -> Forked {
    let chain = TestChain::new(test_config());
    let g_cb = make_coinbase(50, owner(1), 0);
    chain.add(vec![g_cb.clone()]);

    let split = make_tx(&[(outpoint(&g_cb, 0), &keypair(1))], &[(30, owner(3)), (20, owner(4))]);
    let a1 = chain.add(vec![make_coinbase(50, owner(2), 1), split.clone()]);

    let a2_pay = make_tx(&[(outpoint(&split, 0), &keypair(3))], &[(30, owner(5))]);
    chain.add(vec![make_coinbase(50, owner(2), 2), a2_pay]);
    let a3 = chain.add(vec![make_coinbase(50, owner(2), 3)]);

    let b2_pay = make_tx(&[(outpoint(&split, 1), &keypair(4))], &[(20, owner(7))]);
    let b2 = chain.store_block(Some(&a1), &[make_coinbase(50, owner(6), 2), b2_pay]);
    let b3 = chain.store_block(Some(&b2), &[make_coinbase(50, owner(6), 3)]);
    let b4 = chain.store_block(Some(&b3), &[make_coinbase(50, owner(6), 4)]);

    Forked { chain, a1, a3, b_blocks: vec![b2, b3, b4] }
}

fn hashes(headers: &[ChainedHeader]) -> Vec<cairn_core::types::Hash256> {
    headers.iter().map(|h| h.hash).collect()
}

// ======================================================================
// Walker path over a fork
// ======================================================================

#[test]
fn walker_finds_fork_point() {
    let f = forked();
    let b4 = f.b_blocks[2].clone();
    let path = BlockchainWalker::get_path(&f.a3, &b4, f.chain.header_lookup()).unwrap();

    assert_eq!(path.last_common_block, f.a1);
    assert_eq!(path.rewind_blocks.len(), 2);
    assert_eq!(path.rewind_blocks[0], f.a3);
    assert_eq!(path.rewind_blocks[1].height, 2);
    assert_eq!(hashes(&path.advance_blocks), hashes(&f.b_blocks));

    let back = BlockchainWalker::get_path(&b4, &f.a3, f.chain.header_lookup()).unwrap();
    assert_eq!(back.last_common_block, f.a1);
    let b_reversed: Vec<_> = f.b_blocks.iter().rev().map(|h| h.hash).collect();
    assert_eq!(hashes(&back.rewind_blocks), b_reversed);
}

// ======================================================================
// Applying the path
// ======================================================================

#[test]
fn reorg_matches_direct_build() {
    let f = forked();
    let b4 = f.b_blocks[2].clone();
    let path = BlockchainWalker::get_path(&f.a3, &b4, f.chain.header_lookup()).unwrap();

    for block in &path.rewind_blocks {
        let txs = f.chain.transactions(block);
        f.chain.builder.rollback_block(block, &txs).unwrap();
    }
    assert_eq!(f.chain.builder.chain().tip(), Some(&f.a1));
    for block in &path.advance_blocks {
        f.chain.add_stored(block);
    }
    assert_eq!(f.chain.height(), Some(4));
    assert_eq!(f.chain.builder.chain().tip().map(|t| t.hash), Some(b4.hash));

    // Same blocks applied to a fresh chain.
    let direct = TestChain::new(test_config());
    let blocks: Vec<ChainedHeader> = f.chain.builder.chain().blocks().cloned().collect();
    for block in &blocks {
        let txs: Vec<Transaction> = f.chain.transactions(block);
        direct.store.add_block(block, &txs).unwrap();
        direct.add_stored(block);
    }
    assert_eq!(f.chain.utxo_view(), direct.utxo_view());
}

/// Walk from `from` to `to`, rolling back then adding stored blocks.
fn reorganize(chain: &TestChain, from: &ChainedHeader, to: &ChainedHeader) {
    let path = BlockchainWalker::get_path(from, to, chain.header_lookup()).unwrap();
    for block in &path.rewind_blocks {
        let txs = chain.transactions(block);
        chain.builder.rollback_block(block, &txs).unwrap();
    }
    for block in &path.advance_blocks {
        chain.add_stored(block);
    }
}

#[test]
fn reorg_away_and_back_restores_utxo_set() {
    let f = forked();
    let before = f.chain.utxo_view();
    let b4 = f.b_blocks[2].clone();

    reorganize(&f.chain, &f.a3, &b4);
    assert_ne!(f.chain.utxo_view(), before);
    reorganize(&f.chain, &b4, &f.a3);

    assert_eq!(f.chain.builder.chain().tip(), Some(&f.a3));
    assert_eq!(f.chain.utxo_view(), before);
    // The abandoned branch stays replayable.
    let state = f.chain.builder.to_chain_state().unwrap();
    for block in &f.b_blocks {
        assert!(state.block_unminted_txs(&block.hash).is_some());
    }
}

#[test]
fn reminted_transaction_rewinds_through_both_spends() {
    let chain = TestChain::new(test_config());
    chain.add(vec![make_coinbase(50, owner(1), 0)]);
    let x = make_coinbase(50, owner(2), 77);
    let mut views = vec![chain.utxo_view()];

    chain.add(vec![x.clone()]);
    views.push(chain.utxo_view());
    let first = make_tx(&[(outpoint(&x, 0), &keypair(2))], &[(50, owner(3))]);
    chain.add(vec![make_coinbase(50, owner(5), 2), first]);
    views.push(chain.utxo_view());
    chain.add(vec![x.clone()]);
    views.push(chain.utxo_view());
    let second = make_tx(&[(outpoint(&x, 0), &keypair(2))], &[(49, owner(6))]);
    chain.add(vec![make_coinbase(50, owner(5), 4), second]);

    let (_, spent) = chain.utxo_view();
    let heights: Vec<u64> = spent.keys().map(|k| k.confirming_block_index).collect();
    assert_eq!(heights, vec![1, 3]);

    while let Some(view) = views.pop() {
        chain.rollback_tip();
        assert_eq!(chain.utxo_view(), view);
    }
    assert_eq!(chain.height(), Some(0));
}

#[test]
fn rollback_everything_empties_utxo_set() {
    let f = forked();
    while f.chain.height().is_some() {
        f.chain.rollback_tip();
    }
    let (unspent, spent) = f.chain.utxo_view();
    assert!(unspent.is_empty());
    assert!(spent.is_empty());
}

#[test]
fn inverse_law_holds_per_block() {
    let f = forked();
    // Peel blocks one at a time, re-adding each to check add(rollback(s)) == s.
    for _ in 0..3 {
        let before = f.chain.utxo_view();
        let tip = f.chain.rollback_tip();
        f.chain.add_stored(&tip);
        assert_eq!(f.chain.utxo_view(), before);
        f.chain.rollback_tip();
    }
    assert_eq!(f.chain.height(), Some(0));
}

// ======================================================================
// Duplicate coinbases
// ======================================================================

#[test]
fn duplicate_coinbase_heights_survive_reorg() {
    let repeated = make_coinbase(50, owner(9), 0);
    let mut config = test_config();
    config.duplicate_coinbases = vec![(2, repeated.txid().unwrap())];
    let chain = TestChain::new(config);

    chain.add(vec![repeated.clone()]);
    chain.add(vec![make_coinbase(50, owner(2), 1)]);
    let before = chain.utxo_view();
    let dup_block = chain.add(vec![repeated.clone()]);
    assert_eq!(chain.utxo_view(), before);

    // The original record is still confirmed at height 0.
    let (unspent, _) = chain.utxo_view();
    assert_eq!(unspent[&repeated.txid().unwrap()].confirming_block_index, 0);

    assert_eq!(chain.rollback_tip(), dup_block);
    assert_eq!(chain.utxo_view(), before);
    chain.add_stored(&dup_block);
    assert_eq!(chain.utxo_view(), before);
}
