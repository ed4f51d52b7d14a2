//! Criterion benchmarks for fork resolution and UTXO bitsets.

use std::collections::HashMap;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use cairn_core::types::{BlockHeader, ChainedHeader, Hash256};
use cairn_core::utxo::{OutputState, OutputStates};
use cairn_core::walker::BlockchainWalker;

fn header(prev: Hash256, tag: u64) -> BlockHeader {
    BlockHeader {
        version: 1,
        prev_hash: prev,
        merkle_root: Hash256::ZERO,
        timestamp: 1_700_000_000,
        difficulty_target: u64::MAX,
        nonce: tag,
    }
}

fn branch(base: &ChainedHeader, len: usize, tag: u64) -> Vec<ChainedHeader> {
    let mut out: Vec<ChainedHeader> = Vec::with_capacity(len);
    for i in 0..len {
        let parent = out.last().unwrap_or(base);
        let next = ChainedHeader::from_parent(parent, header(parent.hash, tag << 32 | i as u64));
        out.push(next);
    }
    out
}

fn bench_get_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("walker_get_path");
    let genesis = ChainedHeader::genesis(header(Hash256::ZERO, 0));
    let trunk = branch(&genesis, 1_000, 1);
    let base = trunk.last().cloned().unwrap_or(genesis.clone());

    for depth in [10usize, 100, 1_000] {
        let left = branch(&base, depth, 2);
        let right = branch(&base, depth, 3);
        let index: HashMap<Hash256, ChainedHeader> = std::iter::once(&genesis)
            .chain(&trunk)
            .chain(&left)
            .chain(&right)
            .map(|h| (h.hash, h.clone()))
            .collect();
        let from = left.last().cloned().unwrap_or(base.clone());
        let to = right.last().cloned().unwrap_or(base.clone());

        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| {
                BlockchainWalker::get_path(black_box(&from), black_box(&to), |h| {
                    index.get(h).cloned()
                })
                .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_output_states(c: &mut Criterion) {
    c.bench_function("output_states_spend_all_1000", |b| {
        b.iter(|| {
            let mut states = OutputStates::unspent(1_000);
            for i in 0..1_000 {
                states.set(i, OutputState::Spent);
            }
            black_box(states.all_spent())
        })
    });
}

criterion_group!(benches, bench_get_path, bench_output_states);
criterion_main!(benches);
