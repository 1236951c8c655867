//! Throughput benchmarks for the block tree.
//!
//! Tracks the cost of adding leaves and finishing blocks for each supported
//! algorithm, without artifact I/O.

use std::{hint::black_box, io, time::SystemTime};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use logsig_core::{HashAlgorithm, Imprint};
use logsig_tree::{BlockTree, LeafKind, SystemEntropy, TreeOptions};

/// Benchmarks filling a full block of 2^(level-1) records.
fn bench_full_block(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_block");
    let record = vec![b'x'; 200];

    for algorithm in [HashAlgorithm::Sha256, HashAlgorithm::Sha512] {
        for level in [4u8, 8, 12] {
            let records = 1u64 << (level - 1);
            group.throughput(Throughput::Elements(records));

            group.bench_with_input(
                BenchmarkId::new(algorithm.name(), level),
                &level,
                |b, &level| {
                    let options = TreeOptions { algorithm, ..TreeOptions::default() };
                    let mut tree = BlockTree::new(options, Imprint::zero(algorithm));

                    b.iter(|| {
                        tree.start_block(&SystemEntropy, SystemTime::now(), level).unwrap();
                        while !tree.is_full() {
                            tree.add_leaf(&mut io::sink(), &record, LeafKind::Record).unwrap();
                        }
                        black_box(tree.finish_block(&mut io::sink()).unwrap())
                    });
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_full_block);
criterion_main!(benches);
