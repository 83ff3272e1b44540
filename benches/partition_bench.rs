use alloy_primitives::{Address, U256};
use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use sybil_graph::graph::{BatchSubgraph, EdgeStats};
use sybil_graph::{CommunityGraph, CommunityMerger, DetectorConfig, InMemoryStore, LabelPropagation, SybilDetectorBuilder, TransactionEvent};

fn address(ring: usize, member: usize) -> Address {
    let mut bytes = [0u8; 20];
    bytes[..8].copy_from_slice(&(ring as u64).to_be_bytes());
    bytes[8..16].copy_from_slice(&(member as u64).to_be_bytes());
    Address::from(bytes)
}

/// `rings` dense rings of `size` addresses, linked by a few random bridges.
fn ring_subgraph(rings: usize, size: usize) -> BatchSubgraph {
    let mut rng = fastrand::Rng::with_seed(7);
    let mut subgraph = BatchSubgraph::new();
    for ring in 0..rings {
        for member in 0..size {
            let next = (member + 1) % size;
            let amount = U256::from(rng.u64(1..1_000));
            subgraph.insert_edge(address(ring, member), address(ring, next), EdgeStats::new(amount, member as u64));
        }
    }
    for _ in 0..rings / 4 {
        let from = address(rng.usize(..rings), rng.usize(..size));
        let to = address(rng.usize(..rings), rng.usize(..size));
        subgraph.insert_edge(from, to, EdgeStats::new(U256::from(1), 0));
    }
    subgraph
}

fn benchmark_partition(c: &mut Criterion) {
    let subgraph = ring_subgraph(200, 8);
    let partitioner = LabelPropagation::new();

    c.bench_function("label_propagation_1600_nodes", |b| {
        b.iter(|| partitioner.partition(black_box(&subgraph)).unwrap());
    });
}

fn benchmark_merge(c: &mut Criterion) {
    let subgraph = ring_subgraph(200, 8);
    let communities = LabelPropagation::new().partition(&subgraph).unwrap().communities();
    let merger = CommunityMerger::default();
    let mut base = CommunityGraph::new();
    merger.merge(&mut base, &communities, &subgraph, 1);

    c.bench_function("community_merge_200_rings", |b| {
        b.iter(|| {
            let mut graph = base.clone();
            merger.merge(&mut graph, black_box(&communities), black_box(&subgraph), 2)
        });
    });
}

fn benchmark_batch(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let events: Vec<TransactionEvent> = ring_subgraph(50, 6)
        .edges()
        .map(|(from, to, stats)| TransactionEvent::new(from, to, stats.weight, stats.first_seen, stats.first_seen))
        .collect();

    c.bench_function("full_batch_six_member_rings", |b| {
        b.to_async(&runtime).iter(|| async {
            let dir = tempfile::TempDir::new().unwrap();
            let config = DetectorConfig {
                batch_threshold: events.len() as u64,
                artifacts_dir: dir.path().to_path_buf(),
                ..DetectorConfig::default()
            };
            let mut detector =
                SybilDetectorBuilder::new(Arc::new(InMemoryStore::new())).with_config(config).build().await.unwrap();
            let mut findings = Vec::new();
            for event in events.iter().cloned() {
                findings = detector.handle_event(event).await.unwrap();
            }
            black_box(findings)
        });
    });
}

criterion_group!(benches, benchmark_partition, benchmark_merge, benchmark_batch);
criterion_main!(benches);
