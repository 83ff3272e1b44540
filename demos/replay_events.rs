//! Replays transaction events through the detector and prints every finding.
//!
//! Usage: `cargo run --example replay_events -- events.jsonl [config.toml]`
//!
//! Each line of the events file is one JSON `TransactionEvent`. Without a file a small
//! built-in ring of transfers is replayed. The optional config file needs a `[detector]`
//! table, otherwise `SYBIL_*` environment variables are used.
use alloy_primitives::{Address, U256};
use eyre::Result;
use std::path::Path;
use std::sync::Arc;
use sybil_graph::engine::SkipTrivialTransfers;
use sybil_graph::utils::ConfigSectionLoader;
use sybil_graph::{DetectorConfig, InMemoryStore, PersistenceStore, SybilDetectorBuilder, TransactionEvent};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match args.get(1) {
        Some(path) => DetectorConfig::load_section_from_file(Path::new(path)).await?,
        None => DetectorConfig::from_env()?,
    };
    let events = match args.first() {
        Some(path) => read_events(Path::new(path)).await?,
        None => sample_events(config.batch_threshold),
    };
    info!("Replaying {} events, batch threshold {}", events.len(), config.batch_threshold);

    let store = Arc::new(InMemoryStore::new());
    let mut detector = SybilDetectorBuilder::new(store.clone())
        .with_config(config)
        .with_gate(Arc::new(SkipTrivialTransfers))
        .build()
        .await?;

    for event in events {
        for finding in detector.handle_event(event).await? {
            info!(
                "Cluster {} [{}] {} members: {}",
                finding.cluster_id,
                finding.severity,
                finding.members.len(),
                finding.evidence
            );
        }
    }

    let stats = detector.get_statistics();
    info!(
        "Done: {} batches, {} pending events, {} nodes, {} edges, {} communities, {} active clusters",
        stats.batches_processed,
        stats.pending_events,
        stats.global_nodes,
        stats.global_edges,
        stats.communities,
        stats.active_clusters
    );
    for row in store.clusters().await? {
        info!("Stored cluster {} score={:.3} {} merged_into={:?}", row.id, row.score, row.classification, row.merged_into);
    }
    Ok(())
}

async fn read_events(path: &Path) -> Result<Vec<TransactionEvent>> {
    let contents = tokio::fs::read_to_string(path).await?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(n, line)| serde_json::from_str(line).map_err(|e| eyre::eyre!("line {}: {}", n + 1, e)))
        .collect()
}

/// Three funded rings plus unrelated payments, enough for a few batches.
fn sample_events(batch_threshold: u64) -> Vec<TransactionEvent> {
    let mut rng = fastrand::Rng::with_seed(1);
    let mut events = Vec::new();
    let mut timestamp = 1_700_000_000u64;
    let total = (batch_threshold as usize * 3).max(30);

    while events.len() < total {
        timestamp += 12;
        let ring = rng.u8(1..4);
        let member = rng.u8(0..5);
        let (from, to) = if rng.u8(0..4) == 0 {
            (Address::repeat_byte(0x80 + rng.u8(0..60)), Address::repeat_byte(0xc0 + rng.u8(0..60)))
        } else {
            (Address::repeat_byte(ring * 0x10 + member), Address::repeat_byte(ring * 0x10 + (member + 1) % 5))
        };
        events.push(TransactionEvent::new(from, to, U256::from(rng.u64(100..110)), timestamp / 12, timestamp));
    }
    events
}
