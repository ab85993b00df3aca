//! AtlasNode Simulator Binary
//!
//! Runs one storage engine against an in-process log system and peer:
//! assigns a range, migrates another from the peer, writes a stream of
//! versions, flushes and reads everything back.

use std::sync::Arc;
use std::time::Duration;

use atlasnode::peer::MemoryPeer;
use atlasnode::storage::{DurableStore, MemoryStore};
use atlasnode::tlog::MemoryLog;
use atlasnode::{AtomicOp, Config, Engine, KeyRange, Mutation, Result};
use bytes::Bytes;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

/// AtlasNode Simulator
#[derive(Parser, Debug)]
#[command(name = "atlasnode-sim")]
#[command(about = "Drive a storage engine through assignment, migration, writes and reads")]
#[command(version)]
struct Args {
    /// Data directory (used with --file-store)
    #[arg(short, long, default_value = "./atlasnode_data")]
    data_dir: String,

    /// Node identity persisted in the durable store
    #[arg(short, long, default_value = "1")]
    node_id: u64,

    /// Versions of writes to push through the log
    #[arg(short, long, default_value = "200")]
    versions: u64,

    /// Distinct user keys written
    #[arg(short, long, default_value = "50")]
    keys: u64,

    /// Keep durable state on disk instead of in memory
    #[arg(long)]
    file_store: bool,
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,atlasnode=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("AtlasNode Simulator v{}", atlasnode::VERSION);
    tracing::info!("Node id: {}", args.node_id);

    if let Err(e) = run(&args) {
        tracing::error!("Simulation failed: {}", e);
        std::process::exit(1);
    }
    tracing::info!("Simulation finished");
}

fn run(args: &Args) -> Result<()> {
    let config = Config::builder()
        .data_dir(&args.data_dir)
        .node_id(args.node_id)
        .retention_versions(50)
        .durability_interval_ms(5)
        .log_poll_interval_ms(5)
        .fetch_block_bytes(64)
        .build();

    let log = MemoryLog::new();
    let peer = Arc::new(MemoryPeer::new());
    for i in 0..args.keys {
        peer.set(peer_key(i), Bytes::from(format!("peer-{}", i)), 1);
    }

    let engine = if args.file_store {
        tracing::info!("Data directory: {}", args.data_dir);
        Engine::open_file(config, Box::new(log.cursor()), peer.clone())?
    } else {
        let durable: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        Engine::open(config, durable, Box::new(log.cursor()), peer.clone())?
    };

    let start = log.last_version().max(engine.version()) + 1;
    let local = KeyRange::new(&b"a"[..], &b"m"[..]);
    let migrated = KeyRange::new(&b"m"[..], &b"\xff"[..]);
    log.push(
        start,
        vec![
            Mutation::assign_range(&local, true),
            Mutation::assign_range(&migrated, false),
        ],
    )?;

    let counter = Bytes::from_static(b"counter");
    for step in 1..=args.versions {
        let version = start + step;
        let key = Bytes::from(format!("key/{:04}", step % args.keys.max(1)));
        let mut batch = vec![
            Mutation::set(key, Bytes::from(format!("v{}", version))),
            Mutation::atomic(AtomicOp::Add, counter.clone(), Bytes::copy_from_slice(&1u64.to_le_bytes())),
        ];
        if step % 25 == 0 {
            batch.push(Mutation::clear_range(&b"key/0000"[..], &b"key/0005"[..]));
        }
        log.push(version, batch)?;
    }
    let last = start + args.versions;

    if !engine.wait_for_version(last, Duration::from_secs(30)) {
        tracing::warn!("Engine did not reach version {}", last);
    }
    if !engine.wait_readable(&migrated, Duration::from_secs(30)) {
        tracing::warn!("Migrated range {:?} is not readable yet", migrated);
    }
    let durable = engine.flush(Duration::from_secs(30))?;
    tracing::info!(
        "Applied version {}, durable version {}, oldest version {}",
        engine.version(),
        durable,
        engine.oldest_version()
    );

    let version = engine.version();
    let counter_value = engine.get(&counter, version)?;
    let count = counter_value
        .as_ref()
        .and_then(|v| <[u8; 8]>::try_from(v.as_ref()).ok())
        .map(u64::from_le_bytes);
    tracing::info!("counter = {:?}", count);

    let local_rows = engine.get_range(&local, version, 1000, usize::MAX)?;
    tracing::info!("{} rows in {:?} (more: {})", local_rows.rows.len(), local, local_rows.more);
    let migrated_rows = engine.get_range(&migrated, version, 1000, usize::MAX)?;
    tracing::info!(
        "{} rows in {:?} (more: {})",
        migrated_rows.rows.len(),
        migrated,
        migrated_rows.more
    );

    let stats = engine.store_stats();
    let (log_versions, log_bytes) = engine.mutation_log_size();
    tracing::info!(
        "Memory index: {} roots, {} entries; mutation log: {} versions, {} bytes; peer requests: {}",
        stats.roots,
        stats.entries,
        log_versions,
        log_bytes,
        peer.request_count()
    );

    engine.check_invariants()?;
    engine.shutdown();
    Ok(())
}

fn peer_key(i: u64) -> Bytes {
    Bytes::from(format!("peer/{:04}", i))
}
