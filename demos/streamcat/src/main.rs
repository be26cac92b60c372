//! Read files through a streamcache and print their digests.
//!
//! Each file is read front to back in fixed-size chunks. Upcoming chunks can be preloaded while
//! the current one is hashed, and every line is served from a single arena shared by all files.
//!
//! # Usage
//!
//! ```sh
//! cargo run --release --bin streamcat -- --slots 512 --chunk 1048576 --preload 4 a.bin b.bin
//! ```
//!
//! The slot count can also be provided with the `STREAMCACHE_SLOTS` environment variable. Pass
//! `--evict` to drop every unpinned line between files and `--metrics` to print the cache's metrics
//! once all files have been read. Logging is controlled with `RUST_LOG` (default `info`).

use bytes::Buf;
use clap::{value_parser, Arg, ArgAction, Command};
use commonware_runtime::{tokio, Metrics, Runner, Spawner};
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use streamcache::{completion::join, fs::Storage, Cache, Config, Error, Priority};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Hash the file at `path`, reading `chunk` bytes at a time and preloading the `preload` chunks
/// that follow the one being read.
async fn digest<S: Spawner + Metrics>(
    cache: &Cache<S>,
    storage: &Storage,
    path: &str,
    chunk: u64,
    preload: u64,
) -> Result<String, Error> {
    let session = cache.open(storage, path).await?;
    let size = session.wait_size().await?;

    let mut hasher = Sha256::new();
    let mut offset = 0;
    while offset < size {
        if preload > 0 {
            let entries: Vec<(u64, usize)> = (1..=preload)
                .map(|i| offset + i * chunk)
                .filter(|&start| start < size)
                .map(|start| (start, chunk.min(size - start) as usize))
                .collect();
            session.preload(&entries, Priority::Low)?;
        }

        let len = chunk.min(size - offset) as usize;
        let (view, dependencies) = session.read(offset, len, Priority::High)?;
        join(dependencies).await?;
        let mut reader = view.reader();
        while reader.has_remaining() {
            let bytes = reader.chunk();
            hasher.update(bytes);
            let n = bytes.len();
            reader.advance(n);
        }
        offset += len as u64;
    }

    session.close().await?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn main() {
    // Parse arguments
    let matches = Command::new("streamcat")
        .about("read files through a streamcache and print their digests")
        .arg(
            Arg::new("files")
                .required(true)
                .num_args(1..)
                .help("Files to read"),
        )
        .arg(
            Arg::new("slots")
                .long("slots")
                .env("STREAMCACHE_SLOTS")
                .default_value("256")
                .value_parser(value_parser!(usize))
                .help("Number of 64 KiB slots in the cache"),
        )
        .arg(
            Arg::new("chunk")
                .long("chunk")
                .default_value("1048576")
                .value_parser(value_parser!(u64).range(1..))
                .help("Bytes read per request"),
        )
        .arg(
            Arg::new("preload")
                .long("preload")
                .default_value("0")
                .value_parser(value_parser!(u64))
                .help("Chunks to preload ahead of the one being read"),
        )
        .arg(
            Arg::new("evict")
                .long("evict")
                .action(ArgAction::SetTrue)
                .help("Evict every unpinned line after each file"),
        )
        .arg(
            Arg::new("metrics")
                .long("metrics")
                .action(ArgAction::SetTrue)
                .help("Print cache metrics once all files have been read"),
        )
        .get_matches();

    // Create logger
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let files: Vec<String> = matches
        .get_many::<String>("files")
        .expect("Please provide files")
        .cloned()
        .collect();
    let slots = *matches.get_one::<usize>("slots").expect("Please provide slots");
    let slots = NonZeroUsize::new(slots).expect("Slots must be non-zero");
    let chunk = *matches.get_one::<u64>("chunk").expect("Please provide chunk");
    let preload = *matches
        .get_one::<u64>("preload")
        .expect("Please provide preload");
    let evict = matches.get_flag("evict");
    let metrics = matches.get_flag("metrics");

    // Read every file through one cache
    let executor = tokio::Runner::default();
    let failed = executor.start(|context| async move {
        let cfg = Config {
            slots,
            ..Default::default()
        };
        let cache = Cache::new(context.with_label("cache"), cfg);
        let storage = Storage::default();

        let mut failed = false;
        for path in &files {
            match digest(&cache, &storage, path, chunk, preload).await {
                Ok(digest) => println!("{digest}  {path}"),
                Err(err) => {
                    error!(path = %path, ?err, "failed to read file");
                    failed = true;
                }
            }
            if evict {
                let evicted = cache.evict_all();
                info!(evicted, free = cache.free_slots(), "evicted cached lines");
            }
        }

        if metrics {
            print!("{}", context.encode());
        }
        failed
    });
    if failed {
        std::process::exit(1);
    }
}
