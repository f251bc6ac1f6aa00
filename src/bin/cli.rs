//! SIFS CLI
//!
//! Administrative command-line interface over a store location. The store is
//! opened for the duration of one command and stopped cleanly afterwards.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use futures::StreamExt;
use sifs::{KeyFilter, Record, SoftIndexFileStore, StoreConfig, StoreResult};
use tracing_subscriber::{fmt, EnvFilter};

/// SIFS CLI
#[derive(Parser, Debug)]
#[command(name = "sifs-cli")]
#[command(about = "Administrative CLI for a SIFS store")]
#[command(version)]
struct Args {
    /// Root of the data files
    #[arg(short, long, default_value = "./sifs_data")]
    data_location: PathBuf,

    /// Root of the index files (defaults to the data location)
    #[arg(short, long)]
    index_location: Option<PathBuf>,

    /// Cache name
    #[arg(short, long, default_value = "default")]
    cache_name: String,

    /// Seconds to wait for the store lock
    #[arg(long, default_value = "10")]
    lock_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show file and entry statistics
    Stats,

    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key-value pair
    Put {
        /// The key to set
        key: String,

        /// The value to set
        value: String,

        /// Time to live in seconds
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Delete a key
    Delete {
        /// The key to delete
        key: String,
    },

    /// List keys
    Keys {
        /// Only keys of these segments
        #[arg(short, long, value_delimiter = ',')]
        segments: Option<Vec<u32>>,

        /// Only keys starting with this prefix
        #[arg(short, long)]
        prefix: Option<String>,
    },

    /// Compact every closed data file
    Compact,

    /// Remove expired entries and list them
    PurgeExpired,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sifs=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match StoreConfig::builder()
        .cache_name(&args.cache_name)
        .data_location(&args.data_location)
        .index_location(
            args.index_location
                .clone()
                .unwrap_or_else(|| args.data_location.clone()),
        )
        .lock_timeout(Duration::from_secs(args.lock_timeout))
        // One-shot commands never wait for the reaper
        .expiration_wake_up_interval(Duration::ZERO)
        .build()
    {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let store = SoftIndexFileStore::new(config);
    if let Err(e) = store.start().await {
        tracing::error!("Failed to open store: {}", e);
        return ExitCode::FAILURE;
    }

    let outcome = run(&store, args.command).await;
    let stopped = store.stop().await;

    match outcome.and(stopped) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Command failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(store: &SoftIndexFileStore, command: Commands) -> StoreResult<()> {
    match command {
        Commands::Stats => {
            let stats = store.stats().await?;
            println!("data files:    {}", stats.data_files);
            println!("total bytes:   {}", stats.total_bytes);
            println!("free bytes:    {}", stats.free_bytes);
            println!("live entries:  {}", stats.live_entries);
            println!("index entries: {}", stats.index_entries);
        }
        Commands::Get { key } => match store.load(key.into_bytes()).await? {
            Some(record) => {
                let value = record.value.unwrap_or_default();
                println!("{}", String::from_utf8_lossy(&value));
            }
            None => println!("(nil)"),
        },
        Commands::Put { key, value, ttl } => {
            let mut record = Record::new(key.into_bytes(), value.into_bytes());
            if let Some(ttl) = ttl {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0);
                record = record.with_expiration(now + (ttl * 1000) as i64);
            }
            store.write(record).await?;
            println!("OK");
        }
        Commands::Delete { key } => {
            let existed = store.delete(key.into_bytes()).await?;
            println!("{}", if existed { "1" } else { "0" });
        }
        Commands::Keys { segments, prefix } => {
            let filter = prefix.map(|p| -> KeyFilter {
                Arc::new(move |key: &[u8]| key.starts_with(p.as_bytes()))
            });
            let mut keys = store.publish_keys(segments, filter);
            while let Some(key) = keys.next().await {
                println!("{}", String::from_utf8_lossy(&key?));
            }
        }
        Commands::Compact => {
            store.force_compaction().await?;
            println!("OK");
        }
        Commands::PurgeExpired => {
            let mut expired = store.purge_expired();
            let mut count = 0u64;
            while let Some(record) = expired.next().await {
                println!("{}", String::from_utf8_lossy(&record?.key));
                count += 1;
            }
            println!("({} expired)", count);
        }
    }
    Ok(())
}
