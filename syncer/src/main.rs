use anyhow::{anyhow, Result};
use catalog_core::{
    sync_health, Backoff, BoundedResultPager, CatalogRecord, CatalogSynchronizer, HttpPageSource, NumericField,
    NumericFilters, PagerConfig, Remaining, RetryingSource, SearchIndex, SledStore, SyncConfig, SyncOutcome,
};
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "syncer")]
#[command(about = "Mirror a paginated remote catalog locally and query it")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download the catalog into the local store, resuming an interrupted run
    Sync {
        /// Local store directory
        #[arg(long, default_value = "./catalog")]
        store: String,
        /// Paginated endpoint; `limit` and `offset` are appended as query parameters
        #[arg(long)]
        source_url: String,
        /// Ignore any checkpoint and start from offset 0
        #[arg(long, default_value_t = false)]
        force: bool,
        /// Records requested per page
        #[arg(long, default_value_t = 50)]
        page_size: usize,
        /// Pause between page requests in milliseconds
        #[arg(long, default_value_t = 200)]
        delay_ms: u64,
        /// Request timeout seconds
        #[arg(long, default_value_t = 12)]
        timeout_secs: u64,
        /// Attempts per page before the run is aborted (1 disables retrying)
        #[arg(long, default_value_t = 1)]
        retries: u32,
        /// User-Agent string sent to the source
        #[arg(long, default_value = "catalog-syncer/0.1")]
        user_agent: String,
    },
    /// Report whether a complete snapshot is available
    Health {
        #[arg(long, default_value = "./catalog")]
        store: String,
        /// Minutes after which an idle checkpoint counts as abandoned
        #[arg(long, default_value_t = 5)]
        stale_minutes: u64,
    },
    /// Filter the local snapshot and print matching records in batches
    Query {
        #[arg(long, default_value = "./catalog")]
        store: String,
        /// Name substring (ignored when shorter than two characters)
        #[arg(long, default_value = "")]
        q: String,
        #[command(flatten)]
        bounds: Bounds,
        /// Records per printed batch
        #[arg(long, default_value_t = 10)]
        batch: usize,
        /// Never print more than this many records
        #[arg(long, default_value_t = 1000)]
        max_results: usize,
    },
}

#[derive(Args)]
struct Bounds {
    #[arg(long, default_value_t = 0.0)]
    min_members: f64,
    #[arg(long, default_value_t = 0.0)]
    max_members: f64,
    #[arg(long, default_value_t = 0.0)]
    min_activity_24h: f64,
    #[arg(long, default_value_t = 0.0)]
    max_activity_24h: f64,
    #[arg(long, default_value_t = 0.0)]
    min_volume_24h: f64,
    #[arg(long, default_value_t = 0.0)]
    max_volume_24h: f64,
    #[arg(long, default_value_t = 0.0)]
    min_gained_24h: f64,
    #[arg(long, default_value_t = 0.0)]
    max_gained_24h: f64,
    #[arg(long, default_value_t = 0.0)]
    min_lost_24h: f64,
    #[arg(long, default_value_t = 0.0)]
    max_lost_24h: f64,
    #[arg(long, default_value_t = 0.0)]
    min_share_value: f64,
    #[arg(long, default_value_t = 0.0)]
    max_share_value: f64,
}

impl Bounds {
    fn filters(&self) -> NumericFilters {
        NumericFilters::new()
            .min(NumericField::Members, self.min_members)
            .max(NumericField::Members, self.max_members)
            .min(NumericField::Activity24h, self.min_activity_24h)
            .max(NumericField::Activity24h, self.max_activity_24h)
            .min(NumericField::Volume24h, self.min_volume_24h)
            .max(NumericField::Volume24h, self.max_volume_24h)
            .min(NumericField::Gained24h, self.min_gained_24h)
            .max(NumericField::Gained24h, self.max_gained_24h)
            .min(NumericField::Lost24h, self.min_lost_24h)
            .max(NumericField::Lost24h, self.max_lost_24h)
            .min(NumericField::ShareValue, self.min_share_value)
            .max(NumericField::ShareValue, self.max_share_value)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Sync { store, source_url, force, page_size, delay_ms, timeout_secs, retries, user_agent } => {
            let source = HttpPageSource::new(&source_url, &user_agent, Duration::from_secs(timeout_secs))?;
            let source = RetryingSource::new(source, retries, Backoff::default());
            let config = SyncConfig { page_size, page_delay: Duration::from_millis(delay_ms), ..SyncConfig::default() };
            let store = Arc::new(SledStore::open(&store)?);
            let sync = CatalogSynchronizer::new(source, store, config);
            eprintln!("syncer: source={} page_size={} force={}", source_url, page_size, force);
            match sync.synchronize(force).await? {
                SyncOutcome::Completed { count } => {
                    eprintln!("done: records={count}");
                    Ok(())
                }
                SyncOutcome::Aborted { count, offset, error } => {
                    Err(anyhow!("sync aborted at offset {offset} with {count} records fetched: {error}; rerun to resume"))
                }
                SyncOutcome::Skipped => {
                    eprintln!("sync already running");
                    Ok(())
                }
            }
        }
        Commands::Health { store, stale_minutes } => {
            let store = SledStore::open(&store)?;
            let health = sync_health(&store, Duration::from_secs(stale_minutes * 60), false)?;
            println!("{}", serde_json::to_string_pretty(&health)?);
            Ok(())
        }
        Commands::Query { store, q, bounds, batch, max_results } => {
            let index = SearchIndex::new(Arc::new(SledStore::open(&store)?));
            index.load()?;
            let results = index.query(&q, &bounds.filters());
            let total = results.len();
            let mut pager = BoundedResultPager::new(PagerConfig { page_size: batch, max_working_set: max_results });
            pager.reset(results);
            print_batches(&mut pager);
            eprintln!("matched={} shown={}", total, pager.revealed());
            Ok(())
        }
    }
}

fn print_batches(pager: &mut BoundedResultPager<CatalogRecord>) {
    loop {
        let reveal = pager.reveal_next();
        for r in reveal.batch {
            println!("{}\t{}\tmembers={}\tvolume_24h={}", r.id, r.name, r.members, r.volume_24h);
        }
        match reveal.remaining {
            Remaining::More => continue,
            Remaining::CappedMore => {
                eprintln!("more results exist; narrow the query to see them");
                break;
            }
            Remaining::None => break,
        }
    }
}
