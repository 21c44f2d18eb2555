use block_times::{BlockSelector, TimestampSearchCache};
use cache_service::{CacheManager, NetworkConfig, repair};
use chaincache_core::provider::{DEFAULT_CONNECT_TIMEOUT, build_provider};
use chaincache_core::query_rpc_pool::QueryRpcPool;
use chaincache_core::{SchemaName, Timestamp, TimestampMode};
use config::Config;
use eyre::{Result, WrapErr, bail, eyre};
use local_db::{DbBackend, DbConfig, DbError, DbStore};
use serde_json::json;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;
use tracing::metadata::LevelFilter;
use tracing::{Instrument, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(StructOpt)]
#[structopt(name = "chaincache")]
struct Options {
    #[structopt(short, long)]
    pub cfg: PathBuf,
    #[structopt(short, long)]
    pub debug_log: Option<PathBuf>,
    #[structopt(long)]
    pub debug_level: Option<String>,
    #[structopt(subcommand)]
    pub command: Command,
}

#[derive(StructOpt)]
enum Command {
    /// Drops persisted schemas that are missing tables
    Repair,
    /// Prints the block at a timestamp
    BlockOfTimestamp {
        #[structopt(long)]
        chain_id: u64,
        /// Unix seconds or an RFC 3339 date
        #[structopt(long)]
        timestamp: Timestamp,
        #[structopt(long, default_value = "after")]
        mode: TimestampMode,
        #[structopt(long)]
        nary: Option<usize>,
        #[structopt(long)]
        no_store: bool,
        #[structopt(long)]
        verbose: bool,
    },
    /// Prints number and timestamp of a block given by number or time
    BlockAndTime {
        #[structopt(long)]
        chain_id: u64,
        #[structopt(long, conflicts_with = "timestamp", required_unless = "timestamp")]
        block: Option<u64>,
        #[structopt(long)]
        timestamp: Option<Timestamp>,
    },
}

const DEFAULT_DEBUG_LEVEL: &str = "info,chaincache=debug,cache_service=debug,block_times=debug";

#[tokio::main]
async fn main() -> Result<()> {
    let opt: Options = Options::from_args();

    let (console_non_blocking, _console_guard) = tracing_appender::non_blocking(std::io::stderr());
    let debug_log = opt
        .debug_log
        .as_ref()
        .map(|path| {
            OpenOptions::new()
                .read(true)
                .append(true)
                .create(true)
                .open(path)
                .wrap_err("open debug log for writing")
        })
        .transpose()?
        .map(tracing_appender::non_blocking);
    tracing_subscriber::registry()
        .with(debug_log.as_ref().map(|(handle, _)| {
            let debug_level = opt.debug_level.as_deref().unwrap_or(DEFAULT_DEBUG_LEVEL);
            let filter = EnvFilter::builder()
                .parse(debug_level)
                .unwrap_or_else(|error| {
                    eprintln!("failed to build debug log filter: {error:?}, using default: {DEFAULT_DEBUG_LEVEL}");
                    EnvFilter::builder()
                        .parse(DEFAULT_DEBUG_LEVEL)
                        .unwrap_or_else(|_| EnvFilter::builder().from_env_lossy())
                });
            tracing_logfmt::builder()
                .with_span_name(false)
                .with_span_path(true)
                .with_level(false)
                .with_target(false)
                .with_timestamp(true)
                .layer()
                .with_writer(handle.clone())
                .with_filter(filter)
        }))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(true)
                .with_writer(console_non_blocking)
                .with_filter(
                    EnvFilter::builder()
                        .with_default_directive(LevelFilter::INFO.into())
                        .from_env_lossy(),
                ),
        )
        .init();

    let cfg = Config::load(&opt.cfg).wrap_err("load config")?;
    let backend: DbBackend = cfg.db_backend.parse().wrap_err("select db backend")?;
    let db_config = DbConfig {
        root_dir: cfg.db_dir(),
    };
    match backend.check_supported(&db_config) {
        Ok(Some(meta)) => info!(
            %backend,
            schema_version = meta.schema_version,
            app_version = meta.app_version,
            "found existing db"
        ),
        Ok(None) => info!(%backend, "creating new db"),
        Err(DbError::UnsupportedSchemaVersion { version }) => {
            warn!(%backend, version, "db was written by a newer build and will be moved aside");
        }
        Err(err) => return Err(err).wrap_err("check existing db"),
    }
    let db = Arc::new(DbStore::open(db_config).wrap_err("open local db")?);

    match opt.command {
        Command::Repair => {
            let chain_ids: Vec<u64> = cfg.networks.iter().map(|network| network.chain_id).collect();
            for schema in SchemaName::ALL {
                let report = repair(db.as_ref(), schema, &chain_ids)
                    .wrap_err_with(|| format!("repair {schema} schema"))?;
                println!(
                    "{}",
                    json!({ "schema": report.schema, "repaired": report.repaired })
                );
            }
        }
        Command::BlockOfTimestamp {
            chain_id,
            timestamp,
            mode,
            nary,
            no_store,
            verbose,
        } => {
            let manager = CacheManager::new(db.clone());
            let network = add_network(&manager, &cfg, chain_id).await?;
            let mut request = network
                .request(timestamp)
                .mode(mode)
                .use_store(!no_store)
                .verbose(verbose);
            if let Some(nary) = nary {
                request = request.nary(nary);
            }
            let mut cache = TimestampSearchCache::new();
            let resolution = network
                .resolve(request, &mut cache)
                .instrument(tracing::info_span!("block_of_timestamp", chain_id))
                .await
                .wrap_err("resolve block of timestamp")?;
            println!(
                "{}",
                json!({
                    "block_number": resolution.block_number,
                    "tier": format!("{:?}", resolution.tier).to_lowercase(),
                    "rounds": resolution.trail.len(),
                })
            );
        }
        Command::BlockAndTime {
            chain_id,
            block,
            timestamp,
        } => {
            let selector = match (block, timestamp) {
                (Some(number), None) => BlockSelector::Number(number),
                (None, Some(timestamp)) => BlockSelector::Timestamp(timestamp),
                _ => bail!("exactly one of --block and --timestamp is required"),
            };
            let manager = CacheManager::new(db.clone());
            add_network(&manager, &cfg, chain_id).await?;
            let mut cache = TimestampSearchCache::new();
            let (number, timestamp) = manager
                .block_number_and_time(chain_id, selector, &mut cache)
                .await
                .wrap_err("fetch block number and time")?;
            println!("{}", json!({ "block_number": number, "timestamp": timestamp }));
        }
    }
    Ok(())
}

async fn add_network(
    manager: &CacheManager,
    cfg: &Config,
    chain_id: u64,
) -> Result<Arc<cache_service::NetworkCache>> {
    let network_cfg = cfg
        .network(chain_id)
        .ok_or_else(|| eyre!("network {chain_id} is not configured"))?;
    if network_cfg.rpcs.is_empty() {
        bail!("network {chain_id} has no rpcs");
    }
    let cooldown: Duration = cfg.query_rpc_cooldown.into_inner();
    let mut providers = Vec::with_capacity(network_cfg.rpcs.len());
    for url in &network_cfg.rpcs {
        match build_provider(url, DEFAULT_CONNECT_TIMEOUT).await {
            Ok(provider) => providers.push((url.clone(), provider)),
            Err(err) => warn!(?err, rpc = url.as_str(), "skipping rpc"),
        }
    }
    if providers.is_empty() {
        bail!("no usable rpc for network {chain_id}");
    }

    let mut network = NetworkConfig::new(
        chain_id,
        Arc::new(QueryRpcPool::from_providers(providers, cooldown)),
    );
    network.required_confirmations = network_cfg.required_confirmations;
    if let Some(nary) = network_cfg.nary {
        network.nary = nary;
    }
    manager
        .add_network(network)
        .instrument(tracing::info_span!("add_network", chain_id))
        .await
        .wrap_err_with(|| format!("register network {chain_id}"))
}
