use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::{error, info};
use serde::Deserialize;
use std::path::PathBuf;

use QuiverPS::config::{AckMode, ServerConfig};
use QuiverPS::server::{HttpServer, PageService};

#[derive(Parser, Debug)]
#[command(
    name = "quiverps",
    version,
    about = "QuiverPS page server (GetPage / StreamWAL over HTTP+JSON)"
)]
struct Cli {
    /// Config file (TOML). CLI flags override config values, config overrides QPS_* env.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:8080
    #[arg(long)]
    listen: Option<String>,

    /// Page size in bytes (power of two, 512..=65536)
    #[arg(long)]
    page_size: Option<usize>,

    /// HTTP worker threads
    #[arg(long)]
    http_workers: Option<usize>,

    /// Bounded GetPage wait for the applied watermark, ms
    #[arg(long)]
    get_page_wait_ms: Option<u64>,

    /// Applier queue capacity (records)
    #[arg(long)]
    wal_queue_capacity: Option<usize>,

    /// How long StreamWAL waits for queue space, ms
    #[arg(long)]
    enqueue_wait_ms: Option<u64>,

    /// StreamWAL acknowledgement: queued|applied
    #[arg(long)]
    ack_mode: Option<AckMode>,

    /// Bound on the `applied` acknowledgement wait, ms
    #[arg(long)]
    ack_wait_ms: Option<u64>,

    /// Background compaction period, ms (0 disables)
    #[arg(long)]
    compact_interval_ms: Option<u64>,

    /// LSN distance below the watermark that compaction never touches
    #[arg(long)]
    retain_lsn_window: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    listen: Option<String>,
    page_size: Option<usize>,
    http_workers: Option<usize>,
    get_page_wait_ms: Option<u64>,
    wal_queue_capacity: Option<usize>,
    enqueue_wait_ms: Option<u64>,
    ack_mode: Option<String>,
    ack_wait_ms: Option<u64>,
    compact_interval_ms: Option<u64>,
    retain_lsn_window: Option<u64>,
}

fn main() {
    init_logger();

    if let Err(e) = run() {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Cli::parse();
    let cfg = build_config(&args)?;
    info!("effective config: {}", cfg);

    let service = PageService::start(cfg)?;
    let http = HttpServer::start(service.clone())?;
    info!("quiverps ready on {}", http.local_addr());

    // workers run until the process is stopped
    http.wait();
    service.shutdown();
    Ok(())
}

fn build_config(args: &Cli) -> Result<ServerConfig> {
    let file = if let Some(ref p) = args.config {
        let s = std::fs::read_to_string(p)
            .with_context(|| format!("read config {}", p.display()))?;
        let parsed: FileConfig = toml::from_str(&s).context("parse TOML config")?;
        parsed
    } else {
        FileConfig::default()
    };

    // CLI > config > env/default
    fn pick<T>(cli: Option<T>, cfg: Option<T>, default: T) -> T {
        cli.or(cfg).unwrap_or(default)
    }

    let base = ServerConfig::from_env();

    let file_ack = file
        .ack_mode
        .as_deref()
        .map(|s| s.parse::<AckMode>())
        .transpose()?;

    let cfg = ServerConfig {
        listen: pick(args.listen.clone(), file.listen, base.listen),
        page_size: pick(args.page_size, file.page_size, base.page_size),
        http_workers: pick(args.http_workers, file.http_workers, base.http_workers),
        get_page_wait_ms: pick(args.get_page_wait_ms, file.get_page_wait_ms, base.get_page_wait_ms),
        wal_queue_capacity: pick(
            args.wal_queue_capacity,
            file.wal_queue_capacity,
            base.wal_queue_capacity,
        ),
        enqueue_wait_ms: pick(args.enqueue_wait_ms, file.enqueue_wait_ms, base.enqueue_wait_ms),
        ack_mode: pick(args.ack_mode, file_ack, base.ack_mode),
        ack_wait_ms: pick(args.ack_wait_ms, file.ack_wait_ms, base.ack_wait_ms),
        compact_interval_ms: pick(
            args.compact_interval_ms,
            file.compact_interval_ms,
            base.compact_interval_ms,
        ),
        retain_lsn_window: pick(
            args.retain_lsn_window,
            file.retain_lsn_window,
            base.retain_lsn_window,
        ),
    };
    cfg.validate()?;
    Ok(cfg)
}

fn init_logger() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}
