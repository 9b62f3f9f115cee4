use clap::Parser;
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};
use tracing::{error, info};

use domain_tracker::{
    calendar::{DayCalendar, LocalZone},
    config::{TrackerConfig, DEFAULT_TRACE_CAPACITY},
    http::{self, AppState},
    BrowserMirror, KeyValueStore, MemoryStore, RetentionStore, SqliteStore, SystemClock, Tracker,
};

const DEFAULT_PORT: u16 = 17610;

#[derive(Parser, Debug)]
#[command(name = "domain_tracker", version)]
struct Args {
    /// Listen address.
    ///
    /// Accepts:
    /// - ip:port (recommended), e.g. 127.0.0.1:17610
    /// - ip (implies port 17610), e.g. 127.0.0.1
    /// - localhost or localhost:port
    #[arg(long, default_value = "127.0.0.1:17610")]
    listen: String,

    /// SQLite database path.
    #[arg(long, default_value = "./data/domain-tracker.db")]
    db: PathBuf,

    /// Keep data for this many local calendar days (today included).
    #[arg(long, default_value_t = 7)]
    retention_days: u32,

    /// IANA time zone for day boundaries, e.g. Europe/Berlin. Defaults to the system zone.
    #[arg(long)]
    tz: Option<String>,

    /// Number of recent engine events kept for /trace.
    #[arg(long, default_value_t = DEFAULT_TRACE_CAPACITY)]
    trace_capacity: usize,

    /// Keep everything in memory (nothing survives a restart).
    #[arg(long, default_value_t = false)]
    memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "domain_tracker=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    match args.tz.as_deref() {
        Some(name) => {
            let tz: chrono_tz::Tz = name
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid --tz '{name}': {e}"))?;
            serve(args, tz).await
        }
        None => serve(args, chrono::Local).await,
    }
}

async fn serve<Tz: LocalZone>(args: Args, tz: Tz) -> anyhow::Result<()> {
    let kv: Arc<dyn KeyValueStore> = if args.memory {
        info!("DB: in-memory");
        Arc::new(MemoryStore::new())
    } else {
        info!("DB: {}", args.db.display());
        Arc::new(SqliteStore::open(&args.db)?)
    };

    let config = TrackerConfig {
        retention_days: args.retention_days,
        trace_capacity: args.trace_capacity,
    }
    .normalized();
    let store = Arc::new(RetentionStore::with_retention(
        kv,
        DayCalendar::new(tz),
        config.retention_days,
    ));
    let mirror = Arc::new(BrowserMirror::new());
    let tracker = Tracker::new(store, mirror.clone(), Arc::new(SystemClock), config);
    let (handle, join) = domain_tracker::spawn_with_mirror(tracker, mirror);

    // Storage failures at startup are logged by the loop; keep serving.
    let _ = handle.startup().await;

    let app = http::router(AppState {
        tracker: handle.clone(),
    });

    let addr = parse_listen(&args.listen)?;
    info!("Tracker listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Commit the running session before exit.
    if let Err(e) = handle.flush().await {
        error!("final flush failed: {e}");
    }
    drop(handle);
    let _ = join.await;
    Ok(())
}

fn parse_listen(input: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    if input == "localhost" {
        return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), DEFAULT_PORT));
    }

    if let Some((host, port_str)) = input.rsplit_once(':') {
        if host == "localhost" {
            let port: u16 = port_str.parse().map_err(|_| {
                anyhow::anyhow!(
                    "invalid --listen '{}': bad port. Example: 127.0.0.1:{}",
                    input,
                    DEFAULT_PORT
                )
            })?;
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), port));
        }
    }

    Err(anyhow::anyhow!(
        "invalid --listen '{}'. Use ip:port (e.g. 127.0.0.1:{}) or ip (e.g. 127.0.0.1).",
        input,
        DEFAULT_PORT
    ))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}
