use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use slotd::tenant::TenantManager;
use slotd::wire;

struct Config {
    bind: String,
    port: u16,
    data_dir: String,
    password: String,
    max_connections: usize,
    compact_threshold: u64,
    metrics_port: Option<u16>,
    tls_cert: Option<String>,
    tls_key: Option<String>,
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl Config {
    fn from_env() -> Self {
        Self {
            bind: std::env::var("SLOTD_BIND").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_parsed("SLOTD_PORT", 5434),
            data_dir: std::env::var("SLOTD_DATA_DIR").unwrap_or_else(|_| "./data".into()),
            password: std::env::var("SLOTD_PASSWORD").unwrap_or_else(|_| "slotd".into()),
            max_connections: env_parsed("SLOTD_MAX_CONNECTIONS", 256),
            compact_threshold: env_parsed("SLOTD_COMPACT_THRESHOLD", 1000),
            metrics_port: std::env::var("SLOTD_METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
            tls_cert: std::env::var("SLOTD_TLS_CERT").ok(),
            tls_key: std::env::var("SLOTD_TLS_KEY").ok(),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    ctrl_c.await.ok();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    slotd::observability::init(config.metrics_port);

    let tls_acceptor =
        slotd::tls::load_tls_acceptor(config.tls_cert.as_deref(), config.tls_key.as_deref())?;
    std::fs::create_dir_all(&config.data_dir)?;

    let tenant_manager = Arc::new(TenantManager::new(
        PathBuf::from(&config.data_dir),
        config.compact_threshold,
    ));
    let semaphore = Arc::new(Semaphore::new(config.max_connections));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("slotd listening on {addr}");
    info!("  data_dir: {}", config.data_dir);
    info!("  max_connections: {}", config.max_connections);
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    match config.metrics_port {
        Some(p) => info!("  metrics: http://0.0.0.0:{p}/metrics"),
        None => info!("  metrics: disabled"),
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };

                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    warn!("connection limit reached, rejecting {peer}");
                    metrics::counter!(slotd::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                    drop(socket);
                    continue;
                };

                info!("connection from {peer}");
                metrics::counter!(slotd::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(slotd::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let tm = tenant_manager.clone();
                let pw = config.password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, tm, pw, tls).await {
                        error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(slotd::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Let in-flight connections finish, bounded.
    info!("draining connections...");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while semaphore.available_permits() < config.max_connections {
        if tokio::time::Instant::now() >= deadline {
            let open = config.max_connections - semaphore.available_permits();
            warn!("drain timeout, {open} connections still open");
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    info!("slotd stopped");
    Ok(())
}
