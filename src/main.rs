use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;
use tracing_subscriber::EnvFilter;

use agenda::engine::EngineConfig;
use agenda::tenant::{TenantManager, TenantOptions};
use agenda::wire;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let metrics_port: Option<u16> = std::env::var("AGENDA_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    agenda::observability::init(metrics_port);

    let port: u16 = env_or("AGENDA_PORT", 5433);
    let bind = std::env::var("AGENDA_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("AGENDA_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let password = std::env::var("AGENDA_PASSWORD").unwrap_or_else(|_| "agenda".into());
    let max_connections: usize = env_or("AGENDA_MAX_CONNECTIONS", 256);
    let compact_threshold: u64 = env_or("AGENDA_COMPACT_THRESHOLD", 1000);
    let offer_window_secs: i64 = env_or("AGENDA_OFFER_WINDOW_SECS", 7200);
    let sweep_interval_secs: u64 = env_or("AGENDA_SWEEP_INTERVAL_SECS", 5);

    std::fs::create_dir_all(&data_dir)?;

    let options = TenantOptions {
        compact_threshold,
        sweep_interval: Duration::from_secs(sweep_interval_secs.max(1)),
        engine: EngineConfig {
            offer_window_ms: offer_window_secs * 1000,
            ..EngineConfig::default()
        },
    };
    let tenant_manager = Arc::new(TenantManager::new(PathBuf::from(&data_dir), options));
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("agenda listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  max_connections: {max_connections}");
    info!("  offer_window: {offer_window_secs}s, sweep every {sweep_interval_secs}s");
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("no SIGTERM handler: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(agenda::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                tracing::debug!("connection from {peer}");
                metrics::counter!(agenda::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(agenda::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let tm = tenant_manager.clone();
                let pw = password.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, tm, pw).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(agenda::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    tenant_manager.shutdown();
    info!("agenda stopped");
    Ok(())
}
