/**
 * OCEAN KERNEL - Point d'entrée du serveur
 *
 * RÔLE : Bootstrap complet : configuration, moteur, boucles de service,
 * plan de contrôle HTTP. Codes de sortie : 0 arrêt normal, 2 configuration
 * invalide, 3 store du scheduler illisible.
 */

use ocean_kernel::config::load_config;
use ocean_kernel::{http, BootstrapError, Engine};
use std::net::SocketAddr;
use std::path::Path;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ocean_kernel=info,info".into()),
        )
        .init();

    let config_path =
        std::env::var("OCEAN_KERNEL_CONFIG").unwrap_or_else(|_| "ocean.yaml".into());
    let config = match load_config(Path::new(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path, error = %e, "invalid configuration, refusing to start");
            std::process::exit(2);
        }
    };

    let addr: SocketAddr = match config.http_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(http_addr = %config.http_addr, error = %e, "invalid http_addr");
            std::process::exit(2);
        }
    };

    info!(
        devices = config.devices.len(),
        groups = config.groups.len(),
        timezone = %config.timezone,
        "configuration loaded"
    );

    let engine = match Engine::bootstrap(config) {
        Ok(engine) => engine,
        Err(BootstrapError::ScheduleStore(e)) => {
            error!(error = %e, "durable schedule store unreadable");
            std::process::exit(3);
        }
        Err(e) => {
            error!(error = %e, "bootstrap failed");
            std::process::exit(1);
        }
    };

    engine.start_services();

    let app = http::build_router(engine.clone());
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind control plane");
            std::process::exit(1);
        }
    };
    info!("kernel listening on http://{addr}");

    let shutdown_engine = engine.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        shutdown_engine.shutdown();
    });

    if let Err(e) = serve.await {
        error!(error = %e, "http server error");
        std::process::exit(1);
    }

    // laisse le journal d'actions finir d'écrire
    engine.action_log.flush().await;
    info!("kernel stopped");
}
