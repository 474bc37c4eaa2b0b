use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lagoon_swarm::config::SwarmConfig;
use lagoon_swarm::events::EventBus;
use lagoon_swarm::irc::dispatch::Dispatcher;
use lagoon_swarm::swarm::manager::ConnectionManager;
use lagoon_swarm::swarm::population::PopulationController;
use lagoon_swarm::swarm::proxy::{read_proxy_list, ProxyChainConnector};
use lagoon_swarm::swarm::tor::TorControl;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = SwarmConfig::from_env()?;
    info!(
        "lagoon-swarm: {} connections to {}:{} (tor {})",
        config.growth.target,
        config.host,
        config.port,
        if config.tor.enabled { "on" } else { "off" }
    );

    let pool = match &config.proxy_list {
        Some(path) => {
            let pool = read_proxy_list(path)?;
            info!("loaded {} proxies from {}", pool.len(), path.display());
            pool
        }
        None => Vec::new(),
    };

    let running = Arc::new(AtomicBool::new(true));
    let (manager, handle) = ConnectionManager::new(
        EventBus::new(),
        Dispatcher::default(),
        config.liveness,
        Arc::clone(&running),
    )?;
    let io_thread = manager.start()?;

    let renewer = TorControl::new(&config.tor.control_addr, &config.tor.password);
    let mut controller = PopulationController::new(
        config,
        handle.clone(),
        Box::new(ProxyChainConnector),
        Arc::clone(&running),
    )
    .with_renewer(Box::new(renewer))
    .with_pool(pool);

    tokio::select! {
        _ = controller.run() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("ctrl-c handler failed: {e}");
            }
            info!("shutting down");
        }
    }

    info!("{}", controller.status().await);
    running.store(false, Ordering::SeqCst);
    handle.stop();

    match tokio::task::spawn_blocking(move || io_thread.join()).await? {
        Ok(result) => result?,
        Err(_) => warn!("I/O thread panicked"),
    }
    Ok(())
}
