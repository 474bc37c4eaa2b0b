/// Population control: grows the swarm toward its target size.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::identity::IdentityProvider;
use super::manager::ManagerHandle;
use super::proxy::{ChainConnector, ProxyChain, ProxyHop};
use super::tor::CircuitRenewer;
use crate::config::SwarmConfig;
use crate::irc::connection::Connection;

/// What one growth cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Slots this cycle tried to fill.
    pub batch: usize,
    /// Slots skipped because no chain long enough could be built.
    pub exhausted: usize,
    /// Connect attempts made.
    pub attempted: usize,
    pub connected: usize,
    pub failed: usize,
}

impl CycleReport {
    /// Whether the cycle found the target already met.
    pub fn was_idle(&self) -> bool {
        self.batch == 0
    }
}

pub struct PopulationController {
    config: SwarmConfig,
    handle: ManagerHandle,
    connector: Box<dyn ChainConnector>,
    renewer: Option<Box<dyn CircuitRenewer>>,
    pool: Vec<ProxyHop>,
    running: Arc<AtomicBool>,
    total: AtomicU64,
}

impl PopulationController {
    pub fn new(
        config: SwarmConfig,
        handle: ManagerHandle,
        connector: Box<dyn ChainConnector>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            handle,
            connector,
            renewer: None,
            pool: Vec::new(),
            running,
            total: AtomicU64::new(0),
        }
    }

    /// Circuit renewal, requested once per non-empty batch when Tor is on.
    pub fn with_renewer(mut self, renewer: Box<dyn CircuitRenewer>) -> Self {
        self.renewer = Some(renewer);
        self
    }

    /// Proxies to draw from. Each is used for at most one connection; the
    /// last entry is drawn first.
    pub fn with_pool(mut self, pool: Vec<ProxyHop>) -> Self {
        self.pool = pool;
        self
    }

    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    /// Connections ever established by this controller.
    pub fn total_connected(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    fn identity_provider(&self) -> &IdentityProvider {
        &self.config.identity
    }

    /// Assemble the next chain: the Tor hop when enabled, then one pool
    /// proxy if any remain. `None` when the result is below the minimum.
    pub fn build_chain(&mut self) -> Option<ProxyChain> {
        let mut chain = ProxyChain::default();
        if self.config.tor.enabled {
            chain.push(self.config.tor.socks.clone());
        }
        if let Some(hop) = self.pool.pop() {
            chain.push(hop);
        }
        chain
            .meets_minimum(self.config.growth.min_chain_len)
            .then_some(chain)
    }

    /// Run one growth cycle.
    pub async fn grow_once(&mut self) -> CycleReport {
        let growth = &self.config.growth;
        let deficit = growth.target.saturating_sub(self.handle.len());
        let mut report = CycleReport {
            batch: deficit.min(growth.batch),
            ..CycleReport::default()
        };
        if report.batch == 0 {
            return report;
        }

        if self.config.tor.enabled {
            if let Some(renewer) = &self.renewer {
                if let Err(e) = renewer.new_circuit().await {
                    warn!("population: new circuit request failed: {e}");
                }
            }
        }

        let mut chains = Vec::with_capacity(report.batch);
        for _ in 0..report.batch {
            match self.build_chain() {
                Some(chain) => chains.push(chain),
                None => {
                    error!("population: all proxy chain options exhausted");
                    report.exhausted += 1;
                }
            }
        }

        for chain in chains {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            report.attempted += 1;
            if self.connect_one(&chain).await {
                report.connected += 1;
            } else {
                report.failed += 1;
            }
        }

        debug!(?report, "population: cycle finished");
        report
    }

    async fn connect_one(&self, chain: &ProxyChain) -> bool {
        info!(%chain, "population: connecting");
        let (host, port) = (&self.config.host, self.config.port);
        let stream = match self
            .connector
            .connect(chain, host, port, self.config.growth.connect_timeout)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                error!(%chain, "population: {e}");
                return false;
            }
        };
        if let Err(e) = stream.set_nonblocking(true) {
            error!("population: socket setup failed: {e}");
            return false;
        }

        let mut conn = Connection::new(
            mio::net::TcpStream::from_std(stream),
            self.identity_provider().next_identity(),
        );
        conn.identify();
        let nickname = conn.nickname.clone();
        match self.handle.add(conn) {
            Ok(()) => {
                self.total.fetch_add(1, Ordering::Relaxed);
                info!(%nickname, "population: connection added");
                true
            }
            Err(e) => {
                error!("population: {e}");
                false
            }
        }
    }

    /// Grow until the shared running flag clears.
    pub async fn run(&mut self) {
        info!(goal = self.config.growth.target, "population: controller started");
        while self.running.load(Ordering::SeqCst) {
            let report = self.grow_once().await;
            let pause = if report.was_idle() {
                self.config.growth.idle_interval
            } else {
                self.config.growth.growth_interval
            };
            tokio::time::sleep(pause).await;
        }
        info!("population: controller stopped");
    }

    /// `<PopulationController(running live/target (total))> - [summaries]`
    pub async fn status(&self) -> String {
        let state = if self.running.load(Ordering::SeqCst) && self.handle.is_running() {
            "running"
        } else {
            "stopped"
        };
        let summaries = self.handle.summary().await.unwrap_or_default();
        format!(
            "<PopulationController({state} {}/{} ({}))> - [{}]",
            self.handle.len(),
            self.config.growth.target,
            self.total_connected(),
            summaries.join(", ")
        )
    }
}
