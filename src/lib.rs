//! Lagoon swarm, a manager for a population of IRC client connections.
//!
//! Provides four pieces:
//!
//! 1. **I/O loop**: one thread multiplexes every connection's non-blocking
//!    socket, handling partial reads and writes, keepalive pings and idle
//!    timeouts ([`swarm::manager`]).
//!
//! 2. **Event bus**: a hierarchical, path-addressed pub/sub tree with replay,
//!    fan-out and consumption ([`events`]).
//!
//! 3. **Line dispatch**: inbound lines are parsed, routed through a table of
//!    built-in handlers and published on the bus ([`irc::dispatch`]).
//!
//! 4. **Population control**: keeps the swarm at its target size, tunnelling
//!    new connections through Tor and proxy chains ([`swarm::population`]).
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! use std::sync::{atomic::AtomicBool, Arc};
//! use lagoon_swarm::{config::SwarmConfig, events::EventBus, irc::dispatch::Dispatcher};
//! use lagoon_swarm::swarm::{manager::ConnectionManager, population::PopulationController};
//! use lagoon_swarm::swarm::proxy::ProxyChainConnector;
//!
//! let config = SwarmConfig::from_env()?;
//! let running = Arc::new(AtomicBool::new(true));
//! let (manager, handle) =
//!     ConnectionManager::new(EventBus::new(), Dispatcher::default(), config.liveness, running.clone())?;
//! let io_thread = manager.start()?;
//! PopulationController::new(config, handle, Box::new(ProxyChainConnector), running).run().await;
//! # let _ = io_thread;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod events;
pub mod irc;
pub mod swarm;
