//! The swarm: identities, proxy chains, the I/O loop and population control.

pub mod identity;
pub mod manager;
pub mod population;
pub mod proxy;
pub mod tor;
