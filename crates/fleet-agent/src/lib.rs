//! Agent-plane control loop: library surface for the
//! `fleet-agent` binary. One agent process runs per downstream cluster,
//! reconciling only the `Deployment`s in its own assigned namespace.

pub mod bootstrap;
pub mod cli;
pub mod deployer;
pub mod drift;
pub mod leader;
pub mod ticker;
