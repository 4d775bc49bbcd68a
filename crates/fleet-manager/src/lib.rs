//! Management-plane control loop: library
//! surface for the `fleet-manager` binary. Each module owns one
//! reconciler; [`cli`] and the binary's `main.rs` wire them to watch
//! streams and work queues.

pub mod aggregate;
pub mod cli;
pub mod gc;
pub mod ingest;
pub mod reconcile;
pub mod registration;
pub mod targeting;
