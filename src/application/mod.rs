//! Application layer - the actors that run jobs.
//!
//! - `mailbox`: typed, in-order actor mailboxes and pool reply addresses
//! - `pool`: fixed-size worker pools with least-pending dispatch
//! - `workers`: download, transcode and upload workers over the ports
//! - `monitor`: quiet-period watcher for transcoder output
//! - `saga`: per-job state machine
//! - `orchestrator`: spawns sagas and collects their reports
//! - `dead_letters`: undeliverable and unhandled messages, and their logger

pub mod dead_letters;
pub mod mailbox;
pub mod monitor;
pub mod orchestrator;
pub mod pool;
pub mod saga;
pub mod workers;
