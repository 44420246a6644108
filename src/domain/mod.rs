//! Domain layer - Pure types, no I/O.

pub mod hls;
pub mod jobs;
