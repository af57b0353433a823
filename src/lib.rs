//! Multi-protocol reachability prober.
//!
//! Expands targets into probe tasks, spreads them over a fixed pool of
//! worker lanes and aggregates per-target success/failure, flagging targets
//! whose connectivity flipped between rounds.

pub mod cancel;
pub mod cli;
pub mod config;
pub mod display;
pub mod error;
pub mod executor;
pub mod icmp;
pub mod ingest;
pub mod logging;
pub mod probe;
pub mod scheduler;
pub mod stats;
pub mod target;
pub mod task;

pub use cancel::CancelToken;
pub use config::{ProbeConfig, ProbeType, ShowMode};
pub use error::{ProbeError, Result};
pub use stats::{FailRateTracker, StatsSnapshot};
pub use task::{ProbeTask, TaskSet, WorkerLane};
