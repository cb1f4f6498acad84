//! batchsim: a discrete-event simulator for the job management and batch
//! scheduling core of cyber-infrastructure workflow systems.
//!
//! Everything long-lived is an actor on a deterministic cooperative kernel:
//! compute services own simulated cores and hosts, executors drive per-task
//! work, a batch queue places jobs under FCFS or backfilling policies, and
//! client-side managers translate it all into one execution-event stream.

pub mod config;
pub mod events;
pub mod failure;
pub mod jobs;
pub mod managers;
pub mod messages;
pub mod services;
pub mod sim;
pub mod simulation;
pub mod types;
pub mod utils;
pub mod wms;
pub mod workflow;

pub use failure::FailureCause;
pub use sim::EndCondition;
pub use simulation::Simulation;
pub use types::{Duration, Time};
