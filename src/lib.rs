//! Kickoff Backend Library
//!
//! Temporal-correctness engine for staged pre-event feature pipelines.
//! Every window's features are checked against a cutoff derived from the event
//! start, healed where possible, and the terminal window is gated before any
//! decision is acted on.

pub mod audit;
pub mod builders;
pub mod clock;
pub mod config;
pub mod models;
pub mod pipeline;
pub mod store;
pub mod temporal;

pub use config::TemporalConfig;
pub use pipeline::{DecisionGate, PipelineOrchestrator};
