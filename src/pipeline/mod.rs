//! Window scheduling, run orchestration and the terminal decision gate.

pub mod gate;
pub mod locks;
pub mod orchestrator;
pub mod scheduler;

pub use gate::DecisionGate;
pub use orchestrator::{PipelineOrchestrator, SkippedWindow, SweepReport};
pub use scheduler::{ExecutionBand, NextAction, WindowScheduler};
