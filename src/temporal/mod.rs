//! Temporal correctness: cutoff derivation, leakage detection and correction.

pub mod correction;
pub mod cutoff;
pub mod detector;
pub mod suspicious;

pub use correction::{CorrectionEngine, CorrectionOutcome};
pub use cutoff::CutoffPolicy;
pub use detector::ViolationDetector;
pub use suspicious::SuspiciousPatternDetector;
