//! Domain layer - pure types and rules with no I/O.
//!
//! This layer contains the core concepts of the serving kernel:
//! - Feature values and feature sets
//! - Fixed-window admission rules and decisions
//! - Prediction results and advisory thresholds
//! - Monitoring records
//!
//! Nothing here touches clocks, storage or the network; callers pass time in.

pub mod feature;
pub mod monitoring;
pub mod prediction;
pub mod window;
