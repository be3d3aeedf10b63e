//! Test doubles for infrastructure adapters.
//!
//! Controllable time, a counter store that can simulate outages, and a
//! tracing layer that captures events.

pub mod clock;
pub mod layer;
pub mod store;

pub use clock::MockClock;
pub use layer::{CapturedEvent, MockCaptureLayer};
pub use store::FlakyCounterStore;
