//! # Stage: Canary
//!
//! ## Responsibility
//! Decide, per request, whether the new routing implementation or the
//! legacy one serves it, and move that split between phases
//! (0% → 10% → 50% → 100%) based on the new provider's measured health.
//!
//! ## Guarantees
//! - Sticky: the same identifier at the same percentage always lands on the
//!   same provider.
//! - Lock-free reads: the splitter reads the percentage from an atomic.
//! - Safe: any threshold breach moves traffic back to 0% within one
//!   health-check interval, and promotion is refused during the cooldown.
//!
//! ## NOT Responsible For
//! - Collecting metrics (see `metrics`)
//! - Invoking providers (see `coordinator`)

pub mod controller;
pub mod splitter;
pub mod state;

// Re-exports for convenience
pub use controller::{
    evaluate, Breach, ControllerSettings, HealthDecision, RollbackController, RollbackEvent,
    RolloutThresholds,
};
pub use splitter::TrafficSplitter;
pub use state::{CanaryPhase, CanaryState, FixedRollout, RolloutState, SharedCanaryState};
