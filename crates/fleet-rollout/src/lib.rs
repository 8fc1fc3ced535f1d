//! Fleetgate rollout engine: policy evaluation and instance lifecycle.
//!
//! Both halves are pure: they take snapshots read from the state store and
//! return decisions or transitions. Committing them is the protocol
//! handler's job.
//!
//! # Components
//!
//! - **`evaluator`**: Admission decision for one check-in (grant, deny, no-update)
//! - **`lifecycle`**: Per-instance update state machine driven by event reports

pub mod evaluator;
pub mod lifecycle;

pub use evaluator::{breaker_tripped, evaluate, Decision, DenyReason, InstanceView};
pub use lifecycle::{apply_event, EventKind, EventResult, LifecycleError, Transition};
