//! fleet-metrics: observability for Fleetgate rollouts.
//!
//! Counts check-in decisions and event reports per group and renders them,
//! together with live ledger state, in Prometheus text format.
//!
//! # Architecture
//!
//! ```text
//! RolloutMetrics
//!   ├── record_check_in() ← called per check-in response
//!   ├── record_event()    ← called per event report
//!   └── snapshot() → Vec<GroupCounters>
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{GroupCounters, RolloutMetrics};
pub use prometheus::render_prometheus;
