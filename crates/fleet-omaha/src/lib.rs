//! fleet-omaha: the protocol handler in front of the rollout engine.
//!
//! Terminates check-in and event-report requests, drives the per-instance
//! lifecycle, asks the evaluator for a decision and commits the result
//! through the statistics ledger.
//!
//! # Components
//!
//! - **`protocol`**: Wire types for check-ins and event reports
//! - **`handler`**: `ProtocolHandler`: `handle_check_in`, `handle_event`, dry-run evaluation
//! - **`error`**: `HandlerError` taxonomy

pub mod error;
pub mod handler;
pub mod protocol;

pub use error::{HandlerError, HandlerResult};
pub use handler::{EventReceipt, ProtocolHandler};
pub use protocol::{CheckInRequest, CheckInResponse, CheckInStatus, EventAck, EventRequest, UpdateInfo, WireCode};
