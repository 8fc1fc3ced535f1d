//! fleet-state: embedded state store for Fleetgate.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for the catalog (applications, packages, channels, groups), the
//! instance registry, the statistics ledger, and the activity log.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{application_id}:{instance_id}`,
//! `{group_id}:{period_start}`) enable prefix scans for related records.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across threads and async tasks. [`Catalog`] and
//! [`StatisticsLedger`] are thin views over the same store.

pub mod catalog;
pub mod error;
pub mod ledger;
pub mod store;
pub mod tables;
pub mod types;
pub mod window;

pub use catalog::{Catalog, CatalogError, CatalogResult};
pub use error::{StateError, StateResult};
pub use ledger::{GrantCommit, GrantRequest, StatisticsLedger};
pub use store::StateStore;
pub use types::*;
pub use window::FailureWindow;
