//! fleet-api: HTTP API for Fleetgate.
//!
//! Device-facing check-in and event endpoints, a thin catalog admin
//! surface, rollout introspection, and Prometheus metrics.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/v1/update` | Device check-in |
//! | POST | `/v1/event` | Device event report |
//! | GET | `/v1/applications` | List applications |
//! | POST | `/v1/applications` | Create an application |
//! | GET | `/v1/applications/{id}/instances` | List an application's instances |
//! | POST | `/v1/packages` | Create a package |
//! | GET | `/v1/packages/{id}` | Get a package |
//! | POST | `/v1/channels` | Create a channel |
//! | GET | `/v1/channels/{id}` | Get a channel with its package |
//! | PUT | `/v1/channels/{id}/package` | Point a channel at a package |
//! | POST | `/v1/groups` | Create a group |
//! | GET | `/v1/groups/{id}` | Get a group |
//! | PUT | `/v1/groups/{id}/policy` | Replace a group's rollout policy |
//! | GET | `/v1/groups/{id}/evaluate` | Dry-run a check-in decision |
//! | GET | `/v1/groups/{id}/stats` | Period counter and failure window |
//! | POST | `/v1/groups/{id}/safe-mode/reset` | Clear the failure window |
//! | GET | `/v1/activity` | Recent activity, newest first |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;
pub mod omaha_handlers;

use axum::Router;
use axum::routing::{get, post, put};
use fleet_metrics::RolloutMetrics;
use fleet_omaha::ProtocolHandler;
use fleet_state::{Catalog, StateStore, StatisticsLedger};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub catalog: Catalog,
    pub handler: ProtocolHandler,
    pub metrics: RolloutMetrics,
}

impl ApiState {
    pub fn new(store: StateStore) -> Self {
        Self {
            catalog: Catalog::new(store.clone()),
            handler: ProtocolHandler::new(store.clone(), StatisticsLedger::new(store.clone())),
            metrics: RolloutMetrics::new(),
            store,
        }
    }

    pub fn with_stale_write_retries(mut self, retries: u32) -> Self {
        self.handler = self.handler.with_stale_write_retries(retries);
        self
    }
}

/// Build the complete API router (protocol + admin + metrics).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/update", post(omaha_handlers::check_in))
        .route("/event", post(omaha_handlers::event))
        .route(
            "/applications",
            get(handlers::list_applications).post(handlers::create_application),
        )
        .route("/applications/{id}/instances", get(handlers::list_instances))
        .route("/packages", post(handlers::create_package))
        .route("/packages/{id}", get(handlers::get_package))
        .route("/channels", post(handlers::create_channel))
        .route("/channels/{id}", get(handlers::get_channel))
        .route("/channels/{id}/package", put(handlers::set_channel_package))
        .route("/groups", post(handlers::create_group))
        .route("/groups/{id}", get(handlers::get_group))
        .route("/groups/{id}/policy", put(handlers::set_group_policy))
        .route("/groups/{id}/evaluate", get(handlers::evaluate_group))
        .route("/groups/{id}/stats", get(handlers::group_stats))
        .route("/groups/{id}/safe-mode/reset", post(handlers::reset_safe_mode))
        .route("/activity", get(handlers::list_activity))
        .with_state(state.clone());

    Router::new()
        .nest("/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
