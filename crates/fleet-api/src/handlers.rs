//! Catalog admin and rollout introspection handlers.
//!
//! Each handler goes through `Catalog` (for validated writes) or the
//! protocol handler's ledger and returns JSON in the `ApiResponse` envelope.

use std::collections::BTreeSet;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use fleet_core::{unix_now, Arch};
use fleet_rollout::{breaker_tripped, Decision};
use fleet_state::*;
use tracing::info;

use crate::omaha_handlers::status_for;
use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> axum::response::Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn catalog_error(e: CatalogError) -> axum::response::Response {
    let status = match &e {
        CatalogError::NotFound { .. } | CatalogError::State(StateError::NotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        CatalogError::AlreadyExists { .. } => StatusCode::CONFLICT,
        CatalogError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    };
    error_response(&e.to_string(), status)
}

fn state_error(e: StateError) -> axum::response::Response {
    error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
}

fn parse_arch(raw: &str) -> Result<Arch, CatalogError> {
    Ok(raw.parse::<Arch>()?)
}

// ── Applications ───────────────────────────────────────────────

#[derive(serde::Deserialize)]
pub struct CreateApplicationRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// GET /v1/applications
pub async fn list_applications(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_applications() {
        Ok(apps) => ApiResponse::ok(apps).into_response(),
        Err(e) => state_error(e),
    }
}

/// POST /v1/applications
pub async fn create_application(
    State(state): State<ApiState>,
    Json(req): Json<CreateApplicationRequest>,
) -> impl IntoResponse {
    let app = Application {
        id: req.id,
        name: req.name,
        description: req.description,
        created_at: unix_now(),
    };
    match state.catalog.add_application(&app) {
        Ok(()) => (StatusCode::CREATED, ApiResponse::ok(app)).into_response(),
        Err(e) => catalog_error(e),
    }
}

/// GET /v1/applications/{id}/instances
pub async fn list_instances(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.list_instances_for_application(&id) {
        Ok(instances) => ApiResponse::ok(instances).into_response(),
        Err(e) => state_error(e),
    }
}

// ── Packages ───────────────────────────────────────────────────

#[derive(serde::Deserialize)]
pub struct CreatePackageRequest {
    pub id: String,
    pub application_id: String,
    pub arch: String,
    pub version: String,
    pub url: String,
    pub filename: String,
    pub hash: String,
    pub size: u64,
    #[serde(default)]
    pub channels_blacklist: BTreeSet<String>,
}

/// POST /v1/packages
pub async fn create_package(
    State(state): State<ApiState>,
    Json(req): Json<CreatePackageRequest>,
) -> impl IntoResponse {
    let arch = match parse_arch(&req.arch) {
        Ok(a) => a,
        Err(e) => return catalog_error(e),
    };
    let pkg = Package {
        id: req.id,
        application_id: req.application_id,
        arch,
        version: req.version,
        artifact: ArtifactRef {
            url: req.url,
            filename: req.filename,
            hash: req.hash,
            size: req.size,
        },
        channels_blacklist: req.channels_blacklist,
        created_at: unix_now(),
    };
    match state.catalog.add_package(&pkg) {
        Ok(()) => (StatusCode::CREATED, ApiResponse::ok(pkg)).into_response(),
        Err(e) => catalog_error(e),
    }
}

/// GET /v1/packages/{id}
pub async fn get_package(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.catalog.get_package(&id) {
        Ok(pkg) => ApiResponse::ok(pkg).into_response(),
        Err(e) => catalog_error(e),
    }
}

// ── Channels ───────────────────────────────────────────────────

#[derive(serde::Deserialize)]
pub struct CreateChannelRequest {
    pub id: String,
    pub name: String,
    pub application_id: String,
    pub arch: String,
    #[serde(default)]
    pub package_id: Option<String>,
}

#[derive(serde::Deserialize)]
pub struct SetChannelPackageRequest {
    pub package_id: Option<String>,
}

/// POST /v1/channels
pub async fn create_channel(
    State(state): State<ApiState>,
    Json(req): Json<CreateChannelRequest>,
) -> impl IntoResponse {
    let arch = match parse_arch(&req.arch) {
        Ok(a) => a,
        Err(e) => return catalog_error(e),
    };
    let channel = Channel {
        id: req.id,
        name: req.name,
        application_id: req.application_id,
        arch,
        package_id: req.package_id,
        created_at: unix_now(),
    };
    match state.catalog.add_channel(&channel) {
        Ok(()) => (StatusCode::CREATED, ApiResponse::ok(channel)).into_response(),
        Err(e) => catalog_error(e),
    }
}

/// GET /v1/channels/{id}
pub async fn get_channel(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.catalog.get_channel(&id) {
        Ok(resolved) => ApiResponse::ok(resolved).into_response(),
        Err(e) => catalog_error(e),
    }
}

/// PUT /v1/channels/{id}/package
pub async fn set_channel_package(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<SetChannelPackageRequest>,
) -> impl IntoResponse {
    match state
        .catalog
        .update_channel_package(&id, req.package_id.as_deref(), unix_now())
    {
        Ok(channel) => ApiResponse::ok(channel).into_response(),
        Err(e) => catalog_error(e),
    }
}

// ── Groups ─────────────────────────────────────────────────────

#[derive(serde::Deserialize)]
pub struct CreateGroupRequest {
    pub id: String,
    pub name: String,
    pub application_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub policy: RolloutPolicy,
}

/// POST /v1/groups
pub async fn create_group(
    State(state): State<ApiState>,
    Json(req): Json<CreateGroupRequest>,
) -> impl IntoResponse {
    let group = Group {
        id: req.id,
        name: req.name,
        application_id: req.application_id,
        channel_id: req.channel_id,
        policy: req.policy,
        created_at: unix_now(),
    };
    match state.catalog.add_group(&group) {
        Ok(()) => (StatusCode::CREATED, ApiResponse::ok(group)).into_response(),
        Err(e) => catalog_error(e),
    }
}

/// GET /v1/groups/{id}
pub async fn get_group(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.catalog.get_group(&id) {
        Ok(group) => ApiResponse::ok(group).into_response(),
        Err(e) => catalog_error(e),
    }
}

/// PUT /v1/groups/{id}/policy
pub async fn set_group_policy(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(policy): Json<RolloutPolicy>,
) -> impl IntoResponse {
    match state.catalog.update_group_policy(&id, policy) {
        Ok(group) => {
            info!(group = %group.id, "rollout policy updated");
            ApiResponse::ok(group).into_response()
        }
        Err(e) => catalog_error(e),
    }
}

// ── Rollout introspection ──────────────────────────────────────

#[derive(serde::Deserialize)]
pub struct EvaluateParams {
    pub instance_id: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Dry-run decision as returned by the evaluate endpoint.
#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct DryRunView {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub consumes_slot: bool,
}

impl From<&Decision> for DryRunView {
    fn from(d: &Decision) -> Self {
        let (version, consumes_slot) = match d {
            Decision::Granted {
                package,
                consumes_slot,
            } => (Some(package.version.clone()), *consumes_slot),
            _ => (None, false),
        };
        Self {
            status: d.status().to_string(),
            version,
            consumes_slot,
        }
    }
}

/// GET /v1/groups/{id}/evaluate?instance_id=...&version=...
pub async fn evaluate_group(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(params): Query<EvaluateParams>,
) -> impl IntoResponse {
    match state.handler.dry_run(
        &id,
        &params.instance_id,
        params.version.as_deref(),
        unix_now(),
    ) {
        Ok(decision) => ApiResponse::ok(DryRunView::from(&decision)).into_response(),
        Err(e) => error_response(&e.to_string(), status_for(&e)),
    }
}

/// Group statistics as returned by the stats endpoint.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct GroupStats {
    #[serde(flatten)]
    pub snapshot: LedgerSnapshot,
    pub max_updates_per_period: u32,
    pub failure_ratio: f64,
    pub breaker_tripped: bool,
}

/// GET /v1/groups/{id}/stats
pub async fn group_stats(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let group = match state.catalog.get_group(&id) {
        Ok(g) => g,
        Err(e) => return catalog_error(e),
    };
    match state.handler.ledger().snapshot(&group, unix_now()) {
        Ok(snapshot) => ApiResponse::ok(GroupStats {
            max_updates_per_period: group.policy.max_updates_per_period,
            failure_ratio: snapshot.failure_ratio(),
            breaker_tripped: breaker_tripped(&group.policy, &snapshot),
            snapshot,
        })
        .into_response(),
        Err(e) => state_error(e),
    }
}

/// POST /v1/groups/{id}/safe-mode/reset
pub async fn reset_safe_mode(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let group = match state.catalog.get_group(&id) {
        Ok(g) => g,
        Err(e) => return catalog_error(e),
    };
    match state.handler.ledger().reset_failures(&group, unix_now()) {
        Ok(was_halted) => ApiResponse::ok(serde_json::json!({
            "group": id,
            "was_halted": was_halted,
        }))
        .into_response(),
        Err(e) => state_error(e),
    }
}

#[derive(serde::Deserialize)]
pub struct ActivityParams {
    #[serde(default = "default_activity_limit")]
    pub limit: usize,
}

fn default_activity_limit() -> usize {
    50
}

/// GET /v1/activity?limit=N
pub async fn list_activity(
    State(state): State<ApiState>,
    Query(params): Query<ActivityParams>,
) -> impl IntoResponse {
    match state.store.list_activity(params.limit.min(1000)) {
        Ok(entries) => ApiResponse::ok(entries).into_response(),
        Err(e) => state_error(e),
    }
}

// ── Metrics ────────────────────────────────────────────────────

/// GET /metrics: Prometheus text exposition.
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let now = unix_now();
    let groups = match state.store.list_groups() {
        Ok(g) => g,
        Err(e) => return state_error(e),
    };
    let mut ledgers = Vec::with_capacity(groups.len());
    for group in &groups {
        match state.handler.ledger().snapshot(group, now) {
            Ok(s) => ledgers.push(s),
            Err(e) => return state_error(e),
        }
    }
    let counters = state.metrics.snapshot().await;
    let body = fleet_metrics::render_prometheus(&counters, &ledgers);
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}
