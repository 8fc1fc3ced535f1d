//! Device-facing protocol handlers.
//!
//! Devices get the bare protocol body on success and `{error, retry}` on
//! failure; the admin `ApiResponse` envelope is not used here.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fleet_omaha::{CheckInRequest, EventRequest, HandlerError};
use fleet_state::InstanceStatus;
use tracing::{debug, error, warn};

use crate::ApiState;

#[derive(serde::Serialize)]
struct ProtocolError {
    error: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    retry: bool,
}

/// HTTP status for a handler error.
pub fn status_for(e: &HandlerError) -> StatusCode {
    match e {
        HandlerError::Malformed(_) => StatusCode::BAD_REQUEST,
        HandlerError::NotFound(_) => StatusCode::NOT_FOUND,
        HandlerError::UnexpectedEvent(_) => StatusCode::CONFLICT,
        HandlerError::Transient(_) | HandlerError::Unavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

fn protocol_error(e: &HandlerError) -> Response {
    match e {
        HandlerError::Unavailable(_) => error!(error = %e, "store unavailable"),
        HandlerError::Transient(_) => warn!(error = %e, "request failed transiently"),
        _ => debug!(error = %e, "request rejected"),
    }
    (
        status_for(e),
        Json(ProtocolError {
            error: e.to_string(),
            retry: e.is_retryable(),
        }),
    )
        .into_response()
}

fn malformed_body(rejection: JsonRejection) -> Response {
    protocol_error(&HandlerError::Malformed(rejection.body_text()))
}

/// POST /v1/update
pub async fn check_in(
    State(state): State<ApiState>,
    payload: Result<Json<CheckInRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(p) => p,
        Err(rejection) => return malformed_body(rejection),
    };
    match state.handler.handle_check_in(&req) {
        Ok(resp) => {
            state.metrics.record_check_in(&req.group_id, resp.status).await;
            Json(resp).into_response()
        }
        Err(e) => {
            // Counters exist only for groups in the catalog.
            if let Ok(Some(_)) = state.store.get_group(&req.group_id) {
                state.metrics.record_rejected(&req.group_id).await;
            }
            protocol_error(&e)
        }
    }
}

/// POST /v1/event
pub async fn event(
    State(state): State<ApiState>,
    payload: Result<Json<EventRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(p) => p,
        Err(rejection) => return malformed_body(rejection),
    };
    match state.handler.handle_event(&req) {
        Ok(receipt) => {
            let success = receipt.transition.next != InstanceStatus::Errored;
            state.metrics.record_event(&receipt.group_id, success).await;
            Json(receipt.ack()).into_response()
        }
        Err(e) => protocol_error(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::Arch;
    use fleet_omaha::WireCode;
    use fleet_state::{Application, Channel, Group, RolloutPolicy, StateStore};

    fn test_state() -> ApiState {
        ApiState::new(StateStore::open_in_memory().unwrap())
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            status_for(&HandlerError::Malformed("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&HandlerError::UnexpectedEvent("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&HandlerError::Transient("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn check_in_unknown_group_is_not_found() {
        let state = test_state();
        let req = CheckInRequest {
            instance_id: "i-1".into(),
            app_id: "app".into(),
            group_id: "ghost".into(),
            version: "1.0.0".into(),
            arch: String::new(),
            ip: None,
        };
        let resp = check_in(State(state.clone()), Ok(Json(req))).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(state.metrics.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn rejection_in_known_group_is_counted() {
        let state = test_state();
        state
            .catalog
            .add_application(&Application {
                id: "app".into(),
                name: "app".into(),
                description: String::new(),
                created_at: 0,
            })
            .unwrap();
        state
            .catalog
            .add_channel(&Channel {
                id: "stable".into(),
                name: "stable".into(),
                application_id: "app".into(),
                arch: Arch::Amd64,
                package_id: None,
                created_at: 0,
            })
            .unwrap();
        state
            .catalog
            .add_group(&Group {
                id: "prod".into(),
                name: "prod".into(),
                application_id: "app".into(),
                channel_id: "stable".into(),
                policy: RolloutPolicy::default(),
                created_at: 0,
            })
            .unwrap();

        let req = CheckInRequest {
            instance_id: "i-1".into(),
            app_id: "other".into(),
            group_id: "prod".into(),
            version: "1.0.0".into(),
            arch: String::new(),
            ip: None,
        };
        let resp = check_in(State(state.clone()), Ok(Json(req))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let counters = state.metrics.snapshot().await;
        assert_eq!(counters.len(), 1);
        assert_eq!(counters[0].group_id, "prod");
        assert_eq!(counters[0].rejected, 1);
    }

    #[tokio::test]
    async fn event_for_unknown_instance_is_not_found() {
        let state = test_state();
        let req = EventRequest {
            instance_id: "i-1".into(),
            app_id: "app".into(),
            version: "2.0.0".into(),
            event_type: WireCode::Code(13),
            result: WireCode::Code(1),
        };
        let resp = event(State(state), Ok(Json(req))).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn event_with_unknown_type_is_bad_request() {
        let state = test_state();
        let req = EventRequest {
            instance_id: "i-1".into(),
            app_id: "app".into(),
            version: "2.0.0".into(),
            event_type: WireCode::Code(99),
            result: WireCode::Code(1),
        };
        let resp = event(State(state), Ok(Json(req))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
