//! # Ingress
//!
//! The HTTP surface a node exposes to its peers: `POST /event`, `GET
//! /state`, `GET /discovery`. Router assembly follows the teacher's
//! `create_router` — `tower_http` trace/CORS/timeout layers wrapping a
//! small handler set — generalized from Kafka/Redis streaming endpoints to
//! this crate's three routes.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::config::NeighborConfig;
use crate::engine::Engine;
use crate::event::Event;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub neighbors: Arc<Vec<NeighborConfig>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/event", post(post_event))
        .route("/state", get(get_state))
        .route("/discovery", get(get_discovery))
        .layer(
            tower::ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(Duration::from_secs(5)))
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// `POST /event` — decode, validate minimally, append (spec §4.2).
async fn post_event(State(state): State<AppState>, body: axum::body::Bytes) -> impl IntoResponse {
    let event: Event = match serde_json::from_slice(&body) {
        Ok(e) => e,
        Err(e) => {
            debug!(error = %e, "malformed event body");
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ErrorBody {
                    error: format!("invalid event JSON: {e}"),
                }),
            )
                .into_response();
        }
    };

    if let Err(e) = validate_event(&event, &state.engine) {
        debug!(error = %e, "event failed minimal validation");
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorBody { error: e }),
        )
            .into_response();
    }

    match state.engine.ingest(event) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) if e.is_wire_visible() => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorBody { error: e.to_string() }),
        )
            .into_response(),
        Err(e) => {
            // Overflow/transport-class errors never reach the wire (spec
            // §7 propagation policy); this arm should be unreachable for
            // `ingest`, which only returns validation-class errors.
            debug!(error = %e, "unexpected ingest error");
            StatusCode::OK.into_response()
        }
    }
}

fn validate_event(event: &Event, engine: &Engine) -> Result<(), String> {
    if event.event_type.trim().is_empty() {
        return Err("event_type must not be empty".to_string());
    }
    if event.destination != engine.config().name {
        return Err(format!(
            "destination {:?} does not match this node ({:?})",
            event.destination,
            engine.config().name
        ));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct StateResponse {
    fsm_state: crate::fsm::FsmState,
    queue_stats: crate::engine::QueueStats,
    host_state: serde_json::Value,
}

/// `GET /state` (spec §4.2/§6.2).
async fn get_state(State(state): State<AppState>) -> impl IntoResponse {
    Json(StateResponse {
        fsm_state: state.engine.fsm_state(),
        queue_stats: state.engine.queue_stats(),
        host_state: state.engine.host_state_snapshot(),
    })
}

#[derive(Debug, Serialize)]
struct DiscoveryResponse {
    name: String,
    address: String,
    port: u16,
    neighbors: Vec<NeighborConfig>,
}

/// `GET /discovery` — static neighbor table sourced from config (spec
/// §4.2/§6.2; SPEC_FULL.md §10: not a dynamic registry).
async fn get_discovery(State(state): State<AppState>) -> impl IntoResponse {
    let cfg = state.engine.config();
    Json(DiscoveryResponse {
        name: cfg.name.clone(),
        address: cfg.address.clone(),
        port: cfg.port,
        neighbors: (*state.neighbors).clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::NoopHost;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use std::sync::Arc as StdArc;
    use tower::ServiceExt;

    async fn test_app() -> Router {
        let mut cfg = crate::config::NodeConfig::default();
        cfg.name = "node-under-test".to_string();
        let host = StdArc::new(NoopHost);
        let engine = crate::engine::Engine::new(cfg, host.clone(), host).unwrap();
        router(AppState {
            engine,
            neighbors: StdArc::new(vec![]),
        })
    }

    #[tokio::test]
    async fn post_event_rejects_malformed_json() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/event")
                    .header("content-type", "application/json")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn post_event_rejects_wrong_destination() {
        let app = test_app().await;
        let event = Event::new("peer", "1.2.3.4", 1, "someone-else", "5.6.7.8", 2, "ping", json!(null));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/event")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&event).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn post_event_accepts_matching_destination() {
        let app = test_app().await;
        let event = Event::new("peer", "1.2.3.4", 1, "node-under-test", "5.6.7.8", 2, "ping", json!(null));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/event")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&event).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_state_reports_fsm_state_and_queue_stats() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::builder().uri("/state").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_discovery_reports_node_identity() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::builder().uri("/discovery").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
