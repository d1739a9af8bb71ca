use crate::accumulator::EnergyAccumulator;
use crate::api::handlers::{billing, health, metrics};
use crate::billing::BillingCalculator;
use crate::metrics::EngineMetrics;
use crate::store::Store;
use axum::{extract::Request, routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::Level;

#[derive(Clone)]
pub struct AppState {
    pub calculator: Arc<BillingCalculator>,
    pub accumulator: Arc<EnergyAccumulator>,
    pub store: Arc<dyn Store>,
    pub metrics: Arc<EngineMetrics>,
    /// Home used when a request names none
    pub default_home: String,
}

pub fn create_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health::health))
        .route("/metrics", get(metrics::get_metrics));

    let billing_routes = Router::new()
        .route("/billing/current", get(billing::get_current))
        .route("/billing/history", get(billing::get_history))
        .route("/billing/breakdown", get(billing::get_breakdown));

    Router::new()
        .merge(public_routes)
        .merge(billing_routes)
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request| {
                    tracing::span!(
                        Level::INFO,
                        "http_request",
                        method = %request.method(),
                        uri = %request.uri(),
                    )
                })
                .on_request(|_request: &Request, _span: &tracing::Span| {
                    tracing::event!(Level::DEBUG, "received request");
                })
                .on_response(
                    |_response: &axum::response::Response,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::event!(Level::INFO, latency = ?latency, "request completed");
                    },
                )
                .on_failure(
                    |_error: tower_http::classify::ServerErrorsFailureClass,
                     _latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::event!(Level::ERROR, "request failed");
                    },
                ),
        )
}
