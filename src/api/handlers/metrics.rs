use crate::api::AppState;
use crate::metrics::MetricsSnapshot;
use axum::{extract::State, response::Json};

pub async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}
