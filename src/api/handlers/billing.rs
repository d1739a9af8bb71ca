use crate::api::models::billing::{BreakdownResponse, CurrentBillingResponse, SnapshotResponse};
use crate::api::AppState;
use crate::error::AppError;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::error;

/// Resolve the `home_id` parameter, falling back to the default home.
/// Homes the engine does not own are reported as not found.
fn home_param(state: &AppState, params: &HashMap<String, String>) -> Result<String, StatusCode> {
    let home_id = params
        .get("home_id")
        .cloned()
        .unwrap_or_else(|| state.default_home.clone());
    if state.accumulator.has_home(&home_id) {
        Ok(home_id)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

fn time_param(
    params: &HashMap<String, String>,
    key: &str,
) -> Option<Result<DateTime<Utc>, StatusCode>> {
    params.get(key).map(|s| {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| StatusCode::BAD_REQUEST)
    })
}

pub async fn get_current(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<CurrentBillingResponse>, StatusCode> {
    let home_id = home_param(&state, &params)?;
    let current = state
        .calculator
        .latest(&home_id)
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(current.into()))
}

pub async fn get_history(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<SnapshotResponse>>, StatusCode> {
    let home_id = home_param(&state, &params)?;
    let from = time_param(&params, "from").ok_or(StatusCode::BAD_REQUEST)??;
    let to = time_param(&params, "to").transpose()?.unwrap_or_else(Utc::now);
    if from > to {
        return Err(StatusCode::BAD_REQUEST);
    }

    let snapshots = state
        .store
        .snapshot_history(&home_id, from, to)
        .await
        .map_err(|e| {
            error!(home_id = %home_id, error = %e, "failed to load snapshot history");
            if e.is_transient() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        })?;

    Ok(Json(snapshots.into_iter().map(Into::into).collect()))
}

pub async fn get_breakdown(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<BreakdownResponse>, StatusCode> {
    let home_id = home_param(&state, &params)?;
    let breakdown = state
        .calculator
        .today_breakdown(&home_id, Utc::now())
        .await
        .map_err(|e| match e.root() {
            AppError::Lookup(_) => StatusCode::NOT_FOUND,
            _ => {
                error!(home_id = %home_id, error = %e, "failed to compute breakdown");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        })?;

    Ok(Json(BreakdownResponse::new(home_id, breakdown)))
}
