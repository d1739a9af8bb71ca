use axum::response::Json;
use serde_json::{json, Value};

/// Liveness only; does not touch the store or the broker.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_reports_healthy() {
        let Json(body) = health().await;
        assert_eq!(body["status"], "healthy");
    }
}
