use crate::state::AppState;
use axum::extract::State;
use axum::Json;

/// GET /_routes — the full route table as JSON, one entry per registered
/// action. Diagnostic only; the table never changes after startup.
pub async fn list_routes(State(app): State<AppState>) -> Json<serde_json::Value> {
    let routes: Vec<serde_json::Value> = app
        .table
        .actions()
        .iter()
        .map(|a| {
            serde_json::json!({
                "route": a.route,
                "package": a.package,
                "action": a.name,
                "entrypoint": a.entrypoint,
                "timeout": a.timeout_ms,
            })
        })
        .collect();
    Json(serde_json::Value::Array(routes))
}
