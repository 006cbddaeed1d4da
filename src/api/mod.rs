use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::backup::runner::{CheckReport, StatusEntry};
use crate::backup::Runner;
use crate::storage::RunRecord;
use crate::utils::log_buffer::LogEntry;

pub type AppState = Arc<Runner>;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(get_status))
        .route("/check", get(get_check))
        .route("/associations", get(get_associations))
        .route("/logs", get(get_logs))
        .route("/history", get(get_history))
}

#[derive(Serialize)]
pub struct StatusResponse {
    points: Vec<StatusEntry>,
    #[serde(rename = "collectPoints")]
    collect_points: usize,
    #[serde(rename = "backupPoints")]
    backup_points: usize,
}

#[derive(Serialize)]
pub struct Association {
    collect: String,
    backups: Vec<String>,
}

#[derive(Deserialize)]
pub struct LimitQuery {
    limit: Option<usize>,
}

pub async fn get_status(State(runner): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        points: runner.status().await,
        collect_points: runner.collect_points().len(),
        backup_points: runner.backup_points().len(),
    })
}

pub async fn get_check(State(runner): State<AppState>) -> Json<CheckReport> {
    Json(runner.check(Utc::now()).await)
}

pub async fn get_associations(State(runner): State<AppState>) -> Json<Vec<Association>> {
    let associations = runner
        .associations()
        .into_iter()
        .map(|(collect, backups)| Association { collect, backups })
        .collect();
    Json(associations)
}

/// Output of the last pass run by this process.
pub async fn get_logs(
    State(runner): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Json<Vec<LogEntry>> {
    Json(runner.log().get_logs(Some(query.limit.unwrap_or(100))))
}

pub async fn get_history(
    State(runner): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<RunRecord>>, (StatusCode, String)> {
    let Some(history) = runner.history() else {
        return Err((StatusCode::NOT_FOUND, "run history needs a database_url".to_string()));
    };
    let limit = query.limit.unwrap_or(20) as i64;
    history
        .recent_runs(limit)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)))
}
