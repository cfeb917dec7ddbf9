mod ws;

use axum::{
    extract::{FromRequest, FromRequestParts, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::{
    adapters::ToolRequest,
    ai::{AiAnalysis, AiInsights, AiStatus, EnhancedRecommendations},
    error::{LabError, LabResult},
    models::{recommendations_from, NewScan, ScanRecord, ScanStatus, ScanType, ToolKind, ToolResult},
    registry::{ScanFilter, DEFAULT_LIST_LIMIT},
    security::check_scope,
    tasks::ToolTask,
    AppState,
};

#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(LabError))]
pub struct LabJson<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(LabError))]
pub struct LabPath<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(LabError))]
pub struct LabQuery<T>(pub T);

pub fn router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/scans", get(list_scans).post(create_scan))
        .route("/scans/{id}", get(get_scan).delete(delete_scan))
        .route("/scans/{id}/stop", post(stop_scan))
        .route("/scans/{id}/results", get(scan_results))
        .route("/scans/{id}/recommendations", get(scan_recommendations))
        .route("/tools/available", get(available_tools))
        .route("/tools/status/{task_id}", get(tool_status))
        .route("/tools/{tool_kind}", post(run_tool))
        .route("/ai/status", get(ai_status))
        .route("/ai/analyze/{scan_id}", post(ai_analyze))
        .route("/ai/insights/{scan_id}", get(ai_insights))
        .route("/ai/generate-report/{scan_id}", post(ai_generate_report))
        .route(
            "/ai/enhance-recommendations/{scan_id}",
            post(ai_enhance_recommendations),
        );

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws::websocket_handler))
        .nest("/api/v1", v1)
        .with_state(state)
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "pentestlab-rs",
        "active_scans": state.scheduler.active_count().await,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateScanRequest {
    name: Option<String>,
    target: Option<String>,
    scan_type: Option<ScanType>,
}

async fn create_scan(
    State(state): State<AppState>,
    LabJson(req): LabJson<CreateScanRequest>,
) -> LabResult<(StatusCode, Json<ScanRecord>)> {
    let spec = NewScan {
        name: req.name.ok_or_else(|| LabError::validation("name is required"))?,
        target: req.target.ok_or_else(|| LabError::validation("target is required"))?,
        scan_type: req
            .scan_type
            .ok_or_else(|| LabError::validation("scan_type is required"))?,
    };
    let record = state.scheduler.submit(spec).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListScansQuery {
    limit: Option<i64>,
    skip: Option<i64>,
    status: Option<ScanStatus>,
    scan_type: Option<ScanType>,
}

async fn list_scans(
    State(state): State<AppState>,
    LabQuery(query): LabQuery<ListScansQuery>,
) -> LabResult<Json<Vec<ScanRecord>>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    if limit < 1 {
        return Err(LabError::validation("limit must be at least 1"));
    }
    if query.skip.is_some_and(|skip| skip < 0) {
        return Err(LabError::validation("skip must not be negative"));
    }
    let filter = ScanFilter {
        status: query.status,
        scan_type: query.scan_type,
        skip: query.skip.unwrap_or(0),
    };
    Ok(Json(state.registry.list(&filter, limit).await?))
}

async fn get_scan(
    State(state): State<AppState>,
    LabPath(id): LabPath<i64>,
) -> LabResult<Json<ScanRecord>> {
    Ok(Json(state.registry.get(id).await?))
}

async fn stop_scan(
    State(state): State<AppState>,
    LabPath(id): LabPath<i64>,
) -> LabResult<Json<ScanRecord>> {
    Ok(Json(state.scheduler.stop(id).await?))
}

async fn delete_scan(
    State(state): State<AppState>,
    LabPath(id): LabPath<i64>,
) -> LabResult<StatusCode> {
    state.scheduler.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn scan_results(
    State(state): State<AppState>,
    LabPath(id): LabPath<i64>,
) -> LabResult<Json<Vec<ToolResult>>> {
    Ok(Json(state.registry.get(id).await?.tool_results()))
}

async fn scan_recommendations(
    State(state): State<AppState>,
    LabPath(id): LabPath<i64>,
) -> LabResult<Json<Value>> {
    let scan = state.registry.get(id).await?;
    Ok(Json(json!({
        "scan_id": scan.id,
        "status": scan.status,
        "recommendations": recommendations_from(scan.parsed_data.as_ref()),
    })))
}

/// Runs one tool to completion outside the scan lifecycle. The run is
/// detached from the request so its status stays queryable if the client leaves.
async fn run_tool(
    State(state): State<AppState>,
    LabPath(tool_kind): LabPath<String>,
    LabJson(body): LabJson<Value>,
) -> LabResult<Json<ToolTask>> {
    let kind: ToolKind = tool_kind
        .parse()
        .map_err(|e: anyhow::Error| LabError::validation(e.to_string()))?;
    let request = ToolRequest::from_json(kind, body)?;
    request.adapter().validate()?;
    check_scope(kind, request.target(), &state.config.scope_allowlist)?;

    let invocation = state.runner.invoke(&request)?;
    let task = ToolTask::started(kind, invocation.command.clone());
    let task_id = task.task_id;
    info!(%task_id, tool = %kind, command = %task.command, "direct tool run started");
    state.tasks.record(task.clone()).await;

    let tasks = state.tasks.clone();
    let run = tokio::spawn(async move {
        let task = task.finished(invocation.finish().await);
        info!(%task_id, tool = %kind, status = ?task.status, "direct tool run finished");
        tasks.record(task.clone()).await;
        task
    });
    let task = run.await.map_err(|e| LabError::ToolExecution {
        tool: kind.to_string(),
        detail: format!("run task ended abnormally: {e}"),
    })?;
    Ok(Json(task))
}

async fn tool_status(
    State(state): State<AppState>,
    LabPath(task_id): LabPath<Uuid>,
) -> LabResult<Json<ToolTask>> {
    state
        .tasks
        .get(task_id)
        .await
        .map(Json)
        .ok_or_else(|| LabError::NotFound(format!("task {task_id}")))
}

async fn available_tools(State(state): State<AppState>) -> Json<Value> {
    let tools: Vec<Value> = ToolKind::ALL
        .into_iter()
        .map(|kind| {
            json!({
                "name": kind,
                "description": kind.description(),
                "category": kind.category(),
                "path": state.runner.tools().path_for(kind),
            })
        })
        .collect();
    Json(json!({ "tools": tools }))
}

async fn ai_status(State(state): State<AppState>) -> Json<AiStatus> {
    Json(state.insights.status())
}

async fn ai_analyze(
    State(state): State<AppState>,
    LabPath(scan_id): LabPath<i64>,
) -> LabResult<Json<AiAnalysis>> {
    Ok(Json(state.insights.analyze(scan_id).await?))
}

async fn ai_insights(
    State(state): State<AppState>,
    LabPath(scan_id): LabPath<i64>,
) -> LabResult<Json<AiInsights>> {
    Ok(Json(state.insights.insights(scan_id).await?))
}

async fn ai_generate_report(
    State(state): State<AppState>,
    LabPath(scan_id): LabPath<i64>,
) -> LabResult<Json<Value>> {
    Ok(Json(state.insights.generate_report(scan_id).await?))
}

async fn ai_enhance_recommendations(
    State(state): State<AppState>,
    LabPath(scan_id): LabPath<i64>,
) -> LabResult<Json<EnhancedRecommendations>> {
    Ok(Json(state.insights.enhance_recommendations(scan_id).await?))
}
