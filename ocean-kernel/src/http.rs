/**
 * PLAN DE CONTRÔLE HTTP - Routes Axum du kernel
 *
 * RÔLE : Expose le moteur aux opérateurs : état de santé, commandes en
 * masse, planification, journaux et alertes. Chaque réponse porte
 * { ok, payload } ou { ok: false, error, message }.
 *
 * Les vagues de commandes répondent 200 avec le détail par équipement ;
 * seule une cible irrésoluble donne 400 et la contre-pression 503.
 */

use crate::manager::ManagerError;
use crate::models::{DeviceStatus, Outcome, ScheduledJob, Target, Trigger};
use crate::scheduler::SchedulerError;
use crate::Engine;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use time::macros::format_description;

type AppState = Arc<Engine>;
type ApiError = (StatusCode, Json<Value>);
type ApiResult = Result<Json<Value>, ApiError>;

pub fn build_router(engine: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/devices", get(list_devices))
        .route("/devices/all/{action}", post(bulk_all))
        .route("/devices/{id}/{action}", post(device_action))
        .route("/groups", get(list_groups))
        .route("/groups/status", get(groups_status))
        .route("/groups/{id}/{action}", post(group_action))
        .route("/schedule", get(list_schedule).post(upsert_schedule))
        .route("/schedule/{job_id}", delete(delete_schedule))
        .route("/schedule/{job_id}/trigger", post(trigger_schedule))
        .route("/logs", get(query_logs))
        .route("/logs/export", get(export_logs))
        .route("/alerts", get(recent_alerts))
        .with_state(engine)
}

fn ok(payload: Value) -> Json<Value> {
    Json(json!({ "ok": true, "payload": payload }))
}

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(json!({ "ok": false, "error": code, "message": message.into() })),
    )
}

fn manager_error(err: ManagerError) -> ApiError {
    match err {
        ManagerError::Validation(target) => api_error(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            format!("unresolvable target: {target}"),
        ),
        ManagerError::Busy => api_error(StatusCode::SERVICE_UNAVAILABLE, "BUSY", "engine busy"),
    }
}

fn scheduler_error(err: SchedulerError) -> ApiError {
    match err {
        SchedulerError::InvalidCron(..) | SchedulerError::InvalidAction => {
            api_error(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", err.to_string())
        }
        SchedulerError::UnknownJob(_) => {
            api_error(StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string())
        }
        SchedulerError::Persistence(_) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "PERSISTENCE_ERROR",
            err.to_string(),
        ),
    }
}

fn parse_power_action(action: &str) -> Result<bool, ApiError> {
    match action {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(api_error(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            format!("unknown action: {other}"),
        )),
    }
}

// GET /health
async fn health(State(engine): State<AppState>) -> Json<Value> {
    ok(json!({
        "devices_total": engine.registry.len(),
        "devices_online": engine.monitor.online_count(),
        "success_rate": engine.action_log.success_rate_24h(),
        "scheduler_running": engine.scheduler.is_running(),
    }))
}

// GET /devices
async fn list_devices(State(engine): State<AppState>) -> Json<Value> {
    let snapshot = engine.monitor.snapshot();
    let views: Vec<Value> = engine
        .registry
        .all()
        .iter()
        .map(|device| {
            let status = snapshot
                .iter()
                .find(|s| s.device_id == device.id)
                .map_or(DeviceStatus::Unknown, |s| s.current_status);
            json!({
                "id": device.id,
                "name": device.name,
                "type": device.device_type,
                "host": device.host,
                "port": device.effective_port(),
                "group_ids": device.group_ids,
                "status": status,
            })
        })
        .collect();
    ok(json!(views))
}

async fn run_bulk(engine: &Engine, target: Target, on: bool) -> ApiResult {
    let result = if on {
        engine.manager.turn_on(&target, Trigger::Api).await
    } else {
        engine.manager.turn_off(&target, Trigger::Api).await
    };
    let report = result.map_err(manager_error)?;
    Ok(ok(serde_json::to_value(&report).unwrap_or(Value::Null)))
}

// POST /devices/all/{on|off}
async fn bulk_all(State(engine): State<AppState>, Path(action): Path<String>) -> ApiResult {
    let on = parse_power_action(&action)?;
    run_bulk(&engine, Target::All, on).await
}

// POST /devices/{id}/{on|off}
async fn device_action(
    State(engine): State<AppState>,
    Path((id, action)): Path<(String, String)>,
) -> ApiResult {
    let on = parse_power_action(&action)?;
    run_bulk(&engine, Target::Device(id), on).await
}

// GET /groups
async fn list_groups(State(engine): State<AppState>) -> Json<Value> {
    let views: Vec<Value> = engine
        .registry
        .groups()
        .iter()
        .map(|group| {
            json!({
                "id": group.id,
                "name": group.name,
                "device_ids": group.device_ids,
            })
        })
        .collect();
    ok(json!(views))
}

// GET /groups/status
async fn groups_status(State(engine): State<AppState>) -> Json<Value> {
    let snapshot = engine.monitor.snapshot();
    let status_of = |device_id: &str| {
        snapshot
            .iter()
            .find(|s| s.device_id == device_id)
            .map_or(DeviceStatus::Unknown, |s| s.current_status)
    };
    let views: Vec<Value> = engine
        .registry
        .groups()
        .iter()
        .map(|group| {
            let online = group
                .device_ids
                .iter()
                .filter(|id| status_of(id) == DeviceStatus::Online)
                .count();
            let offline = group
                .device_ids
                .iter()
                .filter(|id| status_of(id) == DeviceStatus::Offline)
                .count();
            json!({
                "id": group.id,
                "name": group.name,
                "total": group.device_ids.len(),
                "online": online,
                "offline": offline,
            })
        })
        .collect();
    ok(json!(views))
}

// POST /groups/{id}/{on|off}
async fn group_action(
    State(engine): State<AppState>,
    Path((id, action)): Path<(String, String)>,
) -> ApiResult {
    let on = parse_power_action(&action)?;
    run_bulk(&engine, Target::Group(id), on).await
}

// GET /schedule
async fn list_schedule(State(engine): State<AppState>) -> Json<Value> {
    let jobs = engine.scheduler.jobs();
    ok(serde_json::to_value(&jobs).unwrap_or(Value::Null))
}

// POST /schedule (création ou remplacement)
async fn upsert_schedule(
    State(engine): State<AppState>,
    Json(job): Json<ScheduledJob>,
) -> ApiResult {
    let stored = engine.scheduler.upsert_job(job).map_err(scheduler_error)?;
    Ok(ok(serde_json::to_value(&stored).unwrap_or(Value::Null)))
}

// DELETE /schedule/{job_id}
async fn delete_schedule(
    State(engine): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult {
    engine
        .scheduler
        .delete_job(&job_id)
        .map_err(scheduler_error)?;
    Ok(ok(json!({ "deleted": job_id })))
}

// POST /schedule/{job_id}/trigger
async fn trigger_schedule(
    State(engine): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult {
    let report = engine
        .scheduler
        .trigger_now(&job_id)
        .await
        .map_err(scheduler_error)?;
    Ok(ok(serde_json::to_value(&report).unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    date: Option<String>,
    level: Option<String>,
    page: Option<usize>,
}

fn parse_date(raw: Option<&str>) -> Result<time::Date, ApiError> {
    let format = format_description!("[year]-[month]-[day]");
    match raw {
        None => Ok(time::OffsetDateTime::now_utc().date()),
        Some(text) => time::Date::parse(text, &format).map_err(|_| {
            api_error(
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                format!("invalid date: {text}"),
            )
        }),
    }
}

// GET /logs?date=YYYY-MM-DD&level=…&page=N
async fn query_logs(
    State(engine): State<AppState>,
    Query(params): Query<LogsQuery>,
) -> ApiResult {
    let date = parse_date(params.date.as_deref())?;
    let outcome = match params.level.as_deref() {
        None | Some("") => None,
        Some(level) => Some(
            serde_json::from_value::<Outcome>(Value::String(level.to_string())).map_err(|_| {
                api_error(
                    StatusCode::BAD_REQUEST,
                    "VALIDATION_ERROR",
                    format!("unknown level: {level}"),
                )
            })?,
        ),
    };
    let records = engine
        .action_log
        .query(date, outcome, params.page.unwrap_or(1))
        .await;
    Ok(ok(serde_json::to_value(&records).unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    date: Option<String>,
}

// GET /logs/export
async fn export_logs(
    State(engine): State<AppState>,
    Query(params): Query<ExportQuery>,
) -> Result<String, ApiError> {
    let date = parse_date(params.date.as_deref())?;
    engine.action_log.export(date).await.ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "no action log for that date",
        )
    })
}

#[derive(Debug, Deserialize)]
struct AlertsQuery {
    hours: Option<u64>,
}

// GET /alerts?hours=N
async fn recent_alerts(
    State(engine): State<AppState>,
    Query(params): Query<AlertsQuery>,
) -> Json<Value> {
    let alerts = engine.reports.alerts_since(params.hours.unwrap_or(24));
    ok(serde_json::to_value(&alerts).unwrap_or(Value::Null))
}
