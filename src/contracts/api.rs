use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, info};

use super::coerce::normalize_boolean;
#[cfg(test)]
use super::db::ContractDb;
use super::db::DbHandle;
use super::models::{ContractQuery, NewEmployee, NewProcess, NewProcessRecord, NewProductType};
use crate::errors::ContractError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
}

pub type SharedState = Arc<AppState>;

// ── Response envelope ─────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl<T: Serialize> Envelope<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            message: None,
            meta: None,
        })
    }

    fn with_message(data: T, message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            message: Some(message.into()),
            meta: None,
        })
    }
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    Contract(ContractError),
    BadRequest(String),
}

impl From<ContractError> for ApiError {
    fn from(err: ContractError) -> Self {
        ApiError::Contract(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, meta) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            ApiError::Contract(err) => match &err {
                ContractError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
                ContractError::DuplicateContractNumber { .. }
                | ContractError::DuplicateCode { .. } => (StatusCode::CONFLICT, err.to_string(), None),
                ContractError::ContractNotFound { .. } => {
                    (StatusCode::NOT_FOUND, err.to_string(), None)
                }
                ContractError::ProductInUse {
                    product_ids,
                    reference_count,
                } => (
                    StatusCode::BAD_REQUEST,
                    err.to_string(),
                    Some(json!({"productIds": product_ids, "referenceCount": reference_count})),
                ),
                ContractError::ContractInUse {
                    product_ids,
                    process_record_count,
                } => (
                    StatusCode::BAD_REQUEST,
                    err.to_string(),
                    Some(json!({
                        "productIds": product_ids,
                        "processRecordCount": process_record_count
                    })),
                ),
                ContractError::Database(_) | ContractError::LockPoisoned | ContractError::Other(_) => {
                    error!(error = ?err, "Request failed");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error".to_string(),
                        None,
                    )
                }
            },
        };
        let body = Envelope::<()> {
            success: false,
            data: None,
            message: Some(message),
            meta,
        };
        (status, Json(body)).into_response()
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct DeleteParams {
    pub force: Option<String>,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/contracts", get(list_contracts).post(create_contract))
        .route("/api/contracts/import", post(import_contracts))
        .route(
            "/api/contracts/{id}",
            get(get_contract).put(update_contract).delete(delete_contract),
        )
        .route("/api/employees", get(list_employees).post(create_employee))
        .route("/api/processes", get(list_processes).post(create_process))
        .route(
            "/api/product-types",
            get(list_product_types).post(create_product_type),
        )
        .route("/api/process-records", post(create_process_record))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_contracts(
    State(state): State<SharedState>,
    query: Result<Query<ContractQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query?;
    let page = state
        .db
        .call(move |db| Ok(db.list_contracts(&query)?))
        .await?;
    Ok(Envelope::ok(page))
}

async fn get_contract(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let contract = state.db.call(move |db| Ok(db.get_contract(id)?)).await?;
    match contract {
        Some(contract) => Ok(Envelope::ok(json!({ "contract": contract }))),
        None => Err(ContractError::ContractNotFound { id }.into()),
    }
}

async fn create_contract(
    State(state): State<SharedState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(payload) = payload?;
    let contract = state.db.call(move |db| db.create_contract(payload)).await?;
    Ok((
        StatusCode::CREATED,
        Envelope::with_message(json!({ "contract": contract }), "Contract created"),
    ))
}

async fn update_contract(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(payload) = payload?;
    let contract = state
        .db
        .call(move |db| db.update_contract(id, payload))
        .await?;
    Ok(Envelope::with_message(
        json!({ "contract": contract }),
        "Contract updated",
    ))
}

/// `force` may come from the query string or a JSON body.
async fn delete_contract(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    params: Result<Query<DeleteParams>, QueryRejection>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let Query(params) = params?;
    let force = params
        .force
        .map(Value::String)
        .as_ref()
        .and_then(normalize_boolean)
        .or_else(|| force_from_body(&body))
        .unwrap_or(false);
    let summary = state
        .db
        .call(move |db| db.delete_contract(id, force))
        .await?;
    Ok(Envelope::with_message(summary, "Contract deleted"))
}

fn force_from_body(body: &[u8]) -> Option<bool> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    let value: Value = serde_json::from_slice(body).ok()?;
    value.get("force").and_then(normalize_boolean)
}

async fn import_contracts(
    State(state): State<SharedState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(payload) = payload?;
    let report = state.db.call(move |db| db.import_contracts(payload)).await?;
    info!(
        imported = report.success_count,
        failed = report.failure_count,
        "Import request handled"
    );
    let message = format!(
        "Imported {} contracts, {} failed",
        report.success_count, report.failure_count
    );
    Ok(Json(Envelope {
        success: report.is_clean(),
        data: Some(report),
        message: Some(message),
        meta: None,
    }))
}

async fn list_employees(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let employees = state.db.call(|db| Ok(db.list_employees()?)).await?;
    Ok(Envelope::ok(employees))
}

async fn create_employee(
    State(state): State<SharedState>,
    payload: Result<Json<NewEmployee>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(new) = payload?;
    let employee = state.db.call(move |db| db.create_employee(&new)).await?;
    Ok((StatusCode::CREATED, Envelope::ok(employee)))
}

async fn list_processes(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let processes = state.db.call(|db| Ok(db.list_processes()?)).await?;
    Ok(Envelope::ok(processes))
}

async fn create_process(
    State(state): State<SharedState>,
    payload: Result<Json<NewProcess>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(new) = payload?;
    let process = state.db.call(move |db| db.create_process(&new)).await?;
    Ok((StatusCode::CREATED, Envelope::ok(process)))
}

async fn list_product_types(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let types = state.db.call(|db| Ok(db.list_product_types()?)).await?;
    Ok(Envelope::ok(types))
}

async fn create_product_type(
    State(state): State<SharedState>,
    payload: Result<Json<NewProductType>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(new) = payload?;
    let detail = state
        .db
        .call(move |db| db.create_product_type(&new))
        .await?;
    Ok((StatusCode::CREATED, Envelope::ok(detail)))
}

async fn create_process_record(
    State(state): State<SharedState>,
    payload: Result<Json<NewProcessRecord>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(new) = payload?;
    let record = state
        .db
        .call(move |db| db.create_process_record(&new))
        .await?;
    Ok((StatusCode::CREATED, Envelope::ok(record)))
}

// ── Tests ─────────────────────────────────────────────────────────────
