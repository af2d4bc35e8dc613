use crate::config::ApiConfig;
use crate::document_store::{DocumentStore, StoreError};
use crate::entries::{
    DowntimeEntry, Entry, FieldError, PackingEntry, ProductionEntry, RecordKind,
    ValidationErrors,
};
use crate::export::{ExportAppender, ExportError};
use crate::shift::{self, Shift};
use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub exporter: Arc<ExportAppender>,
}

/// Accepted submission
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub status: &'static str,
    pub id: String,
    pub shift: Shift,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Field-level validation failure body
#[derive(Debug, Serialize)]
pub struct ValidationResponse {
    pub detail: Vec<FieldError>,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid submission: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Export(#[from] ExportError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Validation(ValidationErrors(vec![FieldError::new(
            &["body"],
            "json_invalid",
            rejection.body_text(),
        )]))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Validation(errors) => {
                return (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Json(ValidationResponse {
                        detail: errors.0.clone(),
                    }),
                )
                    .into_response();
            }
            ApiError::Encode(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ENCODE_ERROR"),
            ApiError::Storage(StoreError::Unavailable(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "STORAGE_UNAVAILABLE")
            }
            ApiError::Storage(StoreError::Write(_) | StoreError::Migrate(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR")
            }
            ApiError::Export(_) => (StatusCode::INTERNAL_SERVER_ERROR, "EXPORT_ERROR"),
        };

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/", get(read_root))
        .route("/test", get(test_database))
        .route("/api/production", post(submit::<ProductionEntry>))
        .route("/api/packing", post(submit::<PackingEntry>))
        .route("/api/downtime", post(submit::<DowntimeEntry>))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn read_root() -> impl IntoResponse {
    Json(serde_json::json!({
        "message": "Production Daily Count Backend"
    }))
}

/// Liveness plus document store reachability; never fails
async fn test_database(State(state): State<AppState>) -> impl IntoResponse {
    let database = if state.store.ping().await {
        "Connected"
    } else {
        "Not Available"
    };

    Json(serde_json::json!({
        "backend": "Running",
        "database": database
    }))
}

/// Validate, bucket, persist, then export one submission
#[instrument(skip(state, payload), fields(kind = %E::KIND))]
async fn submit<E: Entry>(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let kind = E::KIND;

    let entry = payload
        .map_err(ApiError::from)
        .and_then(|Json(body)| E::from_json(&body).map_err(ApiError::from))
        .map_err(|e| {
            metrics::counter!("entries.rejected", "kind" => kind.tag()).increment(1);
            e
        })?;

    let info = shift::resolve(entry.timestamp());
    let document = entry.to_document(&info)?;

    let id = stage(kind, "store", state.store.insert(kind, document)).await?;

    let row = entry.export_row(&info, &id);
    let path = stage(
        kind,
        "export",
        state
            .exporter
            .append(info.sheet_name(kind.tag()), kind.columns(), row),
    )
    .await?;

    info!(
        document_id = %id,
        shift = %info.shift,
        bucket = %info.bucket_id,
        export = %path.display(),
        "Entry accepted"
    );
    metrics::counter!("entries.accepted", "kind" => kind.tag()).increment(1);

    Ok(Json(SubmitResponse {
        status: "ok",
        id,
        shift: info.shift,
    }))
}

/// Run one side-effecting step, logging and counting its failure
async fn stage<T, E, F>(kind: RecordKind, name: &'static str, step: F) -> Result<T, ApiError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<ApiError>,
{
    step.await.map_err(|e| {
        let e: ApiError = e.into();
        error!(error = %e, stage = name, "Entry submission failed");
        metrics::counter!("entries.failed", "kind" => kind.tag(), "stage" => name).increment(1);
        e
    })
}

/// Start the HTTP API server, returning once `shutdown` resolves and requests drain
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting floor entry API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document_store::MockDocumentStore;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn router_with(store: MockDocumentStore) -> (Router, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let state = AppState {
            store: Arc::new(store),
            exporter: Arc::new(ExportAppender::new(temp_dir.path()).unwrap()),
        };
        (create_router(state, &ApiConfig::default()), temp_dir)
    }

    async fn call(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let body = match body {
            Some(v) => Body::from(serde_json::to_string(&v).unwrap()),
            None => Body::empty(),
        };
        let resp = router.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    fn production(timestamp: &str, count: i64) -> Value {
        json!({
            "operator_name": "Asha",
            "operator_id": "OP-17",
            "operator_type": "Onrole",
            "test_type": "HV",
            "test_station": "ST-3",
            "device_type": "Inverter",
            "production_count": count,
            "timestamp": timestamp
        })
    }

    fn read_lines(dir: &TempDir, sheet: &str) -> Vec<String> {
        std::fs::read_to_string(dir.path().join(format!("{}.csv", sheet)))
            .unwrap()
            .lines()
            .map(|l| l.to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_root_message() {
        let (router, _dir) = router_with(MockDocumentStore::new());

        let (status, body) = call(&router, "GET", "/", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Production Daily Count Backend");
    }

    #[tokio::test]
    async fn test_diagnostic_reports_store_state() {
        let mut store = MockDocumentStore::new();
        store.expect_ping().times(1).returning(|| true);
        let (router, _dir) = router_with(store);

        let (status, body) = call(&router, "GET", "/test", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"backend": "Running", "database": "Connected"}));

        let mut store = MockDocumentStore::new();
        store.expect_ping().returning(|| false);
        let (router, _dir) = router_with(store);

        let (status, body) = call(&router, "GET", "/test", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["database"], "Not Available");
    }

    #[tokio::test]
    async fn test_production_first_shift() {
        let mut store = MockDocumentStore::new();
        store
            .expect_insert()
            .withf(|kind, document| {
                *kind == RecordKind::Production
                    && document["shift"] == "First"
                    && document["production_count"] == 5
            })
            .times(1)
            .returning(|_, _| Ok("665b1c0ffee".to_string()));
        let (router, dir) = router_with(store);

        let body = production("2024-06-01T10:00:00", 5);
        let (status, body) = call(&router, "POST", "/api/production", Some(body)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok", "id": "665b1c0ffee", "shift": "First"}));

        let lines = read_lines(&dir, "2024-06-01_First_production");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], RecordKind::Production.columns().join(","));
        assert_eq!(
            lines[1],
            "Asha,OP-17,Onrole,HV,ST-3,Inverter,5,2024-06-01T10:00:00,First,665b1c0ffee"
        );
    }

    #[tokio::test]
    async fn test_changeover_gap_accepted_as_off() {
        let mut store = MockDocumentStore::new();
        store
            .expect_insert()
            .times(1)
            .returning(|_, _| Ok("off-1".to_string()));
        let (router, dir) = router_with(store);

        let body = production("2024-06-01T15:27:00", 3);
        let (status, body) = call(&router, "POST", "/api/production", Some(body)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["shift"], "Off");

        let lines = read_lines(&dir, "2024-06-01_Off_production");
        assert_eq!(lines.len(), 2);
        assert!(lines[1].ends_with(",Off,off-1"));
    }

    #[tokio::test]
    async fn test_negative_count_rejected_before_persistence() {
        let mut store = MockDocumentStore::new();
        store.expect_insert().times(0);
        let (router, dir) = router_with(store);

        let body = production("2024-06-01T10:00:00", -1);
        let (status, body) = call(&router, "POST", "/api/production", Some(body)).await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["detail"][0]["loc"], json!(["body", "production_count"]));
        assert_eq!(body["detail"][0]["type"], "greater_than_equal");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_json_is_unprocessable() {
        let mut store = MockDocumentStore::new();
        store.expect_insert().times(0);
        let (router, _dir) = router_with(store);

        let req = Request::builder()
            .method("POST")
            .uri("/api/downtime")
            .header("content-type", "application/json")
            .body(Body::from("{\"operator_name\": "))
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_storage_failure_skips_export() {
        let mut store = MockDocumentStore::new();
        store
            .expect_insert()
            .times(1)
            .returning(|_, _| Err(StoreError::Write(sqlx::Error::PoolTimedOut)));
        let (router, dir) = router_with(store);

        let body = production("2024-06-01T10:00:00", 5);
        let (status, body) = call(&router, "POST", "/api/production", Some(body)).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "STORAGE_ERROR");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_export_failure_after_persist() {
        let mut store = MockDocumentStore::new();
        store
            .expect_insert()
            .times(1)
            .returning(|_, _| Ok("persisted-1".to_string()));
        let (router, dir) = router_with(store);
        // A directory where the sheet file belongs makes the append fail
        std::fs::create_dir(dir.path().join("2024-06-01_First_production.csv")).unwrap();

        let body = production("2024-06-01T10:00:00", 5);
        let (status, body) = call(&router, "POST", "/api/production", Some(body)).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "EXPORT_ERROR");
    }

    #[tokio::test]
    async fn test_schema_failure_is_storage_error() {
        let mut store = MockDocumentStore::new();
        store.expect_insert().times(1).returning(|_, _| {
            Err(StoreError::Migrate(sqlx::migrate::MigrateError::Execute(
                sqlx::Error::PoolTimedOut,
            )))
        });
        let (router, dir) = router_with(store);

        let body = production("2024-06-01T10:00:00", 5);
        let (status, body) = call(&router, "POST", "/api/production", Some(body)).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "STORAGE_ERROR");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_offset_timestamp_exported_with_offset() {
        let mut store = MockDocumentStore::new();
        store
            .expect_insert()
            .withf(|_, document| document["timestamp"] == "2024-06-01T10:00:00+05:30")
            .times(1)
            .returning(|_, _| Ok("tz-1".to_string()));
        let (router, dir) = router_with(store);

        let body = production("2024-06-01T10:00:00+05:30", 3);
        let (status, body) = call(&router, "POST", "/api/production", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["shift"], "First");

        let lines = read_lines(&dir, "2024-06-01_First_production");
        assert!(lines[1].ends_with(",3,2024-06-01T10:00:00+05:30,First,tz-1"));
    }

    #[tokio::test]
    async fn test_unconfigured_store_is_unavailable() {
        let mut store = MockDocumentStore::new();
        store
            .expect_insert()
            .returning(|_, _| Err(StoreError::Unavailable("no database configured".to_string())));
        let (router, _dir) = router_with(store);

        let body = json!({
            "operator_name": "Ravi",
            "description": "Conveyor jam",
            "timestamp": "2024-06-01T09:00:00"
        });
        let (status, body) = call(&router, "POST", "/api/downtime", Some(body)).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "STORAGE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_packing_and_downtime_buckets() {
        let mut store = MockDocumentStore::new();
        store
            .expect_insert()
            .withf(|kind, _| *kind == RecordKind::Packing)
            .returning(|_, _| Ok("pk-1".to_string()));
        store
            .expect_insert()
            .withf(|kind, _| *kind == RecordKind::Downtime)
            .returning(|_, _| Ok("dt-1".to_string()));
        let (router, dir) = router_with(store);

        let packing = json!({
            "operator_name": "Meena",
            "device_type": "Charger",
            "operator_type": "Apprentices",
            "job_type": "Boxing",
            "packing_count": 40,
            "timestamp": "2024-06-01T18:30:00"
        });
        let (status, body) = call(&router, "POST", "/api/packing", Some(packing)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["shift"], "Second");

        let downtime = json!({
            "operator_name": "Ravi",
            "description": "Power cut, line 2",
            "timestamp": "2024-06-02T02:10:00"
        });
        let (status, body) = call(&router, "POST", "/api/downtime", Some(downtime)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["shift"], "Off");

        let packing_lines = read_lines(&dir, "2024-06-01_Second_packing");
        assert_eq!(packing_lines[0], RecordKind::Packing.columns().join(","));
        assert!(packing_lines[1].ends_with(",Second,pk-1"));

        let downtime_lines = read_lines(&dir, "2024-06-02_Off_downtime");
        assert_eq!(
            downtime_lines[1],
            "Ravi,\"Power cut, line 2\",2024-06-02T02:10:00,Off,dt-1"
        );
    }

    #[tokio::test]
    async fn test_repeated_submissions_share_one_header() {
        let mut store = MockDocumentStore::new();
        let mut next = 0;
        store.expect_insert().times(5).returning(move |_, _| {
            next += 1;
            Ok(format!("id-{}", next))
        });
        let (router, dir) = router_with(store);

        for minute in 0..5 {
            let ts = format!("2024-06-01T16:0{}:00", minute);
            let body = production(&ts, 1);
            let (status, _) = call(&router, "POST", "/api/production", Some(body)).await;
            assert_eq!(status, StatusCode::OK);
        }

        let lines = read_lines(&dir, "2024-06-01_Second_production");
        assert_eq!(lines.len(), 6);
        assert_eq!(lines.iter().filter(|l| l.starts_with("operator_name")).count(), 1);
        assert!(lines[5].ends_with(",Second,id-5"));
    }
}
