// Receipt Ledger - Web Server
// REST API with Axum over the blocking bill service

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use receipt_ledger::{
    BillService, Cancellation, Config, Error, Expense, FixedTextRecognizer,
    GoogleVisionRecognizer, Recognizer, SqliteStore, StoreError, MAX_UPLOAD_BYTES,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    service: Arc<BillService>,
    config: Arc<Config>,
}

impl AppState {
    fn cancellation(&self) -> Cancellation {
        Cancellation::with_timeout(self.config.request_timeout)
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Response {
        (
            StatusCode::OK,
            Json(ApiResponse {
                success: true,
                data: Some(data),
                error: None,
            }),
        )
            .into_response()
    }
}

fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::Input(_) => StatusCode::BAD_REQUEST,
        Error::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::NoTextDetected => StatusCode::UNPROCESSABLE_ENTITY,
        Error::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Cancelled => StatusCode::REQUEST_TIMEOUT,
        Error::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
        Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        error!(error = %err, "Request failed");
    }

    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(err.to_string()),
        }),
    )
        .into_response()
}

/// Run a blocking service call off the async workers
async fn blocking<T, F>(f: F) -> Response
where
    T: Serialize + Send + 'static,
    F: FnOnce() -> receipt_ledger::Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(data)) => ApiResponse::ok(data),
        Ok(Err(err)) => error_response(err),
        Err(join_err) => {
            error!(error = %join_err, "Blocking task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    ApiResponse::ok("OK")
}

/// POST /api/bills - Upload a receipt (multipart field "bill") and process it
async fn upload_bill(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let mut upload = None;

    loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("bill") => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let file_type = field.content_type().unwrap_or("application/octet-stream").to_string();
                match field.bytes().await {
                    Ok(bytes) => upload = Some((file_name, file_type, bytes)),
                    Err(e) => return error_response(Error::Input(e.to_string())),
                }
            }
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => return error_response(Error::Input(e.to_string())),
        }
    }

    let Some((file_name, file_type, bytes)) = upload else {
        return error_response(Error::Input("missing form field \"bill\"".to_string()));
    };

    info!(file_name = %file_name, size = bytes.len(), "Received bill upload");

    let cancel = state.cancellation();
    blocking(move || state.service.upload_bill(&file_name, &file_type, &bytes, &cancel)).await
}

/// GET /api/bills/:id
async fn get_bill(State(state): State<AppState>, Path(bill_id): Path<String>) -> Response {
    blocking(move || state.service.get_bill(&bill_id)).await
}

/// PUT /api/bills/:id/expenses/:expense_id - Edit one staged item
async fn update_staged_item(
    State(state): State<AppState>,
    Path((bill_id, expense_id)): Path<(String, String)>,
    Json(expense): Json<Expense>,
) -> Response {
    let cancel = state.cancellation();
    blocking(move || {
        state
            .service
            .update_staged_item(&bill_id, &expense_id, expense, &cancel)
    })
    .await
}

/// POST /api/bills/:id/confirm - Commit reviewed items to the ledger
async fn confirm_expenses(
    State(state): State<AppState>,
    Path(bill_id): Path<String>,
    Json(expenses): Json<Vec<Expense>>,
) -> Response {
    let cancel = state.cancellation();
    blocking(move || {
        state
            .service
            .confirm_expenses(&bill_id, expenses, &cancel)
            .map(|outcome| outcome.expenses_inserted)
    })
    .await
}

/// GET /api/bills/:id/ledger - Ledger entries committed from a bill
async fn get_bill_ledger(State(state): State<AppState>, Path(bill_id): Path<String>) -> Response {
    blocking(move || state.service.ledger_for_bill(&bill_id)).await
}

// ============================================================================
// Main Server
// ============================================================================

fn router(state: AppState) -> Router {
    // multipart framing on top of the largest accepted image
    let upload_limit = DefaultBodyLimit::max(MAX_UPLOAD_BYTES + (64 << 10));

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/bills", post(upload_bill).layer(upload_limit))
        .route("/bills/:id", get(get_bill))
        .route("/bills/:id/expenses/:expense_id", put(update_staged_item))
        .route("/bills/:id/confirm", post(confirm_expenses))
        .route("/bills/:id/ledger", get(get_bill_ledger))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

fn build_service(config: &Config) -> anyhow::Result<BillService> {
    let recognizer: Arc<dyn Recognizer> = match config.vision_api_key.as_deref() {
        Some(key) => Arc::new(GoogleVisionRecognizer::new(
            &config.vision_endpoint,
            key,
            config.recognition_timeout,
        )?),
        None => {
            // every upload will end as NoTextDetected
            tracing::warn!("VISION_API_KEY not set, image recognition disabled");
            Arc::new(FixedTextRecognizer::new(""))
        }
    };

    let store = SqliteStore::open(&config.database_path)?;
    info!(path = %config.database_path.display(), "Database opened");

    Ok(BillService::new(Arc::new(store), recognizer))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "receipt_ledger=info,receipt_server=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    // the blocking HTTP client must be built outside the async runtime
    let service = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || build_service(&config)).await??
    };

    let state = AppState {
        service: Arc::new(service),
        config: Arc::new(config.clone()),
    };

    let app = router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server running on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
