use std::net::SocketAddr;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use anyhow::Context;
use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::coordinator::CoordinatorState;
use crate::entry::Entries;
use crate::entry::Entry;

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

/// Response for the /v1/info endpoint
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    hostname: String,
    entries: usize,
}

/// Coordinator state of one entry
#[derive(Serialize)]
struct EntryStatus {
    entry_id: String,
    phase: String,
    last_update_success: bool,
    last_exception: Option<String>,
    /// Unix seconds
    last_update_success_time: Option<f64>,
    /// Seconds; null when polling is suspended
    update_interval: Option<f64>,
    in_progress: bool,
    auth_failed: bool,
    polling: bool,
}

impl EntryStatus {
    fn new(entry: &Entry<Value>, state: &CoordinatorState<Value>) -> Self {
        Self {
            entry_id: entry.entry_id().to_string(),
            phase: state.phase.to_string(),
            last_update_success: state.last_update_success,
            last_exception: state.last_exception.as_ref().map(|e| e.to_string()),
            last_update_success_time: state
                .last_update_success_time
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64()),
            update_interval: state.update_interval.map(|d| d.as_secs_f64()),
            in_progress: state.in_progress,
            auth_failed: state.auth_failed,
            polling: entry.scheduler().is_running(),
        }
    }
}

/// Response for the /v1/entries/:id endpoint
#[derive(Serialize)]
struct EntryDetail {
    #[serde(flatten)]
    status: EntryStatus,
    data: Option<Value>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    version: &'static str,
    entries: Arc<Entries<Value>>,
}

fn not_found(entry_id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("Unknown entry {}", entry_id),
        }),
    )
        .into_response()
}

/// Handler for GET /v1/ping
#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/info
#[tracing::instrument(skip(state))]
async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/info request");

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    (
        StatusCode::OK,
        Json(InfoResponse {
            version: state.version.to_string(),
            hostname,
            entries: state.entries.len(),
        }),
    )
}

/// Handler for GET /v1/entries
#[tracing::instrument(skip(state))]
async fn list_entries(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let statuses: Vec<EntryStatus> = state
        .entries
        .snapshot()
        .values()
        .map(|entry| EntryStatus::new(entry, &entry.coordinator().state()))
        .collect();

    (StatusCode::OK, Json(statuses))
}

/// Handler for GET /v1/entries/:id
#[tracing::instrument(skip(state))]
async fn get_entry(State(state): State<Arc<AppState>>, Path(entry_id): Path<String>) -> Response {
    let Some(entry) = state.entries.get(&entry_id) else {
        return not_found(&entry_id);
    };

    let snapshot = entry.coordinator().state();
    let detail = EntryDetail {
        status: EntryStatus::new(&entry, &snapshot),
        data: snapshot.data.as_deref().cloned(),
    };
    (StatusCode::OK, Json(detail)).into_response()
}

/// Handler for POST /v1/entries/:id/refresh
#[tracing::instrument(skip(state))]
async fn refresh_entry(
    State(state): State<Arc<AppState>>,
    Path(entry_id): Path<String>,
) -> Response {
    let Some(entry) = state.entries.get(&entry_id) else {
        return not_found(&entry_id);
    };

    tracing::info!("[{}] Refresh requested via API", entry_id);
    entry.scheduler().request_refresh();
    (
        StatusCode::ACCEPTED,
        Json(PingResponse {
            status: "accepted".to_string(),
        }),
    )
        .into_response()
}

/// Create the API router with all endpoints
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info))
        .route("/v1/entries", get(list_entries))
        .route("/v1/entries/:id", get(get_entry))
        .route("/v1/entries/:id/refresh", post(refresh_entry))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP API server
///
/// Binds to `listen:port` and serves until `shutdown_rx` fires.
/// Returns an error if the address is invalid or cannot be bound.
pub async fn serve(
    listen: String,
    port: u16,
    entries: Arc<Entries<Value>>,
    shutdown_rx: oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let version = env!("CARGO_PKG_VERSION");

    let state = Arc::new(AppState { version, entries });
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", listen, port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", listen, port))?;
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await?;

    Ok(())
}

/// A running HTTP API server task.
pub struct ApiServer {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl ApiServer {
    /// Spawn [`serve`] in the background.
    ///
    /// A server that fails to start or dies is logged as soon as it happens.
    pub fn spawn(listen: String, port: u16, entries: Arc<Entries<Value>>) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let result = serve(listen, port, entries, shutdown_rx).await;
            if let Err(e) = &result {
                tracing::error!("HTTP API server failed: {:#}", e);
            }
            result
        });

        Self { shutdown_tx, task }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the server gracefully and wait for it to exit.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.shutdown_tx.send(()).ok();
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("HTTP API task panicked: {}", e);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::coordinator::Coordinator;
    use crate::coordinator::fetch_fn;
    use crate::scheduler::SchedulerOptions;

    async fn app() -> (Router, Arc<Entries<Value>>) {
        let coordinator = Coordinator::builder(
            "office",
            fetch_fn(|| async { Ok(json!({"temp": 21.5})) }),
        )
        .update_interval(Some(Duration::from_secs(30)))
        .build();
        let entry = Entry::setup("office", coordinator, SchedulerOptions::default())
            .await
            .unwrap();

        let entries = Arc::new(Entries::new());
        entries.insert(entry);
        let state = Arc::new(AppState {
            version: "test",
            entries: entries.clone(),
        });
        (create_router(state), entries)
    }

    async fn request(app: Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_ping() {
        let (app, _entries) = app().await;
        let (status, body) = request(app, "GET", "/v1/ping").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_info() {
        let (app, _entries) = app().await;
        let (status, body) = request(app, "GET", "/v1/info").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], "test");
        assert_eq!(body["entries"], 1);
    }

    #[tokio::test]
    async fn test_list_entries() {
        let (app, _entries) = app().await;
        let (status, body) = request(app, "GET", "/v1/entries").await;
        assert_eq!(status, StatusCode::OK);

        let entry = &body[0];
        assert_eq!(entry["entry_id"], "office");
        assert_eq!(entry["phase"], "idle");
        assert_eq!(entry["last_update_success"], true);
        assert_eq!(entry["last_exception"], Value::Null);
        assert_eq!(entry["update_interval"], 30.0);
        assert_eq!(entry["polling"], true);
        assert!(entry.get("data").is_none());
    }

    #[tokio::test]
    async fn test_get_entry() {
        let (app, _entries) = app().await;
        let (status, body) = request(app.clone(), "GET", "/v1/entries/office").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!({"temp": 21.5}));

        let (status, body) = request(app, "GET", "/v1/entries/garage").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Unknown entry garage");
    }

    #[tokio::test]
    async fn test_refresh_entry() {
        let (app, entries) = app().await;
        let (status, _body) = request(app.clone(), "POST", "/v1/entries/office/refresh").await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, _body) = request(app, "POST", "/v1/entries/garage/refresh").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let office = entries.get("office").unwrap();
        office.unload();
        assert!(!office.scheduler().is_running());
    }

    #[tokio::test]
    async fn test_entry_visible_once_set_up() {
        let (app, entries) = app().await;

        let coordinator = Coordinator::builder(
            "garage",
            fetch_fn(|| async { Ok(json!({"door": "closed"})) }),
        )
        .build();
        let garage = Entry::setup("garage", coordinator, SchedulerOptions::default())
            .await
            .unwrap();

        let (status, _body) = request(app.clone(), "GET", "/v1/entries/garage").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        entries.insert(garage);
        let (status, body) = request(app.clone(), "GET", "/v1/entries/garage").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!({"door": "closed"}));

        let (_status, body) = request(app, "GET", "/v1/info").await;
        assert_eq!(body["entries"], 2);
        entries.unload_all();
    }

    #[tokio::test]
    async fn test_bind_failure_reported_at_startup() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();

        let server = ApiServer::spawn("127.0.0.1".to_string(), port, Arc::new(Entries::new()));
        for _ in 0..200 {
            if !server.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!server.is_running());

        let err = server.shutdown().await.unwrap_err();
        assert!(format!("{:#}", err).contains(&format!("Failed to bind 127.0.0.1:{}", port)));
    }

    #[tokio::test]
    async fn test_server_shuts_down_gracefully() {
        let server = ApiServer::spawn("127.0.0.1".to_string(), 0, Arc::new(Entries::new()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.is_running());
        server.shutdown().await.unwrap();
    }
}
