//! In-process mock backend for integration tests.
//!
//! Serves the auth, record, and realtime endpoints with just enough behavior
//! to exercise the client: issued tokens are tracked so they can be revoked,
//! record mutations are broadcast to subscribed SSE connections, and live
//! connections can be dropped on demand.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

pub const ADMIN_EMAIL: &str = "admin@example.com";
pub const ADMIN_PASSWORD: &str = "correct-horse";
pub const SEED_TOKEN: &str = "seed-token";
/// Subscribing to this target is refused with 403.
pub const FORBIDDEN_TARGET: &str = "forbidden";

struct SseClient {
    frames: mpsc::UnboundedSender<String>,
    subscriptions: Vec<String>,
}

#[derive(Default)]
pub struct MockState {
    auth_calls: AtomicUsize,
    auth_delay_ms: AtomicUsize,
    token_seq: AtomicUsize,
    require_auth: AtomicBool,
    fail_auth_status: Mutex<Option<StatusCode>>,
    valid_tokens: Mutex<HashSet<String>>,
    client_seq: AtomicUsize,
    connections: AtomicUsize,
    clients: Mutex<HashMap<String, SseClient>>,
    first_event: Mutex<Option<String>>,
    record_seq: AtomicUsize,
    records: Mutex<HashMap<String, Vec<Map<String, Value>>>>,
    rejected_requests: AtomicUsize,
}

impl MockState {
    fn issue_token(&self) -> String {
        let token = format!("token-{}", self.token_seq.fetch_add(1, Ordering::SeqCst) + 1);
        self.valid_tokens
            .lock()
            .expect("tokens lock")
            .insert(token.clone());
        token
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        if !self.require_auth.load(Ordering::SeqCst) {
            return true;
        }
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|token| {
                self.valid_tokens
                    .lock()
                    .expect("tokens lock")
                    .contains(token)
            })
    }

    fn unauthorized(&self) -> Response {
        self.rejected_requests.fetch_add(1, Ordering::SeqCst);
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"code": 401, "message": "The request requires valid authorization token."})),
        )
            .into_response()
    }

    fn broadcast(&self, collection: &str, action: &str, record: &Map<String, Value>) {
        let id = record.get("id").and_then(Value::as_str).unwrap_or_default();
        let record_topic = format!("{collection}/{id}");
        let clients = self.clients.lock().expect("clients lock");
        for client in clients.values() {
            let topic = client
                .subscriptions
                .iter()
                .find(|topic| topic.as_str() == collection || **topic == record_topic);
            if let Some(topic) = topic {
                let data = json!({"action": action, "record": record});
                let _ = client.frames.send(sse_frame(topic, &data.to_string()));
            }
        }
    }
}

fn sse_frame(event: &str, data: &str) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}

/// Running mock backend bound to an ephemeral local port.
pub struct MockBackend {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route("/api/admins/auth-with-password", post(password_auth))
            .route("/api/collections/users/auth-with-password", post(password_auth))
            .route("/api/admins/auth-refresh", post(token_refresh))
            .route("/api/collections/users/auth-refresh", post(token_refresh))
            .route("/api/realtime", get(realtime_connect).post(realtime_subscribe))
            .route(
                "/api/collections/{collection}/records",
                get(list_records).post(create_record),
            )
            .route(
                "/api/collections/{collection}/records/{id}",
                get(view_record).patch(update_record).delete(delete_record),
            )
            .with_state(Arc::clone(&state));
        let (addr, shutdown_tx, task) = spawn_server(app).await;

        Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn auth_calls(&self) -> usize {
        self.state.auth_calls.load(Ordering::SeqCst)
    }

    pub fn rejected_requests(&self) -> usize {
        self.state.rejected_requests.load(Ordering::SeqCst)
    }

    pub fn set_auth_delay(&self, delay: Duration) {
        self.state
            .auth_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// Makes every auth call answer `status` until cleared with `None`.
    pub fn fail_auth_with(&self, status: Option<StatusCode>) {
        *self.state.fail_auth_status.lock().expect("auth lock") = status;
    }

    /// Requires a valid issued token on record and registration calls.
    pub fn require_auth(&self, required: bool) {
        self.state.require_auth.store(required, Ordering::SeqCst);
    }

    /// Forgets every issued token, as a server-side session expiry would.
    pub fn revoke_tokens(&self) {
        self.state.valid_tokens.lock().expect("tokens lock").clear();
    }

    /// Overrides the name of the first event sent on new connections.
    pub fn set_first_event(&self, name: &str) {
        *self.state.first_event.lock().expect("first event lock") = Some(name.to_string());
    }

    /// Number of realtime connections accepted so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Ends every open realtime connection.
    pub fn drop_connections(&self) {
        self.state.clients.lock().expect("clients lock").clear();
    }

    /// Sends a raw frame to every open realtime connection.
    pub fn push_raw(&self, event: &str, data: &str) {
        let clients = self.state.clients.lock().expect("clients lock");
        for client in clients.values() {
            let _ = client.frames.send(sse_frame(event, data));
        }
    }

    pub async fn shutdown(mut self) {
        self.drop_connections();
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
        }
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Debug, Deserialize)]
struct PasswordBody {
    identity: String,
    password: String,
}

async fn auth_gate(state: &MockState) -> Option<Response> {
    state.auth_calls.fetch_add(1, Ordering::SeqCst);
    let delay = state.auth_delay_ms.load(Ordering::SeqCst) as u64;
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    let forced = *state.fail_auth_status.lock().expect("auth lock");
    forced.map(|status| {
        (
            status,
            Json(json!({"code": status.as_u16(), "message": "auth unavailable"})),
        )
            .into_response()
    })
}

async fn password_auth(
    State(state): State<Arc<MockState>>,
    Json(body): Json<PasswordBody>,
) -> Response {
    if let Some(response) = auth_gate(&state).await {
        return response;
    }
    if body.identity != ADMIN_EMAIL || body.password != ADMIN_PASSWORD {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"code": 400, "message": "Failed to authenticate.", "data": {}})),
        )
            .into_response();
    }
    let token = state.issue_token();
    Json(json!({"token": token, "admin": {"id": "admin1", "email": ADMIN_EMAIL}})).into_response()
}

async fn token_refresh(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    if let Some(response) = auth_gate(&state).await {
        return response;
    }
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let known = presented == SEED_TOKEN
        || state
            .valid_tokens
            .lock()
            .expect("tokens lock")
            .contains(&presented);
    if !known {
        return state.unauthorized();
    }
    let token = state.issue_token();
    Json(json!({"token": token})).into_response()
}

async fn realtime_connect(State(state): State<Arc<MockState>>) -> Response {
    let client_id = format!("client-{}", state.client_seq.fetch_add(1, Ordering::SeqCst) + 1);
    state.connections.fetch_add(1, Ordering::SeqCst);

    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let first_event = state
        .first_event
        .lock()
        .expect("first event lock")
        .clone()
        .unwrap_or_else(|| "PB_CONNECT".to_string());
    let _ = frames_tx.send(sse_frame(
        &first_event,
        &json!({"clientId": client_id}).to_string(),
    ));
    state.clients.lock().expect("clients lock").insert(
        client_id,
        SseClient {
            frames: frames_tx,
            subscriptions: Vec::new(),
        },
    );

    let body = stream::unfold(frames_rx, |mut frames_rx| async move {
        frames_rx
            .recv()
            .await
            .map(|frame| (Ok::<_, Infallible>(frame), frames_rx))
    });
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body))
        .expect("build sse response")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeBody {
    client_id: String,
    subscriptions: Vec<String>,
}

async fn realtime_subscribe(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<SubscribeBody>,
) -> Response {
    if !state.authorized(&headers) {
        return state.unauthorized();
    }
    if body.subscriptions.iter().any(|topic| topic == FORBIDDEN_TARGET) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"code": 403, "message": "Missing or invalid subscription access."})),
        )
            .into_response();
    }
    let mut clients = state.clients.lock().expect("clients lock");
    match clients.get_mut(&body.client_id) {
        Some(client) => {
            client.subscriptions = body.subscriptions;
            StatusCode::NO_CONTENT.into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"code": 404, "message": "Missing or invalid client id."})),
        )
            .into_response(),
    }
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"code": 404, "message": "The requested resource wasn't found."})),
    )
        .into_response()
}

async fn create_record(
    State(state): State<Arc<MockState>>,
    Path(collection): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Map<String, Value>>,
) -> Response {
    if !state.authorized(&headers) {
        return state.unauthorized();
    }
    let mut record = body;
    let id = format!("rec{}", state.record_seq.fetch_add(1, Ordering::SeqCst) + 1);
    record.insert("id".to_string(), Value::String(id.clone()));
    record.insert(
        "collectionName".to_string(),
        Value::String(collection.clone()),
    );
    state
        .records
        .lock()
        .expect("records lock")
        .entry(collection.clone())
        .or_default()
        .push(record.clone());
    state.broadcast(&collection, "create", &record);

    Json(json!({
        "id": id,
        "collectionName": collection,
        "created": "2024-01-01 00:00:00.000Z",
        "updated": "2024-01-01 00:00:00.000Z",
    }))
    .into_response()
}

async fn update_record(
    State(state): State<Arc<MockState>>,
    Path((collection, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Map<String, Value>>,
) -> Response {
    if !state.authorized(&headers) {
        return state.unauthorized();
    }
    let updated = {
        let mut records = state.records.lock().expect("records lock");
        let found = records.get_mut(&collection).and_then(|items| {
            items
                .iter_mut()
                .find(|record| record.get("id").and_then(Value::as_str) == Some(id.as_str()))
        });
        match found {
            Some(record) => {
                for (key, value) in body {
                    if key != "id" {
                        record.insert(key, value);
                    }
                }
                record.clone()
            }
            None => return not_found(),
        }
    };
    state.broadcast(&collection, "update", &updated);
    Json(Value::Object(updated)).into_response()
}

async fn delete_record(
    State(state): State<Arc<MockState>>,
    Path((collection, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if !state.authorized(&headers) {
        return state.unauthorized();
    }
    let removed = {
        let mut records = state.records.lock().expect("records lock");
        let items = records.entry(collection.clone()).or_default();
        let position = items
            .iter()
            .position(|record| record.get("id").and_then(Value::as_str) == Some(id.as_str()));
        match position {
            Some(position) => items.remove(position),
            None => return not_found(),
        }
    };
    state.broadcast(&collection, "delete", &removed);
    StatusCode::NO_CONTENT.into_response()
}

async fn view_record(
    State(state): State<Arc<MockState>>,
    Path((collection, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if !state.authorized(&headers) {
        return state.unauthorized();
    }
    let records = state.records.lock().expect("records lock");
    let found = records.get(&collection).and_then(|items| {
        items
            .iter()
            .find(|record| record.get("id").and_then(Value::as_str) == Some(id.as_str()))
    });
    match found {
        Some(record) => Json(Value::Object(record.clone())).into_response(),
        None => not_found(),
    }
}

async fn list_records(
    State(state): State<Arc<MockState>>,
    Path(collection): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !state.authorized(&headers) {
        return state.unauthorized();
    }
    let page: usize = query
        .get("page")
        .and_then(|value| value.parse().ok())
        .unwrap_or(1)
        .max(1);
    let per_page: usize = query
        .get("perPage")
        .and_then(|value| value.parse().ok())
        .unwrap_or(30)
        .max(1);

    let records = state.records.lock().expect("records lock");
    let all = records.get(&collection).cloned().unwrap_or_default();
    let total_items = all.len();
    let total_pages = total_items.div_ceil(per_page);
    let items: Vec<Value> = all
        .into_iter()
        .skip((page - 1) * per_page)
        .take(per_page)
        .map(Value::Object)
        .collect();

    Json(json!({
        "page": page,
        "perPage": per_page,
        "totalItems": total_items,
        "totalPages": total_pages,
        "items": items,
    }))
    .into_response()
}

pub async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}
