//! Test doubles shared by the unit tests: an in-process HTTP service and an
//! in-memory event-channel connector.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    extract::{Multipart, Path, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, patch, post},
    Json, Router,
};
use serde_json::{json, Value};
use shared::{domain::CredentialPair, protocol::EventFrame};
use storage::MemoryStore;
use tokio::{net::TcpListener, sync::mpsc};

use crate::{
    credentials::CredentialStore,
    transport::{Connector, TransportError, TransportLink},
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn memory_credentials(pair: Option<(&str, &str)>) -> Arc<CredentialStore> {
    let store = Arc::new(CredentialStore::new(Arc::new(MemoryStore::new())));
    if let Some((access, refresh)) = pair {
        store
            .save_credentials(&CredentialPair {
                access_token: access.into(),
                refresh_token: refresh.into(),
            })
            .await
            .expect("seed credentials");
    }
    store
}

pub fn user_json(id: &str, first: &str, last: &str) -> Value {
    json!({
        "_id": id,
        "firstName": first,
        "lastName": last,
        "email": format!("{id}@example.com")
    })
}

#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub file_id: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub len: usize,
}

pub struct MockState {
    pub valid_token: Mutex<String>,
    pub refresh_calls: AtomicUsize,
    pub refresh_ok: AtomicBool,
    pub refresh_delay_ms: AtomicU64,
    pub reject_all: AtomicBool,
    pub groups: Mutex<Vec<Value>>,
    pub history: Mutex<HashMap<String, Value>>,
    pub history_fails: AtomicBool,
    pub created_groups: Mutex<Vec<Value>>,
    pub chunks: Mutex<Vec<ChunkRecord>>,
    pub fail_chunk: Mutex<Option<usize>>,
    pub completed_uploads: AtomicUsize,
    pub seen_auth: Mutex<Vec<Option<String>>>,
    /// Tags of `/notes/:tag` requests that passed authorization, in arrival order.
    pub accepted_notes: Mutex<Vec<String>>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            valid_token: Mutex::new("access-1".into()),
            refresh_calls: AtomicUsize::new(0),
            refresh_ok: AtomicBool::new(true),
            refresh_delay_ms: AtomicU64::new(0),
            reject_all: AtomicBool::new(false),
            groups: Mutex::new(Vec::new()),
            history: Mutex::new(HashMap::new()),
            history_fails: AtomicBool::new(false),
            created_groups: Mutex::new(Vec::new()),
            chunks: Mutex::new(Vec::new()),
            fail_chunk: Mutex::new(None),
            completed_uploads: AtomicUsize::new(0),
            seen_auth: Mutex::new(Vec::new()),
            accepted_notes: Mutex::new(Vec::new()),
        }
    }
}

impl MockState {
    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn set_valid_token(&self, token: &str) {
        *self.valid_token.lock().expect("lock") = token.to_string();
    }
}

type Rejection = (StatusCode, Json<Value>);
type Reply = Result<Json<Value>, Rejection>;

fn envelope(data: Value) -> Json<Value> {
    Json(json!({ "statusCode": 200, "message": "ok", "data": data }))
}

fn reject(status: StatusCode, message: &str) -> Rejection {
    (
        status,
        Json(json!({ "statusCode": status.as_u16(), "message": message })),
    )
}

fn authorize(state: &MockState, headers: &HeaderMap) -> Result<(), Rejection> {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.seen_auth.lock().expect("lock").push(presented.clone());

    let expected = format!("Bearer {}", state.valid_token.lock().expect("lock"));
    if state.reject_all.load(Ordering::SeqCst) || presented.as_deref() != Some(expected.as_str())
    {
        return Err(reject(StatusCode::UNAUTHORIZED, "jwt expired"));
    }
    Ok(())
}

async fn login(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Reply {
    if body["password"] != "secret" {
        return Err(reject(StatusCode::UNAUTHORIZED, "Invalid credentials"));
    }
    state.set_valid_token("access-1");
    let mut user = user_json("u-self", "Ada", "Lovelace");
    user["accessToken"] = json!("access-1");
    user["refreshToken"] = json!("refresh-1");
    Ok(envelope(user))
}

async fn register(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Reply {
    state.set_valid_token("access-1");
    let mut user = user_json(
        "u-new",
        body["firstName"].as_str().unwrap_or_default(),
        body["lastName"].as_str().unwrap_or_default(),
    );
    user["accessToken"] = json!("access-1");
    user["refreshToken"] = json!("refresh-1");
    Ok(envelope(user))
}

async fn refresh(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Reply {
    let call = state.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
    let delay = state.refresh_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    let presented = body["refreshToken"].as_str().unwrap_or_default();
    if !state.refresh_ok.load(Ordering::SeqCst) || presented.is_empty() {
        return Err(reject(StatusCode::UNAUTHORIZED, "refresh token invalid"));
    }
    let access = format!("fresh-{call}");
    state.set_valid_token(&access);
    Ok(envelope(json!({
        "accessToken": access,
        "refreshToken": format!("refresh-{}", call + 1),
    })))
}

async fn list_groups(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Reply {
    authorize(&state, &headers)?;
    let groups = state.groups.lock().expect("lock").clone();
    Ok(envelope(Value::Array(groups)))
}

async fn create_group(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Reply {
    authorize(&state, &headers)?;
    state.created_groups.lock().expect("lock").push(body.clone());
    let members: Vec<Value> = body["memberIds"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|id| user_json(id.as_str().unwrap_or_default(), "Member", "Person"))
        .collect();
    let mut group = json!({
        "_id": "g-created",
        "members": members,
        "createdAt": "2024-05-01T09:00:00Z",
        "updatedAt": "2024-05-01T09:00:00Z"
    });
    if let Some(name) = body.get("name") {
        group["name"] = name.clone();
    }
    Ok(envelope(group))
}

async fn update_group(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Reply {
    authorize(&state, &headers)?;
    Ok(envelope(json!({
        "_id": id,
        "name": body.get("name").cloned().unwrap_or(Value::Null),
        "imageUrl": body.get("imageUrl").cloned().unwrap_or(Value::Null),
        "members": [],
        "createdAt": "2024-05-01T09:00:00Z",
        "updatedAt": "2024-05-02T09:00:00Z"
    })))
}

async fn history(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(_body): Json<Value>,
) -> Reply {
    authorize(&state, &headers)?;
    if state.history_fails.load(Ordering::SeqCst) {
        return Err(reject(StatusCode::INTERNAL_SERVER_ERROR, "history unavailable"));
    }
    let page = state
        .history
        .lock()
        .expect("lock")
        .get(&id)
        .cloned()
        .unwrap_or_else(|| json!({ "messages": [], "canLoadMore": false }));
    Ok(envelope(page))
}

async fn list_users(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Reply {
    authorize(&state, &headers)?;
    Ok(envelope(json!({
        "data": [user_json("u-2", "Alan", "Turing"), user_json("u-3", "Grace", "Hopper")],
        "total": 2,
        "page": 1,
        "limit": 20,
        "totalPages": 1
    })))
}

async fn get_user(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Reply {
    authorize(&state, &headers)?;
    Ok(envelope(user_json(&id, "Fetched", "User")))
}

async fn update_profile_image(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Reply {
    authorize(&state, &headers)?;
    let mut user = user_json("u-self", "Ada", "Lovelace");
    user["profileUrl"] = body["profileUrl"].clone();
    Ok(envelope(user))
}

async fn upload_chunk(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Reply {
    authorize(&state, &headers)?;
    let mut file_id = String::new();
    let mut chunk_index = 0usize;
    let mut total_chunks = 0usize;
    let mut len = 0usize;
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "chunk" => len = field.bytes().await.map(|b| b.len()).unwrap_or_default(),
            "fileId" => file_id = field.text().await.unwrap_or_default(),
            "chunkIndex" => {
                chunk_index = field.text().await.unwrap_or_default().parse().unwrap_or(0)
            }
            "totalChunks" => {
                total_chunks = field.text().await.unwrap_or_default().parse().unwrap_or(0)
            }
            _ => {
                let _ = field.text().await;
            }
        }
    }
    if *state.fail_chunk.lock().expect("lock") == Some(chunk_index) {
        return Err(reject(StatusCode::INTERNAL_SERVER_ERROR, "disk full"));
    }
    state.chunks.lock().expect("lock").push(ChunkRecord {
        file_id,
        chunk_index,
        total_chunks,
        len,
    });
    Ok(envelope(json!({ "received": chunk_index })))
}

async fn complete_upload(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Reply {
    authorize(&state, &headers)?;
    state.completed_uploads.fetch_add(1, Ordering::SeqCst);
    Ok(envelope(json!({
        "url": format!(
            "https://cdn.example/{}/{}",
            body["fileId"].as_str().unwrap_or_default(),
            body["fileName"].as_str().unwrap_or_default()
        )
    })))
}

async fn note(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Path(tag): Path<String>,
) -> Reply {
    authorize(&state, &headers)?;
    state.accepted_notes.lock().expect("lock").push(tag.clone());
    Ok(envelope(json!({ "tag": tag })))
}

async fn boom() -> Reply {
    Err(reject(StatusCode::INTERNAL_SERVER_ERROR, "kaput"))
}

/// Spawns the mock service and returns its base URL.
pub async fn spawn_mock_service() -> (String, Arc<MockState>) {
    let state = Arc::new(MockState::default());
    let app = Router::new()
        .route("/auth/login", post(login))
        .route("/auth/register", post(register))
        .route("/auth/refresh", post(refresh))
        .route("/groups", get(list_groups).post(create_group))
        .route("/groups/:id", patch(update_group))
        .route("/groups/:id/messages", post(history))
        .route("/users", get(list_users))
        .route("/users/profile/image", patch(update_profile_image))
        .route("/users/:id", get(get_user))
        .route("/assets/upload-chunk", post(upload_chunk))
        .route("/assets/complete-upload", post(complete_upload))
        .route("/notes/:tag", get(note))
        .route("/boom", get(boom))
        .with_state(Arc::clone(&state));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

/// Service side of one established fake link.
pub struct FakeLink {
    pub credential: String,
    pub to_client: mpsc::Sender<EventFrame>,
    pub from_client: mpsc::Receiver<EventFrame>,
}

impl FakeLink {
    pub async fn push(&self, event: &str, data: Value) {
        self.to_client
            .send(EventFrame::new(event, data))
            .await
            .expect("client inbound open");
    }
}

/// Connector whose links are in-memory channels. Scripted outcomes are
/// consumed first; afterwards every attempt follows `fail_by_default`.
pub struct FakeConnector {
    pub attempts: AtomicUsize,
    pub fail_by_default: AtomicBool,
    script: Mutex<VecDeque<bool>>,
    links: mpsc::UnboundedSender<FakeLink>,
}

impl FakeConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeLink>) {
        let (links, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                attempts: AtomicUsize::new(0),
                fail_by_default: AtomicBool::new(false),
                script: Mutex::new(VecDeque::new()),
                links,
            }),
            rx,
        )
    }

    pub fn failing() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeLink>) {
        let (connector, rx) = Self::new();
        connector.fail_by_default.store(true, Ordering::SeqCst);
        (connector, rx)
    }

    /// Queues explicit outcomes (`true` = succeed) for the next attempts.
    pub fn script(&self, outcomes: &[bool]) {
        self.script.lock().expect("lock").extend(outcomes.iter().copied());
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, credential: &str) -> Result<TransportLink, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let succeed = self
            .script
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or(!self.fail_by_default.load(Ordering::SeqCst));
        if !succeed {
            return Err(TransportError::Handshake("connection refused".into()));
        }

        let (to_client, inbound) = mpsc::channel(64);
        let (outbound, from_client) = mpsc::channel(64);
        let _ = self.links.send(FakeLink {
            credential: credential.to_string(),
            to_client,
            from_client,
        });
        Ok(TransportLink { outbound, inbound })
    }
}
