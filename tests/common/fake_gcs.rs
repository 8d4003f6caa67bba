//! In-process stand-in for the object-storage service's JSON API.
//!
//! ## Routes
//! - `POST   /upload/storage/v1/b/{bucket}/o`: media upload, or open a resumable session
//! - `PUT    /upload/storage/v1/b/{bucket}/o?upload_id=`: resumable chunk
//! - `GET    /storage/v1/b/{bucket}/o`: list (prefix, pageToken)
//! - `GET    /storage/v1/b/{bucket}/o/{object}`: metadata, or content with `alt=media`
//! - `DELETE /storage/v1/b/{bucket}/o/{object}`: delete

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bucket_utils::checksum;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::net::TcpListener;
use uuid::Uuid;

#[derive(Clone)]
struct StoredObject {
    data: Vec<u8>,
    updated: DateTime<Utc>,
}

struct PendingUpload {
    bucket: String,
    name: String,
    data: Vec<u8>,
}

#[derive(Default)]
struct FakeState {
    objects: BTreeMap<(String, String), StoredObject>,
    sessions: HashMap<String, PendingUpload>,
    page_size: usize,
    fixed_updated: Option<DateTime<Utc>>,
    omit_crc32c: bool,
    corrupt_md5: bool,
    required_token: Option<String>,
    chunk_ranges: Vec<String>,
}

/// Handle shared by the test and the server task.
#[derive(Clone)]
pub struct FakeGcs {
    base_url: String,
    state: Arc<Mutex<FakeState>>,
}

type Params = Query<HashMap<String, String>>;

impl FakeGcs {
    /// Bind to an ephemeral port and serve in the background.
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let fake = Self {
            base_url,
            state: Arc::new(Mutex::new(FakeState {
                page_size: 2,
                ..FakeState::default()
            })),
        };

        let app = routes().with_state(fake.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        fake
    }

    pub fn endpoint(&self) -> &str {
        &self.base_url
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Report every object as last modified at `instant`.
    pub fn pin_updated(&self, instant: DateTime<Utc>) {
        self.state().fixed_updated = Some(instant);
    }

    /// Behave like composite objects: no stored `crc32c`.
    pub fn omit_crc32c(&self) {
        self.state().omit_crc32c = true;
    }

    /// Report a wrong `md5Hash` on uploads.
    pub fn corrupt_md5(&self) {
        self.state().corrupt_md5 = true;
    }

    pub fn require_token(&self, token: &str) {
        self.state().required_token = Some(token.to_string());
    }

    /// Put an object directly, bypassing the API.
    pub fn insert(&self, bucket: &str, name: &str, data: &[u8]) {
        self.state().objects.insert(
            (bucket.to_string(), name.to_string()),
            StoredObject {
                data: data.to_vec(),
                updated: Utc::now(),
            },
        );
    }

    pub fn object(&self, bucket: &str, name: &str) -> Option<Vec<u8>> {
        self.state()
            .objects
            .get(&(bucket.to_string(), name.to_string()))
            .map(|object| object.data.clone())
    }

    /// Drop every open resumable session, as if they expired.
    pub fn expire_sessions(&self) {
        self.state().sessions.clear();
    }

    /// `Content-Range` values received on resumable chunks, in order.
    pub fn chunk_ranges(&self) -> Vec<String> {
        self.state().chunk_ranges.clone()
    }
}

fn routes() -> Router<FakeGcs> {
    Router::new()
        .route(
            "/upload/storage/v1/b/{bucket}/o",
            post(insert_object).put(upload_chunk),
        )
        .route("/storage/v1/b/{bucket}/o", get(list_objects))
        .route(
            "/storage/v1/b/{bucket}/o/{object}",
            get(get_object).delete(delete_object),
        )
}

fn error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({ "error": { "code": status.as_u16(), "message": message } })),
    )
        .into_response()
}

fn authorized(state: &FakeState, headers: &HeaderMap) -> bool {
    match &state.required_token {
        None => true,
        Some(token) => headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == format!("Bearer {}", token)),
    }
}

fn resource(state: &FakeState, bucket: &str, name: &str, object: &StoredObject) -> Value {
    let md5 = if state.corrupt_md5 {
        checksum::md5_base64(b"something else")
    } else {
        checksum::md5_base64(&object.data)
    };
    let mut value = json!({
        "kind": "storage#object",
        "bucket": bucket,
        "name": name,
        "size": object.data.len().to_string(),
        "updated": state.fixed_updated.unwrap_or(object.updated).to_rfc3339(),
        "md5Hash": md5,
    });
    if !state.omit_crc32c {
        value["crc32c"] = json!(checksum::encode_crc32c(checksum::crc32c(&object.data)));
    }
    value
}

fn store(state: &mut FakeState, bucket: &str, name: &str, data: Vec<u8>) -> Value {
    let object = StoredObject {
        data,
        updated: Utc::now(),
    };
    let value = resource(state, bucket, name, &object);
    state
        .objects
        .insert((bucket.to_string(), name.to_string()), object);
    value
}

/// `POST /upload/storage/v1/b/{bucket}/o`
async fn insert_object(
    State(fake): State<FakeGcs>,
    Path(bucket): Path<String>,
    Query(query): Params,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut state = fake.state();
    if !authorized(&state, &headers) {
        return error(StatusCode::UNAUTHORIZED, "missing credentials");
    }
    let Some(name) = query.get("name").cloned() else {
        return error(StatusCode::BAD_REQUEST, "missing name");
    };

    match query.get("uploadType").map(String::as_str) {
        Some("media") => {
            let value = store(&mut state, &bucket, &name, body.to_vec());
            (StatusCode::OK, Json(value)).into_response()
        }
        Some("resumable") => {
            let id = Uuid::new_v4().to_string();
            let location = format!(
                "{}/upload/storage/v1/b/{}/o?uploadType=resumable&upload_id={}",
                fake.base_url, bucket, id
            );
            state.sessions.insert(
                id,
                PendingUpload {
                    bucket,
                    name,
                    data: Vec::new(),
                },
            );
            let mut response = StatusCode::OK.into_response();
            response
                .headers_mut()
                .insert(header::LOCATION, HeaderValue::from_str(&location).unwrap());
            response
        }
        _ => error(StatusCode::BAD_REQUEST, "unsupported uploadType"),
    }
}

/// Parse `bytes a-b/total`, `bytes a-b/*` or `bytes */total`.
fn parse_content_range(value: &str) -> Option<(Option<(u64, u64)>, Option<u64>)> {
    let (range, total) = value.strip_prefix("bytes ")?.split_once('/')?;
    let total = match total {
        "*" => None,
        n => Some(n.parse().ok()?),
    };
    let range = match range {
        "*" => None,
        r => {
            let (first, last) = r.split_once('-')?;
            Some((first.parse().ok()?, last.parse().ok()?))
        }
    };
    Some((range, total))
}

/// `PUT /upload/storage/v1/b/{bucket}/o?upload_id=...`
async fn upload_chunk(
    State(fake): State<FakeGcs>,
    Query(query): Params,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut state = fake.state();
    let Some(id) = query.get("upload_id").cloned() else {
        return error(StatusCode::BAD_REQUEST, "missing upload_id");
    };
    let content_range = headers
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let Some((range, total)) = parse_content_range(&content_range) else {
        return error(StatusCode::BAD_REQUEST, "bad Content-Range");
    };
    state.chunk_ranges.push(content_range);

    let Some(session) = state.sessions.get_mut(&id) else {
        return error(StatusCode::NOT_FOUND, "no such upload");
    };
    if let Some((first, last)) = range {
        if first != session.data.len() as u64 || last + 1 - first != body.len() as u64 {
            return error(StatusCode::BAD_REQUEST, "range does not match upload");
        }
        session.data.extend_from_slice(&body);
    }

    let persisted = session.data.len() as u64;
    if total == Some(persisted) {
        let session = state.sessions.remove(&id).unwrap();
        let value = store(&mut state, &session.bucket, &session.name, session.data);
        return (StatusCode::OK, Json(value)).into_response();
    }
    if total.is_some() {
        return error(StatusCode::BAD_REQUEST, "total does not match data");
    }

    let mut response = StatusCode::PERMANENT_REDIRECT.into_response();
    if persisted > 0 {
        response.headers_mut().insert(
            header::RANGE,
            HeaderValue::from_str(&format!("bytes=0-{}", persisted - 1)).unwrap(),
        );
    }
    response
}

/// `GET /storage/v1/b/{bucket}/o`
async fn list_objects(
    State(fake): State<FakeGcs>,
    Path(bucket): Path<String>,
    Query(query): Params,
    headers: HeaderMap,
) -> Response {
    let state = fake.state();
    if !authorized(&state, &headers) {
        return error(StatusCode::UNAUTHORIZED, "missing credentials");
    }
    let prefix = query.get("prefix").cloned().unwrap_or_default();
    let start: usize = query
        .get("pageToken")
        .and_then(|token| token.parse().ok())
        .unwrap_or(0);

    let matching: Vec<Value> = state
        .objects
        .iter()
        .filter(|((b, name), _)| *b == bucket && name.starts_with(&prefix))
        .map(|((b, name), object)| resource(&state, b, name, object))
        .collect();

    let end = (start + state.page_size).min(matching.len());
    let page = &matching[start.min(end)..end];
    let mut body = json!({
        "kind": "storage#objects",
        "items": page,
    });
    if end < matching.len() {
        body["nextPageToken"] = json!(end.to_string());
    }
    (StatusCode::OK, Json(body)).into_response()
}

/// `GET /storage/v1/b/{bucket}/o/{object}`
async fn get_object(
    State(fake): State<FakeGcs>,
    Path((bucket, name)): Path<(String, String)>,
    Query(query): Params,
    headers: HeaderMap,
) -> Response {
    let state = fake.state();
    if !authorized(&state, &headers) {
        return error(StatusCode::UNAUTHORIZED, "missing credentials");
    }
    let Some(object) = state.objects.get(&(bucket.clone(), name.clone())) else {
        return error(StatusCode::NOT_FOUND, "No such object");
    };

    if query.get("alt").map(String::as_str) == Some("media") {
        return (StatusCode::OK, object.data.clone()).into_response();
    }
    (StatusCode::OK, Json(resource(&state, &bucket, &name, object))).into_response()
}

/// `DELETE /storage/v1/b/{bucket}/o/{object}`
async fn delete_object(
    State(fake): State<FakeGcs>,
    Path((bucket, name)): Path<(String, String)>,
) -> Response {
    let mut state = fake.state();
    match state.objects.remove(&(bucket, name)) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => error(StatusCode::NOT_FOUND, "No such object"),
    }
}
