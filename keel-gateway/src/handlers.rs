//! Route handlers.

use std::convert::Infallible;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use cid::Cid;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value as Json};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use keel_db::{Database, DbError, ExecResult, RequestOutcome};

use crate::response::{data_response, error_response};

pub const ROOT_PATH: &str = "/";
pub const PING_PATH: &str = "/ping";
pub const DUMP_PATH: &str = "/dump";
pub const GRAPHQL_PATH: &str = "/graphql";
pub const SCHEMA_LOAD_PATH: &str = "/schema/load";
pub const BLOCKS_PATH: &str = "/blocks";
pub const PEER_ID_PATH: &str = "/peerid";

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_GRAPHQL: &str = "application/graphql";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

const WELCOME_MESSAGE: &str =
    "Welcome to the keel HTTP API. Use /graphql to send queries to the database.";
const ERR_NO_DATABASE: &str = "no database available";
const ERR_EMPTY_BODY: &str = "body cannot be empty";
const ERR_NO_PEER_ID: &str = "no peer ID available. P2P might be disabled";
const ERR_CID_DECODE: &str = "illegal base32 data at input byte 0";
const ERR_BAD_MIME_PARAM: &str = "mime: invalid media parameter";

/// Shared handler state. The database is optional so a transport-only
/// server (and the error paths) stay testable.
#[derive(Clone, Debug, Default)]
pub struct AppState {
    pub db: Option<Database>,
    pub peer_id: Option<String>,
    /// Development mode attaches stack details to error envelopes.
    pub dev: bool,
}

impl AppState {
    pub fn new(db: Database) -> Self {
        Self {
            db: Some(db),
            peer_id: None,
            dev: false,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(ROOT_PATH, get(root_handler))
        .route(PING_PATH, get(ping_handler))
        .route(DUMP_PATH, get(dump_handler))
        .route(GRAPHQL_PATH, post(graphql_handler))
        .route(SCHEMA_LOAD_PATH, post(schema_load_handler))
        .route(&format!("{BLOCKS_PATH}/:cid"), get(block_handler))
        .route(PEER_ID_PATH, get(peer_id_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root_handler() -> Response {
    data_response(json!({ "response": WELCOME_MESSAGE }))
}

async fn ping_handler() -> Response {
    data_response(json!({ "response": "pong" }))
}

async fn dump_handler(State(state): State<AppState>) -> Response {
    let Some(db) = &state.db else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, ERR_NO_DATABASE, state.dev);
    };
    match db.dump() {
        Ok(()) => data_response(json!({ "response": "ok" })),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string(), state.dev),
    }
}

/// Body shapes accepted by `/graphql`.
enum BodyKind {
    Raw,
    Json,
}

#[derive(Deserialize)]
struct GraphqlEnvelope {
    query: String,
    #[serde(default)]
    variables: Option<Json>,
    #[serde(default, rename = "operationName")]
    _operation_name: Option<String>,
}

/// Negotiate the request content type. `application/graphql`, `text/plain`
/// and an absent header all mean a raw query string; `application/json`
/// carries the `{query, variables, operationName}` envelope. A malformed
/// media parameter is a server error, everything else is unsupported.
fn negotiate(headers: &HeaderMap) -> Result<BodyKind, (StatusCode, String)> {
    let raw = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let mut parts = raw.split(';');
    let mime = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    for param in parts {
        if !param.trim().contains('=') {
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                ERR_BAD_MIME_PARAM.to_string(),
            ));
        }
    }
    match mime.as_str() {
        "" | CONTENT_TYPE_GRAPHQL | CONTENT_TYPE_TEXT => Ok(BodyKind::Raw),
        CONTENT_TYPE_JSON => Ok(BodyKind::Json),
        other => Err((
            StatusCode::BAD_REQUEST,
            format!("content type {other} not yet supported"),
        )),
    }
}

async fn graphql_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let kind = match negotiate(&headers) {
        Ok(kind) => kind,
        Err((status, message)) => return error_response(status, message, state.dev),
    };

    if body.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, ERR_EMPTY_BODY, state.dev);
    }

    let (query, variables) = match kind {
        BodyKind::Raw => match String::from_utf8(body.to_vec()) {
            Ok(text) => (text, None),
            Err(err) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("unmarshal error: {err}"),
                    state.dev,
                )
            }
        },
        BodyKind::Json => match serde_json::from_slice::<GraphqlEnvelope>(&body) {
            Ok(envelope) => (envelope.query, envelope.variables),
            Err(err) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("unmarshal error: {err}"),
                    state.dev,
                )
            }
        },
    };

    if query.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "missing GraphQL request", state.dev);
    }

    let Some(db) = &state.db else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, ERR_NO_DATABASE, state.dev);
    };

    match db.handle_request(&query, variables.as_ref(), None) {
        Ok(RequestOutcome::Result(result)) => exec_response(result),
        Ok(RequestOutcome::Subscription(rx)) => subscription_response(rx),
        Err(err) => error_response(status_for(&err), err.to_string(), state.dev),
    }
}

fn exec_response(result: ExecResult) -> Response {
    let body = if result.errors.is_empty() {
        json!({ "data": result.data })
    } else {
        json!({ "data": result.data, "errors": result.errors })
    };
    (StatusCode::OK, axum::Json(body)).into_response()
}

/// Stream one JSON document per delivered subscription result. The stream
/// ends when the subscriber is dropped server-side or the client goes away.
fn subscription_response(rx: tokio::sync::mpsc::Receiver<ExecResult>) -> Response {
    let stream = ReceiverStream::new(rx).map(|result| {
        let mut payload = serde_json::to_vec(&json!({ "data": result.data }))
            .unwrap_or_else(|_| b"{}".to_vec());
        payload.push(b'\n');
        Ok::<_, Infallible>(Bytes::from(payload))
    });
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, CONTENT_TYPE_JSON)
        .body(Body::from_stream(stream))
        .expect("static response parts")
}

async fn schema_load_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let Some(db) = &state.db else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, ERR_NO_DATABASE, state.dev);
    };
    let sdl = match String::from_utf8(body.to_vec()) {
        Ok(text) => text,
        Err(err) => {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string(), state.dev)
        }
    };
    match db.add_schema(&sdl) {
        Ok(()) => data_response(json!({ "result": "success" })),
        Err(err) => {
            debug!(%err, "schema load failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string(), state.dev)
        }
    }
}

async fn block_handler(State(state): State<AppState>, Path(cid): Path<String>) -> Response {
    let cid = match Cid::try_from(cid.as_str()) {
        Ok(cid) => cid,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, ERR_CID_DECODE, state.dev),
    };
    let Some(db) = &state.db else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, ERR_NO_DATABASE, state.dev);
    };
    match db.get_block(&cid) {
        Ok(bytes) => data_response(json!({ "val": BASE64.encode(&bytes) })),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string(), state.dev),
    }
}

async fn peer_id_handler(State(state): State<AppState>) -> Response {
    match &state.peer_id {
        Some(peer_id) => data_response(json!({ "peerID": peer_id })),
        None => error_response(StatusCode::NOT_FOUND, ERR_NO_PEER_ID, state.dev),
    }
}

/// HTTP status for a transport-level database error.
fn status_for(err: &DbError) -> StatusCode {
    match err {
        DbError::EmptyBody
        | DbError::MissingRequest
        | DbError::ParseSyntax(_)
        | DbError::Unmarshal(_)
        | DbError::UnsupportedContentType(_)
        | DbError::CidDecode(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
