//! In-process stub broker implementing the databus HTTP contract.
//!
//! The broker keeps every request it sees (bodies, auth headers, call
//! counters) behind a shared state handle, and can be scripted to serve
//! record pages or fail upcoming calls with specific statuses.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Form, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use databus_client::{ChannelConfig, ChannelConfigBuilder, RetryPolicy};
use serde_json::{json, Value};
use tokio::net::TcpListener;

type Shared = Arc<Mutex<BrokerState>>;

#[derive(Debug, Default)]
pub struct BrokerState {
    pub consumers_created: u32,
    pub active_consumer: Option<String>,
    pub create_bodies: Vec<Value>,

    pub subscribe_calls: u32,
    pub subscriptions: Vec<(String, Value)>,

    pub records_calls: u32,
    pub records_pages: VecDeque<Value>,
    pub records_failures: VecDeque<u16>,
    pub records_auth: Vec<Option<String>>,

    pub commit_calls: u32,
    pub commit_failures: VecDeque<u16>,
    pub commits: Vec<(String, Value)>,

    pub produce_calls: u32,
    pub produce_status: u16,
    pub produced: Vec<(Option<String>, Value)>,

    pub deleted: Vec<String>,

    pub login_calls: u32,
    pub login_status: u16,
    pub login_body_override: Option<Value>,

    pub token_calls: u32,
    pub token_status: u16,
    pub token_forms: Vec<Value>,
}

pub struct StubBroker {
    pub base_url: String,
    pub state: Shared,
}

impl StubBroker {
    pub async fn start() -> Self {
        let state: Shared = Arc::new(Mutex::new(BrokerState::default()));
        let router = Router::new()
            .route(
                "/databus/consumer-service/v1/consumers",
                post(create_consumer),
            )
            .route(
                "/databus/consumer-service/v1/consumers/:id/subscription",
                post(install_subscription),
            )
            .route(
                "/databus/consumer-service/v1/consumers/:id/records",
                get(fetch_records),
            )
            .route(
                "/databus/consumer-service/v1/consumers/:id/offsets",
                post(commit_offsets),
            )
            .route(
                "/databus/consumer-service/v1/consumers/:id",
                delete(delete_consumer),
            )
            .route("/databus/cloudproxy/v1/produce", post(produce_records))
            .route("/identity/v1/login", get(login))
            .route("/iam/v1.4/token", post(issue_token))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub broker");
        let addr = listener.local_addr().expect("stub broker local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve stub broker");
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    pub fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().expect("stub broker state")
    }

    /// Channel config pointing at the broker, with a fast retry policy.
    pub fn config(&self) -> ChannelConfigBuilder {
        ChannelConfig::builder(&self.base_url)
            .consumer_group("test-group")
            .retry_policy(RetryPolicy::new(
                Duration::from_millis(10),
                Duration::from_millis(40),
                2,
            ))
    }

    pub fn push_records_page(&self, page: Value) {
        self.state().records_pages.push_back(page);
    }

    pub fn fail_next_records(&self, status: u16) {
        self.state().records_failures.push_back(status);
    }

    pub fn fail_next_commit(&self, status: u16) {
        self.state().commit_failures.push_back(status);
    }

    pub fn set_login_status(&self, status: u16) {
        self.state().login_status = status;
    }

    pub fn set_token_status(&self, status: u16) {
        self.state().token_status = status;
    }
}

/// Build a one-record page in the records wire shape.
pub fn record_page(topic: &str, partition: u32, offset: u64, payload: &Value) -> Value {
    json!({
        "records": [{
            "routingData": {"topic": topic, "shardingKey": ""},
            "partition": partition,
            "offset": offset,
            "message": {
                "headers": {},
                "payload": STANDARD.encode(serde_json::to_vec(payload).expect("payload json")),
            },
        }]
    })
}

fn status_response(status: u16) -> Response {
    StatusCode::from_u16(status)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        .into_response()
}

async fn create_consumer(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    let mut state = state.lock().unwrap();
    state.consumers_created += 1;
    let id = format!("c{}", state.consumers_created);
    state.active_consumer = Some(id.clone());
    state.create_bodies.push(body);
    Json(json!({ "consumerInstanceId": id })).into_response()
}

async fn install_subscription(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let mut state = state.lock().unwrap();
    state.subscribe_calls += 1;
    if state.active_consumer.as_deref() != Some(id.as_str()) {
        return StatusCode::NOT_FOUND.into_response();
    }
    state.subscriptions.push((id, body));
    StatusCode::NO_CONTENT.into_response()
}

async fn fetch_records(
    State(state): State<Shared>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let mut state = state.lock().unwrap();
    state.records_calls += 1;
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(String::from);
    state.records_auth.push(auth);

    if let Some(status) = state.records_failures.pop_front() {
        return status_response(status);
    }
    if state.active_consumer.as_deref() != Some(id.as_str()) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let page = state
        .records_pages
        .pop_front()
        .unwrap_or_else(|| json!({ "records": [] }));
    Json(page).into_response()
}

async fn commit_offsets(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let mut state = state.lock().unwrap();
    state.commit_calls += 1;
    if let Some(status) = state.commit_failures.pop_front() {
        return status_response(status);
    }
    if state.active_consumer.as_deref() != Some(id.as_str()) {
        return StatusCode::NOT_FOUND.into_response();
    }
    state.commits.push((id, body));
    StatusCode::NO_CONTENT.into_response()
}

async fn delete_consumer(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    let mut state = state.lock().unwrap();
    if state.active_consumer.as_deref() != Some(id.as_str()) {
        return StatusCode::NOT_FOUND.into_response();
    }
    state.active_consumer = None;
    state.deleted.push(id);
    StatusCode::NO_CONTENT.into_response()
}

async fn produce_records(State(state): State<Shared>, headers: HeaderMap, body: Bytes) -> Response {
    let mut state = state.lock().unwrap();
    state.produce_calls += 1;
    if state.produce_status != 0 && state.produce_status != 204 {
        return status_response(state.produce_status);
    }
    let content_type = headers
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .map(String::from);
    let parsed = serde_json::from_slice(&body).unwrap_or(Value::Null);
    state.produced.push((content_type, parsed));
    StatusCode::NO_CONTENT.into_response()
}

async fn login(State(state): State<Shared>) -> Response {
    let mut state = state.lock().unwrap();
    state.login_calls += 1;
    if state.login_status != 0 && state.login_status != 200 {
        return status_response(state.login_status);
    }
    if let Some(body) = state.login_body_override.clone() {
        return Json(body).into_response();
    }
    Json(json!({ "AuthorizationToken": format!("token-{}", state.login_calls) })).into_response()
}

async fn issue_token(
    State(state): State<Shared>,
    Form(fields): Form<HashMap<String, String>>,
) -> Response {
    let mut state = state.lock().unwrap();
    state.token_calls += 1;
    state.token_forms.push(json!(fields));
    if state.token_status != 0 && state.token_status != 200 {
        return status_response(state.token_status);
    }
    Json(json!({ "access_token": format!("access-{}", state.token_calls) })).into_response()
}
