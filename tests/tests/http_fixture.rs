#![allow(dead_code)]
//! Minimal article gateway served over HTTP for `HttpConnector` tests.
//!
//! - `GET /article/:id` returns the article body, `404` when unknown.
//! - `HEAD` on the same path is answered by axum from the `GET` handler.
//! - With credentials configured, requests without matching basic auth get `401`.
//!
//! The server runs on [`SERVER_RT`](crate::setup::SERVER_RT) so it survives the per-test
//! runtimes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::setup::SERVER_RT;

#[derive(Default)]
struct GatewayState {
    articles: Mutex<HashMap<String, Bytes>>,
    // Expected `Authorization` header value.
    auth: Option<String>,
    seen_groups: Mutex<Vec<String>>,
    requests: Mutex<HashMap<String, usize>>,
}

#[derive(Clone)]
pub struct ArticleGateway {
    state: Arc<GatewayState>,
    pub addr: SocketAddr,
}

impl ArticleGateway {
    pub fn start() -> Self {
        Self::start_with(None)
    }

    /// Requires HTTP basic auth with `user:pass`. The header is precomputed by the caller
    /// as the base64 form of `user:pass`.
    pub fn start_with_basic_auth(encoded: &str) -> Self {
        Self::start_with(Some(format!("Basic {encoded}")))
    }

    fn start_with(auth: Option<String>) -> Self {
        let state = Arc::new(GatewayState {
            auth,
            ..GatewayState::default()
        });

        let app = Router::new()
            .route("/article/:id", get(serve_article))
            .with_state(Arc::clone(&state));

        let listener =
            std::net::TcpListener::bind("127.0.0.1:0").expect("failed to bind gateway listener");
        listener
            .set_nonblocking(true)
            .expect("failed to set nonblocking on gateway listener");
        let addr = listener.local_addr().unwrap();

        SERVER_RT.spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener)
                .expect("failed to convert gateway listener");
            axum::serve(listener, app).await.unwrap();
        });

        Self { state, addr }
    }

    pub fn insert(&self, remote_id: &str, body: impl Into<Bytes>) {
        self.state
            .articles
            .lock()
            .insert(remote_id.to_string(), body.into());
    }

    pub fn remove(&self, remote_id: &str) {
        self.state.articles.lock().remove(remote_id);
    }

    /// `X-Article-Groups` header values received so far.
    pub fn seen_groups(&self) -> Vec<String> {
        self.state.seen_groups.lock().clone()
    }

    pub fn requests(&self, remote_id: &str) -> usize {
        self.state
            .requests
            .lock()
            .get(remote_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

async fn serve_article(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    *state.requests.lock().entry(id.clone()).or_insert(0) += 1;

    if let Some(expected) = &state.auth {
        let given = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if given != Some(expected.as_str()) {
            return (StatusCode::UNAUTHORIZED, Bytes::new());
        }
    }

    if let Some(groups) = headers
        .get("x-article-groups")
        .and_then(|v| v.to_str().ok())
    {
        state.seen_groups.lock().push(groups.to_string());
    }

    match state.articles.lock().get(&id) {
        Some(body) => (StatusCode::OK, body.clone()),
        None => (StatusCode::NOT_FOUND, Bytes::new()),
    }
}
