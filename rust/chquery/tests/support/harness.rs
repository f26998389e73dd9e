use axum::{
    body::{self, Body},
    http::{self, Request, StatusCode},
    Router,
};
use chquery::{config::AppConfig, server::Server, state::AppState};
use serde::Serialize;
use serde_json::Value;
use std::{future::Future, net::SocketAddr, sync::Once, time::Duration};
use tower::ServiceExt;

pub const API_KEY: &str = "test-api-key";

static TRACING_INIT: Once = Once::new();

/// Runs a test closure against an in-process compiler service.
pub async fn with_chquery_harness<F, Fut>(test: F)
where
    F: FnOnce(ChqueryTestHarness) -> Fut,
    Fut: Future<Output = ()>,
{
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });

    let server = Server::new(test_config())
        .await
        .expect("failed to boot chquery server for harness");
    let harness = ChqueryTestHarness {
        router: server.router(),
        state: server.state().clone(),
        api_key: API_KEY.to_string(),
    };

    test(harness).await;
}

pub fn test_config() -> AppConfig {
    AppConfig {
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        api_key: Some(API_KEY.to_string()),
        progress_buffer: 16,
        features: Vec::new(),
        default_list_limit: 100,
        config_push_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(5),
    }
}

pub struct ChqueryTestHarness {
    router: Router,
    pub state: AppState,
    api_key: String,
}

impl ChqueryTestHarness {
    pub async fn compile<T: Serialize>(&self, payload: &T) -> http::Response<Body> {
        self.send("POST", "/api/v1/query/compile", Some(payload), true)
            .await
    }

    pub async fn compile_without_api_key<T: Serialize>(&self, payload: &T) -> http::Response<Body> {
        self.send("POST", "/api/v1/query/compile", Some(payload), false)
            .await
    }

    pub async fn get(&self, path: &str) -> http::Response<Body> {
        self.send::<()>("GET", path, None, true).await
    }

    async fn send<T: Serialize>(
        &self,
        method: &str,
        path: &str,
        payload: Option<&T>,
        include_api_key: bool,
    ) -> http::Response<Body> {
        let mut builder = Request::builder().method(method).uri(path);
        if include_api_key {
            builder = builder.header("x-api-key", &self.api_key);
        }

        let body = match payload {
            Some(payload) => {
                builder = builder.header(http::header::CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(payload).expect("request payload should serialize"))
            }
            None => Body::empty(),
        };
        let request = builder.body(body).expect("failed to build harness request");

        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should produce a response")
    }
}

pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should deserialize");
    let value =
        serde_json::from_slice::<Value>(&bytes).expect("response body should be valid JSON");
    (status, value)
}
