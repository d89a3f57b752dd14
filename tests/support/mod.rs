use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use futures_util::StreamExt;
use httpmock::MockServer;
use sybil_gateway::test_support::{SeedUser, TestGateway, TEST_METRICS_API_KEY};
use tempfile::TempDir;
use tower::ServiceExt;

pub const USER_KEY: &str = "uk-0123456789abcdef0123456789abc";
pub const ADMIN_KEY: &str = "ak-0123456789abcdef0123456789abc";
pub const MODEL: &str = "sybil-test-model";

pub struct TestEnv {
    #[allow(dead_code)]
    dir: TempDir,
    pub upstream: MockServer,
    pub gateway: TestGateway,
    pub router: Router,
}

impl TestEnv {
    pub async fn new() -> Self {
        assert_eq!(USER_KEY.len(), 32);
        assert_eq!(ADMIN_KEY.len(), 32);

        let dir = tempfile::tempdir().expect("tempdir");
        let upstream = MockServer::start_async().await;
        let gateway =
            TestGateway::new(&dir.path().join("sybil.db"), &upstream.base_url()).expect("gateway");
        let router = gateway.router();
        Self {
            dir,
            upstream,
            gateway,
            router,
        }
    }

    pub fn seed_user(&self, api_key: &str, credits: u64, plan_requests: u32) -> u64 {
        self.gateway
            .seed_user(SeedUser {
                api_key,
                role: "user",
                credits,
                plan_requests,
            })
            .expect("seed user")
    }

    #[allow(dead_code)]
    pub fn seed_admin(&self) -> u64 {
        self.gateway
            .seed_user(SeedUser {
                api_key: ADMIN_KEY,
                role: "admin",
                credits: 0,
                plan_requests: 0,
            })
            .expect("seed admin")
    }

    /// input/output cost 10/20 per token, canceled request cost 7.
    pub fn seed_chat_model(&self) -> u64 {
        self.gateway
            .seed_model(MODEL, 10, 20, 7, "CHAT,COMPLETION")
            .expect("seed model")
    }

    pub async fn call(&self, req: Request<Body>) -> axum::response::Response {
        self.router.clone().oneshot(req).await.expect("router call")
    }

    pub async fn call_text(&self, req: Request<Body>) -> (StatusCode, HeaderMap, String) {
        let resp = self.call(req).await;
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .expect("read body");
        (status, headers, String::from_utf8_lossy(&bytes).into_owned())
    }

    /// `sybil_api_error_count` samples from a scrape, as `(labels, value)`.
    #[allow(dead_code)]
    pub async fn error_counts(&self) -> Vec<(String, u64)> {
        let (status, _, body) = self
            .call_text(get("/metrics", Some(&bearer(TEST_METRICS_API_KEY))))
            .await;
        assert_eq!(status, StatusCode::OK);
        body.lines()
            .filter_map(|line| line.strip_prefix("sybil_api_error_count_total"))
            .filter_map(|rest| {
                let (labels, value) = rest.rsplit_once(' ')?;
                Some((labels.to_string(), value.parse().ok()?))
            })
            .collect()
    }

    /// Lets relays and debits settle, then applies the buffered records.
    pub async fn settle(&self) {
        self.gateway.wait_idle().await;
        self.gateway.flush().await;
    }
}

pub fn post_json(path: &str, auth: Option<&str>, body: &serde_json::Value) -> Request<Body> {
    let mut builder = Request::post(path).header("content-type", "application/json");
    if let Some(auth) = auth {
        builder = builder.header("authorization", auth);
    }
    builder
        .body(Body::from(body.to_string()))
        .expect("request")
}

pub fn get(path: &str, auth: Option<&str>) -> Request<Body> {
    let mut builder = Request::get(path);
    if let Some(auth) = auth {
        builder = builder.header("authorization", auth);
    }
    builder.body(Body::empty()).expect("request")
}

pub fn bearer(key: &str) -> String {
    format!("Bearer {key}")
}

pub fn chat_body() -> serde_json::Value {
    serde_json::json!({
        "model": MODEL,
        "messages": [{"role": "user", "content": "hello"}],
    })
}

/// Upstream SSE body: one content delta per token, optional usage chunk and `[DONE]`.
pub fn upstream_sse(deltas: usize, usage: Option<(u64, u64)>, done: bool) -> String {
    let mut out = String::new();
    for i in 0..deltas {
        let chunk = serde_json::json!({"choices": [{"index": 0, "delta": {"content": format!("tok{i} ")}}]});
        out.push_str(&format!("data: {chunk}\n\n"));
    }
    if let Some((prompt, completion)) = usage {
        let chunk = serde_json::json!({
            "choices": [],
            "usage": {"prompt_tokens": prompt, "completion_tokens": completion, "total_tokens": prompt + completion},
        });
        out.push_str(&format!("data: {chunk}\n\n"));
    }
    if done {
        out.push_str("data: [DONE]\n\n");
    }
    out
}

/// Extracts the `data:` payloads of the gateway's re-framed SSE stream.
pub fn answer_payloads(sse: &str) -> Vec<serde_json::Value> {
    sse.split("\n\n")
        .filter_map(|frame| frame.lines().find_map(|l| l.strip_prefix("data: ")))
        .map(|data| serde_json::from_str(data).expect("frame json"))
        .collect()
}

/// Reads `frames` body frames and drops the rest of the response, as a disconnecting client would.
#[allow(dead_code)]
pub async fn read_frames_then_disconnect(resp: axum::response::Response, frames: usize) -> usize {
    let mut stream = resp.into_body().into_data_stream();
    let mut seen = 0;
    while seen < frames {
        match stream.next().await {
            Some(Ok(_)) => seen += 1,
            _ => break,
        }
    }
    drop(stream);
    seen
}
