//! HTTP-level tests against the full router.
//!
//! Requests go through `tower::ServiceExt::oneshot`, so there is no peer
//! address and every request shares the `unknown` client identity.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use loanflow_audit::AuditFilter;
use loanflow_core::{AppConfig, Environment, RateLimitBackend, Stage, StaticToken, StorageBackend};
use loanflow_runtime::fallback::{ASK_AMOUNT, ASK_LOAN_TYPE};
use loanflow_runtime::{Decision, DecisionEngine, DecisionRequest, EngineError, LoanStore};
use loanflow_server::error::{MSG_LOAN_NOT_FOUND, MSG_RATE_LIMITED, MSG_ROUTE_NOT_FOUND};
use loanflow_server::handlers::chat::HEADER_DEGRADED;
use loanflow_server::middleware::{HEADER_LIMIT, HEADER_REMAINING};
use loanflow_server::{AppState, build_router};
use serde_json::{Map, Value, json};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tower::ServiceExt;

const USER_TOKEN: &str = "user-token";
const ADMIN_TOKEN: &str = "admin-token";

// =============================================================================
// HELPERS
// =============================================================================

/// Replays canned decisions; once exhausted it behaves like an outage.
struct ScriptedEngine {
    answers: Mutex<Vec<Decision>>,
}

impl ScriptedEngine {
    fn new(answers: Vec<Decision>) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.into_iter().rev().collect()),
        })
    }

    fn offline() -> Arc<Self> {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl DecisionEngine for ScriptedEngine {
    async fn decide(&self, _request: &DecisionRequest) -> Result<Decision, EngineError> {
        self.answers
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| EngineError::Transport("connection refused".to_string()))
    }
}

fn decision(agent: &str, stage: Stage, patch: Value, completed: bool) -> Decision {
    Decision {
        agent: agent.to_string(),
        data_patch: patch.as_object().cloned().unwrap_or_else(Map::new),
        reply: format!("reply from {agent}"),
        completed,
        stage: Some(stage),
    }
}

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.auth.tokens = vec![
        StaticToken {
            token: USER_TOKEN.to_string(),
            user_id: "user-1".to_string(),
            role: "user".to_string(),
        },
        StaticToken {
            token: ADMIN_TOKEN.to_string(),
            user_id: "admin-1".to_string(),
            role: "admin".to_string(),
        },
    ];
    config
}

async fn memory_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap()
}

async fn app_with(
    config: AppConfig,
    pool: Option<SqlitePool>,
    engine: Arc<dyn DecisionEngine>,
) -> (Router, AppState) {
    let (state, _worker) = AppState::with_engine(config, pool, engine).await.unwrap();
    (build_router(state.clone()), state)
}

async fn app(engine: Arc<dyn DecisionEngine>) -> (Router, AppState) {
    app_with(config(), None, engine).await
}

fn post_message(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/chat/message")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

fn patch(uri: &str, token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("PATCH")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> Response {
    router.clone().oneshot(request).await.unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// =============================================================================
// CONVERSATION
// =============================================================================

#[tokio::test]
async fn test_fallback_when_engine_is_down() {
    let (router, state) = app(ScriptedEngine::offline()).await;

    let response = send(&router, post_message(json!({ "message": "I need a personal loan" }))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[HEADER_DEGRADED], "true");

    let body = json_body(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["reply"], ASK_AMOUNT);
    assert_eq!(body["stage"], "INIT");
    assert_eq!(body["completed"], false);
    assert!(body.get("degraded").is_none());

    let loan_id: uuid::Uuid = body["loanId"].as_str().unwrap().parse().unwrap();
    let loan = state.store().get(loan_id).await.unwrap().unwrap();
    assert_eq!(loan.stage, Stage::Init);
    assert_eq!(loan.owner_id, "guest");
    assert!(loan.data.is_empty());
}

#[tokio::test]
async fn test_conversation_runs_to_completion() {
    let engine = ScriptedEngine::new(vec![
        decision("sales_agent", Stage::Sales, json!({ "loanType": "personal" }), false),
        decision(
            "underwriting_agent",
            Stage::Complete,
            json!({ "approved_amount": 500000, "risk_level": "LOW" }),
            true,
        ),
    ]);
    let (router, state) = app(engine).await;

    let first = json_body(send(&router, post_message(json!({ "message": "hi" }))).await).await;
    assert_eq!(first["stage"], "SALES");
    let loan_id = first["loanId"].as_str().unwrap().to_string();

    let response = send(
        &router,
        post_message(json!({ "message": "50000 please", "loanId": loan_id })),
    )
    .await;
    assert!(response.headers().get(HEADER_DEGRADED).is_none());
    let second = json_body(response).await;
    assert_eq!(second["stage"], "COMPLETE");
    assert_eq!(second["completed"], true);
    assert_eq!(second["loanId"], loan_id);

    let loan = json_body(
        send(&router, get(&format!("/api/chat/loan/{loan_id}"), Some(USER_TOKEN))).await,
    )
    .await;
    assert_eq!(loan["success"], true);
    assert_eq!(loan["loan"]["stage"], "COMPLETE");
    assert_eq!(loan["loan"]["data"]["loanType"], "personal");
    assert_eq!(loan["loan"]["data"]["approved_amount"], 500000);
    assert_eq!(loan["loan"]["riskLevel"], "LOW");

    state.outbox().flush().await;
    let entries = state
        .audit()
        .for_loan(loan_id.parse().unwrap())
        .await
        .unwrap();
    assert!(
        entries
            .iter()
            .any(|e| e.agent == "underwriting_agent" && e.action == "stage: COMPLETE")
    );
}

#[tokio::test]
async fn test_authenticated_message_is_owned_by_caller() {
    let (router, state) = app(ScriptedEngine::offline()).await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/chat/message")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {USER_TOKEN}"))
        .body(Body::from(json!({ "message": "hello", "userId": "someone-else" }).to_string()))
        .unwrap();
    let body = json_body(send(&router, request).await).await;
    assert_eq!(body["reply"], ASK_LOAN_TYPE);

    let owned = state.store().list_by_owner("user-1").await.unwrap();
    assert_eq!(owned.len(), 1);

    let listed = json_body(send(&router, get("/api/loans/user", Some(USER_TOKEN))).await).await;
    assert_eq!(listed["loans"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_loan_is_not_found() {
    let (router, _state) = app(ScriptedEngine::offline()).await;

    let response = send(
        &router,
        post_message(json!({ "message": "hi", "loanId": uuid::Uuid::new_v4().to_string() })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body, json!({ "success": false, "message": MSG_LOAN_NOT_FOUND }));

    let response = send(&router, get("/api/chat/loan/not-a-uuid", Some(USER_TOKEN))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_message_body_is_bad_request() {
    let (router, _state) = app(ScriptedEngine::offline()).await;
    let response = send(&router, post_message(json!({ "loanId": "" }))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["success"], false);
}

// =============================================================================
// ACCESS CONTROL
// =============================================================================

#[tokio::test]
async fn test_loan_lookup_requires_authentication() {
    let (router, _state) = app(ScriptedEngine::offline()).await;
    let id = uuid::Uuid::new_v4();

    let response = send(&router, get(&format!("/api/chat/loan/{id}"), None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = send(&router, get(&format!("/api/chat/loan/{id}"), Some("bogus"))).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_override() {
    let (router, state) = app(ScriptedEngine::offline()).await;
    let created = json_body(send(&router, post_message(json!({ "message": "hi" }))).await).await;
    let loan_id = created["loanId"].as_str().unwrap().to_string();
    let uri = format!("/api/admin/loans/{loan_id}");

    let response = send(&router, patch(&uri, USER_TOKEN, json!({ "stage": "KYC" }))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = send(
        &router,
        patch(
            &uri,
            ADMIN_TOKEN,
            json!({ "stage": "KYC", "riskLevel": "HIGH", "notes": "verified by phone" }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["loan"]["stage"], "KYC");
    assert_eq!(body["loan"]["riskLevel"], "HIGH");

    let response = send(&router, patch(&uri, ADMIN_TOKEN, json!({ "stage": "APPROVED" }))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    state.outbox().flush().await;
    let audits = json_body(
        send(
            &router,
            get(&format!("/api/admin/audit?loanId={loan_id}"), Some(ADMIN_TOKEN)),
        )
        .await,
    )
    .await;
    assert_eq!(audits["currentPage"], 1);
    let actions: Vec<&str> = audits["audits"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|a| a["action"].as_str())
        .collect();
    assert!(actions.contains(&"Manual update: verified by phone"));
}

#[tokio::test]
async fn test_audit_listing_with_huge_page() {
    let (router, _state) = app(ScriptedEngine::offline()).await;
    send(&router, post_message(json!({ "message": "hi" }))).await;

    let response = send(
        &router,
        get(
            &format!("/api/admin/audit?page={}&limit=50", u64::MAX),
            Some(ADMIN_TOKEN),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["currentPage"], u64::MAX);
    assert!(body["audits"].as_array().unwrap().is_empty());
}

// =============================================================================
// REQUEST PIPELINE
// =============================================================================

#[tokio::test]
async fn test_rate_limit_rejects_sixty_first_request() {
    let (router, _state) = app(ScriptedEngine::offline()).await;

    for i in 0..60 {
        let response = send(&router, post_message(json!({ "message": "hi" }))).await;
        assert_eq!(response.status(), StatusCode::OK, "request {i} rejected");
        assert_eq!(response.headers()[HEADER_LIMIT], "60");
        assert_eq!(
            response.headers()[HEADER_REMAINING],
            (59 - i).to_string().as_str()
        );
    }

    let response = send(&router, post_message(json!({ "message": "hi" }))).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[HEADER_REMAINING], "0");
    let retry_after: u64 = response.headers()[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));
    assert_eq!(
        json_body(response).await,
        json!({ "success": false, "message": MSG_RATE_LIMITED })
    );

    // Health sits outside the limited prefix.
    let response = send(&router, get("/health", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_rate_limit_is_shared_between_instances() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("limits.sqlite").display());

    let mut config = config();
    config.rate_limit.backend = RateLimitBackend::Sqlite;
    config.rate_limit.max_requests = 3;

    let mut routers = Vec::new();
    for _ in 0..2 {
        let pool = SqlitePoolOptions::new().connect(&url).await.unwrap();
        let (router, _state) = app_with(config.clone(), Some(pool), ScriptedEngine::offline()).await;
        routers.push(router);
    }

    for i in 0..3 {
        let response = send(&routers[i % 2], post_message(json!({ "message": "hi" }))).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = send(&routers[1], post_message(json!({ "message": "hi" }))).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_sensitive_requests_are_audited() {
    let (router, state) = app(ScriptedEngine::offline()).await;

    send(&router, post_message(json!({ "message": "hi" }))).await;
    send(&router, get("/api/loans/user", Some(USER_TOKEN))).await;
    send(&router, get("/health", None)).await;

    state.outbox().flush().await;
    let entries = state
        .audit()
        .query(AuditFilter {
            agent: Some("system".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.action, "POST /api/chat/message");
    assert_eq!(entry.actor_id, "anonymous");
    assert_eq!(entry.metadata["statusCode"], 200);
    assert_eq!(entry.metadata["ip"], "unknown");
    assert!(entry.metadata["duration"].is_u64());
}

#[tokio::test]
async fn test_unknown_route() {
    let (router, _state) = app(ScriptedEngine::offline()).await;
    let response = send(&router, get("/api/nothing-here", None)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        json_body(response).await,
        json!({ "success": false, "message": MSG_ROUTE_NOT_FOUND })
    );
}

#[tokio::test]
async fn test_health() {
    let (router, _state) = app(ScriptedEngine::offline()).await;
    let body = json_body(send(&router, get("/health", None)).await).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["storage"], true);
    assert!(body["timestamp"].is_string());
}

// =============================================================================
// INTERNAL ERRORS
// =============================================================================

async fn broken_store_app(environment: Environment) -> Router {
    let pool = memory_pool().await;
    let mut config = config();
    config.storage.backend = StorageBackend::Sqlite;
    config.server.environment = environment;
    let (router, _state) = app_with(config, Some(pool.clone()), ScriptedEngine::offline()).await;

    sqlx::query("DROP TABLE loans").execute(&pool).await.unwrap();
    router
}

#[tokio::test]
async fn test_internal_error_includes_stack_in_development() {
    let router = broken_store_app(Environment::Development).await;
    let id = uuid::Uuid::new_v4();

    let response = send(&router, get(&format!("/api/chat/loan/{id}"), Some(USER_TOKEN))).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert_eq!(body["success"], false);
    let stack = body["stack"].as_array().unwrap();
    assert_eq!(stack[0], body["message"]);
}

#[tokio::test]
async fn test_internal_error_hides_stack_in_production() {
    let router = broken_store_app(Environment::Production).await;
    let id = uuid::Uuid::new_v4();

    let response = send(&router, get(&format!("/api/chat/loan/{id}"), Some(USER_TOKEN))).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert!(body.get("stack").is_none());
    assert!(body["message"].is_string());
}
