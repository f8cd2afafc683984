//! Integration tests: a real `ApiClient` against an in-process axum backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use crowdlend::models::Credentials;
use crowdlend::payment::{ManualCheckout, VerifyPolicy};
use crowdlend::session::SessionKey;
use crowdlend::views::{CampaignAction, CampaignDetail, Dashboard};
use crowdlend::{
    auth, campaigns, ApiClient, ClientError, MemorySessionStore, PaymentCoordinator,
    SessionStore, VerificationOutcome, WorkflowState,
};

// ─────────────────────────────────────────────────────────
// Mock backend
// ─────────────────────────────────────────────────────────

#[derive(Default)]
struct Backend {
    /// Authorization header seen per request path (`None` when absent).
    auth_seen: Mutex<Vec<(String, Option<String>)>>,
    verify_queries: Mutex<Vec<HashMap<String, String>>>,
    verify_reply: Mutex<Value>,
    /// Status sent with `verify_reply` (200 by default).
    verify_status: Mutex<StatusCode>,
    progress_calls: AtomicUsize,
    balance: Mutex<f64>,
}

type Shared = Arc<Backend>;

fn record(state: &Backend, path: &str, headers: &HeaderMap) {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    state.auth_seen.lock().unwrap().push((path.to_string(), auth));
}

async fn login(State(state): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    record(&state, "/users/login/", &headers);
    if body["password"] == "secret" {
        (StatusCode::OK, Json(json!({ "access": "acc-1", "refresh": "good-refresh" })))
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "detail": "No active account found with the given credentials" })),
        )
    }
}

async fn refresh(State(state): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    record(&state, "/users/refresh/", &headers);
    if body["refresh"] == "good-refresh" {
        (StatusCode::OK, Json(json!({ "access": "acc-2" })))
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "detail": "Token is invalid or expired" })),
        )
    }
}

async fn me(State(state): State<Shared>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    record(&state, "/users/me/", &headers);
    if !headers.contains_key("authorization") {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "detail": "Authentication credentials were not provided." })),
        );
    }
    let balance = *state.balance.lock().unwrap();
    (
        StatusCode::OK,
        Json(json!({
            "id": 1,
            "first_name": "Ada",
            "last_name": "Obi",
            "username": "ada",
            "email": "ada@example.org",
            "user_type": "lender",
            "is_approved": true,
            "balance": balance
        })),
    )
}

fn campaign_json(id: u64, title: &str) -> Value {
    json!({
        "id": id,
        "title": title,
        "description": "Ten solar kiosks for Yaba market",
        "goal_amount": "100000.00",
        "current_amount": "25000.00",
        "interest_rate": "12.50",
        "repayment_period": 6,
        "founder": { "id": 9, "username": "tunde" },
        "funding_progress": 25.0,
        "repayment_progress": 0.0,
        "is_fully_repaid": false,
        "created_at": "2024-03-01T10:00:00Z"
    })
}

async fn list_campaigns() -> Json<Value> {
    Json(json!([campaign_json(7, "Solar Kiosks"), campaign_json(8, "Bakery Oven")]))
}

async fn search_campaigns(Query(q): Query<HashMap<String, String>>) -> Json<Value> {
    let term = q.get("search").cloned().unwrap_or_default().to_lowercase();
    let all = [campaign_json(7, "Solar Kiosks"), campaign_json(8, "Bakery Oven")];
    let hits: Vec<Value> = all
        .into_iter()
        .filter(|c| c["title"].as_str().unwrap().to_lowercase().contains(&term))
        .collect();
    Json(Value::Array(hits))
}

async fn progress(State(state): State<Shared>, Path(id): Path<u64>) -> (StatusCode, Json<Value>) {
    state.progress_calls.fetch_add(1, Ordering::SeqCst);
    if id == 404 {
        return (StatusCode::NOT_FOUND, Json(json!({ "detail": "Not found." })));
    }
    (StatusCode::OK, Json(campaign_json(id, "Solar Kiosks")))
}

async fn initialize(State(state): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    record(&state, "/payments/initialize/", &headers);
    if body["amount"].as_f64().unwrap_or_default() > 1_000_000.0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Amount exceeds the campaign goal" })),
        );
    }
    (
        StatusCode::OK,
        Json(json!({
            "status": true,
            "data": {
                "authorization_url": "https://checkout.test/ref-1",
                "reference": "ref-1"
            }
        })),
    )
}

async fn repayment_initialize(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    record(&state, "/campaigns/repayment/initialize/", &headers);
    let campaign = body["campaign_id"].as_u64().unwrap();
    Json(json!({
        "status": true,
        "data": {
            "authorization_url": format!("https://checkout.test/repay/{campaign}"),
            "reference": format!("RP/{campaign}?month=1#2")
        }
    }))
}

async fn verify(
    State(state): State<Shared>,
    Path(reference): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    let mut query = query;
    query.insert("reference".into(), reference);
    state.verify_queries.lock().unwrap().push(query);
    let status = *state.verify_status.lock().unwrap();
    (status, Json(state.verify_reply.lock().unwrap().clone()))
}

async fn withdraw(State(state): State<Shared>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let amount = body["amount"].as_f64().unwrap_or_default();
    let mut balance = state.balance.lock().unwrap();
    if amount > *balance {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Insufficient balance" })),
        );
    }
    *balance -= amount;
    (
        StatusCode::OK,
        Json(json!({ "message": "Withdrawal successful", "new_balance": *balance })),
    )
}

async fn spawn_backend(state: Shared) -> String {
    let api = Router::new()
        .route("/users/login/", post(login))
        .route("/users/refresh/", post(refresh))
        .route("/users/me/", get(me))
        .route("/users/withdraw/", post(withdraw))
        .route("/campaigns/create/", get(list_campaigns))
        .route("/campaigns/campaign/search/", get(search_campaigns))
        .route("/campaigns/campaign/:id/progress/", get(progress))
        .route("/payments/initialize/", post(initialize))
        .route("/payments/verify/:reference/", get(verify))
        .route("/campaigns/repayment/initialize/", post(repayment_initialize))
        .route("/campaigns/repayment/verify/:reference/", get(verify))
        .with_state(state);
    let app = Router::new().nest("/api", api);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/api")
}

async fn setup() -> (Shared, ApiClient, Arc<MemorySessionStore>) {
    let backend = Arc::new(Backend {
        balance: Mutex::new(1000.0),
        ..Default::default()
    });
    let base = spawn_backend(backend.clone()).await;
    let store = Arc::new(MemorySessionStore::new());
    let api = ApiClient::new(&base, store.clone(), Duration::from_secs(5)).unwrap();
    (backend, api, store)
}

async fn logged_in() -> (Shared, ApiClient, Arc<MemorySessionStore>) {
    let (backend, api, store) = setup().await;
    auth::login(
        &api,
        &Credentials {
            username: "ada".into(),
            password: "secret".into(),
        },
    )
    .await
    .unwrap();
    (backend, api, store)
}

fn auth_for(backend: &Backend, path: &str) -> Vec<Option<String>> {
    backend
        .auth_seen
        .lock()
        .unwrap()
        .iter()
        .filter(|(p, _)| p == path)
        .map(|(_, a)| a.clone())
        .collect()
}

// ─────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn login_stores_tokens_and_later_requests_carry_bearer() {
    let (backend, api, store) = logged_in().await;

    assert_eq!(store.get(SessionKey::Access).await.unwrap().as_deref(), Some("acc-1"));
    assert_eq!(
        store.get(SessionKey::Refresh).await.unwrap().as_deref(),
        Some("good-refresh")
    );

    let user = crowdlend::users::me(&api).await.unwrap();
    assert_eq!(user.username, "ada");

    assert_eq!(auth_for(&backend, "/users/login/"), vec![None]);
    assert_eq!(
        auth_for(&backend, "/users/me/"),
        vec![Some("Bearer acc-1".to_string())]
    );
}

#[tokio::test]
async fn rejected_login_surfaces_server_detail() {
    let (_backend, api, store) = setup().await;
    let err = auth::login(
        &api,
        &Credentials {
            username: "ada".into(),
            password: "wrong".into(),
        },
    )
    .await
    .unwrap_err();

    assert!(err.is_unauthorized());
    assert_eq!(
        err.user_message("Not Approved / Invalid credentials"),
        "No active account found with the given credentials"
    );
    assert!(store.get(SessionKey::Access).await.unwrap().is_none());
}

#[tokio::test]
async fn logout_clears_tokens_and_stops_sending_bearer() {
    let (backend, api, store) = logged_in().await;
    auth::logout(&api).await.unwrap();

    for key in SessionKey::ALL {
        assert!(store.get(key).await.unwrap().is_none());
    }

    let err = crowdlend::users::me(&api).await.unwrap_err();
    match err {
        ClientError::Http { status, message } => {
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(
                message.as_deref(),
                Some("Authentication credentials were not provided.")
            );
        }
        other => panic!("expected Http error, got {other:?}"),
    }
    assert_eq!(auth_for(&backend, "/users/me/"), vec![None]);
}

#[tokio::test]
async fn refresh_replaces_access_token_without_sending_bearer() {
    let (backend, api, store) = logged_in().await;

    let token = auth::refresh_access_token(&api).await.unwrap();
    assert_eq!(token.as_deref(), Some("acc-2"));
    assert_eq!(store.get(SessionKey::Access).await.unwrap().as_deref(), Some("acc-2"));
    assert_eq!(auth_for(&backend, "/users/refresh/"), vec![None]);
}

#[tokio::test]
async fn failed_refresh_clears_the_session() {
    let (_backend, api, store) = setup().await;
    store.set(SessionKey::Access, "stale").await.unwrap();
    store.set(SessionKey::Refresh, "revoked").await.unwrap();

    let err = auth::refresh_access_token(&api).await.unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
    assert!(store.get(SessionKey::Access).await.unwrap().is_none());
    assert!(store.get(SessionKey::Refresh).await.unwrap().is_none());
}

// ─────────────────────────────────────────────────────────
// Campaigns and users
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn search_sends_term_as_query_parameter() {
    let (_backend, api, _store) = logged_in().await;
    let found = campaigns::search(&api, "bakery").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, 8);
    assert_eq!(found[0].founder_id(), Some(9));
}

#[tokio::test]
async fn missing_campaign_reports_not_found() {
    let (_backend, api, _store) = logged_in().await;
    let err = CampaignDetail::load(&api, 404).await.unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
    assert_eq!(err.user_message("Failed to fetch campaign details."), "Not found.");
}

#[tokio::test]
async fn dashboard_withdraw_updates_balance_from_receipt() {
    let (_backend, api, _store) = logged_in().await;
    let mut dashboard = Dashboard::load(&api).await.unwrap();
    assert_eq!(dashboard.campaigns.len(), 2);
    assert_eq!(dashboard.user.balance.to_string(), "1000");

    let receipt = dashboard.withdraw(&api, "250").await.unwrap();
    assert_eq!(receipt.message.as_deref(), Some("Withdrawal successful"));
    assert_eq!(dashboard.user.balance.to_string(), "750");

    let err = dashboard.withdraw(&api, "5000").await.unwrap_err();
    assert_eq!(err.user_message("Withdrawal failed."), "Insufficient balance");
    assert_eq!(dashboard.user.balance.to_string(), "750");
}

#[tokio::test]
async fn invalid_withdraw_amount_never_reaches_backend() {
    let (backend, api, _store) = logged_in().await;
    let before = *backend.balance.lock().unwrap();
    let err = crowdlend::users::withdraw(&api, "abc").await.unwrap_err();
    assert!(matches!(err, ClientError::Validation(_)));
    assert_eq!(*backend.balance.lock().unwrap(), before);
}

// ─────────────────────────────────────────────────────────
// Investment workflow
// ─────────────────────────────────────────────────────────

fn investment(api: &ApiClient, delay_ms: u64) -> PaymentCoordinator {
    PaymentCoordinator::investment(Arc::new(api.clone()), Arc::new(ManualCheckout))
        .with_policy(VerifyPolicy::single(Duration::from_millis(delay_ms)))
}

#[tokio::test]
async fn verified_investment_refreshes_campaign_once() {
    let (backend, api, _store) = logged_in().await;
    *backend.verify_reply.lock().unwrap() = json!({ "message": "Payment verified" });

    let detail = CampaignDetail::load(&api, 7).await.unwrap();
    assert_eq!(detail.action(), CampaignAction::Invest);
    let loads_before = backend.progress_calls.load(Ordering::SeqCst);

    let coordinator = investment(&api, 50);
    let refresh_api = api.clone();
    let refreshes = Arc::new(AtomicUsize::new(0));
    let counter = refreshes.clone();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();

    let handle = coordinator
        .initiate(7, "5000", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let reloaded = campaigns::progress(&refresh_api, 7).await;
                let _ = done_tx.send(reloaded.is_ok());
            });
        })
        .await
        .unwrap();

    assert_eq!(handle.reference(), "ref-1");
    assert_eq!(handle.intent().amount.to_string(), "5000");
    assert_eq!(handle.authorization_url(), "https://checkout.test/ref-1");
    assert_eq!(handle.state(), WorkflowState::AwaitingExternalCompletion);

    // The check waits for the configured delay.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(backend.verify_queries.lock().unwrap().is_empty());

    assert_eq!(handle.wait().await, VerificationOutcome::Verified);
    assert!(done_rx.await.unwrap());
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(backend.progress_calls.load(Ordering::SeqCst), loads_before + 1);

    let queries = backend.verify_queries.lock().unwrap().clone();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0]["reference"], "ref-1");
    assert_eq!(queries[0]["campaign_id"], "7");

    assert_eq!(
        auth_for(&backend, "/payments/initialize/"),
        vec![Some("Bearer acc-1".to_string())]
    );
    assert_eq!(coordinator.state_of(7), WorkflowState::Idle);
}

#[tokio::test]
async fn empty_verify_response_fails_without_refresh() {
    let (backend, api, _store) = logged_in().await;
    *backend.verify_reply.lock().unwrap() = json!({});

    let coordinator = investment(&api, 50);
    let refreshes = Arc::new(AtomicUsize::new(0));
    let counter = refreshes.clone();

    let handle = coordinator
        .initiate(7, "5000", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

    assert_eq!(handle.wait().await, VerificationOutcome::Failed(None));
    assert_eq!(refreshes.load(Ordering::SeqCst), 0);
    assert_eq!(backend.verify_queries.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn rejected_initiation_surfaces_backend_error_and_frees_slot() {
    let (backend, api, _store) = logged_in().await;
    let coordinator = investment(&api, 50);

    let err = coordinator
        .initiate(7, "2000000", || {})
        .await
        .err()
        .unwrap();
    assert_eq!(err.user_message("Loan failed!"), "Amount exceeds the campaign goal");
    assert_eq!(coordinator.state_of(7), WorkflowState::Idle);
    assert!(backend.verify_queries.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cancelled_investment_never_verifies() {
    let (backend, api, _store) = logged_in().await;
    *backend.verify_reply.lock().unwrap() = json!({ "message": "Payment verified" });

    let coordinator = investment(&api, 300);
    let refreshes = Arc::new(AtomicUsize::new(0));
    let counter = refreshes.clone();

    let handle = coordinator
        .initiate(7, "5000", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

    assert!(coordinator.cancel(7));
    assert_eq!(handle.wait().await, VerificationOutcome::Cancelled);

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(backend.verify_queries.lock().unwrap().is_empty());
    assert_eq!(refreshes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn verify_rejection_reports_the_server_message() {
    let (backend, api, _store) = logged_in().await;
    *backend.verify_status.lock().unwrap() = StatusCode::BAD_REQUEST;
    *backend.verify_reply.lock().unwrap() = json!({ "error": "Payment not successful" });

    let coordinator = investment(&api, 50);
    let refreshes = Arc::new(AtomicUsize::new(0));
    let counter = refreshes.clone();

    let handle = coordinator
        .initiate(7, "5000", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

    assert_eq!(
        handle.wait().await,
        VerificationOutcome::Failed(Some("Payment not successful".to_string()))
    );
    assert_eq!(refreshes.load(Ordering::SeqCst), 0);
}

// ─────────────────────────────────────────────────────────
// Repayment workflow
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn repayment_round_trip_keeps_reference_in_one_segment() {
    let (backend, api, _store) = logged_in().await;
    *backend.verify_reply.lock().unwrap() = json!({ "message": "Repayment verified" });

    let coordinator = PaymentCoordinator::repayment(Arc::new(api.clone()), Arc::new(ManualCheckout))
        .with_policy(VerifyPolicy::single(Duration::from_millis(50)));
    let refreshes = Arc::new(AtomicUsize::new(0));
    let counter = refreshes.clone();

    let handle = coordinator
        .initiate(12, "2500", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
    assert_eq!(handle.reference(), "RP/12?month=1#2");
    assert_eq!(handle.authorization_url(), "https://checkout.test/repay/12");

    assert_eq!(handle.wait().await, VerificationOutcome::Verified);
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);

    let queries = backend.verify_queries.lock().unwrap().clone();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0]["reference"], "RP/12?month=1#2");
    assert_eq!(queries[0]["campaign_id"], "12");
    assert!(!queries[0].contains_key("month"));

    assert_eq!(
        auth_for(&backend, "/campaigns/repayment/initialize/"),
        vec![Some("Bearer acc-1".to_string())]
    );
    assert!(auth_for(&backend, "/payments/initialize/").is_empty());
}
