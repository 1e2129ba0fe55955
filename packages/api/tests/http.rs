mod common;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use common::Harness;
use jobplane_api::credentials::{
    AccessToken, Role, Scope, Subject, TokenRequest, USER_SCOPES, WORKER_SCOPES,
};
use jobplane_executor::HandlerRegistry;
use jobplane_storage::Operation;
use jobplane_types::{StatusReport, TaskStatus, chrono::Duration};
use serde_json::{Value, json};
use tower::ServiceExt;

fn setup() -> (Harness, Router) {
    let h = Harness::new(HandlerRegistry::with_builtins());
    let router = h.platform.router();
    (h, router)
}

fn operator_scopes() -> Vec<Scope> {
    let mut scopes = USER_SCOPES.to_vec();
    scopes.push(Scope::DeadLetterRead);
    scopes
}

async fn send(
    router: &Router,
    method: &str,
    uri: &str,
    token: Option<&AccessToken>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {}", token.as_str()));
    }
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

fn submission() -> Value {
    json!({
        "pipeline_ref": "builtin/echo",
        "input_locator": "in/a",
        "output_locator": "out/a",
        "priority": 5,
    })
}

async fn submit(router: &Router, token: &AccessToken) -> String {
    let (status, body) = send(router, "POST", "/tasks", Some(token), Some(submission())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    body["task_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_is_public() {
    let (_h, router) = setup();
    let (status, body) = send(&router, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn submission_requires_a_token() {
    let (_h, router) = setup();
    let (status, body) = send(&router, "POST", "/tasks", None, Some(submission())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "AUTH_DENIED");
}

#[tokio::test]
async fn expired_token_is_refused_at_the_edge() {
    let (h, router) = setup();
    let token = h.token("alice", Role::User, USER_SCOPES);
    h.clock.advance(Duration::minutes(10));

    let (status, _) = send(&router, "POST", "/tasks", Some(&token), Some(submission())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(h.platform.state.queue.stats().await.unwrap().ready, 0);
}

#[tokio::test]
async fn owner_submits_and_reads_task() {
    let (h, router) = setup();
    let token = h.token("alice", Role::User, USER_SCOPES);
    let task_id = submit(&router, &token).await;

    let (status, body) = send(&router, "GET", &format!("/tasks/{}", task_id), Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "queued");
    assert_eq!(body["owner"], "alice");
    assert_eq!(body["priority"], 5);
}

#[tokio::test]
async fn other_users_cannot_see_task_but_operators_can() {
    let (h, router) = setup();
    let alice = h.token("alice", Role::User, USER_SCOPES);
    let bob = h.token("bob", Role::User, USER_SCOPES);
    let operator = h.token("ops", Role::Operator, &operator_scopes());
    let task_id = submit(&router, &alice).await;
    let uri = format!("/tasks/{}", task_id);

    let (status, _) = send(&router, "GET", &uri, Some(&bob), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&router, "DELETE", &uri, Some(&bob), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&router, "GET", &uri, Some(&operator), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn cancel_only_once() {
    let (h, router) = setup();
    let token = h.token("alice", Role::User, USER_SCOPES);
    let task_id = submit(&router, &token).await;
    let uri = format!("/tasks/{}", task_id);

    let (status, body) = send(&router, "DELETE", &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");

    let (status, body) = send(&router, "DELETE", &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "NOT_CANCELLABLE");
}

#[tokio::test]
async fn same_dedup_key_returns_same_task() {
    let (h, router) = setup();
    let token = h.token("alice", Role::User, USER_SCOPES);
    let mut body = submission();
    body["dedup_key"] = json!("invoice-7");

    let (_, first) = send(&router, "POST", "/tasks", Some(&token), Some(body.clone())).await;
    let (_, second) = send(&router, "POST", "/tasks", Some(&token), Some(body)).await;
    assert_eq!(first["task_id"], second["task_id"]);
}

#[tokio::test]
async fn invalid_locator_is_a_bad_request() {
    let (h, router) = setup();
    let token = h.token("alice", Role::User, USER_SCOPES);
    let mut body = submission();
    body["output_locator"] = json!("/");

    let (status, body) = send(&router, "POST", "/tasks", Some(&token), Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn dead_letters_need_operator_scope() {
    let (h, router) = setup();
    let user = h.token("alice", Role::User, USER_SCOPES);
    let operator = h.token("ops", Role::Operator, &operator_scopes());

    let (status, _) = send(&router, "GET", "/dead-letters", Some(&user), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&router, "GET", "/dead-letters", Some(&operator), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn jwks_lists_the_signing_key() {
    let (_h, router) = setup();
    let (status, body) = send(&router, "GET", "/.well-known/jwks.json", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["keys"].as_array().unwrap().len(), 1);
    assert_eq!(body["keys"][0]["alg"], "ES256");
}

#[tokio::test]
async fn status_callback_is_bound_to_its_task() {
    let (h, router) = setup();
    let user = h.token("alice", Role::User, USER_SCOPES);
    let task_id = submit(&router, &user).await;
    let other_id = submit(&router, &h.token("bob", Role::User, USER_SCOPES)).await;

    let callback = h
        .platform
        .state
        .vendor
        .issue_with(
            TokenRequest::new(Subject::new("worker", Role::Worker), WORKER_SCOPES)
                .bound_to(task_id.clone()),
        )
        .unwrap();

    let report = StatusReport::new(task_id.as_str().into(), TaskStatus::Running, 0, h.clock.now());
    let (status, _) = send(
        &router,
        "POST",
        &format!("/tasks/{}/status", task_id),
        Some(&callback),
        Some(serde_json::to_value(&report).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(h.statuses.reports().len(), 1);

    let foreign = StatusReport::new(other_id.as_str().into(), TaskStatus::Running, 0, h.clock.now());
    let (status, _) = send(
        &router,
        "POST",
        &format!("/tasks/{}/status", other_id),
        Some(&callback),
        Some(serde_json::to_value(&foreign).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // A user token cannot report at all.
    let (status, _) = send(
        &router,
        "POST",
        &format!("/tasks/{}/status", task_id),
        Some(&user),
        Some(serde_json::to_value(&report).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(h.statuses.reports().len(), 1);
}

#[tokio::test]
async fn objects_are_served_through_presigned_urls_only() {
    let (h, router) = setup();
    h.put_input("in/a", b"payload").await;
    let base = h.platform.state.config.storage.base_url.clone();
    let url = h
        .platform
        .state
        .gateway
        .presign("in/a", Operation::Read, Duration::minutes(5))
        .unwrap();
    let relative = url.url.trim_start_matches(base.as_str()).to_string();

    let response = router
        .clone()
        .oneshot(Request::get(relative.as_str()).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"payload");

    let response = router
        .oneshot(Request::get("/objects/in/a").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert!(response.status().is_client_error());
}
