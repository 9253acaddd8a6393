//! HTTP API integration tests, driven through the router with oneshot
//! requests (no sockets).

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use bespoke_api::config::ApiConfig;
use bespoke_api::server::Server;
use bespoke_core::{MemoryBackend, StoreBackend};
use bespoke_flow::config::ExecutorConfig;
use bespoke_flow::executor::ExecutorSet;
use bespoke_flow::supervisor::Supervisor;

async fn deployment() -> (Supervisor, Router) {
    let supervisor = Supervisor::new(
        ExecutorConfig {
            shutdown_grace: Duration::from_millis(500),
            ..ExecutorConfig::default()
        },
        ExecutorSet::stubs(),
    );
    let backend: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());
    let coordinator = supervisor.start_with_backend(backend).await.unwrap();
    let server = Server::new(ApiConfig::default(), coordinator);
    let router = server.test_router();
    (supervisor, router)
}

fn workflow_document() -> Value {
    json!({
        "smiles": "CC",
        "initial_force_field": "openff-2.2.0.offxml",
        "fragmenter": {"kind": "wbo", "wbo_threshold": 0.03},
        "targets": [{
            "kind": "torsion-profile",
            "qc_spec": {"method": "gfn2xtb", "program": "xtb"},
        }],
        "optimizer": {"kind": "force-balance", "max_iterations": 50},
    })
}

async fn request(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    let request = match body {
        Some(value) => builder.body(Body::from(value.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn await_success(router: &Router, id: u64) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let (status, body) = request(router, "GET", &format!("/submissions/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        match body["status"].as_str() {
            Some("success") => return body,
            Some("errored" | "cancelled") => panic!("submission settled badly: {body}"),
            _ => {}
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "submission {id} did not succeed in time: {body}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn health_reports_liveness_and_version() {
    let (supervisor, router) = deployment().await;

    let (status, body) = request(&router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(true));
    assert!(body["version"].as_str().is_some_and(|v| !v.is_empty()));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn submit_runs_to_success_and_serves_result() {
    let (supervisor, router) = deployment().await;

    let (status, body) = request(
        &router,
        "POST",
        "/submissions",
        Some(json!({"workflows": [workflow_document()]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let submission = &body["submissions"][0];
    let id = submission["id"].as_u64().expect("integer id");
    assert_eq!(
        submission["self"].as_str().unwrap(),
        format!("/submissions/{id}")
    );

    let detail = await_success(&router, id).await;
    let stages = detail["stages"].as_array().expect("stages array");
    assert_eq!(stages.len(), 3);
    assert_eq!(stages[0]["name"], "fragmentation");
    assert_eq!(stages[1]["name"], "qc-generation");
    assert_eq!(stages[2]["name"], "optimization");
    for stage in stages {
        assert_eq!(stage["status"], "success", "{stage}");
        assert!(stage["tasks"].as_array().is_some_and(|t| !t.is_empty()));
    }
    assert!(detail["result"]["refit_force_field"].as_str().is_some());

    supervisor.shutdown().await;
}

#[tokio::test]
async fn invalid_workflow_is_rejected_with_invalid_schema() {
    let (supervisor, router) = deployment().await;

    let mut document = workflow_document();
    document["smiles"] = json!("");

    let (status, body) = request(
        &router,
        "POST",
        "/submissions",
        Some(json!({"workflows": [document]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid-schema");

    // Nothing was persisted for the rejected request.
    let (status, body) = request(&router, "GET", "/submissions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["items"].as_array().unwrap().is_empty());

    supervisor.shutdown().await;
}

#[tokio::test]
async fn unknown_submission_is_not_found() {
    let (supervisor, router) = deployment().await;

    let (status, body) = request(&router, "GET", "/submissions/4040", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not-found");

    let (status, body) = request(&router, "DELETE", "/submissions/4040", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not-found");

    supervisor.shutdown().await;
}

#[tokio::test]
async fn delete_is_idempotent() {
    // A slow QC engine keeps the submission running long enough for the
    // DELETE to land before it settles on its own.
    let supervisor = Supervisor::new(
        ExecutorConfig {
            shutdown_grace: Duration::from_millis(500),
            ..ExecutorConfig::default()
        },
        ExecutorSet {
            fragment: Arc::new(bespoke_flow::executor::StubFragmenter),
            qc: Arc::new(bespoke_flow::executor::StubQcEngine::with_delay(
                Duration::from_millis(50),
            )),
            optimize: Arc::new(bespoke_flow::executor::StubOptimizer),
        },
    );
    let backend: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());
    let coordinator = supervisor.start_with_backend(backend).await.unwrap();
    let router = Server::new(ApiConfig::default(), coordinator).test_router();

    let (_, body) = request(
        &router,
        "POST",
        "/submissions",
        Some(json!({"workflows": [workflow_document()]})),
    )
    .await;
    let id = body["submissions"][0]["id"].as_u64().unwrap();

    let (status, _) = request(&router, "DELETE", &format!("/submissions/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // Repeating the DELETE acknowledges the same terminal state.
    let (status, _) = request(&router, "DELETE", &format!("/submissions/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, detail) = request(&router, "GET", &format!("/submissions/{id}"), None).await;
    assert_eq!(detail["status"], "cancelled");

    supervisor.shutdown().await;
}

#[tokio::test]
async fn list_filters_and_rejects_bad_status() {
    let (supervisor, router) = deployment().await;

    let (_, body) = request(
        &router,
        "POST",
        "/submissions",
        Some(json!({"workflows": [workflow_document()]})),
    )
    .await;
    let id = body["submissions"][0]["id"].as_u64().unwrap();
    await_success(&router, id).await;

    let (status, body) = request(&router, "GET", "/submissions?status=success", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"].as_array().unwrap().len(), 1);

    let (status, body) = request(&router, "GET", "/submissions?status=cancelled", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["items"].as_array().unwrap().is_empty());

    let (status, body) = request(&router, "GET", "/submissions?status=bogus", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid-filter");

    supervisor.shutdown().await;
}

#[tokio::test]
async fn openapi_document_is_served() {
    let (supervisor, router) = deployment().await;

    let (status, body) = request(&router, "GET", "/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/submissions"].is_object());
    assert!(body["paths"]["/submissions/{id}"].is_object());

    supervisor.shutdown().await;
}
