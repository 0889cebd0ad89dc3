//! HTTP route tests driven through the router without a socket.

use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use folio_core::eval::remote_context_factory;
use folio_core::resolve::MemoryPackageSource;
use folio_core::{DependencyResolver, EvaluationService, WorkbookConfig};
use folio_server::{AppState, WorkbookSession, create_router};
use tower::ServiceExt;

fn app() -> (axum::Router, Arc<WorkbookSession>) {
    let resolver = DependencyResolver::new(Arc::new(MemoryPackageSource::new()));
    let factory = remote_context_factory(WorkbookConfig::default().in_process());
    let (session, _rx) = WorkbookSession::new(EvaluationService::new(resolver, factory));
    let session = Arc::new(session);
    let router = create_router(Arc::new(AppState {
        session: session.clone(),
    }));
    (router, session)
}

async fn get_json(router: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_health() {
    let (router, _) = app();
    let (status, json) = get_json(router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_state_lists_cells_in_link_order() {
    let (router, session) = app();
    let b = session.insert_cell("2".to_string(), None, false).unwrap();
    session.insert_cell("1".to_string(), Some(b), true).unwrap();

    let (status, json) = get_json(router, "/api/state").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["type"], "state");
    assert_eq!(json["state"]["state"], "idle");

    let buffers: Vec<&str> = json["cells"]
        .as_array()
        .unwrap()
        .iter()
        .map(|cell| cell["buffer"].as_str().unwrap())
        .collect();
    assert_eq!(buffers, vec!["1", "2"]);
    assert!(json["cells"].as_array().unwrap().iter().all(|cell| cell["status"] == "unevaluated"));
}

#[tokio::test]
async fn test_unknown_route() {
    let (router, _) = app();
    let response = router
        .oneshot(Request::builder().uri("/api/graph").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
