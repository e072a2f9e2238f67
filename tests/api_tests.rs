use std::sync::Arc;

use anyhow::Result;
use eval_notifier::{
    api::router,
    clients::{health::HealthChecker, memory::MemoryStore},
};
use serde_json::Value;
use tokio::net::TcpListener;

use crate::common::{lock_manager, queue};

async fn serve(checker: HealthChecker) -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        let _ = axum::serve(listener, router(checker)).await;
    });

    Ok(format!("http://{}", addr))
}

/// Test: Without a database the service reports degraded but keeps serving
#[tokio::test]
async fn test_health_reports_backlog_and_held_locks() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let locks = lock_manager(store.clone(), "server-a");

    queue(&store, "email_lock_0", "a@example.edu").await?;
    queue(&store, "email_lock_1", "b@example.edu").await?;
    assert!(locks.acquire("email_lock_1").await?);

    let base = serve(HealthChecker::new(None, None, store, locks)).await?;
    let response = reqwest::get(format!("{}/health", base)).await?;

    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let body: Value = response.json().await?;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["server_id"], "server-a");
    assert_eq!(body["components"]["database"]["status"], "degraded");
    assert_eq!(body["queue"]["pending_notifications"], 2);
    assert_eq!(body["queue"]["held_locks"], serde_json::json!(["email_lock_1"]));

    Ok(())
}

/// Test: The liveness probe answers without touching the stores
#[tokio::test]
async fn test_liveness_probe() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let locks = lock_manager(store.clone(), "server-b");

    let base = serve(HealthChecker::new(None, None, store, locks)).await?;
    let response = reqwest::get(format!("{}/health/live", base)).await?;

    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);

    Ok(())
}
