//! REST round trips against a real server on a random port.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};

use stagerun_control_plane::{http::create_router, AppState, Config, MemoryStore, Scheduler};

struct TestServer {
    base: String,
    scheduler: Scheduler,
    client: reqwest::Client,
    _dir: tempfile::TempDir,
}

/// Spin up a server on a random port. The scheduler is not spawned; tests
/// drive it with explicit ticks.
async fn start_test_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        workspace_base: dir.path().to_path_buf(),
        ..Config::default()
    };
    let state = AppState::new(config, Arc::new(MemoryStore::new()));
    let scheduler = Scheduler::new(state.clone());
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestServer {
        base: format!("http://{}", addr),
        scheduler,
        client: reqwest::Client::new(),
        _dir: dir,
    }
}

impl TestServer {
    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self
            .client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn send(&self, method: reqwest::Method, path: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .request(method, format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        self.send(reqwest::Method::POST, path, body).await
    }

    async fn put(&self, path: &str, body: Value) -> (u16, Value) {
        self.send(reqwest::Method::PUT, path, body).await
    }

    async fn create_task(&self, complexity: u8) -> String {
        let (status, task) = self
            .post(
                "/v1/tasks",
                json!({"title": "Landing page", "description": "copy + layout", "complexity": complexity}),
            )
            .await;
        assert_eq!(status, 201, "{task}");
        task["id"].as_str().unwrap().to_string()
    }

    async fn register_agent(&self, min: u8, max: u8) -> String {
        let (status, agent) = self
            .post(
                "/v1/agents",
                json!({
                    "model": "claude",
                    "endpoint": "http://agent:9000",
                    "min_complexity": min,
                    "max_complexity": max
                }),
            )
            .await;
        assert_eq!(status, 201, "{agent}");
        agent["id"].as_str().unwrap().to_string()
    }

    async fn advance(&self, task_id: &str, status: &str, progress: i32) -> (u16, Value) {
        self.put(
            &format!("/v1/tasks/{task_id}/status"),
            json!({"status": status, "stage_progress": progress}),
        )
        .await
    }
}

#[tokio::test]
async fn test_health_and_metrics() {
    let server = start_test_server().await;
    let (status, body) = server.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");

    server.create_task(3).await;
    let resp = reqwest::get(format!("{}/metrics", server.base)).await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let text = resp.text().await.unwrap();
    assert!(text.contains("stagerun_tasks{status=\"not_started\"} 1"));
}

#[tokio::test]
async fn test_create_task_validation_errors() {
    let server = start_test_server().await;

    let (status, body) = server
        .post("/v1/tasks", json!({"title": "x", "complexity": 11}))
        .await;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().contains("complexity"));

    let (status, _) = server
        .post("/v1/tasks", json!({"title": "", "complexity": 3}))
        .await;
    assert_eq!(status, 400);

    let (status, _) = server.get("/v1/tasks/does-not-exist").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_task_lifecycle_over_rest() {
    let server = start_test_server().await;
    let task_id = server.create_task(5).await;
    let agent_id = server.register_agent(1, 5).await;
    server.register_agent(6, 10).await;

    let report = server.scheduler.tick().await.unwrap();
    assert_eq!(report.assigned.len(), 1);

    let (_, task) = server.get(&format!("/v1/tasks/{task_id}")).await;
    assert_eq!(task["status"], "design");
    assert_eq!(task["assigned_agent_id"], agent_id.as_str());

    // Skipping a stage is a client error.
    let (status, body) = server.advance(&task_id, "test", 0).await;
    assert_eq!(status, 422, "{body}");

    let (status, _) = server.advance(&task_id, "build", 150).await;
    assert_eq!(status, 422);

    for (stage, progress) in [("build", 30), ("build", 90), ("test", 0), ("review", 50)] {
        let (status, body) = server.advance(&task_id, stage, progress).await;
        assert_eq!(status, 200, "{body}");
    }
    let (status, task) = server
        .put(
            &format!("/v1/tasks/{task_id}/status"),
            json!({"status": "complete", "stage_progress": 100, "result_path": "/out/site"}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(task["status"], "complete");
    assert_eq!(task["result_path"], "/out/site");
    assert!(task["assigned_agent_id"].is_null());

    let (_, agent) = server.get(&format!("/v1/agents/{agent_id}")).await;
    assert_eq!(agent["status"], "available");

    let (_, updates) = server.get(&format!("/v1/tasks/{task_id}/updates")).await;
    let kinds: Vec<&str> = updates
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u["kind"].as_str().unwrap())
        .collect();
    assert_eq!(
        kinds,
        vec![
            "status_change",
            "status_change",
            "progress_update",
            "status_change",
            "status_change",
            "status_change"
        ]
    );

    let (_, archived) = server.get("/v1/workspaces?phase=archived").await;
    assert_eq!(archived.as_array().unwrap().len(), 1);

    let (status, listed) = server.get("/v1/tasks?status=complete").await;
    assert_eq!(status, 200);
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_agent_status_routes_through_claim_rules() {
    let server = start_test_server().await;
    let agent_id = server.register_agent(1, 5).await;
    server.create_task(2).await;
    server.scheduler.tick().await.unwrap();

    let path = format!("/v1/agents/{agent_id}/status");
    let (status, _) = server.put(&path, json!({"status": "busy"})).await;
    assert_eq!(status, 400);

    let (status, body) = server.put(&path, json!({"status": "offline"})).await;
    assert_eq!(status, 409, "{body}");

    let (status, agent) = server
        .post(&format!("/v1/agents/{agent_id}/heartbeat"), json!({}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(agent["status"], "busy");
}

#[tokio::test]
async fn test_cancel_and_workspace_retention() {
    let server = start_test_server().await;
    let task_id = server.create_task(4).await;
    server.register_agent(1, 5).await;
    server.scheduler.tick().await.unwrap();

    let (_, workspaces) = server.get("/v1/workspaces").await;
    let workspace = &workspaces.as_array().unwrap()[0];
    let workspace_id = workspace["id"].as_str().unwrap().to_string();
    let root = workspace["root_path"].as_str().unwrap().to_string();
    assert!(Path::new(&root).join("manifest.json").is_file());

    let (status, fetched) = server.get(&format!("/v1/workspaces/{workspace_id}")).await;
    assert_eq!(status, 200);
    assert_eq!(fetched["phase"], "active");
    assert_eq!(fetched["task_id"], task_id.as_str());

    let (status, out) = server
        .post(
            &format!("/v1/workspaces/{workspace_id}/exec"),
            json!({"command": "cat manifest.json", "timeout_secs": 5}),
        )
        .await;
    assert_eq!(status, 200);
    assert!(out["stdout"].as_str().unwrap().contains("Landing page"));

    let delete = server
        .client
        .delete(format!("{}/v1/workspaces/{workspace_id}", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(delete.status().as_u16(), 409);

    let (status, body) = server
        .post(
            &format!("/v1/tasks/{task_id}/cancel"),
            json!({"reason": "requirements changed"}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["queued"], false);
    assert_eq!(body["task"]["status"], "failed");
    assert!(body["task"]["result_path"].is_null());

    // Retention has not elapsed yet.
    let (status, purged) = server.post("/v1/workspaces/purge", json!({})).await;
    assert_eq!(status, 200);
    assert!(purged["deleted"].as_array().unwrap().is_empty());

    let delete = server
        .client
        .delete(format!("{}/v1/workspaces/{workspace_id}", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(delete.status().as_u16(), 200);
    assert!(!Path::new(&root).exists());

    let (status, _) = server
        .post(&format!("/v1/tasks/{task_id}/cancel"), json!({}))
        .await;
    assert_eq!(status, 422);
}
