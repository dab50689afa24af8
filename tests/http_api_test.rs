//! Transport-level tests against a live server on an ephemeral port.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};

use switchback::executors::default_registry;
use switchback::{ApiServer, Config, Engine};

async fn spawn_server() -> (ApiServer, SocketAddr, reqwest::Client) {
    let config = Config::default();
    let (engine, _task) = Engine::start(&config, default_registry());
    let server = ApiServer::start("127.0.0.1:0".parse().unwrap(), engine)
        .await
        .unwrap();
    let addr = server.addr();
    (server, addr, reqwest::Client::new())
}

fn single_job_body() -> Value {
    json!({
        "name": "slide run",
        "jobs": [
            {
                "job_id": "seg",
                "job_type": "cell_segmentation",
                "image_path": "/slides/case_0001.svs",
                "branch": "main"
            }
        ]
    })
}

async fn wait_workflow_terminal(
    client: &reqwest::Client,
    addr: SocketAddr,
    tenant: &str,
    workflow_id: &str,
) -> Value {
    for _ in 0..400 {
        let body: Value = client
            .get(format!("http://{addr}/api/workflows/{workflow_id}"))
            .header("X-User-ID", tenant)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let status = body["status"].as_str().unwrap_or_default().to_string();
        if status == "SUCCEEDED" || status == "FAILED" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("workflow {workflow_id} never finished");
}

#[tokio::test]
async fn missing_tenant_header_is_unauthorized() {
    let (_server, addr, client) = spawn_server().await;

    let response = client
        .get(format!("http://{addr}/api/workflows"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "tenant_missing");
}

#[tokio::test]
async fn workflow_lifecycle_over_http() {
    let (_server, addr, client) = spawn_server().await;

    let created = client
        .post(format!("http://{addr}/api/workflows"))
        .header("X-User-ID", "t1")
        .json(&single_job_body())
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);
    let created: Value = created.json().await.unwrap();
    let workflow_id = created["workflow_id"].as_str().unwrap().to_string();
    assert_eq!(created["tenant_id"], "t1");
    assert_eq!(created["job_count"], 1);

    // The owner sees it; another tenant does not.
    let mine: Value = client
        .get(format!("http://{addr}/api/workflows"))
        .header("X-User-ID", "t1")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(mine.as_array().unwrap().len(), 1);

    let theirs: Value = client
        .get(format!("http://{addr}/api/workflows"))
        .header("X-User-ID", "t2")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(theirs.as_array().unwrap().is_empty());

    let foreign = client
        .get(format!("http://{addr}/api/workflows/{workflow_id}"))
        .header("X-User-ID", "t2")
        .send()
        .await
        .unwrap();
    assert_eq!(foreign.status(), 404);

    let done = wait_workflow_terminal(&client, addr, "t1", &workflow_id).await;
    assert_eq!(done["status"], "SUCCEEDED");

    // Job view and result descriptor.
    let job: Value = client
        .get(format!("http://{addr}/api/jobs/seg"))
        .header("X-User-ID", "t1")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(job["status"], "SUCCEEDED");
    assert_eq!(job["progress"], 1.0);

    let results: Value = client
        .get(format!("http://{addr}/api/jobs/seg/results"))
        .header("X-User-ID", "t1")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(
        results["result_path"]
            .as_str()
            .unwrap()
            .starts_with("results/")
    );

    // Cancelling a finished job is a conflict.
    let cancel = client
        .delete(format!("http://{addr}/api/jobs/seg"))
        .header("X-User-ID", "t1")
        .send()
        .await
        .unwrap();
    assert_eq!(cancel.status(), 409);
    let cancel: Value = cancel.json().await.unwrap();
    assert_eq!(cancel["error"], "not_cancellable");

    // Progress poll endpoint.
    let progress: Value = client
        .get(format!("http://{addr}/api/progress/workflow/{workflow_id}"))
        .header("X-User-ID", "t1")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(progress["jobs_total"], 1);
    assert_eq!(progress["jobs_completed"], 1);
}

#[tokio::test]
async fn cyclic_submission_is_rejected_without_state() {
    let (_server, addr, client) = spawn_server().await;

    let body = json!({
        "name": "loop",
        "jobs": [
            {"job_id": "a", "job_type": "tissue_mask", "image_path": "/s/a.svs", "branch": "b1", "depends_on": ["b"]},
            {"job_id": "b", "job_type": "tissue_mask", "image_path": "/s/b.svs", "branch": "b1", "depends_on": ["a"]}
        ]
    });
    let response = client
        .post(format!("http://{addr}/api/workflows"))
        .header("X-User-ID", "t1")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 422);
    let error: Value = response.json().await.unwrap();
    assert_eq!(error["error"], "validation_failed");
    assert!(error["message"].as_str().unwrap().contains("cycle"));

    let listed: Value = client
        .get(format!("http://{addr}/api/workflows"))
        .header("X-User-ID", "t1")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listed.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn dashboard_and_health_report_shape() {
    let (_server, addr, client) = spawn_server().await;

    let dashboard: Value = client
        .get(format!("http://{addr}/api/metrics/dashboard"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(dashboard["active_workers"]["max"], 10);
    assert_eq!(dashboard["active_users"]["max"], 3);
    assert_eq!(dashboard["system_health"]["status"], "healthy");
    assert_eq!(dashboard["job_latency"]["average_minutes"], 0.0);
    assert_eq!(dashboard["queue_depth"]["total"], 0);

    let health: Value = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["running_jobs"], 0);
}

#[tokio::test]
async fn websocket_pong_and_progress_events() {
    let (_server, addr, client) = spawn_server().await;

    let (mut socket, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/api/progress/ws/t1"))
            .await
            .unwrap();

    // Application-level ping gets a pong.
    socket
        .send(tokio_tungstenite::tungstenite::Message::Text(
            json!({"type": "ping"}).to_string().into(),
        ))
        .await
        .unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let reply: Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert_eq!(reply["type"], "pong");

    // Submit a workflow; the subscriber sees typed events for it.
    let created: Value = client
        .post(format!("http://{addr}/api/workflows"))
        .header("X-User-ID", "t1")
        .json(&single_job_body())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let workflow_id = created["workflow_id"].as_str().unwrap();

    let mut saw_terminal = false;
    for _ in 0..10_000 {
        let message = tokio::time::timeout(Duration::from_secs(10), socket.next())
            .await
            .expect("event stream stalled")
            .unwrap()
            .unwrap();
        if !message.is_text() {
            continue;
        }
        let event: Value = serde_json::from_str(message.to_text().unwrap()).unwrap();
        assert!(event["type"].is_string());
        if event["type"] == "workflow_status"
            && event["workflow_id"] == *workflow_id
            && event["status"] == "SUCCEEDED"
        {
            saw_terminal = true;
            break;
        }
    }
    assert!(saw_terminal, "never saw the terminal workflow event");
}
