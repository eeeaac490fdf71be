use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use swu_push::{
    CancellationToken, FirmwareAsset, HttpDeviceApi, OrchestratorSettings, UpdateError, UpdateOutcome, UpdateStage,
    UploadOrchestrator, WebSocketConnector,
};

const WORKER: &str = "ekx_rest_worker.php";

fn state_body(state: &str) -> String {
    format!(r#"{{"Process":"swupdate","State":"{}","ErrorReason":"","timeout":0}}"#, state)
}

fn request_chunk(offset: u64, size: u32) -> Message {
    Message::Text(format!(
        r#"{{"RequestChunk":{{"Pos":{},"Size":{},"Progress":"{:.1}%","EffTransferRate":"n/a","RealTransferRate":"n/a","EtaSec":"n/a"}}}}"#,
        offset, size, 0.0
    ))
}

/// Minimal upload server: pulls the whole file in `chunk` sized requests.
async fn serve_upload(listener: TcpListener, chunk: u32) -> (String, Vec<u8>) {
    let (tcp, _) = listener.accept().await.unwrap();
    let mut socket = accept_async(tcp).await.unwrap();
    let mut name = String::new();
    let mut size = 0u64;
    let mut received = Vec::new();

    while let Some(message) = socket.next().await {
        match message.unwrap() {
            Message::Text(text) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                if value.get("ping").is_some() {
                    socket.send(Message::Text(r#"{"pong":true}"#.to_string())).await.unwrap();
                } else if let Some(start) = value.get("UploadFile") {
                    name = start["Name"].as_str().unwrap().to_string();
                    size = start["Size"].as_u64().unwrap();
                    socket.send(request_chunk(0, chunk)).await.unwrap();
                }
            }
            Message::Binary(frame) => {
                let offset = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
                assert_eq!(u64::from(offset), received.len() as u64);
                received.extend_from_slice(&frame[4..]);
                let next = received.len() as u64;
                if next >= size {
                    socket
                        .send(Message::Text(r#"{"StopDownload":{"Success":true,"Reason":""}}"#.to_string()))
                        .await
                        .unwrap();
                    break;
                }
                socket.send(request_chunk(next, chunk)).await.unwrap();
            }
            _ => {}
        }
    }
    (name, received)
}

async fn mount_state(server: &MockServer, state: &str, times: Option<u64>, priority: u8) {
    let mock = Mock::given(method("GET"))
        .and(path(format!("/{}", WORKER)))
        .and(query_param("get_sw_update_state", ""))
        .respond_with(ResponseTemplate::new(200).set_body_string(state_body(state)))
        .with_priority(priority);
    match times {
        Some(n) => mock.up_to_n_times(n).mount(server).await,
        None => mock.mount(server).await,
    }
}

async fn mount_device(server: &MockServer) {
    Mock::given(method("GET"))
        .and(query_param("ping", ""))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/{}", WORKER)))
        .and(query_param("start_fw_update", "EKX_2.0.swu"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(server)
        .await;
}

fn firmware(dir: &std::path::Path, size: usize) -> (FirmwareAsset, Vec<u8>) {
    let data: Vec<u8> = (0..size).map(|i| (i * 7 % 256) as u8).collect();
    let file = dir.join("EKX_2.0.swu");
    std::fs::write(&file, &data).unwrap();
    (FirmwareAsset::open(&file).unwrap(), data)
}

fn orchestrator(upload_url: String, device: &MockServer) -> UploadOrchestrator {
    let connector = Arc::new(WebSocketConnector::new(Duration::from_secs(2)));
    let api = Arc::new(
        HttpDeviceApi::new(&device.uri(), WORKER, Duration::from_secs(1), Duration::from_secs(5)).unwrap(),
    );
    UploadOrchestrator::new(connector, api, upload_url, OrchestratorSettings::default())
}

#[tokio::test]
async fn test_upload_and_install_over_real_sockets() {
    let temp_dir = tempdir().unwrap();
    let (asset, data) = firmware(temp_dir.path(), 300_000);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upload_url = format!("ws://{}", listener.local_addr().unwrap());
    let upload_server = tokio::spawn(serve_upload(listener, 64 * 1024));

    let device = MockServer::start().await;
    mount_device(&device).await;
    mount_state(&device, "EVALUATE_PACKAGE", Some(2), 1).await;
    mount_state(&device, "UPDATE_COMPLETED", None, 2).await;

    let mut orchestrator = orchestrator(upload_url, &device);
    let outcome = tokio::time::timeout(Duration::from_secs(20), orchestrator.run(asset, CancellationToken::new()))
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(outcome, UpdateOutcome::Succeeded { stage: UpdateStage::UpdateCompleted, .. }));
    let (name, received) = upload_server.await.unwrap();
    assert_eq!(name, "EKX_2.0.swu");
    assert_eq!(received, data);

    let requests = device.received_requests().await.unwrap();
    assert!(requests
        .iter()
        .any(|r| r.url.query().unwrap_or_default().contains("start_fw_update=EKX_2.0.swu")));
}

#[tokio::test]
async fn test_device_rejects_package() {
    let temp_dir = tempdir().unwrap();
    let (asset, _) = firmware(temp_dir.path(), 10_000);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upload_url = format!("ws://{}", listener.local_addr().unwrap());
    let upload_server = tokio::spawn(serve_upload(listener, 4096));

    let device = MockServer::start().await;
    mount_device(&device).await;
    mount_state(&device, "PACKAGE_FAILED", None, 1).await;

    let mut orchestrator = orchestrator(upload_url, &device);
    let error = tokio::time::timeout(Duration::from_secs(20), orchestrator.run(asset, CancellationToken::new()))
        .await
        .unwrap()
        .unwrap_err();

    match error {
        UpdateError::DeviceReported { stage, message } => {
            assert_eq!(stage, "PACKAGE_FAILED");
            assert!(message.contains("package check failed"));
        }
        other => panic!("unexpected {:?}", other),
    }
    upload_server.await.unwrap();
}
