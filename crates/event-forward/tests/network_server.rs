// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test readability

//! Network-server relay tests against a local HTTP server.

use event_forward::{
    DownlinkCommand, DownlinkRelay, NetworkServerClient, NetworkServerConfig, RelayError,
};
use serde_json::Value;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tiny_http::{Response, Server};

struct Captured {
    method: String,
    url: String,
    authorization: Option<String>,
    grpc_authorization: Option<String>,
    content_type: Option<String>,
    body: String,
}

/// Serve one request with `status`/`reply` and hand back what was received.
fn one_shot_server(status: u16, reply: &'static str) -> (String, mpsc::Receiver<Captured>) {
    let server = Server::http("127.0.0.1:0").unwrap();
    let addr = server.server_addr().to_ip().unwrap();
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        if let Ok(mut request) = server.recv() {
            let header = |name: &'static str| {
                request
                    .headers()
                    .iter()
                    .find(|h| h.field.equiv(name))
                    .map(|h| h.value.as_str().to_string())
            };
            let authorization = header("Authorization");
            let grpc_authorization = header("Grpc-Metadata-Authorization");
            let content_type = header("Content-Type");
            let method = request.method().to_string();
            let url = request.url().to_string();

            let mut body = String::new();
            let _ = request.as_reader().read_to_string(&mut body);
            let _ = request.respond(Response::from_string(reply).with_status_code(status));

            let _ = tx.send(Captured {
                method,
                url,
                authorization,
                grpc_authorization,
                content_type,
                body,
            });
        }
    });

    (format!("http://{}", addr), rx)
}

fn client(url: &str) -> NetworkServerClient {
    NetworkServerClient::new(&NetworkServerConfig {
        url: format!("{}/", url),
        token: "secret-token".into(),
        timeout_secs: 5,
    })
    .unwrap()
}

fn command() -> DownlinkCommand {
    DownlinkCommand::decode(
        br#"{"confirmed":true,"data":"AQID","devEUI":"0102030405060708","fCnt":12,"fPort":10}"#,
    )
    .unwrap()
}

#[tokio::test]
async fn test_submit_posts_queue_item() {
    let (url, rx) = one_shot_server(200, "{}");

    client(&url).submit(&command()).await.unwrap();

    let captured = rx.recv().unwrap();
    assert_eq!(captured.method, "POST");
    assert_eq!(captured.url, "/api/devices/0102030405060708/queue");
    assert_eq!(captured.authorization.as_deref(), Some("Bearer secret-token"));
    assert_eq!(
        captured.grpc_authorization.as_deref(),
        Some("Bearer secret-token")
    );
    assert_eq!(captured.content_type.as_deref(), Some("application/json"));

    let body: Value = serde_json::from_str(&captured.body).unwrap();
    let item = &body["deviceQueueItem"];
    assert_eq!(item["devEUI"], "0102030405060708");
    assert_eq!(item["confirmed"], true);
    assert_eq!(item["data"], "AQID");
    assert_eq!(item["fCnt"], 12);
    assert_eq!(item["fPort"], 10);
}

#[tokio::test]
async fn test_non_success_status_carries_body() {
    let (url, rx) = one_shot_server(500, "device queue full");

    let err = client(&url).submit(&command()).await.unwrap_err();
    match &err {
        RelayError::Status { status, body } => {
            assert_eq!(*status, 500);
            assert_eq!(body, "device queue full");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(err.to_string().contains("device queue full"));
    rx.recv().unwrap();
}

#[tokio::test]
async fn test_dev_eui_cannot_leave_the_queue_path() {
    assert!(DownlinkCommand::decode(br#"{"devEUI":"../../internal/users?x="}"#).is_err());

    // Commands built in code are checked before any request is made.
    let (url, rx) = one_shot_server(200, "{}");
    let command = DownlinkCommand {
        dev_eui: "../../internal/users?x=".into(),
        ..Default::default()
    };
    let err = client(&url).submit(&command).await.unwrap_err();
    assert!(matches!(err, RelayError::InvalidDevEui(_)));
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[tokio::test]
async fn test_unreachable_server_is_http_error() {
    // Bind then drop to get a port nothing listens on.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let err = client(&format!("http://127.0.0.1:{}", port))
        .submit(&command())
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Http(_)));
}
