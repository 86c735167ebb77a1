// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test readability

//! HTTP ingestion end to end: request in, event out to every integration.

use async_trait::async_trait;
use event_forward::{
    error_channel, Dispatcher, ErrorSender, Event, HandleError, Integration, IntegrationError,
};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Recorded {
    events: Mutex<Vec<Event>>,
}

struct RecordingIntegration {
    name: &'static str,
    recorded: Arc<Recorded>,
    refuse: bool,
}

#[async_trait]
impl Integration for RecordingIntegration {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn handle_event(&self, _errors: &ErrorSender, event: &Event) -> Result<(), HandleError> {
        self.recorded.events.lock().unwrap().push(event.clone());
        if self.refuse {
            return Err(HandleError::new(
                self.name,
                IntegrationError::Publish("broker unavailable".into()),
            ));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), HandleError> {
        Ok(())
    }
}

struct Harness {
    base: String,
    shutdown: CancellationToken,
    server: JoinHandle<std::io::Result<()>>,
}

impl Harness {
    async fn start(integrations: Vec<Box<dyn Integration>>) -> Self {
        let (errors, _rx) = error_channel(16);
        let dispatcher = Arc::new(Dispatcher::new(integrations, errors));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(event_forward::ingest::serve(
            listener,
            dispatcher,
            shutdown.clone(),
        ));
        Self {
            base,
            shutdown,
            server,
        }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.server.await.unwrap().unwrap();
    }
}

fn recording(name: &'static str, refuse: bool) -> (Box<dyn Integration>, Arc<Recorded>) {
    let recorded = Arc::new(Recorded::default());
    (
        Box::new(RecordingIntegration {
            name,
            recorded: recorded.clone(),
            refuse,
        }),
        recorded,
    )
}

const UPLINK: &str = r#"{"applicationID":"7","devEUI":"0102030405060708","fCnt":3}"#;

#[tokio::test]
async fn test_event_reaches_every_integration() {
    let (mqtt, mqtt_seen) = recording("mqtt", false);
    let (pulsar, pulsar_seen) = recording("pulsar", false);
    let harness = Harness::start(vec![mqtt, pulsar]).await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("{}/?event=up", harness.base))
        .body(UPLINK)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    for seen in [&mqtt_seen, &pulsar_seen] {
        let events = seen.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, UPLINK.as_bytes());
        assert_eq!(events[0].vars["event"], "up");
        assert_eq!(events[0].vars["applicationID"], "7");
        assert_eq!(events[0].vars["devEUI"], "0102030405060708");
    }

    harness.stop().await;
}

#[tokio::test]
async fn test_path_route_sets_event_type() {
    let (mqtt, seen) = recording("mqtt", false);
    let harness = Harness::start(vec![mqtt]).await;

    let response = reqwest::Client::new()
        .post(format!("{}/events/join", harness.base))
        .body(UPLINK)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(seen.events.lock().unwrap()[0].vars["event"], "join");

    harness.stop().await;
}

#[tokio::test]
async fn test_integration_failure_is_bad_gateway() {
    let (mqtt, mqtt_seen) = recording("mqtt", false);
    let (pulsar, _) = recording("pulsar", true);
    let harness = Harness::start(vec![mqtt, pulsar]).await;

    let response = reqwest::Client::new()
        .post(format!("{}/?event=up", harness.base))
        .body(UPLINK)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 502);
    let body = response.text().await.unwrap();
    assert!(body.contains("pulsar"), "body: {}", body);
    assert!(body.contains("broker unavailable"), "body: {}", body);

    // The healthy integration still got the event.
    assert_eq!(mqtt_seen.events.lock().unwrap().len(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_missing_event_type_is_rejected() {
    let (mqtt, seen) = recording("mqtt", false);
    let harness = Harness::start(vec![mqtt]).await;
    let http = reqwest::Client::new();

    let blank = http
        .post(format!("{}/?event=%20", harness.base))
        .body(UPLINK)
        .send()
        .await
        .unwrap();
    assert_eq!(blank.status().as_u16(), 400);

    let absent = http
        .post(format!("{}/", harness.base))
        .body(UPLINK)
        .send()
        .await
        .unwrap();
    assert_eq!(absent.status().as_u16(), 400);

    assert!(seen.events.lock().unwrap().is_empty());
    harness.stop().await;
}

#[tokio::test]
async fn test_health() {
    let (mqtt, _) = recording("mqtt", false);
    let harness = Harness::start(vec![mqtt]).await;

    let response = reqwest::get(format!("{}/health", harness.base))
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");

    harness.stop().await;
}
