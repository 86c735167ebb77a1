// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test readability

//! Downlink consumption loop: ack only what the network server accepted.

use async_trait::async_trait;
use event_forward::integration::{consume_downlinks, DownlinkConsumer};
use event_forward::{
    error_channel, DownlinkCommand, DownlinkContext, DownlinkRelay, ErrorReceiver,
    IntegrationError, RelayError,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Message id plus payload.
type Message = (u32, Vec<u8>);

#[derive(Default)]
struct Acks {
    acked: Mutex<Vec<u32>>,
    closed: AtomicBool,
}

/// Replays a fixed script, then ends (or idles when `hold_open`).
struct ScriptedConsumer {
    script: VecDeque<Message>,
    hold_open: bool,
    acks: Arc<Acks>,
}

impl ScriptedConsumer {
    fn new(payloads: &[&[u8]], hold_open: bool) -> (Self, Arc<Acks>) {
        let acks = Arc::new(Acks::default());
        let script = payloads
            .iter()
            .enumerate()
            .map(|(id, payload)| (id as u32, payload.to_vec()))
            .collect();
        (
            Self {
                script,
                hold_open,
                acks: acks.clone(),
            },
            acks,
        )
    }
}

impl DownlinkConsumer for ScriptedConsumer {
    type Message = Message;

    async fn receive(&mut self) -> Option<Result<Message, IntegrationError>> {
        match self.script.pop_front() {
            Some(message) => Some(Ok(message)),
            None if self.hold_open => std::future::pending().await,
            None => None,
        }
    }

    fn payload(message: &Message) -> &[u8] {
        &message.1
    }

    async fn ack(&mut self, message: &Message) -> Result<(), IntegrationError> {
        self.acks.acked.lock().unwrap().push(message.0);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), IntegrationError> {
        self.acks.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct Relay {
    submitted: Mutex<Vec<String>>,
    reject: bool,
}

#[async_trait]
impl DownlinkRelay for Relay {
    async fn submit(&self, command: &DownlinkCommand) -> Result<(), RelayError> {
        self.submitted.lock().unwrap().push(command.dev_eui.clone());
        if self.reject {
            return Err(RelayError::Status {
                status: 404,
                body: "device not found".into(),
            });
        }
        Ok(())
    }
}

fn drain(rx: &mut ErrorReceiver) -> Vec<IntegrationError> {
    let mut out = Vec::new();
    while let Ok(e) = rx.try_recv() {
        assert_eq!(e.integration, "pulsar");
        out.push(e.error);
    }
    out
}

const GOOD: &[u8] = br#"{"devEUI":"0102030405060708","fPort":1,"data":"AQ=="}"#;

#[tokio::test]
async fn test_accepted_command_is_acked() {
    let (errors, mut rx) = error_channel(16);
    let relay = Arc::new(Relay::default());
    let (consumer, acks) = ScriptedConsumer::new(&[GOOD], false);

    consume_downlinks(
        consumer,
        DownlinkContext::new(relay.clone(), errors),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(*acks.acked.lock().unwrap(), vec![0]);
    assert_eq!(*relay.submitted.lock().unwrap(), vec!["0102030405060708"]);
    assert!(drain(&mut rx).is_empty());
    assert!(acks.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_rejected_command_is_not_acked() {
    let (errors, mut rx) = error_channel(16);
    let relay = Arc::new(Relay {
        reject: true,
        ..Default::default()
    });
    let (consumer, acks) = ScriptedConsumer::new(&[GOOD], false);

    consume_downlinks(
        consumer,
        DownlinkContext::new(relay, errors),
        CancellationToken::new(),
    )
    .await;

    assert!(acks.acked.lock().unwrap().is_empty());
    let reported = drain(&mut rx);
    assert_eq!(reported.len(), 1);
    assert!(matches!(reported[0], IntegrationError::Relay(_)));
    assert!(reported[0].to_string().contains("device not found"));
}

#[tokio::test]
async fn test_malformed_messages_do_not_stop_the_loop() {
    let (errors, mut rx) = error_channel(16);
    let relay = Arc::new(Relay::default());
    let (consumer, acks) = ScriptedConsumer::new(
        &[b"not json", br#"{"fPort":1}"#, br#"{"devEUI":"  "}"#, GOOD],
        false,
    );

    consume_downlinks(
        consumer,
        DownlinkContext::new(relay.clone(), errors),
        CancellationToken::new(),
    )
    .await;

    // Only the last message reached the relay and was acked.
    assert_eq!(*acks.acked.lock().unwrap(), vec![3]);
    assert_eq!(relay.submitted.lock().unwrap().len(), 1);

    let reported = drain(&mut rx);
    assert_eq!(reported.len(), 3);
    assert!(reported
        .iter()
        .all(|e| matches!(e, IntegrationError::Decode(_))));
}

#[tokio::test]
async fn test_cancellation_stops_idle_consumer() {
    let (errors, _rx) = error_channel(16);
    let (consumer, acks) = ScriptedConsumer::new(&[GOOD], true);
    let cancel = CancellationToken::new();

    let task = tokio::spawn(consume_downlinks(
        consumer,
        DownlinkContext::new(Arc::new(Relay::default()), errors),
        cancel.clone(),
    ));

    // Wait for the scripted message, then the loop sits in receive().
    for _ in 0..100 {
        if !acks.acked.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*acks.acked.lock().unwrap(), vec![0]);
    assert!(!acks.closed.load(Ordering::SeqCst));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert!(acks.closed.load(Ordering::SeqCst));
}
