// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HTTP event ingestion.
//!
//! The network server's HTTP integration posts every event to
//! `/?event=<type>`; `/events/<type>` is accepted too. The body is forwarded
//! untouched, and its JSON scalars become template variables.

use crate::dispatcher::Dispatcher;
use crate::integration::Event;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Variable holding the event type.
pub const EVENT_VARIABLE: &str = "event";

#[derive(Debug, Deserialize)]
struct EventQuery {
    event: String,
}

/// Ingestion routes.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/", post(ingest_query))
        .route("/events/:event", post(ingest_path))
        .route("/health", get(health))
        .with_state(dispatcher)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router(dispatcher))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health() -> &'static str {
    "ok"
}

async fn ingest_query(
    State(dispatcher): State<Arc<Dispatcher>>,
    Query(query): Query<EventQuery>,
    body: Bytes,
) -> Response {
    forward(&dispatcher, &query.event, body).await
}

async fn ingest_path(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(event): Path<String>,
    body: Bytes,
) -> Response {
    forward(&dispatcher, &event, body).await
}

async fn forward(dispatcher: &Dispatcher, event_type: &str, body: Bytes) -> Response {
    let event_type = event_type.trim();
    if event_type.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing event type").into_response();
    }

    let event = Event::new(event_variables(event_type, &body), body.to_vec());
    tracing::debug!("Received {} event ({} bytes)", event_type, body.len());

    let failures = dispatcher.dispatch(&event).await;
    if failures.is_empty() {
        return StatusCode::OK.into_response();
    }

    let message = failures
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    (StatusCode::BAD_GATEWAY, message).into_response()
}

/// Template variables for an event.
///
/// Every scalar of a JSON object body is exposed under its dotted path
/// (`deviceInfo.devEui`, `rxInfo.0.rssi`); nulls are skipped. `event` always
/// holds the event type.
pub fn event_variables(event_type: &str, body: &[u8]) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    if let Ok(value @ Value::Object(_)) = serde_json::from_slice::<Value>(body) {
        flatten("", &value, &mut vars);
    }
    vars.insert(EVENT_VARIABLE.to_string(), event_type.to_string());
    vars
}

fn flatten(prefix: &str, value: &Value, out: &mut HashMap<String, String>) {
    let key = |name: &str| {
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", prefix, name)
        }
    };

    match value {
        Value::Object(map) => {
            for (name, child) in map {
                flatten(&key(name), child, out);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten(&key(&index.to_string()), child, out);
            }
        }
        Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        Value::Number(n) => {
            out.insert(prefix.to_string(), n.to_string());
        }
        Value::Bool(b) => {
            out.insert(prefix.to_string(), b.to_string());
        }
        Value::Null => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_uplink_fields() {
        let body = br#"{"applicationID":"42","applicationName":"meters","devEUI":"0102030405060708","fCnt":7,"confirmed":true,"data":null}"#;
        let vars = event_variables("up", body);
        assert_eq!(vars["event"], "up");
        assert_eq!(vars["applicationID"], "42");
        assert_eq!(vars["devEUI"], "0102030405060708");
        assert_eq!(vars["fCnt"], "7");
        assert_eq!(vars["confirmed"], "true");
        assert!(!vars.contains_key("data"));
    }

    #[test]
    fn test_nested_objects_and_arrays_use_dotted_keys() {
        let body = br#"{"deviceInfo":{"devEui":"aa","tags":{"site":"north"}},"rxInfo":[{"rssi":-57}]}"#;
        let vars = event_variables("up", body);
        assert_eq!(vars["deviceInfo.devEui"], "aa");
        assert_eq!(vars["deviceInfo.tags.site"], "north");
        assert_eq!(vars["rxInfo.0.rssi"], "-57");
    }

    #[test]
    fn test_event_type_wins_over_body_field() {
        let vars = event_variables("join", br#"{"event":"spoofed"}"#);
        assert_eq!(vars["event"], "join");
    }

    #[test]
    fn test_non_json_body_only_has_event() {
        let vars = event_variables("up", b"\x01\x02binary");
        assert_eq!(vars.len(), 1);
        assert_eq!(vars["event"], "up");

        let vars = event_variables("up", b"[1,2]");
        assert_eq!(vars.len(), 1);
    }
}
