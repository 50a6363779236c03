// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::logger::Field;
use crate::writer::{DeferredWriter, WriteError};

/// Summary of one RAL call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallEvent {
    pub service: String,
    pub request: String,
    /// Balancing strategy of the connector used, empty when unknown.
    pub balance: String,
    pub cost_ms: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp_ms: u64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

impl CallEvent {
    pub(crate) fn new(service: &str, request: String, balance: String, fields: &[Field]) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        Self {
            service: service.to_string(),
            request,
            balance,
            cost_ms: 0,
            ok: true,
            error_kind: None,
            error: None,
            timestamp_ms,
            fields: fields
                .iter()
                .map(|f| (f.key.clone(), f.value.clone()))
                .collect(),
        }
    }
}

#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, event: &CallEvent);
}

/// Writes one JSON object per call event through a [`DeferredWriter`].
pub struct JsonLinesRecorder {
    writer: DeferredWriter,
}

impl JsonLinesRecorder {
    pub fn new(writer: DeferredWriter) -> Self {
        Self { writer }
    }

    pub async fn close(&self) -> Result<(), WriteError> {
        self.writer.close().await
    }
}

#[async_trait]
impl EventRecorder for JsonLinesRecorder {
    async fn record(&self, event: &CallEvent) {
        let mut line = match serde_json::to_vec(event) {
            Ok(line) => line,
            Err(e) => {
                debug!(error = %e, "ral: failed to encode call event");
                return;
            }
        };
        line.push(b'\n');
        if let Err(e) = self.writer.write(line).await {
            debug!(service = %event.service, error = %e, "ral: call event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_json_lines() {
        let (client, mut server) = tokio::io::duplex(4096);
        let recorder = JsonLinesRecorder::new(DeferredWriter::new(8, Duration::ZERO, client));

        let mut ok = CallEvent::new("db", "GET k".to_string(), "round-robin".to_string(), &[]);
        ok.cost_ms = 3;
        let mut failed = CallEvent::new(
            "db",
            "SET k".to_string(),
            String::new(),
            &[Field::new("trace", "t-1")],
        );
        failed.ok = false;
        failed.error_kind = Some("timeout".to_string());
        failed.error = Some("deadline exceeded".to_string());

        recorder.record(&ok).await;
        recorder.record(&failed).await;
        recorder.close().await.unwrap();

        let mut out = String::new();
        server.read_to_string(&mut out).await.unwrap();
        let lines: Vec<serde_json::Value> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["balance"], "round-robin");
        assert_eq!(lines[0]["cost_ms"], 3);
        assert!(lines[0].get("error").is_none());
        assert_eq!(lines[1]["error_kind"], "timeout");
        assert_eq!(lines[1]["fields"]["trace"], "t-1");
    }
}
