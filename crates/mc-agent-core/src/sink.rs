// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery targets for queued envelopes.
//!
//! A sink performs exactly one attempt per call. Retrying, backoff and
//! dead-lettering belong to the queue, so any error here is simply one
//! failed attempt.

use crate::signer::Envelope;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use std::io::{self, Write};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";
pub const NONCE_HEADER: &str = "X-Nonce";

/// Longest response body kept in a [`DeliveryError::Status`].
const MAX_ERROR_BODY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("ingest responded with {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to write envelope: {0}")]
    Io(#[from] io::Error),
}

#[async_trait]
pub trait Sink: Send + Sync {
    /// Makes one delivery attempt. `Ok` means the envelope was accepted.
    async fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryError>;
}

/// Posts envelopes as JSON to the ingest endpoint.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpSink {
    pub fn new(client: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(envelope)?;
        let mut request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .header(CONTENT_TYPE, "application/json")
            .header(TIMESTAMP_HEADER, envelope.timestamp.to_string())
            .header(NONCE_HEADER, envelope.nonce.as_str());
        if let Some(signature) = envelope.signature_header() {
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout(self.timeout)
            } else {
                DeliveryError::Request(e)
            }
        })?;

        let status = response.status();
        if status.is_success() {
            debug!("Ingest accepted envelope {} with {status}", envelope.nonce);
            return Ok(());
        }

        // Only read the body when it is going into an error
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut end = MAX_ERROR_BODY;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }
        Err(DeliveryError::Status { status, body })
    }
}

/// Prints each envelope as one JSON line instead of sending it.
#[derive(Debug)]
pub struct DryRunSink<W = io::Stdout> {
    out: Mutex<W>,
}

impl DryRunSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> DryRunSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl<W: Write + Send> Sink for DryRunSink<W> {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
        let mut line = serde_json::to_vec(envelope)?;
        line.push(b'\n');

        #[allow(clippy::expect_used)]
        let mut out = self.out.lock().expect("lock poisoned");
        out.write_all(&line)?;
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventKind};
    use crate::signer::Signer;
    use mockito::Matcher;

    fn stopped_event() -> Event {
        Event {
            server_id: "minecraft-01".to_string(),
            ts: 1_718_000_000,
            kind: EventKind::ServerStopped,
        }
    }

    fn sink_for(server: &mockito::Server) -> HttpSink {
        HttpSink::new(
            reqwest::Client::new(),
            format!("{}/ingest", server.url()),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_http_sink_sends_signed_envelope() {
        let mut server = mockito::Server::new_async().await;
        let envelope = Signer::new("top-secret")
            .unwrap()
            .sign(stopped_event())
            .unwrap();
        let expected_signature = envelope.signature_header().unwrap();

        let mock = server
            .mock("POST", "/ingest")
            .match_header("content-type", "application/json")
            .match_header("x-signature", expected_signature.as_str())
            .match_header("x-timestamp", envelope.timestamp.to_string().as_str())
            .match_header("x-nonce", envelope.nonce.as_str())
            .match_body(Matcher::PartialJsonString(
                r#"{"event":{"server_id":"minecraft-01","event":"server_stopped"}}"#.to_string(),
            ))
            .with_status(202)
            .create_async()
            .await;

        sink_for(&server).deliver(&envelope).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_sink_non_2xx_is_failure() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/ingest")
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let envelope = Signer::Unsigned.sign(stopped_event()).unwrap();
        let err = sink_for(&server).deliver(&envelope).await.unwrap_err();
        match err {
            DeliveryError::Status { status, body } => {
                assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(body, "maintenance");
            }
            other => panic!("unexpected error {other:?}"),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_sink_unsigned_omits_signature_header() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/ingest")
            .match_header("x-signature", Matcher::Missing)
            .with_status(200)
            .create_async()
            .await;

        let envelope = Signer::Unsigned.sign(stopped_event()).unwrap();
        sink_for(&server).deliver(&envelope).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_sink_connection_failure() {
        // Nothing listens on the discard port
        let sink = HttpSink::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9/ingest",
            Duration::from_secs(1),
        );
        let envelope = Signer::Unsigned.sign(stopped_event()).unwrap();
        assert!(sink.deliver(&envelope).await.is_err());
    }

    #[tokio::test]
    async fn test_dry_run_sink_writes_json_lines() {
        let sink = DryRunSink::new(Vec::new());
        let envelope = Signer::new("k").unwrap().sign(stopped_event()).unwrap();
        sink.deliver(&envelope).await.unwrap();
        sink.deliver(&envelope).await.unwrap();

        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: Envelope = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed, envelope);
    }
}
