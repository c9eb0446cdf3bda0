// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Envelope signing using HMAC-SHA256 over a pre-shared secret.
//!
//! The signature covers the canonical JSON of `{event, nonce, timestamp}`:
//! struct field order, no whitespace. A receiver holding the same secret
//! re-serializes those three fields from the envelope and compares. The
//! signature is sent both in the body and as `X-Signature: sha256=<hex>`.

use crate::clock;
use crate::config::{AgentConfig, ConfigError};
use crate::events::Event;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

const NONCE_BYTES: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("signing secret is empty")]
    MissingKey,

    #[error("failed to serialize envelope: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid signing key: {0}")]
    InvalidKey(String),
}

/// A signed event, ready to be queued and delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: Event,
    /// Unix seconds at which the envelope was signed
    pub timestamp: i64,
    /// Random hex token, unique per envelope
    pub nonce: String,
    /// Lowercase hex HMAC-SHA256; absent only in unsigned dry-run mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Serialize)]
struct SignedFields<'a> {
    event: &'a Event,
    nonce: &'a str,
    timestamp: i64,
}

impl Envelope {
    /// The exact bytes covered by the signature.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&SignedFields {
            event: &self.event,
            nonce: &self.nonce,
            timestamp: self.timestamp,
        })
    }

    /// Value for the `X-Signature` header.
    pub fn signature_header(&self) -> Option<String> {
        self.signature.as_ref().map(|sig| format!("sha256={sig}"))
    }
}

#[derive(Clone)]
pub enum Signer {
    Hmac { key: Vec<u8> },
    /// Dry-run only: envelopes carry no signature
    Unsigned,
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signer::Hmac { .. } => write!(f, "Signer::Hmac"),
            Signer::Unsigned => write!(f, "Signer::Unsigned"),
        }
    }
}

impl Signer {
    pub fn new(secret: &str) -> Result<Self, SignerError> {
        if secret.is_empty() {
            return Err(SignerError::MissingKey);
        }
        Ok(Signer::Hmac {
            key: secret.as_bytes().to_vec(),
        })
    }

    /// Builds the signer for a validated configuration.
    ///
    /// Without a secret the agent only runs in dry-run mode, unsigned.
    pub fn from_config(config: &AgentConfig) -> Result<Self, ConfigError> {
        match config.agent_key.as_deref() {
            Some(secret) if !secret.is_empty() => Ok(Signer::Hmac {
                key: secret.as_bytes().to_vec(),
            }),
            _ if config.dry_run => {
                warn!("AGENT_KEY not set, dry-run envelopes will not be signed");
                Ok(Signer::Unsigned)
            }
            _ => Err(ConfigError::MissingSigningKey),
        }
    }

    pub fn is_signing(&self) -> bool {
        matches!(self, Signer::Hmac { .. })
    }

    /// Wraps an event in an envelope with a fresh nonce and signs it.
    pub fn sign(&self, event: Event) -> Result<Envelope, SignerError> {
        let mut envelope = Envelope {
            event,
            timestamp: clock::unix_secs(),
            nonce: hex::encode(rand::random::<[u8; NONCE_BYTES]>()),
            signature: None,
        };
        if let Signer::Hmac { key } = self {
            let mac = Self::mac(key, &envelope.canonical_bytes()?)?;
            envelope.signature = Some(hex::encode(mac.finalize().into_bytes()));
        }
        Ok(envelope)
    }

    /// Checks an envelope's signature in constant time.
    ///
    /// Always false for the unsigned signer.
    pub fn verify(&self, envelope: &Envelope) -> bool {
        let Signer::Hmac { key } = self else {
            return false;
        };
        let Some(expected) = envelope
            .signature
            .as_deref()
            .and_then(|sig| hex::decode(sig).ok())
        else {
            return false;
        };
        let Ok(payload) = envelope.canonical_bytes() else {
            return false;
        };
        match Self::mac(key, &payload) {
            Ok(mac) => mac.verify_slice(&expected).is_ok(),
            Err(_) => false,
        }
    }

    fn mac(key: &[u8], payload: &[u8]) -> Result<HmacSha256, SignerError> {
        let mut mac =
            HmacSha256::new_from_slice(key).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        mac.update(payload);
        Ok(mac)
    }
}
