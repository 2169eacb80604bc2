//! Worker callback verification and parsing
//!
//! Workers sign the raw request body with HMAC-SHA256 using a shared secret
//! and send the hex digest in `X-Webhook-Signature`. The body is only parsed
//! after the signature checks out.

use crate::error::{OrchestratorError, Result};
use crate::serverless::normalize_output;
use hmac::{Hmac, Mac};
use kiln_core::Artifact;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;

/// Header carrying the hex signature
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 signer/verifier for worker callbacks
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Vec<u8>,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier").finish_non_exhaustive()
    }
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self, body: &[u8]) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| OrchestratorError::config(format!("webhook secret: {}", e)))?;
        mac.update(body);
        Ok(mac)
    }

    /// Hex signature for `body`
    pub fn sign(&self, body: &[u8]) -> Result<String> {
        Ok(hex::encode(self.mac(body)?.finalize().into_bytes()))
    }

    /// Constant-time check of a hex signature
    pub fn verify(&self, body: &[u8], signature: &str) -> Result<()> {
        if self.secret.is_empty() {
            return Err(OrchestratorError::InvalidSignature);
        }
        let provided =
            hex::decode(signature.trim()).map_err(|_| OrchestratorError::InvalidSignature)?;
        self.mac(body)?
            .verify_slice(&provided)
            .map_err(|_| OrchestratorError::InvalidSignature)
    }
}

/// Worker-reported state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Processing,
    Completed,
    Failed,
}

/// Callback body
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub job_id: String,
    #[serde(default)]
    pub job_type: Option<String>,
    pub status: WebhookStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub current_stage: Option<String>,
}

impl WebhookPayload {
    pub fn parse(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map_err(|e| OrchestratorError::InvalidPayload(format!("webhook body: {}", e)))
    }

    /// Result URLs as hosted artifacts
    pub fn artifacts(&self) -> Vec<Artifact> {
        self.result.as_ref().map(normalize_output).unwrap_or_default()
    }

    /// Reported progress clamped into 0..=100
    pub fn progress_percent(&self) -> Option<u8> {
        self.progress
            .filter(|p| p.is_finite())
            .map(|p| p.clamp(0.0, 100.0).round() as u8)
    }
}
