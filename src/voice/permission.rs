//! Microphone permission gate

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{AudioSource, CaptureConstraints, CaptureHandle};
use crate::Error;

/// Normalized microphone permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    Granted,
    Denied,
    /// Not decided yet; the user will be asked on first use
    Prompt,
    /// A query is in flight
    Checking,
}

/// Queries and requests microphone access
///
/// State changes only through [`query_permission`](Self::query_permission),
/// [`request_access`](Self::request_access), or an explicit refusal reported by
/// a recognizer. Any device stream acquired here is released before returning.
pub struct PermissionGate {
    source: Arc<dyn AudioSource>,
    constraints: CaptureConstraints,
    state: PermissionState,
}

impl PermissionGate {
    /// Create a gate over an audio source; the state starts as `Prompt`
    #[must_use]
    pub fn new(source: Arc<dyn AudioSource>, constraints: CaptureConstraints) -> Self {
        Self {
            source,
            constraints,
            state: PermissionState::Prompt,
        }
    }

    /// Last known permission state
    #[must_use]
    pub const fn state(&self) -> PermissionState {
        self.state
    }

    /// Query the current permission
    ///
    /// Uses the host's query capability when it has one. Otherwise probes by
    /// acquiring and immediately releasing the microphone.
    pub async fn query_permission(&mut self) -> PermissionState {
        self.state = PermissionState::Checking;

        let state = match self.source.query_permission().await {
            Some(PermissionState::Checking) | None => self.probe().await,
            Some(state) => state,
        };

        tracing::debug!(?state, "microphone permission queried");
        self.state = state;
        state
    }

    /// Ask the user for access, releasing the device immediately
    ///
    /// Returns whether access was granted.
    pub async fn request_access(&mut self) -> bool {
        let granted = match self.source.acquire(&self.constraints).await {
            Ok(stream) => {
                CaptureHandle::new(stream).release();
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "microphone access request failed");
                false
            }
        };

        self.state = if granted {
            PermissionState::Granted
        } else {
            PermissionState::Denied
        };
        tracing::info!(granted, "microphone access requested");
        granted
    }

    /// Record a refusal reported by a recognizer
    pub(crate) const fn mark_denied(&mut self) {
        self.state = PermissionState::Denied;
    }

    async fn probe(&self) -> PermissionState {
        match self.source.acquire(&self.constraints).await {
            Ok(stream) => {
                CaptureHandle::new(stream).release();
                PermissionState::Granted
            }
            Err(Error::PermissionDenied) => PermissionState::Denied,
            Err(e) => {
                // A missing device says nothing about permission
                tracing::warn!(error = %e, "microphone probe failed");
                PermissionState::Prompt
            }
        }
    }
}
