//! Credential capture - Reads a fresh connection string from the in-instance helper
//!
//! The helper keeps running after it prints the credential, so the capture
//! only waits for the marker line, never for process exit. The wait is
//! bounded by a timeout and aborts early when the shutdown signal fires.
//! On any failure the helper is killed; on success it is left running.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::instance::{short_id, validate_field};
use super::runtime::{HelperProcess, RuntimeClient};
use super::settings::Settings;
use crate::error::CaptureError;

/// Launches the helper and extracts the credential from its output
#[derive(Debug, Clone)]
pub struct CredentialCapture {
    command: Vec<String>,
    marker: String,
    timeout: Duration,
}

impl CredentialCapture {
    pub fn new(command: Vec<String>, marker: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command,
            marker: marker.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.helper_command.clone(),
            settings.credential_marker.clone(),
            settings.capture_timeout(),
        )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Program name of the helper, used to terminate stale helpers
    pub fn program(&self) -> Option<&str> {
        self.command.first().map(String::as_str)
    }

    /// Run the helper inside `instance_id` and return the credential it prints.
    ///
    /// The helper is left running on success.
    pub async fn capture(
        &self,
        runtime: &dyn RuntimeClient,
        instance_id: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Result<String, CaptureError> {
        Ok(self.capture_pending(runtime, instance_id, shutdown).await?.keep())
    }

    /// Like [`capture`](Self::capture), but the caller decides whether the
    /// helper that issued the credential survives
    pub async fn capture_pending(
        &self,
        runtime: &dyn RuntimeClient,
        instance_id: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<PendingCredential, CaptureError> {
        if *shutdown.borrow() {
            return Err(CaptureError::Cancelled);
        }

        let mut helper = runtime
            .spawn_helper(instance_id, &self.command)
            .await
            .map_err(CaptureError::Spawn)?;
        debug!("Credential helper launched in {}", short_id(instance_id));

        let outcome = tokio::select! {
            read = tokio::time::timeout(self.timeout, self.read_credential(&mut helper)) => {
                read.unwrap_or(Err(CaptureError::Timeout(self.timeout)))
            }
            _ = cancelled(&mut shutdown) => Err(CaptureError::Cancelled),
        };

        match outcome {
            Ok(credential) => {
                info!("Captured new credential for {}", short_id(instance_id));
                Ok(PendingCredential { credential, helper })
            }
            Err(e) => {
                warn!("Credential capture for {} failed: {}", short_id(instance_id), e);
                helper.terminate().await;
                Err(e)
            }
        }
    }

    async fn read_credential(&self, helper: &mut HelperProcess) -> Result<String, CaptureError> {
        while let Some(line) = helper.next_line().await? {
            if let Some(credential) = extract_credential(&line, &self.marker) {
                validate_field("credential", &credential)
                    .map_err(|e| CaptureError::InvalidCredential(e.to_string()))?;
                return Ok(credential);
            }
        }
        Err(CaptureError::StreamEnded)
    }
}

/// A captured credential whose helper is still attached
pub struct PendingCredential {
    credential: String,
    helper: HelperProcess,
}

impl PendingCredential {
    pub fn credential(&self) -> &str {
        &self.credential
    }

    /// Leave the helper running and take the credential
    pub fn keep(self) -> String {
        self.helper.detach();
        self.credential
    }

    /// Kill the helper; the credential it issued dies with it
    pub async fn discard(self) {
        self.helper.terminate().await;
    }
}

/// Text following `marker` on `line`, if the line carries a non-empty credential
pub fn extract_credential(line: &str, marker: &str) -> Option<String> {
    let (_, rest) = line.split_once(marker)?;
    let credential = rest.trim();
    if credential.is_empty() {
        None
    } else {
        Some(credential.to_string())
    }
}

/// Resolves once the shutdown flag is raised; never if the sender is gone
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
