//! Lifecycle orchestrator - Sequences runtime calls, credential capture and
//! registry commits for every instance operation
//!
//! Every operation on an existing instance runs inside that instance's
//! critical section, so two requests for the same instance never interleave
//! while requests for different instances proceed in parallel. Registry
//! changes are committed only after the runtime confirmed the operation.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::capture::CredentialCapture;
use super::image::ImageCatalog;
use super::instance::{
    short_id, validate_field, HistoryEntry, InstanceEvent, InstanceRecord, InstanceStatus,
    InstanceSummary,
};
use super::locks::{KeyGuard, KeyedLocks};
use super::quota::QuotaEnforcer;
use super::runtime::RuntimeClient;
use super::settings::Settings;
use crate::error::{CaptureError, LifecycleError, RegistryError, Result, RuntimeError};
use crate::persistence::InstanceRegistry;

/// A freshly deployed and registered instance
#[derive(Debug, Clone, Serialize)]
pub struct DeployOutcome {
    pub instance_id: String,
    pub credential: String,
    /// OS choice the instance was created from
    pub image: String,
}

/// Credential result of a start or restart.
///
/// The instance is running in both cases; a failed refresh leaves the
/// previously stored credential in place.
#[derive(Debug)]
pub enum CredentialRefresh {
    Rotated(String),
    Failed(CaptureError),
}

impl CredentialRefresh {
    pub fn credential(&self) -> Option<&str> {
        match self {
            Self::Rotated(credential) => Some(credential),
            Self::Failed(_) => None,
        }
    }

    pub fn is_rotated(&self) -> bool {
        matches!(self, Self::Rotated(_))
    }
}

/// Composes runtime, capture, registry and quota into lifecycle operations
pub struct LifecycleOrchestrator {
    runtime: Arc<dyn RuntimeClient>,
    registry: Arc<InstanceRegistry>,
    capture: CredentialCapture,
    quota: QuotaEnforcer,
    images: ImageCatalog,
    instance_locks: KeyedLocks,
    shutdown: watch::Sender<bool>,
}

impl LifecycleOrchestrator {
    pub fn new(
        runtime: Arc<dyn RuntimeClient>,
        registry: Arc<InstanceRegistry>,
        settings: &Settings,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            runtime,
            registry,
            capture: CredentialCapture::from_settings(settings),
            quota: QuotaEnforcer::new(settings.server_limit),
            images: settings.image_catalog(),
            instance_locks: KeyedLocks::new(),
            shutdown,
        }
    }

    /// Replace the credential capture configuration
    pub fn with_capture(mut self, capture: CredentialCapture) -> Self {
        self.capture = capture;
        self
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn quota(&self) -> QuotaEnforcer {
        self.quota
    }

    pub fn images(&self) -> &ImageCatalog {
        &self.images
    }

    /// Abort every in-flight credential capture; later captures fail at once
    pub fn shutdown(&self) {
        info!("Shutting down, cancelling pending credential captures");
        self.shutdown.send_replace(true);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    // === Lifecycle operations ===

    /// Create an instance for `owner`, capture its credential and register it
    pub async fn deploy(&self, owner: &str, image_choice: &str) -> Result<DeployOutcome> {
        validate_field("owner", owner)?;
        let image = self.images.resolve(image_choice)?.clone();

        if self.quota.is_at_limit(&self.registry, owner)? {
            info!("Deploy for {} rejected: quota of {} reached", owner, self.quota.limit());
            return Err(self.quota_exceeded(owner));
        }

        let instance_id = self.runtime.create(&image.image).await?;
        info!(
            "Created instance {} from {} for {}",
            short_id(&instance_id),
            image.image,
            owner
        );
        let _guard = self.instance_locks.lock(&instance_id).await;

        let pending = match self
            .capture
            .capture_pending(self.runtime.as_ref(), &instance_id, self.shutdown.subscribe())
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                self.rollback(&instance_id).await;
                return Err(LifecycleError::DeployIncomplete(e));
            }
        };

        let record = InstanceRecord::new(owner, &instance_id, pending.credential())
            .with_image(&image.key);
        if let Err(e) = self.quota.admit(&self.registry, &record) {
            pending.discard().await;
            let err = LifecycleError::from(e);
            // The id is already registered: the instance is someone else's, leave it running
            if !matches!(err, LifecycleError::DuplicateId(_)) {
                self.rollback(&instance_id).await;
            }
            return Err(self.flag(err));
        }
        pending.keep();

        info!("Registered instance {} for {}", record.short_id(), owner);
        self.note(&record, InstanceEvent::Deployed, Some(&image.key));
        Ok(DeployOutcome {
            instance_id,
            credential: record.credential,
            image: image.key,
        })
    }

    /// Start a stopped instance and issue it a fresh credential
    pub async fn start(&self, owner: &str, id_prefix: &str) -> Result<CredentialRefresh> {
        let (_guard, record) = self.resolve(owner, id_prefix).await?;
        self.ensure_present(&record).await?;

        let started = self.runtime.start(&record.instance_id).await;
        self.confirm(&record, started)?;
        info!("Started instance {}", record.short_id());
        self.note(&record, InstanceEvent::Started, None);

        self.refresh_credential(&record).await
    }

    pub async fn stop(&self, owner: &str, id_prefix: &str) -> Result<()> {
        let (_guard, record) = self.resolve(owner, id_prefix).await?;
        self.ensure_present(&record).await?;

        let stopped = self.runtime.stop(&record.instance_id).await;
        self.confirm(&record, stopped)?;
        info!("Stopped instance {}", record.short_id());
        self.note(&record, InstanceEvent::Stopped, None);
        Ok(())
    }

    /// Restart an instance and issue it a fresh credential
    pub async fn restart(&self, owner: &str, id_prefix: &str) -> Result<CredentialRefresh> {
        let (_guard, record) = self.resolve(owner, id_prefix).await?;
        self.ensure_present(&record).await?;

        let restarted = self.runtime.restart(&record.instance_id).await;
        self.confirm(&record, restarted)?;
        info!("Restarted instance {}", record.short_id());
        self.note(&record, InstanceEvent::Restarted, None);

        self.refresh_credential(&record).await
    }

    /// Replace the credential of a running instance, returning the new one
    pub async fn regenerate_credential(&self, owner: &str, id_prefix: &str) -> Result<String> {
        let (_guard, record) = self.resolve(owner, id_prefix).await?;
        let status = self.ensure_present(&record).await?;
        if !status.is_running() {
            return Err(LifecycleError::NotRunning(record.short_id().to_string()));
        }

        if let Some(program) = self.capture.program() {
            if let Err(e) = self.runtime.kill_helper(&record.instance_id, program).await {
                warn!(
                    "Could not terminate old helper in {}: {}",
                    record.short_id(),
                    e
                );
            }
        }

        let credential = self
            .capture
            .capture(
                self.runtime.as_ref(),
                &record.instance_id,
                self.shutdown.subscribe(),
            )
            .await
            .map_err(LifecycleError::RegenFailed)?;

        self.store_credential(&record, &credential)?;
        Ok(credential)
    }

    /// Tear down one of `owner`'s instances and forget it
    pub async fn remove(&self, owner: &str, id_prefix: &str) -> Result<InstanceRecord> {
        let (_guard, record) = self.resolve(owner, id_prefix).await?;
        self.teardown(&record).await?;
        Ok(record)
    }

    /// Tear down any owner's instance; the returned record names the former owner
    pub async fn force_remove(&self, id_prefix: &str) -> Result<InstanceRecord> {
        let candidate = self.registry.find_by_id_prefix(id_prefix)?;
        let (_guard, record) = self.relock(candidate, id_prefix).await?;
        info!(
            "Force-removing instance {} owned by {}",
            record.short_id(),
            record.owner
        );
        self.teardown(&record).await?;
        Ok(record)
    }

    // === Queries ===

    /// Records of `owner` with their live runtime status
    pub async fn list(&self, owner: &str) -> Result<Vec<InstanceSummary>> {
        let records = self.registry.list_by_owner(owner)?;
        Ok(self.summarize(records).await)
    }

    /// Every record with its live runtime status
    pub async fn list_all(&self) -> Result<Vec<InstanceSummary>> {
        let records = self.registry.list_all()?;
        Ok(self.summarize(records).await)
    }

    /// Event history for an instance, newest first.
    ///
    /// A prefix of a registered instance is resolved first; anything else is
    /// taken as a full id so removed instances stay queryable.
    pub fn history(&self, id_or_prefix: &str) -> Result<Vec<HistoryEntry>> {
        let instance_id = match self.registry.find_by_id_prefix(id_or_prefix) {
            Ok(record) => record.instance_id,
            Err(RegistryError::NotFound(_)) => id_or_prefix.trim().to_string(),
            Err(e) => return Err(e.into()),
        };
        Ok(self.registry.history(&instance_id)?)
    }

    pub fn count_all(&self) -> Result<usize> {
        Ok(self.registry.count_all()?)
    }

    // === Internals ===

    /// Resolve `id_prefix` among `owner`'s records and enter its critical section
    async fn resolve(&self, owner: &str, id_prefix: &str) -> Result<(KeyGuard, InstanceRecord)> {
        let candidate = self.registry.find_by_owner_and_prefix(owner, id_prefix)?;
        self.relock(candidate, id_prefix).await
    }

    /// Lock the record's instance and reload it; it may have gone while we waited
    async fn relock(
        &self,
        candidate: InstanceRecord,
        id_prefix: &str,
    ) -> Result<(KeyGuard, InstanceRecord)> {
        let guard = self.instance_locks.lock(&candidate.instance_id).await;
        match self.registry.get(&candidate.instance_id)? {
            Some(record) => Ok((guard, record)),
            None => Err(LifecycleError::NotFound(id_prefix.to_string())),
        }
    }

    /// Current runtime status; drops the record if the runtime lost the instance
    async fn ensure_present(&self, record: &InstanceRecord) -> Result<InstanceStatus> {
        match self.runtime.inspect(&record.instance_id).await {
            Ok(status) => Ok(status),
            Err(e) if e.is_not_found() => Err(self.self_heal(record)),
            Err(e) => Err(e.into()),
        }
    }

    /// Map a runtime result, self-healing if the instance vanished mid-operation
    fn confirm(
        &self,
        record: &InstanceRecord,
        result: std::result::Result<(), RuntimeError>,
    ) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Err(self.self_heal(record)),
            Err(e) => Err(e.into()),
        }
    }

    fn self_heal(&self, record: &InstanceRecord) -> LifecycleError {
        warn!(
            "Instance {} of {} is gone from the runtime, dropping its record",
            record.short_id(),
            record.owner
        );
        if let Err(e) = self.registry.delete(&record.instance_id) {
            return e.into();
        }
        self.note(record, InstanceEvent::SelfHealed, None);
        LifecycleError::StaleRecord(record.short_id().to_string())
    }

    async fn refresh_credential(&self, record: &InstanceRecord) -> Result<CredentialRefresh> {
        match self
            .capture
            .capture(
                self.runtime.as_ref(),
                &record.instance_id,
                self.shutdown.subscribe(),
            )
            .await
        {
            Ok(credential) => {
                self.store_credential(record, &credential)?;
                Ok(CredentialRefresh::Rotated(credential))
            }
            Err(e) => {
                warn!(
                    "Instance {} is up but keeps its old credential: {}",
                    record.short_id(),
                    e
                );
                Ok(CredentialRefresh::Failed(e))
            }
        }
    }

    fn store_credential(&self, record: &InstanceRecord, credential: &str) -> Result<()> {
        self.registry
            .replace_credential(&record.instance_id, credential)
            .map_err(|e| self.flag(e.into()))?;
        info!("Rotated credential of {}", record.short_id());
        self.note(record, InstanceEvent::CredentialRotated, None);
        Ok(())
    }

    /// Stop and remove in the runtime, then drop the record
    async fn teardown(&self, record: &InstanceRecord) -> Result<()> {
        let id = &record.instance_id;
        match self.runtime.stop(id).await {
            Ok(()) => match self.runtime.remove(id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => debug!("Instance {} already removed", short_id(id)),
                Err(e) => return Err(e.into()),
            },
            Err(e) if e.is_not_found() => match self.runtime.inspect(id).await {
                Err(absent) if absent.is_not_found() => {
                    info!("Instance {} already absent from the runtime", short_id(id));
                }
                Ok(_) => return Err(e.into()),
                Err(other) => return Err(other.into()),
            },
            Err(e) => return Err(e.into()),
        }

        self.registry.delete(id)?;
        info!("Removed instance {} of {}", record.short_id(), record.owner);
        self.note(record, InstanceEvent::Removed, None);
        Ok(())
    }

    /// Best-effort cleanup of an instance that never got registered
    async fn rollback(&self, instance_id: &str) {
        warn!("Rolling back instance {}", short_id(instance_id));
        if let Err(e) = self.runtime.stop(instance_id).await {
            warn!("Rollback stop of {} failed: {}", short_id(instance_id), e);
        }
        if let Err(e) = self.runtime.remove(instance_id).await {
            error!(
                "Rollback remove of {} failed, instance may be orphaned: {}",
                short_id(instance_id),
                e
            );
        }
    }

    async fn summarize(&self, records: Vec<InstanceRecord>) -> Vec<InstanceSummary> {
        let mut summaries = Vec::with_capacity(records.len());
        for record in records {
            let status = match self.runtime.inspect(&record.instance_id).await {
                Ok(status) => Some(status),
                Err(e) => {
                    debug!("No status for {}: {}", record.short_id(), e);
                    None
                }
            };
            summaries.push(InstanceSummary { record, status });
        }
        summaries
    }

    /// Append to the instance history; a failure here never fails the operation
    fn note(&self, record: &InstanceRecord, event: InstanceEvent, details: Option<&str>) {
        if let Err(e) = self.registry.record_event(record, event, details) {
            warn!(
                "Failed to record {} event for {}: {}",
                event,
                record.short_id(),
                e
            );
        }
    }

    fn quota_exceeded(&self, owner: &str) -> LifecycleError {
        LifecycleError::QuotaExceeded {
            owner: owner.to_string(),
            limit: self.quota.limit(),
        }
    }

    /// Log invariant violations loudly before handing them to the caller
    fn flag(&self, err: LifecycleError) -> LifecycleError {
        if err.is_invariant_violation() {
            error!("OPERATOR ATTENTION: {}", err);
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::runtime::HelperProcess;

    #[test]
    fn test_credential_refresh_accessors() {
        let rotated = CredentialRefresh::Rotated("ssh new@host".to_string());
        assert!(rotated.is_rotated());
        assert_eq!(rotated.credential(), Some("ssh new@host"));

        let failed = CredentialRefresh::Failed(CaptureError::StreamEnded);
        assert!(!failed.is_rotated());
        assert_eq!(failed.credential(), None);
    }

    #[test]
    fn test_flag_passes_errors_through() {
        struct Idle;

        #[async_trait::async_trait]
        impl RuntimeClient for Idle {
            async fn create(&self, _: &str) -> std::result::Result<String, RuntimeError> {
                Err(RuntimeError::NotFound("idle".into()))
            }
            async fn start(&self, _: &str) -> std::result::Result<(), RuntimeError> {
                Ok(())
            }
            async fn stop(&self, _: &str) -> std::result::Result<(), RuntimeError> {
                Ok(())
            }
            async fn restart(&self, _: &str) -> std::result::Result<(), RuntimeError> {
                Ok(())
            }
            async fn remove(&self, _: &str) -> std::result::Result<(), RuntimeError> {
                Ok(())
            }
            async fn inspect(&self, _: &str) -> std::result::Result<InstanceStatus, RuntimeError> {
                Ok(InstanceStatus::Running)
            }
            async fn spawn_helper(
                &self,
                _: &str,
                _: &[String],
            ) -> std::result::Result<HelperProcess, RuntimeError> {
                Err(RuntimeError::NotFound("idle".into()))
            }
            async fn kill_helper(&self, _: &str, _: &str) -> std::result::Result<(), RuntimeError> {
                Ok(())
            }
        }

        let registry = Arc::new(InstanceRegistry::open_in_memory().unwrap());
        let orchestrator =
            LifecycleOrchestrator::new(Arc::new(Idle), registry, &Settings::default());

        let err = orchestrator.flag(LifecycleError::DuplicateId("c1a2".into()));
        assert!(matches!(err, LifecycleError::DuplicateId(_)));
        assert!(!orchestrator.is_shut_down());
        orchestrator.shutdown();
        assert!(orchestrator.is_shut_down());
    }
}
