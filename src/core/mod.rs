//! Core module - Instance records, runtime access, credential capture and lifecycle orchestration

mod capture;
mod image;
mod instance;
mod locks;
mod orchestrator;
mod quota;
mod runtime;
pub mod settings;

pub use capture::{extract_credential, CredentialCapture, PendingCredential};
pub use image::{default_images, ImageCatalog, ImageOption};
pub use instance::{
    short_id, validate_field, HistoryEntry, InstanceEvent, InstanceRecord, InstanceStatus,
    InstanceSummary, FIELD_DELIMITER, SHORT_ID_LEN,
};
pub use locks::{KeyGuard, KeyedLocks};
pub use orchestrator::{CredentialRefresh, DeployOutcome, LifecycleOrchestrator};
pub use quota::QuotaEnforcer;
pub use runtime::{DockerCli, HelperProcess, RuntimeClient};
pub use settings::{Settings, MAX_CAPTURE_TIMEOUT_SECS, MIN_CAPTURE_TIMEOUT_SECS};
