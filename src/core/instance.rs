//! Instance records - Ownership and credential of a single runtime instance

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// Separator used by the flat-file registry layout
pub const FIELD_DELIMITER: char = '|';

/// Number of id characters shown to users
pub const SHORT_ID_LEN: usize = 12;

/// Runtime status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// Instance is running
    Running,
    /// Instance exists but is not running
    Stopped,
}

impl InstanceStatus {
    /// Parse the status string reported by the runtime
    pub fn from_runtime(status: &str) -> Self {
        match status.trim().trim_matches('\'') {
            "running" => Self::Running,
            _ => Self::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Stopped => "Stopped",
        }
    }
}

/// A registered instance: who owns it and how to reach it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Stable identity of the owning user
    pub owner: String,
    /// Runtime-assigned identifier
    pub instance_id: String,
    /// Most recently issued connection string
    pub credential: String,
    /// OS choice the instance was deployed from, if known
    pub image: Option<String>,
    /// When the record was first committed
    pub created_at: DateTime<Utc>,
}

impl InstanceRecord {
    pub fn new(
        owner: impl Into<String>,
        instance_id: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            instance_id: instance_id.into(),
            credential: credential.into(),
            image: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Display form of the instance id
    pub fn short_id(&self) -> &str {
        short_id(&self.instance_id)
    }

    /// Check that every field can be stored in the line-oriented layout
    pub fn validate(&self) -> Result<(), RegistryError> {
        validate_field("owner", &self.owner)?;
        validate_field("instance id", &self.instance_id)?;
        validate_field("credential", &self.credential)?;
        Ok(())
    }
}

/// First characters of an instance id, for logs and display
pub fn short_id(instance_id: &str) -> &str {
    match instance_id.char_indices().nth(SHORT_ID_LEN) {
        Some((idx, _)) => &instance_id[..idx],
        None => instance_id,
    }
}

/// Reject values that would break the one-record-per-line layout
pub fn validate_field(field: &'static str, value: &str) -> Result<(), RegistryError> {
    if value.trim().is_empty() {
        return Err(RegistryError::InvalidField {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    if value.contains(FIELD_DELIMITER) || value.contains('\n') || value.contains('\r') {
        return Err(RegistryError::InvalidField {
            field,
            reason: format!("must not contain '{}' or line breaks", FIELD_DELIMITER),
        });
    }
    Ok(())
}

/// Committed lifecycle transitions kept in the instance history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceEvent {
    Deployed,
    Started,
    Stopped,
    Restarted,
    CredentialRotated,
    Removed,
    SelfHealed,
}

impl InstanceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployed => "deployed",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Restarted => "restarted",
            Self::CredentialRotated => "credential_rotated",
            Self::Removed => "removed",
            Self::SelfHealed => "self_healed",
        }
    }
}

impl std::fmt::Display for InstanceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of instance history
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub instance_id: String,
    pub owner: String,
    pub event: String,
    pub time: DateTime<Utc>,
    pub details: Option<String>,
}

/// A record together with the status the runtime reported for it
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub record: InstanceRecord,
    /// `None` when the runtime could not report a status
    pub status: Option<InstanceStatus>,
}

impl InstanceSummary {
    pub fn status_label(&self) -> &'static str {
        self.status.map(|s| s.label()).unwrap_or("Unknown")
    }
}
