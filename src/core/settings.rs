//! Orchestrator settings management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::image::{default_images, ImageCatalog, ImageOption};

/// Shortest allowed credential capture wait
pub const MIN_CAPTURE_TIMEOUT_SECS: u64 = 5;
/// Longest allowed credential capture wait
pub const MAX_CAPTURE_TIMEOUT_SECS: u64 = 900;

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Quota
    /// Maximum instances a single owner may hold
    pub server_limit: usize,

    // Runtime
    /// Container runtime CLI executable
    pub runtime_binary: String,
    /// Arguments placed before every runtime subcommand
    pub runtime_global_args: Vec<String>,
    /// Extra arguments passed when creating an instance
    pub run_args: Vec<String>,
    /// Memory cap for each instance (runtime syntax, e.g. "2g")
    pub memory_limit: Option<String>,
    /// Deployable OS choices
    pub images: Vec<ImageOption>,

    // Credential helper
    /// Helper argv executed inside the instance
    pub helper_command: Vec<String>,
    /// Token that precedes the credential in the helper output
    pub credential_marker: String,
    /// Bounded wait for the credential line, in seconds
    pub capture_timeout_secs: u64,

    // Advanced
    /// Custom data directory, taken from `--data-dir`/`VPSCTL_DATA_DIR`.
    /// Never stored: it has to be known before the registry can be opened.
    #[serde(skip)]
    pub data_directory: Option<PathBuf>,
    /// Enable debug logging
    pub debug_logging: bool,
    /// Keep instance history for N days (0 = forever)
    pub history_retention_days: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            // Quota
            server_limit: 12,

            // Runtime
            runtime_binary: "docker".to_string(),
            runtime_global_args: Vec::new(),
            run_args: vec!["--privileged".to_string()],
            memory_limit: Some("2g".to_string()),
            images: default_images(),

            // Credential helper
            helper_command: vec!["tmate".to_string(), "-F".to_string()],
            credential_marker: "ssh session:".to_string(),
            capture_timeout_secs: 120,

            // Advanced
            data_directory: None,
            debug_logging: false,
            history_retention_days: 30,
        }
    }
}

impl Settings {
    /// Get the data directory, using default if not set
    pub fn get_data_directory(&self) -> PathBuf {
        self.data_directory.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("vpsctl")
        })
    }

    /// Path of the registry database inside the data directory
    pub fn get_database_path(&self) -> PathBuf {
        self.get_data_directory().join("registry.db")
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }

    pub fn image_catalog(&self) -> ImageCatalog {
        ImageCatalog::new(self.images.clone())
    }

    /// Validate settings and fix any invalid values
    pub fn validate(&mut self) {
        self.capture_timeout_secs = self
            .capture_timeout_secs
            .clamp(MIN_CAPTURE_TIMEOUT_SECS, MAX_CAPTURE_TIMEOUT_SECS);
        if self.runtime_binary.trim().is_empty() {
            self.runtime_binary = Self::default().runtime_binary;
        }
        if self.helper_command.is_empty() {
            self.helper_command = Self::default().helper_command;
        }
        if self.credential_marker.trim().is_empty() {
            self.credential_marker = Self::default().credential_marker;
        }
        if self.images.is_empty() {
            self.images = default_images();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_service_limits() {
        let settings = Settings::default();
        assert_eq!(settings.server_limit, 12);
        assert_eq!(settings.capture_timeout(), Duration::from_secs(120));
        assert_eq!(settings.credential_marker, "ssh session:");
        assert_eq!(settings.image_catalog().keys().len(), 6);
    }

    #[test]
    fn test_validate_clamps_and_restores() {
        let mut settings = Settings {
            capture_timeout_secs: 0,
            helper_command: Vec::new(),
            credential_marker: " ".to_string(),
            ..Default::default()
        };
        settings.validate();
        assert_eq!(settings.capture_timeout_secs, MIN_CAPTURE_TIMEOUT_SECS);
        assert_eq!(settings.helper_command, vec!["tmate", "-F"]);
        assert_eq!(settings.credential_marker, "ssh session:");

        settings.capture_timeout_secs = 10_000;
        settings.validate();
        assert_eq!(settings.capture_timeout_secs, MAX_CAPTURE_TIMEOUT_SECS);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"server_limit": 3}"#).unwrap();
        assert_eq!(settings.server_limit, 3);
        assert_eq!(settings.runtime_binary, "docker");
    }

    #[test]
    fn test_database_path_under_data_directory() {
        let settings = Settings {
            data_directory: Some(PathBuf::from("/tmp/vps")),
            ..Default::default()
        };
        assert_eq!(settings.get_database_path(), PathBuf::from("/tmp/vps/registry.db"));
    }

    #[test]
    fn test_data_directory_is_not_stored() {
        let settings = Settings {
            data_directory: Some(PathBuf::from("/tmp/vps")),
            ..Default::default()
        };
        let json = serde_json::to_string(&settings).unwrap();
        assert!(!json.contains("data_directory"));

        let loaded: Settings =
            serde_json::from_str(r#"{"data_directory": "/elsewhere", "server_limit": 4}"#).unwrap();
        assert_eq!(loaded.server_limit, 4);
        assert!(loaded.data_directory.is_none());
    }
}
