//! Image catalog - OS choices offered to users and the images behind them

use serde::{Deserialize, Serialize};

use crate::error::LifecycleError;

/// A deployable OS choice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageOption {
    /// Short name users type (e.g. "ubuntu")
    pub key: String,
    /// Runtime image reference
    pub image: String,
    /// Human-readable name
    pub name: String,
    pub description: String,
}

impl ImageOption {
    pub fn new(key: &str, image: &str, name: &str, description: &str) -> Self {
        Self {
            key: key.to_string(),
            image: image.to_string(),
            name: name.to_string(),
            description: description.to_string(),
        }
    }
}

/// Default OS choices
pub fn default_images() -> Vec<ImageOption> {
    vec![
        ImageOption::new(
            "ubuntu",
            "ubuntu-vps",
            "Ubuntu 22.04",
            "Stable and widely-used Linux distribution",
        ),
        ImageOption::new(
            "debian",
            "debian-vps",
            "Debian 12",
            "Rock-solid stability with large software repository",
        ),
        ImageOption::new("alpine", "alpine-vps", "Alpine Linux", "Lightweight and security-focused"),
        ImageOption::new(
            "arch",
            "arch-vps",
            "Arch Linux",
            "Rolling release with bleeding-edge software",
        ),
        ImageOption::new(
            "kali",
            "kali-vps",
            "Kali Linux",
            "Penetration testing and security auditing",
        ),
        ImageOption::new("fedora", "fedora-vps", "Fedora", "Innovative features with Red Hat backing"),
    ]
}

/// Lookup table from OS choice to image
#[derive(Debug, Clone)]
pub struct ImageCatalog {
    options: Vec<ImageOption>,
}

impl ImageCatalog {
    pub fn new(options: Vec<ImageOption>) -> Self {
        Self { options }
    }

    /// Resolve a user's choice, ignoring case and surrounding whitespace
    pub fn resolve(&self, choice: &str) -> Result<&ImageOption, LifecycleError> {
        let wanted = choice.trim().to_lowercase();
        self.options
            .iter()
            .find(|o| o.key == wanted)
            .ok_or_else(|| LifecycleError::ImageUnknown {
                choice: choice.to_string(),
                available: self.keys().join(", "),
            })
    }

    pub fn keys(&self) -> Vec<&str> {
        self.options.iter().map(|o| o.key.as_str()).collect()
    }

    pub fn options(&self) -> &[ImageOption] {
        &self.options
    }
}

impl Default for ImageCatalog {
    fn default() -> Self {
        Self::new(default_images())
    }
}
