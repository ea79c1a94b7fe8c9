use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Lifecycle of a registered image's local artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageStatus {
    Pending,
    Downloading,
    Ready,
    Error,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Pending => "PENDING",
            ImageStatus::Downloading => "DOWNLOADING",
            ImageStatus::Ready => "READY",
            ImageStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A logical image name mapped to where it comes from and where it lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    name: String,
    url: String,
    local_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
    status: ImageStatus,
}

impl RegistryEntry {
    pub(crate) fn new(name: String, url: String, local_path: PathBuf, checksum: Option<String>) -> Self {
        Self {
            name,
            url,
            local_path,
            checksum,
            status: ImageStatus::Pending,
        }
    }

    /// Logical name, e.g. `ubuntu-24.04`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// Stored for reference; downloads only warn on a mismatch.
    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    pub fn status(&self) -> ImageStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: ImageStatus) {
        self.status = status;
    }
}
