//! Runtime settings.
//!
//! Everything has a default so a missing config file is fine; a present one
//! only needs the keys it wants to override.

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::repositories::{ProbeSpec, default_mirrors};

pub const CONFIG_ENV: &str = "VPS_MANAGER_CONFIG";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Holds the catalog cache and the image registry file.
    pub data_dir: PathBuf,
    /// Downloaded base images, one `<name>.qcow2` per registry entry.
    pub image_cache_dir: PathBuf,
    /// Per-instance overlay disks.
    pub disk_dir: PathBuf,
    /// Per-instance cloud-init seed files.
    pub seed_dir: PathBuf,
    pub catalog_ttl_hours: u64,
    pub probe_timeout_secs: u64,
    pub listing_timeout_secs: u64,
    pub listen: SocketAddr,
    pub mirrors: Vec<ProbeSpec>,
    pub kvm: KvmSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvmSettings {
    pub emulator: String,
    /// Address the VNC console listens on.
    pub graphics_listen: String,
}

impl Default for KvmSettings {
    fn default() -> Self {
        Self {
            emulator: "/usr/bin/qemu-system-x86_64".to_string(),
            graphics_listen: "0.0.0.0".to_string(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".vps-manager");

        Self {
            data_dir,
            image_cache_dir: PathBuf::from("/var/lib/libvirt/images/base"),
            disk_dir: PathBuf::from("/host-data/vms"),
            seed_dir: PathBuf::from("/host-data/configs"),
            catalog_ttl_hours: 24,
            probe_timeout_secs: 2,
            listing_timeout_secs: 5,
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            mirrors: default_mirrors(),
            kvm: KvmSettings::default(),
        }
    }
}

impl Settings {
    /// Read settings from `path`, or return the defaults when no path is
    /// given. An explicit path that does not exist is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            tracing::debug!("no config file given, using defaults");
            return Ok(Self::default());
        };

        let data = fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Self = serde_json::from_slice(&data).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::debug!(path = %path.display(), mirrors = settings.mirrors.len(), "config loaded");
        Ok(settings)
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join("catalog.json")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("images.json")
    }

    pub fn catalog_ttl(&self) -> Duration {
        Duration::from_secs(self.catalog_ttl_hours.saturating_mul(60 * 60))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn listing_timeout(&self) -> Duration {
        Duration::from_secs(self.listing_timeout_secs)
    }
}
