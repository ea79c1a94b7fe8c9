mod models;

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use url::Url;

pub use models::{ImageStatus, RegistryEntry};

use crate::config::Settings;
use crate::helpers::image_resolver::{DownloadError, download_to};
use crate::helpers::write_atomic;

const USER_AGENT: &str = "vps-manager/0.1";
const ARTIFACT_EXTENSION: &str = "qcow2";

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("image '{0}' not registered")]
    NotRegistered(String),
    #[error("invalid image name {0:?}: use letters, digits, '.', '-' or '_'")]
    InvalidName(String),
    #[error("invalid image URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to download image '{name}': {source}")]
    DownloadFailed {
        name: String,
        #[source]
        source: DownloadError,
    },
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("registry file {} is unreadable: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Durable logical-name → image mapping with on-demand download.
///
/// Every mutation rewrites the registry file in full while the write lock is
/// held. Downloads happen outside the lock; at most one runs per name.
pub struct ImageRegistry {
    registry_path: PathBuf,
    cache_dir: PathBuf,
    client: Client,
    entries: RwLock<BTreeMap<String, RegistryEntry>>,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ImageRegistry {
    pub fn open(registry_path: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let registry_path = registry_path.into();
        let cache_dir = cache_dir.into();

        fs::create_dir_all(&cache_dir).map_err(|source| RegistryError::Io {
            path: cache_dir.clone(),
            source,
        })?;

        let entries = load_entries(&registry_path)?;
        tracing::debug!(path = %registry_path.display(), count = entries.len(), "image registry loaded");

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(RegistryError::Client)?;

        Ok(Self {
            registry_path,
            cache_dir,
            client,
            entries: RwLock::new(entries),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, RegistryError> {
        Self::open(settings.registry_path(), &settings.image_cache_dir)
    }

    /// Where `name`'s artifact lives. Names are restricted to a filename-safe
    /// alphabet, so distinct names never share a path.
    pub fn artifact_path(&self, name: &str) -> Result<PathBuf, RegistryError> {
        validate_name(name)?;
        Ok(self.cache_dir.join(format!("{name}.{ARTIFACT_EXTENSION}")))
    }

    /// Create or completely overwrite the entry for `name`, reset to `Pending`.
    pub fn register(&self, name: &str, url: &str, checksum: Option<&str>) -> Result<RegistryEntry, RegistryError> {
        let local_path = self.artifact_path(name)?;
        validate_url(url)?;

        let entry = RegistryEntry::new(
            name.to_string(),
            url.to_string(),
            local_path,
            checksum.filter(|c| !c.is_empty()).map(str::to_string),
        );

        let mut entries = self.entries.write();
        if let Some(previous) = entries.insert(name.to_string(), entry.clone()) {
            tracing::info!(image = name, previous_url = previous.url(), url, "image re-registered");
        } else {
            tracing::info!(image = name, url, "image registered");
        }
        self.persist(&entries)?;

        Ok(entry)
    }

    pub fn get(&self, name: &str) -> Option<RegistryEntry> {
        self.entries.read().get(name).cloned()
    }

    /// Every entry, ordered by name.
    pub fn entries(&self) -> Vec<RegistryEntry> {
        self.entries.read().values().cloned().collect()
    }

    /// Return the entry for `name`, downloading its artifact first if the
    /// local file is missing. A present file means no network I/O at all.
    pub async fn resolve(&self, name: &str) -> Result<RegistryEntry, RegistryError> {
        let entry = self
            .get(name)
            .ok_or_else(|| RegistryError::NotRegistered(name.to_string()))?;
        if entry.local_path().exists() {
            tracing::debug!(image = name, path = %entry.local_path().display(), "image already cached");
            return Ok(entry);
        }

        let guard = self.download_guard(name);
        let fetched = {
            let _in_flight = guard.lock().await;
            self.fetch_current(name).await
        };
        drop(guard);
        self.release_guard(name);

        fetched
    }

    /// Download whatever URL `name` is registered for right now. Must be
    /// called with the name's download guard held.
    async fn fetch_current(&self, name: &str) -> Result<RegistryEntry, RegistryError> {
        loop {
            // Whoever held the guard before us may have fetched it already.
            let entry = self
                .get(name)
                .ok_or_else(|| RegistryError::NotRegistered(name.to_string()))?;
            if entry.local_path().exists() {
                return Ok(entry);
            }

            let prior = entry.status();
            if self.update_status(name, entry.url(), ImageStatus::Downloading)?.is_none() {
                continue;
            }
            tracing::info!(image = name, url = entry.url(), "pulling image");

            let staging = staging_path(entry.local_path());
            let done = match download_to(&self.client, entry.url(), &staging).await {
                Ok(done) => done,
                Err(source) => {
                    if let Err(err) = self.update_status(name, entry.url(), prior) {
                        tracing::warn!(image = name, error = %err, "failed to restore image status");
                    }
                    return Err(RegistryError::DownloadFailed {
                        name: name.to_string(),
                        source,
                    });
                }
            };

            if let Some(expected) = entry.checksum()
                && !expected.trim_start_matches("sha256:").eq_ignore_ascii_case(&done.sha256)
            {
                tracing::warn!(image = name, expected, actual = %done.sha256, "checksum differs (not enforced)");
            }

            match self.promote(name, entry.url(), &staging) {
                Ok(Some(ready)) => {
                    tracing::info!(
                        image = name,
                        path = %ready.local_path().display(),
                        bytes = done.bytes,
                        sha256 = %done.sha256,
                        "image ready"
                    );
                    return Ok(ready);
                }
                Ok(None) => {
                    remove_stale(&staging);
                    tracing::info!(image = name, stale_url = entry.url(), "discarded download for a replaced URL");
                }
                Err(err) => {
                    remove_stale(&staging);
                    return Err(err);
                }
            }
        }
    }

    /// Move a finished download into `name`'s artifact path and mark it
    /// `Ready`, but only while `name` is still registered for `url`.
    fn promote(&self, name: &str, url: &str, staging: &Path) -> Result<Option<RegistryEntry>, RegistryError> {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(name) else {
            return Err(RegistryError::NotRegistered(name.to_string()));
        };
        if entry.url() != url {
            tracing::warn!(image = name, url, current = entry.url(), "image re-registered during download");
            return Ok(None);
        }

        fs::rename(staging, entry.local_path()).map_err(|source| RegistryError::Io {
            path: entry.local_path().to_path_buf(),
            source,
        })?;
        entry.set_status(ImageStatus::Ready);
        let updated = entry.clone();
        self.persist(&entries)?;
        Ok(Some(updated))
    }

    /// Set `name`'s status if it is still registered for `url`. Returns the
    /// updated entry, or `None` when it was re-registered in the meantime.
    fn update_status(
        &self,
        name: &str,
        url: &str,
        status: ImageStatus,
    ) -> Result<Option<RegistryEntry>, RegistryError> {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(name) else {
            return Err(RegistryError::NotRegistered(name.to_string()));
        };
        if entry.url() != url {
            tracing::warn!(image = name, url, current = entry.url(), "image re-registered during download");
            return Ok(None);
        }

        entry.set_status(status);
        let updated = entry.clone();
        self.persist(&entries)?;
        Ok(Some(updated))
    }

    fn download_guard(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut in_flight = self.in_flight.lock();
        Arc::clone(in_flight.entry(name.to_string()).or_default())
    }

    /// Forget `name`'s guard once nobody else holds or waits on it.
    fn release_guard(&self, name: &str) {
        let mut in_flight = self.in_flight.lock();
        if let Some(guard) = in_flight.get(name)
            && Arc::strong_count(guard) == 1
        {
            in_flight.remove(name);
        }
    }

    fn persist(&self, entries: &BTreeMap<String, RegistryEntry>) -> Result<(), RegistryError> {
        let bytes = serde_json::to_vec_pretty(entries).map_err(|source| RegistryError::Corrupt {
            path: self.registry_path.clone(),
            source,
        })?;
        write_atomic(&self.registry_path, &bytes).map_err(|source| RegistryError::Io {
            path: self.registry_path.clone(),
            source,
        })
    }
}

fn load_entries(path: &Path) -> Result<BTreeMap<String, RegistryEntry>, RegistryError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(source) => {
            return Err(RegistryError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    serde_json::from_slice(&data).map_err(|source| RegistryError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Completed downloads wait here until they are known to match the current
/// registration.
fn staging_path(artifact: &Path) -> PathBuf {
    let mut name: OsString = artifact.as_os_str().to_owned();
    name.push(".incoming");
    PathBuf::from(name)
}

fn remove_stale(path: &Path) {
    if let Err(err) = fs::remove_file(path)
        && err.kind() != io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %err, "failed to remove stale download");
    }
}

fn validate_name(name: &str) -> Result<(), RegistryError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));

    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidName(name.to_string()))
    }
}

fn validate_url(url: &str) -> Result<(), RegistryError> {
    let invalid = |reason: String| RegistryError::InvalidUrl {
        url: url.to_string(),
        reason,
    };

    let parsed = Url::parse(url).map_err(|err| invalid(err.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(format!("unsupported scheme '{other}'"))),
    }
}
