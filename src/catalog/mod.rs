mod entry;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::Mutex;

pub use entry::CatalogEntry;

use crate::config::Settings;
use crate::helpers::write_atomic;
use crate::repositories::{MirrorProbe, ProbeError, Prober};

/// The catalog of discoverable images.
///
/// Owns its probes, the published list and the on-disk cache. Construct one
/// per process and share it behind an `Arc`.
pub struct CatalogService {
    probes: Vec<Arc<dyn MirrorProbe>>,
    prober: Prober,
    cache_path: PathBuf,
    ttl: Duration,
    published: RwLock<Arc<Vec<CatalogEntry>>>,
}

impl CatalogService {
    pub fn new(
        probes: Vec<Arc<dyn MirrorProbe>>,
        prober: Prober,
        cache_path: impl Into<PathBuf>,
        ttl: Duration,
    ) -> Self {
        Self {
            probes,
            prober,
            cache_path: cache_path.into(),
            ttl,
            published: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, ProbeError> {
        let prober = Prober::new(settings.probe_timeout(), settings.listing_timeout())?;
        let probes = settings
            .mirrors
            .iter()
            .cloned()
            .map(|spec| Arc::new(spec) as Arc<dyn MirrorProbe>)
            .collect();

        Ok(Self::new(probes, prober, settings.catalog_path(), settings.catalog_ttl()))
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// The last published catalog, without touching disk or network.
    pub fn current(&self) -> Arc<Vec<CatalogEntry>> {
        self.published.read().clone()
    }

    /// Serve the cached catalog when it is fresh, refreshing first otherwise.
    pub async fn load(&self) -> Arc<Vec<CatalogEntry>> {
        match self.read_fresh_cache() {
            Some(entries) => {
                tracing::debug!(path = %self.cache_path.display(), count = entries.len(), "catalog served from cache");
                let entries = Arc::new(entries);
                *self.published.write() = Arc::clone(&entries);
                entries
            }
            None => {
                tracing::info!("catalog expired or missing, probing mirrors");
                self.refresh().await
            }
        }
    }

    /// Run every probe concurrently and publish whatever they found.
    ///
    /// Never fails: probes that find nothing are logged and skipped, so a total
    /// outage publishes an empty catalog.
    pub async fn refresh(&self) -> Arc<Vec<CatalogEntry>> {
        let found: Arc<Mutex<Vec<CatalogEntry>>> = Arc::default();

        let tasks = self.probes.iter().map(|probe| {
            let probe = Arc::clone(probe);
            let prober = self.prober.clone();
            let found = Arc::clone(&found);

            tokio::spawn(async move {
                match probe.probe(&prober).await {
                    Ok(entries) => {
                        tracing::debug!(probe = probe.name(), count = entries.len(), "probe found images");
                        found.lock().await.extend(entries);
                    }
                    Err(err) => {
                        tracing::info!(probe = probe.name(), error = %err, "probe found nothing")
                    }
                }
            })
        });

        for joined in join_all(tasks).await {
            if let Err(err) = joined {
                tracing::warn!(error = %err, "probe task aborted");
            }
        }

        let entries = std::mem::take(&mut *found.lock().await);
        self.publish(normalize(entries))
    }

    fn publish(&self, entries: Vec<CatalogEntry>) -> Arc<Vec<CatalogEntry>> {
        let entries = Arc::new(entries);
        let mut published = self.published.write();
        *published = Arc::clone(&entries);

        // A failed write only costs a re-probe on the next load.
        match serde_json::to_vec_pretty(entries.as_ref()) {
            Ok(bytes) => match write_atomic(&self.cache_path, &bytes) {
                Ok(()) => tracing::info!(
                    path = %self.cache_path.display(),
                    count = entries.len(),
                    "catalog updated and cached"
                ),
                Err(err) => tracing::warn!(
                    path = %self.cache_path.display(),
                    error = %err,
                    "failed to write catalog cache"
                ),
            },
            Err(err) => tracing::warn!(error = %err, "failed to encode catalog"),
        }

        entries
    }

    fn read_fresh_cache(&self) -> Option<Vec<CatalogEntry>> {
        let modified = fs::metadata(&self.cache_path).ok()?.modified().ok()?;
        let age = modified.elapsed().unwrap_or_default();
        if age >= self.ttl {
            tracing::debug!(age_secs = age.as_secs(), "catalog cache is stale");
            return None;
        }

        let bytes = fs::read(&self.cache_path).ok()?;
        match serde_json::from_slice::<Vec<CatalogEntry>>(&bytes) {
            Ok(entries) if !entries.is_empty() => Some(entries),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(path = %self.cache_path.display(), error = %err, "ignoring unreadable catalog cache");
                None
            }
        }
    }
}

/// Sort by display name and drop repeated distro+version pairs, keeping the
/// first in sorted order. The URL tie-break makes the result independent of
/// the order probes finished in.
fn normalize(mut entries: Vec<CatalogEntry>) -> Vec<CatalogEntry> {
    entries.sort_by(|a, b| {
        a.display_name()
            .cmp(b.display_name())
            .then_with(|| a.download_url().cmp(b.download_url()))
    });

    let mut seen = HashSet::new();
    entries.retain(|e| {
        let (distro, version) = e.dedup_key();
        seen.insert((distro.to_string(), version.to_string()))
    });
    entries
}
