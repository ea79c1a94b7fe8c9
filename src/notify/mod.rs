//! Release notifications: register the announced image, then pull it in the
//! background.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::registry::{ImageRegistry, RegistryEntry, RegistryError};

/// Body of a release announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReleaseNotification {
    /// `{distro, version, url}`; registered as `distro-version`.
    Release {
        distro: String,
        version: String,
        url: String,
    },
    /// `{id, url, format}`; registered under `id` as given.
    Image {
        id: String,
        url: String,
        #[serde(default)]
        format: Option<String>,
    },
}

impl ReleaseNotification {
    pub fn logical_name(&self) -> String {
        match self {
            ReleaseNotification::Release { distro, version, .. } => {
                format!("{}-{}", distro.trim(), version.trim())
                    .to_lowercase()
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join("-")
            }
            ReleaseNotification::Image { id, .. } => id.trim().to_string(),
        }
    }

    pub fn url(&self) -> &str {
        match self {
            ReleaseNotification::Release { url, .. } | ReleaseNotification::Image { url, .. } => url,
        }
    }
}

/// A download started by [`Notifier::accept`]. Dropping it detaches the task.
pub struct PendingDownload {
    pub entry: RegistryEntry,
    pub task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct Notifier {
    registry: Arc<ImageRegistry>,
}

impl Notifier {
    pub fn new(registry: Arc<ImageRegistry>) -> Self {
        Self { registry }
    }

    /// Register the announced image and spawn its download without waiting
    /// for it. Registration errors are returned; download errors are logged.
    pub fn accept(&self, notification: &ReleaseNotification) -> Result<PendingDownload, RegistryError> {
        let name = notification.logical_name();
        if let ReleaseNotification::Image { format: Some(format), .. } = notification
            && !format.eq_ignore_ascii_case("qcow2")
        {
            tracing::warn!(image = %name, format = %format, "announced image is not qcow2");
        }

        let entry = self.registry.register(&name, notification.url(), None)?;
        tracing::info!(image = %name, url = notification.url(), "release announced");

        let registry = Arc::clone(&self.registry);
        let task = tokio::spawn(async move {
            match registry.resolve(&name).await {
                Ok(entry) => tracing::info!(image = %name, status = %entry.status(), "announced image available"),
                Err(err) => tracing::error!(image = %name, error = %err, "background pull failed"),
            }
        });

        Ok(PendingDownload { entry, task })
    }
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::routing::get;
    use tempfile::TempDir;

    use super::*;
    use crate::registry::ImageStatus;
    use crate::test_support::{serve, unreachable_base};

    fn registry(dir: &TempDir) -> Arc<ImageRegistry> {
        Arc::new(ImageRegistry::open(dir.path().join("images.json"), dir.path().join("cache")).unwrap())
    }

    #[test]
    fn parses_both_shapes() {
        let release: ReleaseNotification =
            serde_json::from_str(r#"{"distro":"Ubuntu","version":"24.04","url":"https://m/x.img"}"#).unwrap();
        let image: ReleaseNotification =
            serde_json::from_str(r#"{"id":"custom-7","url":"https://m/y.qcow2","format":"qcow2"}"#).unwrap();

        assert_eq!(release.logical_name(), "ubuntu-24.04");
        assert_eq!(image.logical_name(), "custom-7");
        assert_eq!(image.url(), "https://m/y.qcow2");
    }

    #[test]
    fn logical_name_folds_spaces() {
        let release = ReleaseNotification::Release {
            distro: "CentOS Stream".to_string(),
            version: "9".to_string(),
            url: "https://m/c.qcow2".to_string(),
        };
        assert_eq!(release.logical_name(), "centos-stream-9");
    }

    #[tokio::test]
    async fn accept_registers_then_downloads_in_background() {
        let dir = TempDir::new().unwrap();
        let base = serve(Router::new().route("/noble.img", get(|| async { "image" }))).await;
        let registry = registry(&dir);
        let notifier = Notifier::new(Arc::clone(&registry));

        let pending = notifier
            .accept(&ReleaseNotification::Release {
                distro: "Ubuntu".to_string(),
                version: "24.04".to_string(),
                url: format!("{base}/noble.img"),
            })
            .unwrap();

        assert_eq!(pending.entry.name(), "ubuntu-24.04");
        assert_eq!(pending.entry.status(), ImageStatus::Pending);

        pending.task.await.unwrap();
        let entry = registry.get("ubuntu-24.04").unwrap();
        assert_eq!(entry.status(), ImageStatus::Ready);
        assert!(entry.local_path().exists());
    }

    #[tokio::test]
    async fn failed_background_pull_keeps_registration() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let notifier = Notifier::new(Arc::clone(&registry));

        let pending = notifier
            .accept(&ReleaseNotification::Image {
                id: "custom-7".to_string(),
                url: format!("{}/custom.qcow2", unreachable_base()),
                format: None,
            })
            .unwrap();
        pending.task.await.unwrap();

        let entry = registry.get("custom-7").unwrap();
        assert_eq!(entry.status(), ImageStatus::Pending);
        assert!(!entry.local_path().exists());
    }

    #[tokio::test]
    async fn invalid_url_is_rejected_up_front() {
        let dir = TempDir::new().unwrap();
        let notifier = Notifier::new(registry(&dir));

        let result = notifier.accept(&ReleaseNotification::Image {
            id: "custom-7".to_string(),
            url: "ftp://mirror/custom.qcow2".to_string(),
            format: None,
        });

        assert!(matches!(result, Err(RegistryError::InvalidUrl { .. })));
    }
}
