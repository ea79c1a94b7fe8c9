use serde::{Deserialize, Serialize};

/// A downloadable image confirmed by a mirror probe. Field names on disk match
/// the catalog cache written by earlier releases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(rename = "name")]
    display_name: String,
    distro: String,
    version: String,
    filename: String,
    #[serde(rename = "url")]
    download_url: String,
    #[serde(rename = "is_lts")]
    lts: bool,
}

impl CatalogEntry {
    pub fn new(
        display_name: String,
        distro: String,
        version: String,
        filename: String,
        download_url: String,
        lts: bool,
    ) -> Self {
        Self {
            display_name,
            distro,
            version,
            filename,
            download_url,
            lts,
        }
    }

    /// Human readable name, e.g. `Ubuntu 24.04 LTS`.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn distro(&self) -> &str {
        &self.distro
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn download_url(&self) -> &str {
        &self.download_url
    }

    pub fn is_lts(&self) -> bool {
        self.lts
    }

    /// Registry name an entry is registered under when picked: `ubuntu-24.04`.
    pub fn logical_name(&self) -> String {
        format!("{}-{}", self.distro, self.version).to_lowercase()
    }

    pub(crate) fn dedup_key(&self) -> (&str, &str) {
        (&self.distro, &self.version)
    }
}
