pub mod defaults;
pub mod listing;
mod models;

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use url::Url;

use crate::catalog::CatalogEntry;
pub use defaults::default_mirrors;
pub use models::{
    ArtifactLocator, Candidate, ImageTemplate, ListingProbe, PatternProbe, PinnedProbe, ProbeSpec,
    Selection,
};
use models::render;

const USER_AGENT: &str = "vps-manager/0.1";

/// A unit of logic that checks one distribution's public download location.
///
/// A probe returns every image it could confirm. An error means "nothing
/// found here"; the catalog logs it and moves on.
#[async_trait]
pub trait MirrorProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn probe(&self, prober: &Prober) -> Result<Vec<CatalogEntry>, ProbeError>;
}

// ---- Errors ----
#[derive(thiserror::Error, Debug)]
pub enum ProbeError {
    #[error("nothing published for {0}")]
    NotFound(String),
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("HTTP {status} for {url}")]
    Status { url: String, status: StatusCode },
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("invalid URL {url}: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

/// HTTP side of probing: short-timeout existence checks and listing fetches.
#[derive(Debug, Clone)]
pub struct Prober {
    client: Client,
    check_timeout: Duration,
    listing_timeout: Duration,
}

impl Prober {
    pub fn new(check_timeout: Duration, listing_timeout: Duration) -> Result<Self, ProbeError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(check_timeout)
            .build()
            .map_err(ProbeError::Client)?;

        Ok(Self {
            client,
            check_timeout,
            listing_timeout,
        })
    }

    /// HEAD `url`. Any failure, including a non-success status, is `false`.
    pub async fn exists(&self, url: &str) -> bool {
        match self
            .client
            .head(url)
            .timeout(self.check_timeout)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::debug!(%url, status = %resp.status(), "existence check rejected");
                false
            }
            Err(err) => {
                tracing::debug!(%url, error = %err, "existence check failed");
                false
            }
        }
    }

    /// Fetch a directory listing page as text.
    pub async fn listing(&self, url: &str) -> Result<String, ProbeError> {
        let http_err = |source| ProbeError::Http {
            url: url.to_string(),
            source,
        };

        let resp = self
            .client
            .get(url)
            .timeout(self.listing_timeout)
            .send()
            .await
            .map_err(http_err)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ProbeError::Status {
                url: url.to_string(),
                status,
            });
        }

        resp.text().await.map_err(http_err)
    }
}

#[async_trait]
impl MirrorProbe for ProbeSpec {
    fn name(&self) -> &str {
        self.image().distro()
    }

    async fn probe(&self, prober: &Prober) -> Result<Vec<CatalogEntry>, ProbeError> {
        let found = match self {
            ProbeSpec::Pinned(p) => probe_pinned(p, prober).await?,
            ProbeSpec::Pattern(p) => probe_pattern(p, prober).await?,
            ProbeSpec::Listing(p) => probe_listing(p, prober).await?,
        };

        if found.is_empty() {
            return Err(ProbeError::NotFound(format!(
                "{} ({})",
                self.name(),
                self.strategy()
            )));
        }
        Ok(found)
    }
}

fn make_entry(image: &ImageTemplate, version: &str, codename: Option<&str>, url: String) -> CatalogEntry {
    CatalogEntry::new(
        render(&image.display_name, version, codename),
        image.distro.clone(),
        version.to_string(),
        render(&image.filename, version, codename),
        url,
        image.lts,
    )
}

async fn probe_pinned(p: &PinnedProbe, prober: &Prober) -> Result<Vec<CatalogEntry>, ProbeError> {
    if prober.exists(&p.url).await {
        Ok(vec![make_entry(&p.image, &p.version, None, p.url.clone())])
    } else {
        Ok(Vec::new())
    }
}

async fn probe_pattern(p: &PatternProbe, prober: &Prober) -> Result<Vec<CatalogEntry>, ProbeError> {
    let mut out = Vec::new();
    for candidate in &p.versions {
        let codename = candidate.codename.as_deref();
        let url = render(&p.url, &candidate.version, codename);
        if prober.exists(&url).await {
            out.push(make_entry(&p.image, &candidate.version, codename, url));
        }
    }
    Ok(out)
}

async fn probe_listing(p: &ListingProbe, prober: &Prober) -> Result<Vec<CatalogEntry>, ProbeError> {
    let version_re = Regex::new(&p.version_pattern)?;
    let html = prober.listing(&p.index_url).await?;

    let mut versions = listing::extract_captures(&html, &version_re);
    if let Some(floor) = &p.min_version {
        versions.retain(|v| listing::compare_versions(v, floor).is_ge());
    }

    let chosen: Vec<String> = match p.select {
        Selection::Latest => listing::latest(&versions).cloned().into_iter().collect(),
        Selection::All => versions,
    };

    let mut out = Vec::new();
    for version in chosen {
        match locate_artifact(&p.artifact, &version, prober).await {
            Ok(Some(url)) => out.push(make_entry(&p.image, &version, None, url)),
            Ok(None) => {
                tracing::debug!(distro = %p.image.distro, %version, "no artifact for listed version")
            }
            Err(err) => {
                tracing::debug!(distro = %p.image.distro, %version, error = %err, "artifact lookup failed")
            }
        }
    }
    Ok(out)
}

async fn locate_artifact(
    locator: &ArtifactLocator,
    version: &str,
    prober: &Prober,
) -> Result<Option<String>, ProbeError> {
    match locator {
        ArtifactLocator::Template { url } => {
            let url = render(url, version, None);
            Ok(prober.exists(&url).await.then_some(url))
        }
        ArtifactLocator::Scrape {
            directory,
            file_pattern,
        } => {
            let directory = render(directory, version, None);
            let file_re = Regex::new(&file_pattern.replace("{version}", &regex::escape(version)))?;
            let html = prober.listing(&directory).await?;

            let Some(file) = listing::extract_captures(&html, &file_re).into_iter().next() else {
                return Ok(None);
            };
            join_url(&directory, &file).map(Some)
        }
    }
}

/// Resolve a listing href against its directory URL.
fn join_url(directory: &str, href: &str) -> Result<String, ProbeError> {
    let url_err = |source| ProbeError::Url {
        url: directory.to_string(),
        source,
    };
    let mut base = Url::parse(directory).map_err(url_err)?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(href).map(String::from).map_err(url_err)
}
