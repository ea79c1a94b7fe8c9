use serde::{Deserialize, Serialize};

/// How a single mirror is probed. Serde is confined to this module tree; the
/// JSON settings file carries a list of these under `mirrors`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ProbeSpec {
    /// A fixed URL re-checked on every refresh (rolling or `latest` channels).
    Pinned(PinnedProbe),
    /// Known versions substituted into a URL template and existence-checked.
    Pattern(PatternProbe),
    /// Versions discovered from a directory listing.
    Listing(ListingProbe),
}

/// Naming shared by every strategy. `{version}` and `{codename}` placeholders
/// are substituted per candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageTemplate {
    pub(crate) distro: String,
    pub(crate) display_name: String,
    pub(crate) filename: String,
    #[serde(default)]
    pub(crate) lts: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinnedProbe {
    #[serde(flatten)]
    pub(crate) image: ImageTemplate,
    pub(crate) version: String,
    pub(crate) url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternProbe {
    #[serde(flatten)]
    pub(crate) image: ImageTemplate,
    pub(crate) url: String,
    pub(crate) versions: Vec<Candidate>,
}

/// One version the pattern probe should try, with an optional release codename
/// for mirrors that lay out directories by codename (Debian).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub(crate) version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) codename: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingProbe {
    #[serde(flatten)]
    pub(crate) image: ImageTemplate,
    pub(crate) index_url: String,
    /// Regex with one capture group matching a version directory in the index.
    pub(crate) version_pattern: String,
    #[serde(default)]
    pub(crate) select: Selection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) min_version: Option<String>,
    pub(crate) artifact: ArtifactLocator,
}

/// Which of the discovered versions become catalog entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    #[default]
    Latest,
    All,
}

/// How a discovered version is turned into a concrete artifact URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactLocator {
    /// Build the URL from a template and existence-check it.
    Template { url: String },
    /// Fetch a second listing and take the first filename matching the
    /// pattern. `{version}` inside `file_pattern` is regex-escaped.
    Scrape {
        directory: String,
        file_pattern: String,
    },
}

impl ProbeSpec {
    pub fn image(&self) -> &ImageTemplate {
        match self {
            ProbeSpec::Pinned(p) => &p.image,
            ProbeSpec::Pattern(p) => &p.image,
            ProbeSpec::Listing(p) => &p.image,
        }
    }

    pub fn strategy(&self) -> &'static str {
        match self {
            ProbeSpec::Pinned(_) => "pinned",
            ProbeSpec::Pattern(_) => "pattern",
            ProbeSpec::Listing(_) => "listing",
        }
    }
}

impl ImageTemplate {
    pub fn new(
        distro: impl Into<String>,
        display_name: impl Into<String>,
        filename: impl Into<String>,
        lts: bool,
    ) -> Self {
        Self {
            distro: distro.into(),
            display_name: display_name.into(),
            filename: filename.into(),
            lts,
        }
    }

    pub fn distro(&self) -> &str {
        &self.distro
    }
}

impl Candidate {
    pub fn new(version: impl Into<String>, codename: Option<&str>) -> Self {
        Self {
            version: version.into(),
            codename: codename.map(str::to_string),
        }
    }
}

/// Substitute `{version}` and `{codename}` in a template.
pub(crate) fn render(template: &str, version: &str, codename: Option<&str>) -> String {
    let rendered = template.replace("{version}", version);
    match codename {
        Some(codename) => rendered.replace("{codename}", codename),
        None => rendered,
    }
}
