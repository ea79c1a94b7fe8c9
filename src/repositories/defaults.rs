use super::models::{
    ArtifactLocator, Candidate, ImageTemplate, ListingProbe, PatternProbe, PinnedProbe, ProbeSpec,
    Selection,
};

const UBUNTU_RELEASES: &str = "https://cloud-images.ubuntu.com/releases/";
const FEDORA_RELEASES: &str = "https://download.fedoraproject.org/pub/fedora/linux/releases/";
const OPENSUSE_IMAGES: &str = "https://download.opensuse.org/repositories/Cloud:/Images:/";
const ALPINE_ROOT: &str = "https://dl-cdn.alpinelinux.org/alpine/";

/// Built-in mirror set used when the settings file does not list `mirrors`.
pub fn default_mirrors() -> Vec<ProbeSpec> {
    let rhel_majors = || {
        (8..12)
            .map(|major: u32| Candidate::new(major.to_string(), None))
            .collect::<Vec<_>>()
    };

    vec![
        ProbeSpec::Listing(ListingProbe {
            image: ImageTemplate::new("ubuntu", "Ubuntu {version} LTS", "ubuntu-{version}.img", true),
            index_url: UBUNTU_RELEASES.to_string(),
            version_pattern: r#"href="(2[2-9]\.04)/""#.to_string(),
            select: Selection::All,
            min_version: None,
            artifact: ArtifactLocator::Scrape {
                directory: format!("{UBUNTU_RELEASES}{{version}}/release/"),
                file_pattern: r#"href="(ubuntu-{version}-server-cloudimg-amd64\.img)""#.to_string(),
            },
        }),
        ProbeSpec::Pattern(PatternProbe {
            image: ImageTemplate::new(
                "debian",
                "Debian {version} ({codename})",
                "debian-{version}.qcow2",
                true,
            ),
            url: "https://cloud.debian.org/images/cloud/{codename}/latest/debian-{version}-generic-amd64.qcow2"
                .to_string(),
            versions: vec![
                Candidate::new("13", Some("trixie")),
                Candidate::new("12", Some("bookworm")),
                Candidate::new("11", Some("bullseye")),
            ],
        }),
        ProbeSpec::Pattern(PatternProbe {
            image: ImageTemplate::new("alma", "AlmaLinux {version}", "alma-{version}.qcow2", true),
            url: "https://repo.almalinux.org/almalinux/{version}/cloud/x86_64/images/AlmaLinux-{version}-GenericCloud-latest.x86_64.qcow2"
                .to_string(),
            versions: rhel_majors(),
        }),
        ProbeSpec::Pattern(PatternProbe {
            image: ImageTemplate::new("rocky", "Rocky Linux {version}", "rocky-{version}.qcow2", true),
            url: "https://dl.rockylinux.org/pub/rocky/{version}/images/x86_64/Rocky-{version}-GenericCloud.latest.x86_64.qcow2"
                .to_string(),
            versions: rhel_majors(),
        }),
        ProbeSpec::Pattern(PatternProbe {
            image: ImageTemplate::new("centos", "CentOS Stream {version}", "centos-{version}.qcow2", false),
            url: "https://cloud.centos.org/centos/{version}-stream/x86_64/images/CentOS-Stream-GenericCloud-{version}-latest.x86_64.qcow2"
                .to_string(),
            versions: rhel_majors(),
        }),
        ProbeSpec::Listing(ListingProbe {
            image: ImageTemplate::new("fedora", "Fedora {version}", "fedora-{version}.qcow2", false),
            index_url: FEDORA_RELEASES.to_string(),
            version_pattern: r#"href="([0-9]+)/""#.to_string(),
            select: Selection::Latest,
            min_version: None,
            artifact: ArtifactLocator::Scrape {
                directory: format!("{FEDORA_RELEASES}{{version}}/Cloud/x86_64/images/"),
                file_pattern: r#"href="(Fedora-Cloud-Base-Generic-[^"]+\.qcow2)""#.to_string(),
            },
        }),
        ProbeSpec::Listing(ListingProbe {
            image: ImageTemplate::new("opensuse", "OpenSUSE Leap {version}", "opensuse-{version}.qcow2", true),
            index_url: OPENSUSE_IMAGES.to_string(),
            version_pattern: r#"href="Leap_([0-9]+\.[0-9]+)/""#.to_string(),
            select: Selection::All,
            min_version: Some("15.5".to_string()),
            artifact: ArtifactLocator::Template {
                url: format!(
                    "{OPENSUSE_IMAGES}Leap_{{version}}/images/openSUSE-Leap-{{version}}.x86_64-NoCloud.qcow2"
                ),
            },
        }),
        ProbeSpec::Listing(ListingProbe {
            image: ImageTemplate::new("alpine", "Alpine Linux {version}", "alpine-{version}.qcow2", true),
            index_url: ALPINE_ROOT.to_string(),
            version_pattern: r#"href="(v3\.[0-9]+)/""#.to_string(),
            select: Selection::All,
            min_version: Some("v3.18".to_string()),
            artifact: ArtifactLocator::Scrape {
                directory: format!("{ALPINE_ROOT}{{version}}/releases/cloud/"),
                file_pattern: r#"href="(nocloud_alpine-[^"]+-x86_64-bios-cloudinit-r0\.qcow2)""#.to_string(),
            },
        }),
        ProbeSpec::Pinned(PinnedProbe {
            image: ImageTemplate::new("arch", "Arch Linux (Rolling)", "arch-linux.qcow2", false),
            version: "latest".to_string(),
            url: "https://geo.mirror.pkgbuild.com/images/latest/Arch-Linux-x86_64-cloudimg.qcow2".to_string(),
        }),
    ]
}
