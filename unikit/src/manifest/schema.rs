//! The YAML schema of component manifests and index manifests, plus
//! the version-selection rules applied to them.

use serde::{Deserialize, Serialize};

use crate::pack::error::{Error, Result};
use crate::pack::ComponentType;

/// A remote component source: either inline channels/versions, or an
/// indirection to another manifest URL. The two are exclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentManifest {
    pub name: String,
    #[serde(rename = "type")]
    pub ctype: ComponentType,
    /// Indirection: the URL of the real component manifest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<Channel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<ManifestVersion>,
    /// Where the component's source tree lives (git URL or site).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub origin: String,
    /// The provider kind that served this manifest.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    #[serde(default)]
    pub default: bool,
    /// Artifact the channel currently points at.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestVersion {
    pub version: String,
    /// A git URL or tarball URL.
    pub resource: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub vtype: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub local: bool,
    #[serde(rename = "unikraft", skip_serializing_if = "Option::is_none")]
    pub unikraft_range: Option<String>,
}

/// An index manifest: a list of pointers to component manifests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexManifest {
    pub manifests: Vec<IndexEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub ctype: ComponentType,
    pub manifest: String,
}

impl ComponentManifest {
    /// Channels/versions and the `manifest` indirection are exclusive
    /// at the top level.
    pub fn validate(&self) -> anyhow::Result<()> {
        let inline = !self.channels.is_empty() || !self.versions.is_empty();
        anyhow::ensure!(
            !(self.manifest.is_some() && inline),
            "manifest '{}' mixes an indirection pointer with inline channels/versions",
            self.name
        );
        anyhow::ensure!(
            self.manifest.is_some() || inline,
            "manifest '{}' has neither an indirection pointer nor channels/versions",
            self.name
        );
        Ok(())
    }
}

/// The artifact a version or channel selection resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedVersion {
    pub version: String,
    pub resource: String,
    pub sha256: Option<String>,
    /// Channel name when selected through a channel.
    pub channel: Option<String>,
}

/// Select a version entry from a manifest.
///
/// Rules, in order: exact version-string equality; channel-name
/// equality; the channel marked `default` when the query names no
/// version; the lexicographically greatest version otherwise. Versions
/// are compared as plain strings, never parsed as semver.
pub fn select_version(
    manifest: &ComponentManifest,
    wanted: Option<&str>,
) -> Result<ResolvedVersion> {
    if let Some(wanted) = wanted {
        let exact: Vec<&ManifestVersion> = manifest
            .versions
            .iter()
            .filter(|v| v.version == wanted)
            .collect();
        match exact.as_slice() {
            [only] => {
                return Ok(ResolvedVersion {
                    version: only.version.clone(),
                    resource: only.resource.clone(),
                    sha256: only.sha256.clone(),
                    channel: None,
                })
            }
            [] => {}
            many => {
                return Err(Error::AmbiguousQuery {
                    query: format!("{}:{wanted}", manifest.name),
                    count: many.len(),
                })
            }
        }

        let channels: Vec<&Channel> = manifest
            .channels
            .iter()
            .filter(|c| c.name == wanted)
            .collect();
        match channels.as_slice() {
            [only] => return resolve_channel(manifest, only),
            [] => {
                return Err(Error::NotFound {
                    query: format!("{}:{wanted}", manifest.name),
                })
            }
            many => {
                return Err(Error::AmbiguousQuery {
                    query: format!("{}:{wanted}", manifest.name),
                    count: many.len(),
                })
            }
        }
    }

    // No version requested: prefer the default channel.
    let defaults: Vec<&Channel> = manifest.channels.iter().filter(|c| c.default).collect();
    match defaults.as_slice() {
        [only] => return resolve_channel(manifest, only),
        [] => {}
        many => {
            return Err(Error::AmbiguousQuery {
                query: manifest.name.clone(),
                count: many.len(),
            })
        }
    }

    // Otherwise the lexicographically greatest version wins.
    let best = manifest
        .versions
        .iter()
        .max_by(|a, b| a.version.cmp(&b.version))
        .ok_or_else(|| Error::NotFound {
            query: manifest.name.clone(),
        })?;
    let equally_best = manifest
        .versions
        .iter()
        .filter(|v| v.version == best.version)
        .count();
    if equally_best > 1 {
        return Err(Error::AmbiguousQuery {
            query: format!("{}:{}", manifest.name, best.version),
            count: equally_best,
        });
    }
    Ok(ResolvedVersion {
        version: best.version.clone(),
        resource: best.resource.clone(),
        sha256: best.sha256.clone(),
        channel: None,
    })
}

fn resolve_channel(manifest: &ComponentManifest, channel: &Channel) -> Result<ResolvedVersion> {
    let resource = channel
        .resource
        .clone()
        .ok_or_else(|| Error::NotFound {
            query: format!("{}:{}", manifest.name, channel.name),
        })?;
    Ok(ResolvedVersion {
        version: channel.name.clone(),
        resource,
        sha256: channel.sha256.clone(),
        channel: Some(channel.name.clone()),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> ComponentManifest {
        serde_yaml::from_str(
            r#"
name: nginx
type: app
description: nginx on Unikraft
origin: https://github.com/unikraft/app-nginx.git
provider: manifests
channels:
  - name: stable
    default: true
    resource: https://example.com/nginx-stable.tar.gz
    sha256: aaaa
  - name: staging
    resource: https://example.com/nginx-staging.tar.gz
versions:
  - version: "1.25"
    resource: https://example.com/nginx-1.25.tar.gz
    sha256: bbbb
  - version: "1.27"
    resource: https://example.com/nginx-1.27.tar.gz
    sha256: cccc
"#,
        )
        .unwrap()
    }

    #[test]
    fn parses_and_validates() {
        let manifest = sample();
        manifest.validate().unwrap();
        assert_eq!(manifest.channels.len(), 2);
        assert_eq!(manifest.versions.len(), 2);
        assert_eq!(manifest.ctype, crate::pack::ComponentType::App);
    }

    #[test]
    fn indirection_and_inline_are_exclusive() {
        let mut manifest = sample();
        manifest.manifest = Some("https://example.com/nginx.yaml".to_string());
        assert!(manifest.validate().is_err());

        manifest.channels.clear();
        manifest.versions.clear();
        manifest.validate().unwrap();

        manifest.manifest = None;
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn exact_version_wins() {
        let resolved = select_version(&sample(), Some("1.25")).unwrap();
        assert_eq!(resolved.version, "1.25");
        assert_eq!(resolved.sha256.as_deref(), Some("bbbb"));
    }

    #[test]
    fn channel_name_matches() {
        let resolved = select_version(&sample(), Some("staging")).unwrap();
        assert_eq!(resolved.channel.as_deref(), Some("staging"));
        assert!(resolved.sha256.is_none());
    }

    #[test]
    fn empty_version_prefers_default_channel() {
        let resolved = select_version(&sample(), None).unwrap();
        assert_eq!(resolved.channel.as_deref(), Some("stable"));
    }

    #[test]
    fn no_channels_falls_back_to_greatest_version() {
        let mut manifest = sample();
        manifest.channels.clear();
        let resolved = select_version(&manifest, None).unwrap();
        assert_eq!(resolved.version, "1.27");
    }

    #[test]
    fn unknown_version_is_not_found() {
        let result = select_version(&sample(), Some("9.99"));
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[test]
    fn duplicate_best_versions_are_ambiguous() {
        let mut manifest = sample();
        manifest.channels.clear();
        manifest.versions.push(ManifestVersion {
            version: "1.27".to_string(),
            resource: "https://example.com/other-1.27.tar.gz".to_string(),
            sha256: None,
            vtype: None,
            local: false,
            unikraft_range: None,
        });
        let result = select_version(&manifest, None);
        assert!(matches!(result, Err(Error::AmbiguousQuery { count: 2, .. })));
    }

    #[test]
    fn index_manifest_parses() {
        let index: IndexManifest = serde_yaml::from_str(
            r#"
manifests:
  - name: nginx
    type: app
    manifest: https://manifests.kraftkit.sh/nginx.yaml
  - name: unikraft
    type: core
    manifest: https://manifests.kraftkit.sh/unikraft.yaml
"#,
        )
        .unwrap();
        assert_eq!(index.manifests.len(), 2);
        assert_eq!(index.manifests[1].ctype, crate::pack::ComponentType::Core);
    }
}
