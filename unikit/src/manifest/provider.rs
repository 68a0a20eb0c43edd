//! Resolution of manifest sources into component manifests, and
//! retrieval of the artifacts their versions point at.
//!
//! A source is an HTTPS URL to a component or index manifest, a local
//! YAML file or directory of them, or a git repository whose tags and
//! branches become versions and channels.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use log::{debug, trace, warn};
use oci_dist::{Credentials, TransportSettings};
use sha2::{Digest as _, Sha256};
use url::Url;

use crate::common::{fs, CommandRunner};
use crate::pack::error::{Error, Result};
use crate::pack::ComponentType;

use super::schema::{Channel, ComponentManifest, IndexManifest, ManifestVersion};

/// HTTP retrieval for manifest sources and version artifacts.
///
/// Mirrors the registry transport's client split: a strict client for
/// ordinary hosts and a certificate-lenient one for hosts whose auth
/// entry opts out of TLS verification. Basic credentials from the
/// per-host auth config are attached to every request to that host.
#[derive(Debug)]
pub struct Fetcher {
    settings: TransportSettings,
    strict: reqwest::Client,
    lax: reqwest::Client,
}

impl Fetcher {
    pub fn new(settings: TransportSettings) -> anyhow::Result<Self> {
        let strict = reqwest::Client::builder()
            .build()
            .context("Unable to construct HTTP client for manifest sources")?;
        let lax = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .context("Unable to construct lenient HTTP client for manifest sources")?;
        Ok(Self {
            settings,
            strict,
            lax,
        })
    }

    fn credentials_for(&self, host: &str) -> Option<&Credentials> {
        self.settings.auth.get(host)
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let host = host_key(url);
        let verify = self
            .credentials_for(&host)
            .map(|c| c.verify_ssl)
            .unwrap_or(true);
        let client = if verify { &self.strict } else { &self.lax };
        let mut request = client.get(url);
        if let Some(creds) = self.credentials_for(&host) {
            request = request.basic_auth(&creds.user, Some(&creds.token));
        }
        request
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let response = self
            .request(url)
            .send()
            .await
            .map_err(|e| Error::Network {
                endpoint: url.to_string(),
                reason: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Network {
                endpoint: url.to_string(),
                reason: format!("server returned {status}"),
            });
        }
        Ok(response)
    }

    pub async fn get_text(&self, url: &str) -> Result<String> {
        self.get(url)
            .await?
            .text()
            .await
            .map_err(|e| Error::Network {
                endpoint: url.to_string(),
                reason: e.to_string(),
            })
    }

    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        Ok(self
            .get(url)
            .await?
            .bytes()
            .await
            .map_err(|e| Error::Network {
                endpoint: url.to_string(),
                reason: e.to_string(),
            })?
            .to_vec())
    }
}

/// The auth-config key of a URL: its host plus any explicit port,
/// matching the way hosts are keyed in the persisted config.
fn host_key(url: &str) -> String {
    match Url::parse(url) {
        Ok(url) => {
            let host = url.host_str().unwrap_or_default().to_string();
            match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host,
            }
        }
        Err(_) => String::new(),
    }
}

/// A resolved manifest source.
#[derive(Debug, Clone)]
pub enum Provider {
    Https(Url),
    File(PathBuf),
    Directory(PathBuf),
    Git(String),
}

impl Provider {
    /// Classify a source string. Local paths must exist to qualify.
    pub fn from_source(source: &str) -> Result<Self> {
        if let Ok(url) = Url::parse(source) {
            match url.scheme() {
                "http" | "https" => {
                    if url.path().ends_with(".git") {
                        return Ok(Provider::Git(source.to_string()));
                    }
                    return Ok(Provider::Https(url));
                }
                "git" | "ssh" => return Ok(Provider::Git(source.to_string())),
                "file" => {
                    if let Ok(path) = url.to_file_path() {
                        return Self::from_path(path, source);
                    }
                }
                _ => {}
            }
        }
        let path = PathBuf::from(source);
        if path.exists() {
            return Self::from_path(path, source);
        }
        Err(Error::IncompatibleSource {
            source_value: source.to_string(),
        })
    }

    fn from_path(path: PathBuf, source: &str) -> Result<Self> {
        if path.is_dir() {
            Ok(Provider::Directory(path))
        } else if path
            .extension()
            .is_some_and(|e| e == "yaml" || e == "yml")
        {
            Ok(Provider::File(path))
        } else {
            Err(Error::IncompatibleSource {
                source_value: source.to_string(),
            })
        }
    }

    /// Fetch every component manifest this source provides, each paired
    /// with the relative path it is cached under
    /// (`<domain>/<path>.yaml`).
    pub async fn fetch(
        &self,
        http: &Fetcher,
        runner: &Arc<dyn CommandRunner>,
    ) -> Result<Vec<(PathBuf, ComponentManifest)>> {
        match self {
            Provider::Https(url) => fetch_url(http, url, 0).await,
            Provider::File(path) => {
                let raw = fs::read_to_string(path).await?;
                let manifest = parse_component(&raw, path.display().to_string().as_str())?;
                Ok(vec![(local_cache_path(&manifest.name), manifest)])
            }
            Provider::Directory(dir) => {
                let mut found = Vec::new();
                for entry in walkdir::WalkDir::new(dir)
                    .sort_by_file_name()
                    .into_iter()
                    .filter_map(|e| e.ok())
                {
                    let path = entry.path();
                    if !path
                        .extension()
                        .is_some_and(|e| e == "yaml" || e == "yml")
                    {
                        continue;
                    }
                    let raw = fs::read_to_string(path).await?;
                    match parse_component(&raw, path.display().to_string().as_str()) {
                        Ok(manifest) => {
                            found.push((local_cache_path(&manifest.name), manifest))
                        }
                        Err(error) => {
                            warn!("skipping '{}': {error}", path.display());
                        }
                    }
                }
                Ok(found)
            }
            Provider::Git(url) => {
                let manifest = manifest_from_git(runner, url).await?;
                Ok(vec![(
                    PathBuf::from("git").join(format!("{}.yaml", manifest.name)),
                    manifest,
                )])
            }
        }
    }
}

/// Fetch a manifest URL, expanding index manifests and following one
/// level of `manifest:` indirection per component.
fn fetch_url<'a>(
    http: &'a Fetcher,
    url: &'a Url,
    depth: u8,
) -> futures::future::BoxFuture<'a, Result<Vec<(PathBuf, ComponentManifest)>>> {
    Box::pin(async move {
        if depth > 2 {
            return Err(Error::Other(anyhow::anyhow!(
                "manifest indirection too deep at '{url}'"
            )));
        }
        let raw = http.get_text(url.as_str()).await?;

        // An index manifest lists pointers; a component manifest stands
        // alone. Try the index shape first.
        if let Ok(index) = serde_yaml::from_str::<IndexManifest>(&raw) {
            let mut found = Vec::new();
            for entry in index.manifests {
                let target = absolute_or_sibling(url, &entry.manifest)?;
                match fetch_url(http, &target, depth + 1).await {
                    Ok(mut manifests) => found.append(&mut manifests),
                    Err(error) => {
                        warn!("skipping index entry '{}': {error}", entry.name);
                    }
                }
            }
            return Ok(found);
        }

        let manifest = parse_component(&raw, url.as_str())?;
        if let Some(pointer) = &manifest.manifest {
            let target = absolute_or_sibling(url, pointer)?;
            return fetch_url(http, &target, depth + 1).await;
        }
        Ok(vec![(url_cache_path(url), manifest)])
    })
}

fn parse_component(raw: &str, origin: &str) -> Result<ComponentManifest> {
    let manifest: ComponentManifest = serde_yaml::from_str(raw)
        .context(format!("Unable to parse component manifest from '{origin}'"))?;
    manifest.validate()?;
    Ok(manifest)
}

/// Resolve a possibly relative manifest pointer against its index URL.
fn absolute_or_sibling(base: &Url, pointer: &str) -> Result<Url> {
    if let Ok(url) = Url::parse(pointer) {
        return Ok(url);
    }
    base.join(pointer)
        .context(format!("Unable to resolve manifest pointer '{pointer}'"))
        .map_err(Error::from)
}

/// Cache location of a manifest served over HTTP:
/// `<domain>/<path>.yaml`.
pub fn url_cache_path(url: &Url) -> PathBuf {
    let mut path = PathBuf::from(url.host_str().unwrap_or("unknown"));
    let rel = url.path().trim_start_matches('/');
    if rel.is_empty() {
        path.push("index.yaml");
    } else {
        path.push(rel);
    }
    if path.extension().is_none() {
        path.set_extension("yaml");
    }
    path
}

fn local_cache_path(name: &str) -> PathBuf {
    PathBuf::from("local").join(format!("{name}.yaml"))
}

/// Synthesize a component manifest from a git remote: tags become
/// versions, the `stable`/`staging` branches become channels.
async fn manifest_from_git(
    runner: &Arc<dyn CommandRunner>,
    url: &str,
) -> Result<ComponentManifest> {
    let output = runner
        .output(
            "git",
            &[
                "ls-remote".to_string(),
                "--tags".to_string(),
                "--heads".to_string(),
                url.to_string(),
            ],
        )
        .await
        .map_err(|e| Error::Network {
            endpoint: url.to_string(),
            reason: e.to_string(),
        })?;
    let listing = String::from_utf8_lossy(&output);

    let name = repo_name(url);
    let mut versions = Vec::new();
    let mut channels = Vec::new();
    for line in listing.lines() {
        let Some((_, reference)) = line.split_once('\t') else {
            continue;
        };
        if let Some(tag) = reference.strip_prefix("refs/tags/") {
            // Peeled duplicates (`^{}`) repeat the tag; skip them.
            if tag.ends_with("^{}") {
                continue;
            }
            versions.push(ManifestVersion {
                version: tag.trim_start_matches('v').to_string(),
                resource: url.to_string(),
                sha256: None,
                vtype: Some("git".to_string()),
                local: false,
                unikraft_range: None,
            });
        } else if let Some(branch) = reference.strip_prefix("refs/heads/") {
            if branch == "stable" || branch == "staging" {
                channels.push(Channel {
                    name: branch.to_string(),
                    default: branch == "stable",
                    resource: Some(url.to_string()),
                    sha256: None,
                });
            }
        }
    }
    trace!(
        "git source '{url}' provides {} version(s), {} channel(s)",
        versions.len(),
        channels.len()
    );

    Ok(ComponentManifest {
        ctype: component_type_from_name(&name),
        name,
        manifest: None,
        description: String::new(),
        channels,
        versions,
        origin: url.to_string(),
        provider: "git".to_string(),
    })
}

/// `lib-`, `app-`, `plat-` prefixes carry the component type; the core
/// repository is always named `unikraft`.
fn component_type_from_name(name: &str) -> ComponentType {
    if name == "unikraft" {
        ComponentType::Core
    } else if name.starts_with("lib-") {
        ComponentType::Lib
    } else if name.starts_with("plat-") {
        ComponentType::Plat
    } else {
        ComponentType::App
    }
}

fn repo_name(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(url)
        .trim_end_matches(".git")
        .to_string()
}

/// Retrieve a version's resource into `dest`, verifying the declared
/// sha256 unless disabled. The download is staged next to `dest` and
/// renamed only after verification, so a mismatch leaves nothing
/// behind.
pub async fn fetch_resource(
    http: &Fetcher,
    resource: &str,
    dest: &Path,
    sha256: Option<&str>,
    skip_verify: bool,
) -> Result<()> {
    let parent = dest
        .parent()
        .context(format!("'{}' has no parent directory", dest.display()))?;
    fs::create_dir_all(parent).await?;

    let content: Vec<u8> = if resource.starts_with("http://") || resource.starts_with("https://") {
        http.get_bytes(resource).await?
    } else {
        fs::read(Path::new(resource)).await?
    };

    if let (Some(expected), false) = (sha256, skip_verify) {
        let computed = hex::encode(Sha256::digest(&content));
        if computed != expected {
            debug!("checksum mismatch for '{resource}'");
            return Err(Error::Integrity {
                subject: resource.to_string(),
                expected: expected.to_string(),
                computed,
            });
        }
    }

    fs::write_atomic(dest, content).await?;
    Ok(())
}

/// Clone a git resource at a version (tag or branch) into `dest`.
/// The clone lands in a staging directory first.
pub async fn clone_resource(
    runner: &Arc<dyn CommandRunner>,
    url: &str,
    version: Option<&str>,
    dest: &Path,
) -> Result<()> {
    let parent = dest
        .parent()
        .context(format!("'{}' has no parent directory", dest.display()))?;
    fs::create_dir_all(parent).await?;
    let staging = tempfile::tempdir_in(parent)
        .context("Unable to create staging directory for git clone")?;
    let target = staging.path().join("checkout");

    let mut args = vec![
        "clone".to_string(),
        "--depth".to_string(),
        "1".to_string(),
    ];
    if let Some(version) = version {
        args.push("--branch".to_string());
        args.push(version.to_string());
    }
    args.push(url.to_string());
    args.push(target.display().to_string());
    runner
        .run("git", &args)
        .await
        .map_err(|e| Error::Network {
            endpoint: url.to_string(),
            reason: e.to_string(),
        })?;

    if dest.exists() {
        fs::remove_dir_all(dest).await?;
    }
    fs::rename(&target, dest).await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classifies_sources() {
        assert!(matches!(
            Provider::from_source("https://manifests.kraftkit.sh/index.yaml").unwrap(),
            Provider::Https(_)
        ));
        assert!(matches!(
            Provider::from_source("https://github.com/unikraft/app-nginx.git").unwrap(),
            Provider::Git(_)
        ));
        assert!(matches!(
            Provider::from_source("git://github.com/unikraft/unikraft").unwrap(),
            Provider::Git(_)
        ));
        assert!(matches!(
            Provider::from_source("no-such-path-anywhere.yaml"),
            Err(Error::IncompatibleSource { .. })
        ));
    }

    #[test]
    fn classifies_local_paths() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("nginx.yaml");
        std::fs::write(&file, "name: nginx\ntype: app\nmanifest: x\n").unwrap();
        assert!(matches!(
            Provider::from_source(file.to_str().unwrap()).unwrap(),
            Provider::File(_)
        ));
        assert!(matches!(
            Provider::from_source(dir.path().to_str().unwrap()).unwrap(),
            Provider::Directory(_)
        ));
    }

    #[test]
    fn cache_paths_mirror_url_layout() {
        let url = Url::parse("https://manifests.kraftkit.sh/libs/musl.yaml").unwrap();
        assert_eq!(
            url_cache_path(&url),
            PathBuf::from("manifests.kraftkit.sh/libs/musl.yaml")
        );
        let bare = Url::parse("https://example.com/nginx").unwrap();
        assert_eq!(
            url_cache_path(&bare),
            PathBuf::from("example.com/nginx.yaml")
        );
    }

    #[test]
    fn component_types_from_repo_names() {
        assert_eq!(component_type_from_name("unikraft"), ComponentType::Core);
        assert_eq!(component_type_from_name("lib-musl"), ComponentType::Lib);
        assert_eq!(component_type_from_name("plat-xen"), ComponentType::Plat);
        assert_eq!(component_type_from_name("app-nginx"), ComponentType::App);
    }

    #[test]
    fn host_keys_match_config_entries() {
        assert_eq!(host_key("https://unikraft.org/index.yaml"), "unikraft.org");
        assert_eq!(
            host_key("https://localhost:5000/manifests/nginx.yaml"),
            "localhost:5000"
        );
        assert_eq!(host_key("not a url"), "");
    }

    #[test]
    fn fetcher_honors_per_host_auth_config() {
        let mut settings = TransportSettings::default();
        settings.auth.insert(
            "localhost:5000".to_string(),
            Credentials {
                user: "dev".to_string(),
                token: "dev".to_string(),
                verify_ssl: false,
            },
        );
        let fetcher = Fetcher::new(settings).unwrap();
        assert!(fetcher.credentials_for("localhost:5000").is_some());
        assert!(fetcher.credentials_for("unikraft.org").is_none());
        // Requests to the opted-out host build against the lenient
        // client without panicking.
        let _ = fetcher.request("https://localhost:5000/index.yaml");
    }

    #[test]
    fn repo_names_strip_git_suffix() {
        assert_eq!(
            repo_name("https://github.com/unikraft/lib-musl.git"),
            "lib-musl"
        );
        assert_eq!(repo_name("git://host/unikraft"), "unikraft");
    }

    #[tokio::test]
    async fn fetch_resource_verifies_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("artifact.tar.gz");
        std::fs::write(&source, b"artifact bytes").unwrap();
        let good = hex::encode(Sha256::digest(b"artifact bytes"));
        let dest = dir.path().join("out").join("artifact.tar.gz");

        let http = Fetcher::new(TransportSettings::default()).unwrap();
        fetch_resource(
            &http,
            source.to_str().unwrap(),
            &dest,
            Some(good.as_str()),
            false,
        )
        .await
        .unwrap();
        assert!(dest.is_file());
    }

    #[tokio::test]
    async fn checksum_mismatch_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("artifact.tar.gz");
        std::fs::write(&source, b"artifact bytes").unwrap();
        let dest = dir.path().join("out").join("artifact.tar.gz");

        let http = Fetcher::new(TransportSettings::default()).unwrap();
        let result = fetch_resource(
            &http,
            source.to_str().unwrap(),
            &dest,
            Some("0000000000000000000000000000000000000000000000000000000000000000"),
            false,
        )
        .await;
        assert!(matches!(result, Err(Error::Integrity { .. })));
        assert!(!dest.exists());

        // Disabling verification is an explicit opt-out.
        fetch_resource(
            &http,
            source.to_str().unwrap(),
            &dest,
            Some("0000000000000000000000000000000000000000000000000000000000000000"),
            true,
        )
        .await
        .unwrap();
        assert!(dest.is_file());
    }
}
