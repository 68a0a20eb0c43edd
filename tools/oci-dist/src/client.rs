use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use log::{debug, trace};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, RANGE};
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use sha2::{Digest as _, Sha256};
use snafu::ResultExt;
use tokio::io::AsyncWriteExt;

use crate::views::{ImageIndex, Manifest, Platform};
use crate::{error, Descriptor, Reference, Result, Store};
use crate::{MEDIA_TYPE_IMAGE_INDEX, MEDIA_TYPE_MANIFEST};

/// How many blobs of one image are fetched concurrently.
const BLOB_CONCURRENCY: usize = 4;

/// Per-host registry credentials, as persisted in user config.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub token: String,
    pub verify_ssl: bool,
}

/// Wire-level settings for the HTTP transport.
#[derive(Debug, Clone, Default)]
pub struct TransportSettings {
    /// Credentials keyed by registry host.
    pub auth: HashMap<String, Credentials>,
    /// Hosts spoken to over plain HTTP (local registries).
    pub plain_http: HashSet<String>,
}

/// A blob download stream plus the byte offset the server honored.
/// `offset` is zero when the server ignored a range request.
pub struct BlobResponse {
    pub offset: u64,
    pub stream: BoxStream<'static, Result<bytes::Bytes>>,
}

/// The wire operations of the distribution protocol. [`Client`] layers
/// verification, caching and concurrency on top; tests substitute an
/// in-memory registry.
#[async_trait]
pub trait Transport: Debug + Send + Sync {
    /// Cheap existence probe; `None` when the reference is unknown.
    async fn head_manifest(&self, reference: &Reference) -> Result<Option<Descriptor>>;
    async fn get_manifest(&self, reference: &Reference) -> Result<(Descriptor, Vec<u8>)>;
    async fn blob_exists(&self, reference: &Reference, digest: &str) -> Result<bool>;
    async fn get_blob(
        &self,
        reference: &Reference,
        digest: &str,
        offset: u64,
    ) -> Result<BlobResponse>;
    async fn put_blob(&self, reference: &Reference, digest: &str, content: Vec<u8>) -> Result<()>;
    async fn put_manifest(
        &self,
        reference: &Reference,
        media_type: &str,
        content: Vec<u8>,
    ) -> Result<Descriptor>;
    async fn list_tags(&self, reference: &Reference) -> Result<Vec<String>>;
}

/// Byte-level progress callback: `(fetched, total)`.
pub type Progress<'a> = Option<&'a (dyn Fn(u64, u64) + Send + Sync)>;

/// Registry client: manifest resolution, verified parallel blob pulls
/// with resume, and pushes that skip content the remote already has.
#[derive(Debug)]
pub struct Client {
    transport: Box<dyn Transport>,
}

impl Client {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    /// A client speaking HTTP(S) with the given settings.
    pub fn http(settings: TransportSettings) -> Result<Self> {
        Ok(Self::new(Box::new(HttpTransport::new(settings)?)))
    }

    /// Probe the remote for the reference without pulling anything.
    pub async fn resolve(&self, reference: &Reference) -> Result<Option<Descriptor>> {
        self.transport.head_manifest(reference).await
    }

    pub async fn list_tags(&self, reference: &Reference) -> Result<Vec<String>> {
        self.transport.list_tags(reference).await
    }

    /// Pull the image into `store` and record it in the store index
    /// under the reference name. Returns the manifest descriptor.
    ///
    /// Layer and config blobs are downloaded concurrently; blobs
    /// already present locally are skipped, and concurrent pulls of the
    /// same digest collapse onto a single download via the store's
    /// per-digest locks. Interrupted downloads resume from the staged
    /// partial file.
    pub async fn pull(
        &self,
        reference: &Reference,
        store: &Store,
        platform: Option<&Platform>,
        progress: Progress<'_>,
    ) -> Result<Descriptor> {
        let (descriptor, raw) = self.resolve_manifest(reference, platform).await?;
        let manifest: Manifest = serde_json::from_slice(&raw).context(error::ParseSnafu {
            what: "image manifest",
        })?;

        let total: u64 = manifest.config.size + manifest.layers.iter().map(|l| l.size).sum::<u64>();
        let fetched = Arc::new(AtomicU64::new(0));
        let report = |fetched: &AtomicU64, n: u64| {
            let done = fetched.fetch_add(n, Ordering::Relaxed) + n;
            if let Some(f) = progress {
                f(done.min(total), total);
            }
        };

        let mut blobs = vec![manifest.config.clone()];
        blobs.extend(manifest.layers.iter().cloned());
        let mut downloads = stream::iter(blobs.into_iter().map(|blob| {
            let fetched = fetched.clone();
            let report = &report;
            async move {
                if store.contains(&blob.digest).await {
                    trace!("blob {} already in store", blob.digest);
                    report(&fetched, blob.size);
                    return Ok(());
                }
                let lock = store.digest_lock(&blob.digest);
                let _guard = lock.lock().await;
                if store.contains(&blob.digest).await {
                    report(&fetched, blob.size);
                    return Ok(());
                }
                self.fetch_blob(reference, &blob, store, &|n| report(&fetched, n))
                    .await
            }
        }))
        .buffer_unordered(BLOB_CONCURRENCY);
        while let Some(result) = downloads.next().await {
            result?;
        }
        drop(downloads);

        store.write_blob(&raw).await?;
        store.tag(&reference.to_string(), descriptor.clone()).await?;
        Ok(descriptor)
    }

    /// Push the manifest stored under the reference name, uploading
    /// only the blobs the remote does not already have.
    pub async fn push(&self, reference: &Reference, store: &Store) -> Result<Descriptor> {
        let name = reference.to_string();
        let index = store.read_index().await?;
        let descriptor =
            index
                .find_ref_name(&name)
                .cloned()
                .ok_or_else(|| error::Error::ManifestMissing {
                    reference: name.clone(),
                })?;
        let raw = store.read_blob(&descriptor.digest).await?;
        let manifest: Manifest = serde_json::from_slice(&raw).context(error::ParseSnafu {
            what: "image manifest",
        })?;

        let mut blobs = vec![manifest.config.clone()];
        blobs.extend(manifest.layers.iter().cloned());
        for blob in blobs {
            if self.transport.blob_exists(reference, &blob.digest).await? {
                trace!("remote already has {}", blob.digest);
                continue;
            }
            let content = store.read_blob(&blob.digest).await?;
            self.transport
                .put_blob(reference, &blob.digest, content)
                .await?;
        }

        self.transport
            .put_manifest(reference, &descriptor.media_type, raw)
            .await
    }

    /// Fetch the manifest bytes, descending through an image index to
    /// the platform-specific manifest when necessary.
    async fn resolve_manifest(
        &self,
        reference: &Reference,
        platform: Option<&Platform>,
    ) -> Result<(Descriptor, Vec<u8>)> {
        let (descriptor, raw) = self.transport.get_manifest(reference).await?;
        verify_bytes(&raw, &descriptor.digest)?;

        if descriptor.media_type != MEDIA_TYPE_IMAGE_INDEX {
            return Ok((descriptor, raw));
        }

        let index: ImageIndex = serde_json::from_slice(&raw).context(error::ParseSnafu {
            what: "image index",
        })?;
        let selected = match platform {
            Some(platform) => index
                .manifests
                .iter()
                .find(|m| m.platform.as_ref() == Some(platform)),
            None if index.manifests.len() == 1 => index.manifests.first(),
            None => None,
        }
        .ok_or_else(|| {
            let (architecture, os) = platform
                .map(|p| (p.architecture.clone(), p.os.clone()))
                .unwrap_or_else(|| ("any".to_string(), "any".to_string()));
            error::Error::PlatformMissing {
                reference: reference.to_string(),
                architecture,
                os,
            }
        })?;

        debug!(
            "descending into index {} for manifest {}",
            descriptor.digest, selected.digest
        );
        let pinned = reference.with_digest(selected.digest.clone());
        let (descriptor, raw) = self.transport.get_manifest(&pinned).await?;
        verify_bytes(&raw, &descriptor.digest)?;
        Ok((descriptor, raw))
    }

    /// Download one blob into the store, verifying its digest as the
    /// bytes stream in. The partial file survives failures so a retry
    /// resumes where the connection dropped.
    async fn fetch_blob(
        &self,
        reference: &Reference,
        blob: &Descriptor,
        store: &Store,
        report: &(dyn Fn(u64) + Sync),
    ) -> Result<()> {
        let partial = store.partial_path(&blob.digest)?;
        let mut hasher = Sha256::new();
        let mut offset = 0u64;
        if let Ok(existing) = tokio::fs::read(&partial).await {
            offset = existing.len() as u64;
            hasher.update(&existing);
            trace!("resuming {} at byte {offset}", blob.digest);
        }

        let response = self
            .transport
            .get_blob(reference, &blob.digest, offset)
            .await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&partial)
            .await
            .context(error::IoSnafu {
                what: "open staged blob",
            })?;
        if response.offset == 0 && offset > 0 {
            // Server ignored the range request; start over.
            file.set_len(0).await.context(error::IoSnafu {
                what: "truncate staged blob",
            })?;
            hasher = Sha256::new();
        }

        let mut chunks = response.stream;
        while let Some(chunk) = chunks.try_next().await? {
            hasher.update(&chunk);
            file.write_all(&chunk).await.context(error::IoSnafu {
                what: "write staged blob",
            })?;
            report(chunk.len() as u64);
        }
        file.flush().await.context(error::IoSnafu {
            what: "flush staged blob",
        })?;
        drop(file);

        let computed = format!("sha256:{}", hex::encode(hasher.finalize()));
        if computed != blob.digest {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(error::Error::DigestMismatch {
                expected: blob.digest.clone(),
                computed,
            });
        }
        store.commit_file(&partial, &blob.digest).await
    }
}

fn verify_bytes(raw: &[u8], expected: &str) -> Result<()> {
    let computed = crate::digest(raw);
    if computed != expected {
        return Err(error::Error::DigestMismatch {
            expected: expected.to_string(),
            computed,
        });
    }
    Ok(())
}

/// The production transport: the OCI distribution protocol over
/// HTTP(S) with basic credentials and the bearer-token dance.
#[derive(Debug)]
pub struct HttpTransport {
    settings: TransportSettings,
    strict: reqwest::Client,
    lax: reqwest::Client,
    // Bearer tokens keyed by repository name.
    tokens: Mutex<HashMap<String, String>>,
}

impl HttpTransport {
    pub fn new(settings: TransportSettings) -> Result<Self> {
        let strict = reqwest::Client::builder()
            .build()
            .map_err(|source| error::Error::Http {
                url: "<client construction>".to_string(),
                source,
            })?;
        let lax = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|source| error::Error::Http {
                url: "<client construction>".to_string(),
                source,
            })?;
        Ok(Self {
            settings,
            strict,
            lax,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn base_url(&self, reference: &Reference) -> String {
        let scheme = if self.settings.plain_http.contains(&reference.registry) {
            "http"
        } else {
            "https"
        };
        format!(
            "{scheme}://{}/v2/{}",
            reference.registry, reference.repository
        )
    }

    fn client_for(&self, registry: &str) -> &reqwest::Client {
        let verify = self
            .settings
            .auth
            .get(registry)
            .map(|c| c.verify_ssl)
            .unwrap_or(true);
        if verify {
            &self.strict
        } else {
            &self.lax
        }
    }

    /// Send a request, performing the bearer-token exchange on a 401
    /// and retrying once.
    async fn send(
        &self,
        reference: &Reference,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<Vec<u8>>,
    ) -> Result<Response> {
        let client = self.client_for(&reference.registry);
        let request = |token: Option<String>| {
            let mut builder = client
                .request(method.clone(), url)
                .headers(headers.clone());
            if let Some(token) = token {
                builder = builder.bearer_auth(token);
            } else if let Some(creds) = self.settings.auth.get(&reference.registry) {
                builder = builder.basic_auth(&creds.user, Some(&creds.token));
            }
            if let Some(body) = body.clone() {
                builder = builder.body(body);
            }
            builder
        };

        let cached = self
            .tokens
            .lock()
            .expect("token cache poisoned")
            .get(&reference.name())
            .cloned();
        let response = request(cached)
            .send()
            .await
            .context(error::HttpSnafu { url })?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get("www-authenticate")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| error::Error::Auth {
                registry: reference.registry.clone(),
            })?;
        let token = self.exchange_token(reference, &challenge).await?;
        self.tokens
            .lock()
            .expect("token cache poisoned")
            .insert(reference.name(), token.clone());
        request(Some(token))
            .send()
            .await
            .context(error::HttpSnafu { url })
    }

    /// Fetch a bearer token from the realm named in a `WWW-Authenticate`
    /// challenge.
    async fn exchange_token(&self, reference: &Reference, challenge: &str) -> Result<String> {
        let params = parse_challenge(challenge);
        let realm = params.get("realm").ok_or_else(|| error::Error::Auth {
            registry: reference.registry.clone(),
        })?;

        let mut request = self.client_for(&reference.registry).get(realm.as_str());
        if let Some(service) = params.get("service") {
            request = request.query(&[("service", service)]);
        }
        request = request.query(&[(
            "scope",
            format!("repository:{}:pull,push", reference.repository),
        )]);
        if let Some(creds) = self.settings.auth.get(&reference.registry) {
            request = request.basic_auth(&creds.user, Some(&creds.token));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            token: Option<String>,
            access_token: Option<String>,
        }
        let response = request
            .send()
            .await
            .context(error::HttpSnafu { url: realm.as_str() })?;
        if !response.status().is_success() {
            return Err(error::Error::Auth {
                registry: reference.registry.clone(),
            });
        }
        let token: TokenResponse = response
            .json()
            .await
            .context(error::HttpSnafu { url: realm.as_str() })?;
        token
            .token
            .or(token.access_token)
            .ok_or_else(|| error::Error::Auth {
                registry: reference.registry.clone(),
            })
    }
}

fn accept_manifests() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static(
            "application/vnd.oci.image.manifest.v1+json, \
             application/vnd.oci.image.index.v1+json",
        ),
    );
    headers
}

fn parse_challenge(challenge: &str) -> HashMap<String, String> {
    challenge
        .trim_start_matches("Bearer ")
        .split(',')
        .filter_map(|part| {
            let (key, value) = part.trim().split_once('=')?;
            Some((key.to_string(), value.trim_matches('"').to_string()))
        })
        .collect()
}

fn descriptor_from_response(response: &Response, fallback_digest: Option<String>) -> Descriptor {
    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    Descriptor::new(
        header("content-type").unwrap_or_else(|| MEDIA_TYPE_MANIFEST.to_string()),
        header("docker-content-digest")
            .or(fallback_digest)
            .unwrap_or_default(),
        header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
    )
}

#[async_trait]
impl Transport for HttpTransport {
    async fn head_manifest(&self, reference: &Reference) -> Result<Option<Descriptor>> {
        let url = format!(
            "{}/manifests/{}",
            self.base_url(reference),
            reference.version_part()
        );
        let response = self
            .send(reference, Method::HEAD, &url, accept_manifests(), None)
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(descriptor_from_response(&response, None))),
            status => Err(error::Error::Status {
                url,
                status: status.as_u16(),
            }),
        }
    }

    async fn get_manifest(&self, reference: &Reference) -> Result<(Descriptor, Vec<u8>)> {
        let url = format!(
            "{}/manifests/{}",
            self.base_url(reference),
            reference.version_part()
        );
        let response = self
            .send(reference, Method::GET, &url, accept_manifests(), None)
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(error::Error::ManifestMissing {
                reference: reference.to_string(),
            });
        }
        if !status.is_success() {
            return Err(error::Error::Status {
                url,
                status: status.as_u16(),
            });
        }
        let mut descriptor = descriptor_from_response(&response, reference.digest.clone());
        let raw = response
            .bytes()
            .await
            .context(error::HttpSnafu { url })?
            .to_vec();
        if descriptor.digest.is_empty() {
            descriptor.digest = crate::digest(&raw);
        }
        descriptor.size = raw.len() as u64;
        Ok((descriptor, raw))
    }

    async fn blob_exists(&self, reference: &Reference, digest: &str) -> Result<bool> {
        let url = format!("{}/blobs/{digest}", self.base_url(reference));
        let response = self
            .send(reference, Method::HEAD, &url, HeaderMap::new(), None)
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(error::Error::Status {
                url,
                status: status.as_u16(),
            }),
        }
    }

    async fn get_blob(
        &self,
        reference: &Reference,
        digest: &str,
        offset: u64,
    ) -> Result<BlobResponse> {
        let url = format!("{}/blobs/{digest}", self.base_url(reference));
        let mut headers = HeaderMap::new();
        if offset > 0 {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes={offset}-")) {
                headers.insert(RANGE, value);
            }
        }
        let response = self
            .send(reference, Method::GET, &url, headers, None)
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(error::Error::Status {
                url,
                status: status.as_u16(),
            });
        }
        let honored = if status == StatusCode::PARTIAL_CONTENT {
            offset
        } else {
            0
        };
        let stream = response
            .bytes_stream()
            .map_err(move |source| error::Error::Http {
                url: url.clone(),
                source,
            })
            .boxed();
        Ok(BlobResponse {
            offset: honored,
            stream,
        })
    }

    async fn put_blob(&self, reference: &Reference, digest: &str, content: Vec<u8>) -> Result<()> {
        let url = format!("{}/blobs/uploads/", self.base_url(reference));
        let response = self
            .send(reference, Method::POST, &url, HeaderMap::new(), None)
            .await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(error::Error::UploadRejected {
                url,
                status: response.status().as_u16(),
            });
        }
        let location = response
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| error::Error::UploadRejected {
                url: url.clone(),
                status: response.status().as_u16(),
            })?;
        // Location may be relative to the registry root.
        let upload_url = if location.starts_with("http") {
            location.to_string()
        } else {
            let scheme = if self.settings.plain_http.contains(&reference.registry) {
                "http"
            } else {
                "https"
            };
            format!("{scheme}://{}{location}", reference.registry)
        };
        let separator = if upload_url.contains('?') { '&' } else { '?' };
        let upload_url = format!("{upload_url}{separator}digest={digest}");

        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        let response = self
            .send(reference, Method::PUT, &upload_url, headers, Some(content))
            .await?;
        if response.status() != StatusCode::CREATED {
            return Err(error::Error::UploadRejected {
                url: upload_url,
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    async fn put_manifest(
        &self,
        reference: &Reference,
        media_type: &str,
        content: Vec<u8>,
    ) -> Result<Descriptor> {
        let url = format!(
            "{}/manifests/{}",
            self.base_url(reference),
            reference.version_part()
        );
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(media_type).map_err(|_| error::Error::UnsupportedMediaType {
                media_type: media_type.to_string(),
            })?,
        );
        let digest = crate::digest(&content);
        let size = content.len() as u64;
        let response = self
            .send(reference, Method::PUT, &url, headers, Some(content))
            .await?;
        if !response.status().is_success() {
            return Err(error::Error::UploadRejected {
                url,
                status: response.status().as_u16(),
            });
        }
        Ok(Descriptor::new(media_type, digest, size))
    }

    async fn list_tags(&self, reference: &Reference) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct TagList {
            #[serde(default)]
            tags: Vec<String>,
        }
        let url = format!("{}/tags/list", self.base_url(reference));
        let response = self
            .send(reference, Method::GET, &url, HeaderMap::new(), None)
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(error::Error::Status {
                url,
                status: status.as_u16(),
            });
        }
        let tags: TagList = response.json().await.context(error::HttpSnafu { url })?;
        Ok(tags.tags)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::views::{ImageConfiguration, MEDIA_TYPE_CONFIG, MEDIA_TYPE_LAYER_TAR};
    use std::sync::atomic::AtomicUsize;

    /// In-memory registry that counts blob transfers.
    #[derive(Debug, Default)]
    struct MemoryTransport {
        manifests: Mutex<HashMap<String, (Descriptor, Vec<u8>)>>,
        blobs: Mutex<HashMap<String, Vec<u8>>>,
        blob_fetches: AtomicUsize,
        blob_puts: AtomicUsize,
    }

    impl MemoryTransport {
        fn insert_blob(&self, content: &[u8]) -> Descriptor {
            let digest = crate::digest(content);
            self.blobs
                .lock()
                .unwrap()
                .insert(digest.clone(), content.to_vec());
            Descriptor::new(MEDIA_TYPE_LAYER_TAR, digest, content.len() as u64)
        }

        fn insert_image(&self, reference: &Reference, layers: &[&[u8]]) -> Descriptor {
            let config = ImageConfiguration {
                architecture: "x86_64".into(),
                os: "unikraft".into(),
                config: None,
            };
            let config_raw = serde_json::to_vec(&config).unwrap();
            let mut config_descriptor = self.insert_blob(&config_raw);
            config_descriptor.media_type = MEDIA_TYPE_CONFIG.to_string();
            let manifest = Manifest {
                schema_version: 2,
                media_type: Some(MEDIA_TYPE_MANIFEST.to_string()),
                config: config_descriptor,
                layers: layers.iter().map(|l| self.insert_blob(l)).collect(),
                annotations: None,
            };
            let raw = serde_json::to_vec(&manifest).unwrap();
            let descriptor =
                Descriptor::new(MEDIA_TYPE_MANIFEST, crate::digest(&raw), raw.len() as u64);
            let mut manifests = self.manifests.lock().unwrap();
            manifests.insert(reference.to_string(), (descriptor.clone(), raw.clone()));
            manifests.insert(
                reference.with_digest(descriptor.digest.clone()).to_string(),
                (descriptor.clone(), raw),
            );
            descriptor
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn head_manifest(&self, reference: &Reference) -> Result<Option<Descriptor>> {
            Ok(self
                .manifests
                .lock()
                .unwrap()
                .get(&reference.to_string())
                .map(|(d, _)| d.clone()))
        }

        async fn get_manifest(&self, reference: &Reference) -> Result<(Descriptor, Vec<u8>)> {
            self.manifests
                .lock()
                .unwrap()
                .get(&reference.to_string())
                .cloned()
                .ok_or_else(|| error::Error::ManifestMissing {
                    reference: reference.to_string(),
                })
        }

        async fn blob_exists(&self, _reference: &Reference, digest: &str) -> Result<bool> {
            Ok(self.blobs.lock().unwrap().contains_key(digest))
        }

        async fn get_blob(
            &self,
            _reference: &Reference,
            digest: &str,
            _offset: u64,
        ) -> Result<BlobResponse> {
            self.blob_fetches.fetch_add(1, Ordering::SeqCst);
            let content = self
                .blobs
                .lock()
                .unwrap()
                .get(digest)
                .cloned()
                .ok_or_else(|| error::Error::BlobMissing {
                    digest: digest.to_string(),
                })?;
            Ok(BlobResponse {
                offset: 0,
                stream: stream::once(async move { Ok(bytes::Bytes::from(content)) }).boxed(),
            })
        }

        async fn put_blob(
            &self,
            _reference: &Reference,
            digest: &str,
            content: Vec<u8>,
        ) -> Result<()> {
            self.blob_puts.fetch_add(1, Ordering::SeqCst);
            self.blobs
                .lock()
                .unwrap()
                .insert(digest.to_string(), content);
            Ok(())
        }

        async fn put_manifest(
            &self,
            reference: &Reference,
            media_type: &str,
            content: Vec<u8>,
        ) -> Result<Descriptor> {
            let descriptor = Descriptor::new(
                media_type,
                crate::digest(&content),
                content.len() as u64,
            );
            self.manifests
                .lock()
                .unwrap()
                .insert(reference.to_string(), (descriptor.clone(), content));
            Ok(descriptor)
        }

        async fn list_tags(&self, _reference: &Reference) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    async fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        store.init().await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn pull_stores_all_content() {
        let reference: Reference = "unikraft.org/nginx:1.25".parse().unwrap();
        let transport = MemoryTransport::default();
        let descriptor = transport.insert_image(&reference, &[b"layer one", b"layer two"]);
        let client = Client::new(Box::new(transport));
        let (_dir, store) = store().await;

        let pulled = client.pull(&reference, &store, None, None).await.unwrap();
        assert_eq!(pulled.digest, descriptor.digest);
        assert!(store.contains(&descriptor.digest).await);
        assert!(store
            .read_index()
            .await
            .unwrap()
            .find_ref_name("unikraft.org/nginx:1.25")
            .is_some());
    }

    #[async_trait]
    impl Transport for Arc<MemoryTransport> {
        async fn head_manifest(&self, r: &Reference) -> Result<Option<Descriptor>> {
            self.as_ref().head_manifest(r).await
        }
        async fn get_manifest(&self, r: &Reference) -> Result<(Descriptor, Vec<u8>)> {
            self.as_ref().get_manifest(r).await
        }
        async fn blob_exists(&self, r: &Reference, d: &str) -> Result<bool> {
            self.as_ref().blob_exists(r, d).await
        }
        async fn get_blob(&self, r: &Reference, d: &str, o: u64) -> Result<BlobResponse> {
            self.as_ref().get_blob(r, d, o).await
        }
        async fn put_blob(&self, r: &Reference, d: &str, c: Vec<u8>) -> Result<()> {
            self.as_ref().put_blob(r, d, c).await
        }
        async fn put_manifest(&self, r: &Reference, m: &str, c: Vec<u8>) -> Result<Descriptor> {
            self.as_ref().put_manifest(r, m, c).await
        }
        async fn list_tags(&self, r: &Reference) -> Result<Vec<String>> {
            self.as_ref().list_tags(r).await
        }
    }

    #[tokio::test]
    async fn concurrent_pulls_download_each_blob_once() {
        let reference: Reference = "unikraft.org/nginx:1.27".parse().unwrap();
        let transport = Arc::new(MemoryTransport::default());
        transport.insert_image(&reference, &[b"shared layer"]);

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path()));
        store.init().await.unwrap();

        let spawn_pull = |transport: Arc<MemoryTransport>, store: Arc<Store>| {
            let reference = reference.clone();
            tokio::spawn(async move {
                Client::new(Box::new(transport))
                    .pull(&reference, &store, None, None)
                    .await
            })
        };
        let first = spawn_pull(transport.clone(), store.clone());
        let second = spawn_pull(transport.clone(), store.clone());
        let (first, second) = (first.await.unwrap().unwrap(), second.await.unwrap().unwrap());
        assert_eq!(first.digest, second.digest);

        // Config + one layer, each fetched exactly once across both pulls.
        assert_eq!(transport.blob_fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn corrupted_blob_is_rejected_and_not_committed() {
        let reference: Reference = "unikraft.org/evil:1".parse().unwrap();
        let transport = MemoryTransport::default();
        let descriptor = transport.insert_image(&reference, &[b"real layer"]);

        // Corrupt the layer in the registry after the manifest was built.
        let layer_digest = {
            let manifest: Manifest = serde_json::from_slice(
                &transport
                    .manifests
                    .lock()
                    .unwrap()
                    .get(&reference.to_string())
                    .unwrap()
                    .1,
            )
            .unwrap();
            manifest.layers[0].digest.clone()
        };
        transport
            .blobs
            .lock()
            .unwrap()
            .insert(layer_digest.clone(), b"tampered".to_vec());

        let client = Client::new(Box::new(transport));
        let (_dir, store) = store().await;
        let result = client.pull(&reference, &store, None, None).await;
        assert!(matches!(
            result,
            Err(error::Error::DigestMismatch { .. })
        ));
        assert!(!store.contains(&layer_digest).await);
        let _ = descriptor;
    }

    #[tokio::test]
    async fn push_skips_blobs_remote_already_has() {
        let reference: Reference = "unikraft.org/app:1".parse().unwrap();
        let source = MemoryTransport::default();
        source.insert_image(&reference, &[b"layer"]);
        let client = Client::new(Box::new(source));
        let (_dir, store) = store().await;
        client.pull(&reference, &store, None, None).await.unwrap();

        // Pre-seed the target with the layer so only the config needs
        // uploading.
        let target = Arc::new(MemoryTransport::default());
        target.insert_blob(b"layer");
        let client = Client::new(Box::new(target.clone()));
        let pushed = client.push(&reference, &store).await.unwrap();
        assert!(!pushed.digest.is_empty());
        assert_eq!(target.blob_puts.load(Ordering::SeqCst), 1);
        assert!(target
            .manifests
            .lock()
            .unwrap()
            .contains_key(&reference.to_string()));
    }

    #[test]
    fn challenge_parser() {
        let params = parse_challenge(
            "Bearer realm=\"https://auth.example/token\",service=\"registry\",scope=\"repository:a:pull\"",
        );
        assert_eq!(params["realm"], "https://auth.example/token");
        assert_eq!(params["service"], "registry");
    }
}
