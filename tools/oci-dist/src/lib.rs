//! Client library for the OCI image distribution protocol, together
//! with the content-addressed local store that backs it.
//!
//! The wire model is the OCI Image Spec v1: content-addressed blobs,
//! manifests and image indices, addressed as `registry/repository` plus
//! a tag or digest. The [`Client`] wraps a [`Transport`] trait object
//! so tests can substitute an in-memory registry for the HTTP
//! implementation, the same way callers substitute command runners for
//! external tools.
//!
//! The [`Store`] keeps `blobs/sha256/<hex>` plus a top-level
//! `index.json`. All writes are staged to temporary names and renamed
//! into place, and concurrent fetches of one digest are collapsed onto
//! a single downloader by a per-digest lock.

mod client;
mod reference;
mod store;
mod views;

pub use client::{
    BlobResponse, Client, Credentials, HttpTransport, Progress, Transport, TransportSettings,
};
pub use reference::{Reference, DEFAULT_REGISTRY};
pub use store::Store;
pub use views::{
    Descriptor, ImageConfig, ImageConfiguration, ImageIndex, Manifest, Platform,
    MEDIA_TYPE_CONFIG, MEDIA_TYPE_IMAGE_INDEX, MEDIA_TYPE_LAYER_TAR, MEDIA_TYPE_LAYER_TAR_GZIP,
    MEDIA_TYPE_MANIFEST, REF_NAME_ANNOTATION,
};

use sha2::{Digest as _, Sha256};

/// Compute the canonical `sha256:<hex>` digest of a byte slice.
pub fn digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// The hex portion of a `sha256:<hex>` digest string.
pub fn digest_hex(digest: &str) -> Result<&str> {
    digest
        .strip_prefix("sha256:")
        .filter(|hex| hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit()))
        .ok_or_else(|| error::Error::InvalidDigest {
            digest: digest.to_string(),
        })
}

pub type Result<T> = std::result::Result<T, error::Error>;

pub mod error {
    use snafu::Snafu;

    #[derive(Snafu, Debug)]
    #[snafu(visibility(pub(crate)))]
    pub enum Error {
        #[snafu(display("Invalid image reference '{value}': {reason}"))]
        InvalidReference { value: String, reason: &'static str },

        #[snafu(display("Invalid content digest '{digest}'"))]
        InvalidDigest { digest: String },

        #[snafu(display("Digest mismatch: expected {expected}, content hashes to {computed}"))]
        DigestMismatch { expected: String, computed: String },

        #[snafu(display("Blob {digest} is not in the local store"))]
        BlobMissing { digest: String },

        #[snafu(display("Manifest for '{reference}' not found"))]
        ManifestMissing { reference: String },

        #[snafu(display("No manifest for platform {architecture}/{os} in '{reference}'"))]
        PlatformMissing {
            reference: String,
            architecture: String,
            os: String,
        },

        #[snafu(display("Unsupported media type '{media_type}'"))]
        UnsupportedMediaType { media_type: String },

        #[snafu(display("Request to {url} failed: {source}"))]
        Http { url: String, source: reqwest::Error },

        #[snafu(display("Registry returned {status} for {url}"))]
        Status { url: String, status: u16 },

        #[snafu(display("Authentication against '{registry}' failed"))]
        Auth { registry: String },

        #[snafu(display("Upload to '{url}' was rejected with {status}"))]
        UploadRejected { url: String, status: u16 },

        #[snafu(display("Failed to {what}: {source}"))]
        Io {
            what: &'static str,
            source: std::io::Error,
        },

        #[snafu(display("Failed to parse {what}: {source}"))]
        Parse {
            what: &'static str,
            source: serde_json::Error,
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn digest_is_stable() {
        let first = digest(b"unikernel");
        let second = digest(b"unikernel");
        assert_eq!(first, second);
        assert!(first.starts_with("sha256:"));
        assert_eq!(digest_hex(&first).unwrap().len(), 64);
    }

    #[test]
    fn digest_hex_rejects_junk() {
        assert!(digest_hex("sha256:zz").is_err());
        assert!(digest_hex("md5:abcd").is_err());
    }
}
