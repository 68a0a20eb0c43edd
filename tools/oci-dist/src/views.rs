use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

pub const MEDIA_TYPE_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
pub const MEDIA_TYPE_LAYER_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Annotation naming the reference a manifest was stored under.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// A content descriptor: the typed pointer at the heart of the format.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    pub fn new<S: Into<String>>(media_type: S, digest: String, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            platform: None,
            annotations: None,
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}

/// Top-level image index, also the layout of the store's `index.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    pub fn new() -> Self {
        Self {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_IMAGE_INDEX.to_string()),
            manifests: Vec::new(),
        }
    }

    /// The descriptor stored under the given reference name, if any.
    pub fn find_ref_name(&self, name: &str) -> Option<&Descriptor> {
        self.manifests
            .iter()
            .find(|m| m.annotation(REF_NAME_ANNOTATION) == Some(name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// The image configuration blob. Only the fields the toolchain consumes
/// are modeled; everything else passes through untouched on the blob
/// level because blobs are content-addressed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfiguration {
    pub architecture: String,
    pub os: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<ImageConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(rename = "Env", skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(rename = "Entrypoint", skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(rename = "Labels", skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

impl ImageConfiguration {
    /// Default argv: entrypoint followed by cmd.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(config) = &self.config {
            args.extend(config.entrypoint.clone().unwrap_or_default());
            args.extend(config.cmd.clone().unwrap_or_default());
        }
        args
    }

    pub fn env(&self) -> Vec<String> {
        self.config
            .as_ref()
            .and_then(|c| c.env.clone())
            .unwrap_or_default()
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.config
            .as_ref()
            .and_then(|c| c.labels.as_ref())
            .and_then(|l| l.get(key))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_args_concatenate_entrypoint_and_cmd() {
        let config = ImageConfiguration {
            architecture: "amd64".into(),
            os: "linux".into(),
            config: Some(ImageConfig {
                entrypoint: Some(vec!["/entry".into()]),
                cmd: Some(vec!["-c".into(), "conf".into()]),
                ..Default::default()
            }),
        };
        assert_eq!(config.args(), vec!["/entry", "-c", "conf"]);
    }

    #[test]
    fn manifest_round_trips_wire_names() {
        let manifest = Manifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_MANIFEST.to_string()),
            config: Descriptor::new(MEDIA_TYPE_CONFIG, crate::digest(b"cfg"), 3),
            layers: vec![Descriptor::new(
                MEDIA_TYPE_LAYER_TAR_GZIP,
                crate::digest(b"layer"),
                5,
            )],
            annotations: None,
        };
        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains("\"schemaVersion\":2"));
        assert!(json.contains("\"mediaType\""));
        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.layers.len(), 1);
    }

    #[test]
    fn index_ref_name_lookup() {
        let mut index = ImageIndex::new();
        let mut descriptor = Descriptor::new(MEDIA_TYPE_MANIFEST, crate::digest(b"m"), 2);
        descriptor.annotations = Some(BTreeMap::from([(
            REF_NAME_ANNOTATION.to_string(),
            "unikraft.org/nginx:1.25".to_string(),
        )]));
        index.manifests.push(descriptor);
        assert!(index.find_ref_name("unikraft.org/nginx:1.25").is_some());
        assert!(index.find_ref_name("unikraft.org/nginx:1.27").is_none());
    }
}
