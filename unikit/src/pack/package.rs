use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// The kinds of components a unikernel build consumes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ComponentType {
    Core,
    Arch,
    Plat,
    Lib,
    App,
}

impl Display for ComponentType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ComponentType::Core => "core",
            ComponentType::Arch => "arch",
            ComponentType::Plat => "plat",
            ComponentType::Lib => "lib",
            ComponentType::App => "app",
        })
    }
}

impl FromStr for ComponentType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "core" | "unikraft" => Ok(ComponentType::Core),
            "arch" => Ok(ComponentType::Arch),
            "plat" => Ok(ComponentType::Plat),
            "lib" => Ok(ComponentType::Lib),
            "app" => Ok(ComponentType::App),
            _ => anyhow::bail!("unknown component type '{s}'"),
        }
    }
}

/// The backend a package belongs to. Fixed for the package's lifetime.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum PackageFormat {
    Manifest,
    Oci,
    #[serde(rename = "local-engine")]
    Engine,
}

impl Display for PackageFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PackageFormat::Manifest => "manifest",
            PackageFormat::Oci => "oci",
            PackageFormat::Engine => "local-engine",
        })
    }
}

impl FromStr for PackageFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manifest" => Ok(PackageFormat::Manifest),
            "oci" => Ok(PackageFormat::Oci),
            "local-engine" => Ok(PackageFormat::Engine),
            _ => anyhow::bail!("unknown package format '{s}'"),
        }
    }
}

/// A named, typed, versioned unit consumed by unikernel builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub ctype: ComponentType,
    /// URL or local path the component originates from.
    pub source: String,
    /// Local materialization; absent until pulled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kconfig: BTreeMap<String, String>,
}

/// An opaque handle to a component held by a package. Packages never
/// hold the component itself; the component store resolves the handle
/// on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRef {
    pub id: String,
    pub name: String,
}

/// A distributable artifact wrapping one component target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub format: PackageFormat,
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Kernel binary location after unpack.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initrd: Option<PathBuf>,
    /// Content fingerprint or registry digest. Two packages sharing an
    /// id are byte-identical.
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<ComponentRef>,
    /// Backend-specific payload.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl Package {
    pub fn new<S1, S2>(format: PackageFormat, name: S1, version: S2, id: String) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            format,
            name: name.into(),
            version: version.into(),
            architecture: None,
            platform: None,
            kernel: None,
            initrd: None,
            id,
            component: None,
            metadata: serde_json::Value::Null,
        }
    }
}

// Interchangeability: equal (format, name, version, architecture,
// platform) means the packages are substitutes for one another even
// when their ids differ.
impl PartialEq for Package {
    fn eq(&self, other: &Self) -> bool {
        self.format == other.format
            && self.name == other.name
            && self.version == other.version
            && self.architecture == other.architecture
            && self.platform == other.platform
    }
}

impl Eq for Package {}

impl Display for Package {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} ({})", self.name, self.version, self.format)
    }
}

/// Content fingerprint of any serializable value: the sha256 of its
/// canonical-JSON form, stable across key order.
pub fn fingerprint<T: Serialize>(value: &T) -> anyhow::Result<String> {
    let mut canonical = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(
        &mut canonical,
        olpc_cjson::CanonicalFormatter::new(),
    );
    value
        .serialize(&mut ser)
        .context("failed to canonicalize value for fingerprinting")?;
    Ok(format!("sha256:{}", hex::encode(Sha256::digest(&canonical))))
}
