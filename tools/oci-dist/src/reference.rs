use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Registry used when a reference names no registry of its own.
pub const DEFAULT_REGISTRY: &str = "unikraft.org";

const DEFAULT_TAG: &str = "latest";

/// A parsed image reference such as `unikraft.org/nginx:1.25` or
/// `localhost:5000/app@sha256:<hex>`. The registry is optional in the
/// textual form; a leading path segment counts as a registry when it
/// looks like a host (contains `.` or `:`, or is `localhost`).
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl Reference {
    pub fn new<S1, S2, S3>(registry: S1, repository: S2, tag: S3) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self {
            registry: registry.into(),
            repository: repository.into(),
            tag: Some(tag.into()),
            digest: None,
        }
    }

    /// The reference with the given digest pinned.
    pub fn with_digest<S: Into<String>>(&self, digest: S) -> Self {
        Self {
            digest: Some(digest.into()),
            ..self.clone()
        }
    }

    /// `registry/repository`, the unambiguous name of the repository.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    pub fn tag_or_default(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }

    /// The tag or digest to place in a manifest URL path.
    pub fn version_part(&self) -> String {
        match &self.digest {
            Some(digest) => digest.clone(),
            None => self.tag_or_default().to_string(),
        }
    }
}

impl FromStr for Reference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| Error::InvalidReference {
            value: s.to_string(),
            reason,
        };
        if s.is_empty() {
            return Err(invalid("empty reference"));
        }

        let (rest, digest) = match s.split_once('@') {
            Some((rest, digest)) => (rest, Some(digest.to_string())),
            None => (s, None),
        };

        // A colon after the last slash separates the tag; earlier colons
        // belong to a registry port.
        let (rest, tag) = match rest.rsplit_once(':') {
            Some((head, tail)) if !tail.contains('/') => (head, Some(tail.to_string())),
            _ => (rest, None),
        };

        let (registry, repository) = match rest.split_once('/') {
            Some((head, tail))
                if head.contains('.') || head.contains(':') || head == "localhost" =>
            {
                (head.to_string(), tail.to_string())
            }
            _ => (DEFAULT_REGISTRY.to_string(), rest.to_string()),
        };

        if repository.is_empty() {
            return Err(invalid("missing repository"));
        }
        if let Some(digest) = &digest {
            crate::digest_hex(digest).map_err(|_| invalid("malformed digest"))?;
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }
}

impl Display for Reference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bare_name_gets_defaults() {
        let reference: Reference = "nginx".parse().unwrap();
        assert_eq!(reference.registry, DEFAULT_REGISTRY);
        assert_eq!(reference.repository, "nginx");
        assert_eq!(reference.tag_or_default(), "latest");
    }

    #[test]
    fn registry_with_port_and_tag() {
        let reference: Reference = "localhost:5000/apps/echo:v2".parse().unwrap();
        assert_eq!(reference.registry, "localhost:5000");
        assert_eq!(reference.repository, "apps/echo");
        assert_eq!(reference.tag.as_deref(), Some("v2"));
        assert_eq!(reference.to_string(), "localhost:5000/apps/echo:v2");
    }

    #[test]
    fn plain_path_is_repository() {
        let reference: Reference = "official/nginx:1.25".parse().unwrap();
        assert_eq!(reference.registry, DEFAULT_REGISTRY);
        assert_eq!(reference.repository, "official/nginx");
    }

    #[test]
    fn digest_pin() {
        let digest = crate::digest(b"content");
        let reference: Reference = format!("unikraft.org/nginx@{digest}").parse().unwrap();
        assert_eq!(reference.digest.as_deref(), Some(digest.as_str()));
        assert_eq!(reference.version_part(), digest);
    }

    #[test]
    fn malformed_digest_rejected() {
        assert!("nginx@sha256:nothex".parse::<Reference>().is_err());
        assert!("".parse::<Reference>().is_err());
    }
}
