use super::PackageFormat;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors of the package subsystem. Backend-internal failures surface
/// verbatim; the umbrella wraps them in [`Error::Backend`] so messages
/// name the backend that produced them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No package found matching '{query}'")]
    NotFound { query: String },

    #[error("Query '{query}' matches {count} packages and none can be selected")]
    AmbiguousQuery { query: String, count: usize },

    #[error("No compatible backend for source '{source_value}'")]
    IncompatibleSource { source_value: String },

    #[error("Integrity check failed for '{subject}': expected {expected}, content hashes to {computed}")]
    Integrity {
        subject: String,
        expected: String,
        computed: String,
    },

    #[error("Network failure talking to '{endpoint}': {reason}")]
    Network { endpoint: String, reason: String },

    #[error("Missing or rejected credentials for '{host}'")]
    Auth { host: String },

    #[error("Backend '{format}' is unavailable: {reason}")]
    BackendUnavailable {
        format: PackageFormat,
        reason: String,
    },

    #[error("Build of '{subject}' failed: {reason}")]
    Build { subject: String, reason: String },

    #[error("Operation canceled")]
    Cancelled,

    #[error("{format}: {source}")]
    Backend {
        format: PackageFormat,
        source: Box<Error>,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Attach a backend format label, the umbrella's propagation rule.
    pub fn labeled(self, format: PackageFormat) -> Self {
        match self {
            Error::Backend { .. } => self,
            other => Error::Backend {
                format,
                source: Box::new(other),
            },
        }
    }

    /// The error beneath any backend labels, for matching on kind.
    pub fn root(&self) -> &Error {
        match self {
            Error::Backend { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<oci_dist::error::Error> for Error {
    fn from(value: oci_dist::error::Error) -> Self {
        use oci_dist::error::Error as Dist;
        match value {
            Dist::DigestMismatch { expected, computed } => Error::Integrity {
                subject: "oci blob".to_string(),
                expected,
                computed,
            },
            Dist::Http { url, source } => Error::Network {
                endpoint: url,
                reason: source.to_string(),
            },
            Dist::Status { url, status } if status == 401 || status == 403 => {
                Error::Auth { host: url }
            }
            Dist::Auth { registry } => Error::Auth { host: registry },
            other => Error::Other(anyhow::Error::new(other)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn labels_nest_once() {
        let error = Error::NotFound {
            query: "nginx".to_string(),
        };
        let labeled = error.labeled(PackageFormat::Oci).labeled(PackageFormat::Oci);
        assert!(matches!(labeled, Error::Backend { .. }));
        assert!(matches!(labeled.root(), Error::NotFound { .. }));
        assert!(labeled.to_string().starts_with("oci:"));
    }

    #[test]
    fn integrity_from_digest_mismatch() {
        let dist = oci_dist::error::Error::DigestMismatch {
            expected: "sha256:aa".to_string(),
            computed: "sha256:bb".to_string(),
        };
        assert!(matches!(Error::from(dist), Error::Integrity { .. }));
    }
}
