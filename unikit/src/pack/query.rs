use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};

use super::error::{Error, Result};
use super::{ComponentType, Package};

/// A catalog selection request. The zero value matches every package
/// and permits consulting local caches only; builders narrow it.
///
/// Follows the consuming builder pattern:
///
/// ```
/// use unikit::pack::Query;
/// let query = Query::new().with_name("nginx").with_version("1.25");
/// ```
#[derive(Debug, Clone)]
pub struct Query {
    name: Option<String>,
    version: Option<String>,
    source: Option<String>,
    types: Vec<ComponentType>,
    architecture: Option<String>,
    platform: Option<String>,
    kconfig: BTreeMap<String, String>,
    remote: bool,
    local: bool,
    auth_all: bool,
    all: bool,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            name: None,
            version: None,
            source: None,
            types: Vec::new(),
            architecture: None,
            platform: None,
            kconfig: BTreeMap::new(),
            remote: false,
            local: true,
            auth_all: false,
            all: false,
        }
    }
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_version<S: Into<String>>(mut self, version: S) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_source<S: Into<String>>(mut self, source: S) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_types<I: IntoIterator<Item = ComponentType>>(mut self, types: I) -> Self {
        self.types = types.into_iter().collect();
        self
    }

    pub fn with_architecture<S: Into<String>>(mut self, architecture: S) -> Self {
        self.architecture = Some(architecture.into());
        self
    }

    pub fn with_platform<S: Into<String>>(mut self, platform: S) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_kconfig<S1: Into<String>, S2: Into<String>>(mut self, key: S1, value: S2) -> Self {
        self.kconfig.insert(key.into(), value.into());
        self
    }

    /// Permit refreshing from remotes before answering.
    pub fn with_remote(mut self, remote: bool) -> Self {
        self.remote = remote;
        self
    }

    /// Permit consulting cached indices.
    pub fn with_local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Attempt authentication against all configured hosts.
    pub fn with_auth_all(mut self, auth_all: bool) -> Self {
        self.auth_all = auth_all;
        self
    }

    /// Return every version instead of the best match.
    pub fn with_all(mut self, all: bool) -> Self {
        self.all = all;
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn types(&self) -> &[ComponentType] {
        &self.types
    }

    pub fn architecture(&self) -> Option<&str> {
        self.architecture.as_deref()
    }

    pub fn platform(&self) -> Option<&str> {
        self.platform.as_deref()
    }

    pub fn kconfig(&self) -> &BTreeMap<String, String> {
        &self.kconfig
    }

    pub fn remote(&self) -> bool {
        self.remote
    }

    pub fn local(&self) -> bool {
        self.local
    }

    pub fn auth_all(&self) -> bool {
        self.auth_all
    }

    pub fn all(&self) -> bool {
        self.all
    }

    /// Whether a catalog result satisfies this query.
    pub fn matches(&self, package: &Package) -> bool {
        if let Some(name) = &self.name {
            if *name != package.name {
                return false;
            }
        }
        if let Some(version) = &self.version {
            if *version != package.version {
                return false;
            }
        }
        if let Some(architecture) = &self.architecture {
            if package
                .architecture
                .as_ref()
                .is_some_and(|a| a != architecture)
            {
                return false;
            }
        }
        if let Some(platform) = &self.platform {
            if package.platform.as_ref().is_some_and(|p| p != platform) {
                return false;
            }
        }
        true
    }
}

// The user-visible form, also used in cache keys:
// `{type1,type2}-name:version`, with absent parts elided.
impl Display for Query {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if !self.types.is_empty() {
            let types = self
                .types
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            write!(f, "{{{types}}}-")?;
        }
        f.write_str(self.name.as_deref().unwrap_or("*"))?;
        if let Some(version) = &self.version {
            write!(f, ":{version}")?;
        }
        Ok(())
    }
}

/// Capability for interactive selection among equally good candidates.
/// The terminal prompt implementing it lives outside the core; when no
/// chooser is attached an ambiguous query is an error.
pub trait Chooser: Debug + Send + Sync {
    /// The index of the chosen package, or `None` to decline.
    fn choose(&self, packages: &[Package]) -> Option<usize>;
}

/// Select one package from a catalog result.
///
/// Rules, in order: a single result wins; an exact architecture and
/// platform match wins; an explicit version match wins; an attached
/// chooser decides; otherwise the query is ambiguous.
pub fn select(
    query: &Query,
    mut packages: Vec<Package>,
    chooser: Option<&dyn Chooser>,
) -> Result<Package> {
    if packages.is_empty() {
        return Err(Error::NotFound {
            query: query.to_string(),
        });
    }
    if packages.len() == 1 {
        return Ok(packages.remove(0));
    }

    if query.architecture().is_some() || query.platform().is_some() {
        let exact: Vec<&Package> = packages
            .iter()
            .filter(|p| {
                p.architecture.as_deref() == query.architecture()
                    && p.platform.as_deref() == query.platform()
            })
            .collect();
        if let [only] = exact.as_slice() {
            return Ok((*only).clone());
        }
    }

    if let Some(version) = query.version() {
        let exact: Vec<&Package> = packages
            .iter()
            .filter(|p| p.version == version)
            .collect();
        if let [only] = exact.as_slice() {
            return Ok((*only).clone());
        }
    }

    if let Some(chooser) = chooser {
        if let Some(index) = chooser.choose(&packages) {
            if index < packages.len() {
                return Ok(packages.remove(index));
            }
        }
    }

    Err(Error::AmbiguousQuery {
        query: query.to_string(),
        count: packages.len(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pack::PackageFormat;

    fn package(name: &str, version: &str, arch: Option<&str>, plat: Option<&str>) -> Package {
        let mut package = Package::new(
            PackageFormat::Manifest,
            name,
            version,
            format!("sha256:{name}{version}"),
        );
        package.architecture = arch.map(str::to_string);
        package.platform = plat.map(str::to_string);
        package
    }

    #[test]
    fn defaults_are_local_only() {
        let query = Query::new();
        assert!(query.local());
        assert!(!query.remote());
        assert!(query.matches(&package("anything", "1", None, None)));
    }

    #[test]
    fn display_form() {
        let query = Query::new()
            .with_types([ComponentType::Lib, ComponentType::App])
            .with_name("nginx")
            .with_version("1.25");
        assert_eq!(query.to_string(), "{lib,app}-nginx:1.25");
        assert_eq!(Query::new().to_string(), "*");
    }

    #[test]
    fn more_specific_queries_match_subsets() {
        let packages = vec![
            package("nginx", "1.25", None, None),
            package("nginx", "1.27", None, None),
            package("redis", "7", None, None),
        ];
        let broad = Query::new().with_name("nginx");
        let narrow = broad.clone().with_version("1.27");

        let broad_hits: Vec<_> = packages.iter().filter(|p| broad.matches(p)).collect();
        let narrow_hits: Vec<_> = packages.iter().filter(|p| narrow.matches(p)).collect();
        assert_eq!(broad_hits.len(), 2);
        assert_eq!(narrow_hits.len(), 1);
        assert!(narrow_hits.iter().all(|p| broad_hits.contains(p)));
    }

    #[test]
    fn select_single_result() {
        let query = Query::new().with_name("nginx");
        let selected = select(&query, vec![package("nginx", "1.25", None, None)], None).unwrap();
        assert_eq!(selected.version, "1.25");
    }

    #[test]
    fn select_prefers_exact_target() {
        let query = Query::new()
            .with_name("nginx")
            .with_architecture("x86_64")
            .with_platform("qemu");
        let packages = vec![
            package("nginx", "1.25", Some("x86_64"), Some("qemu")),
            package("nginx", "1.25", Some("arm64"), Some("qemu")),
        ];
        let selected = select(&query, packages, None).unwrap();
        assert_eq!(selected.architecture.as_deref(), Some("x86_64"));
    }

    #[test]
    fn select_by_explicit_version() {
        let query = Query::new().with_name("nginx").with_version("1.27");
        let packages = vec![
            package("nginx", "1.25", None, None),
            package("nginx", "1.27", None, None),
        ];
        assert_eq!(select(&query, packages, None).unwrap().version, "1.27");
    }

    #[test]
    fn select_consults_chooser_before_failing() {
        #[derive(Debug)]
        struct PickLast;
        impl Chooser for PickLast {
            fn choose(&self, packages: &[Package]) -> Option<usize> {
                Some(packages.len() - 1)
            }
        }

        let query = Query::new().with_name("nginx");
        let packages = vec![
            package("nginx", "1.25", None, None),
            package("nginx", "1.27", None, None),
        ];
        let chosen = select(&query, packages.clone(), Some(&PickLast)).unwrap();
        assert_eq!(chosen.version, "1.27");

        let result = select(&query, packages, None);
        assert!(matches!(result, Err(Error::AmbiguousQuery { count: 2, .. })));
    }

    #[test]
    fn select_nothing_is_not_found() {
        let query = Query::new().with_name("ghost");
        assert!(matches!(
            select(&query, Vec::new(), None),
            Err(Error::NotFound { .. })
        ));
    }
}
