//! The from-OCI-image producer: pull the reference if needed, squash
//! its layers into a staging tree, and archive that tree with the
//! directory rules. Default argv and environment come from the image
//! configuration.

use std::path::Path;

use anyhow::{Context, Result};
use log::debug;
use oci_dist::Reference;
use tracing::instrument;

use super::{directory, Initrd, InitrdOptions};
use crate::oci::OciManager;
use crate::pack::{PackageManager, PullOptions};

#[instrument(level = "trace", skip(oci, opts), fields(reference = %reference))]
pub(crate) async fn build(
    oci: &OciManager,
    reference: &Reference,
    output: &Path,
    opts: &InitrdOptions,
) -> Result<Initrd> {
    let mut package = OciManager::package_for(reference);
    package.architecture = opts.architecture.clone();

    if !oci.has_local(reference).await? {
        debug!("'{reference}' is not in the local store, pulling");
        oci.pull(&package, &PullOptions::default()).await?;
    }

    let staging = match &opts.cache_dir {
        Some(cache) => {
            std::fs::create_dir_all(cache)
                .context(format!("Unable to create cache dir '{}'", cache.display()))?;
            tempfile::tempdir_in(cache)
        }
        None => tempfile::tempdir(),
    }
    .context("Unable to create image staging directory")?;

    // Squash: layers extract in manifest order, later layers override
    // earlier ones.
    let rootfs = staging.path().join("rootfs");
    oci.unpack(&package, &rootfs).await?;

    let config = oci.config_for(reference).await?;
    let mut initrd = directory::build(&rootfs, output, opts).await?;
    initrd.args = config.args();
    initrd.env = config.env();
    Ok(initrd)
}
