//! Image builder adapter.
//!
//! [`ImageBackend`] is everything the build, hash and upgrade flows need from
//! the container engine. [`podman::Podman`] implements it by shelling out to
//! `podman` (and `skopeo` for registry-side metadata).

pub mod containerfile;
pub mod podman;

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;

use crate::build::BuildArgs;
use crate::error::Error;

pub use containerfile::{base_images, single_base_image, SCRATCH};
pub use podman::Podman;

/// Label carrying the full variant fingerprint.
pub const HASH_LABEL: &str = "hash";
/// Label carrying the `pacman -Q` manifest of an image.
pub const PACKAGES_LABEL: &str = "packages";
pub const MIRRORLIST_LABEL: &str = "mirrorlist";

/// Image labels keyed by name.
pub type Labels = BTreeMap<String, String>;

/// Fetch a label that the build contract requires.
pub fn require_label<'a>(labels: &'a Labels, image: &str, key: &str) -> Result<&'a str> {
    labels.get(key).map(String::as_str).ok_or_else(|| {
        Error::Resolution(format!("image '{image}' has no '{key}' label")).into()
    })
}

/// `os-release.<KEY>` label name.
pub fn os_release_label(key: &str) -> String {
    format!("os-release.{key}")
}

/// Parse `name version` lines (the `pacman -Q` format).
pub fn parse_package_list(raw: &str) -> BTreeMap<String, String> {
    raw.lines()
        .filter_map(|line| line.trim().split_once(' '))
        .map(|(pkg, ver)| (pkg.to_string(), ver.trim().to_string()))
        .collect()
}

/// Arguments of one `podman build` invocation.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub tag: String,
    pub file: PathBuf,
    pub context: PathBuf,
    pub build_args: BuildArgs,
    pub use_cache: bool,
    pub volumes: Vec<String>,
    pub timestamp: i64,
}

pub trait ImageBackend {
    /// Whether `image` exists locally, or in its registry when `remote`.
    fn exists(&self, image: &str, remote: bool) -> Result<bool>;

    fn labels(&self, image: &str, remote: bool) -> Result<Labels>;

    fn pull(&self, image: &str) -> Result<()>;

    fn build(&self, request: &BuildRequest) -> Result<()>;

    fn tag(&self, source: &str, target: &str) -> Result<()>;

    fn remove(&self, image: &str) -> Result<()>;

    fn push(&self, image: &str) -> Result<()>;

    /// Run `entrypoint args..` in a throwaway container and return stdout.
    fn run_output(&self, image: &str, entrypoint: &str, args: &[&str]) -> Result<String>;

    /// Drop dangling build cache.
    fn prune(&self) -> Result<()>;

    /// Create a stopped container and return its id.
    fn create_container(&self, image: &str) -> Result<String>;

    /// Stream a container's filesystem as a tar archive.
    fn export_container(&self, container: &str) -> Result<Box<dyn Read + Send>>;

    fn remove_container(&self, container: &str) -> Result<()>;

    /// Labels from the local image when present, from the registry otherwise.
    fn resolve_labels(&self, image: &str) -> Result<Labels> {
        let local = self.exists(image, false)?;
        self.labels(image, !local)
            .with_context(|| format!("reading labels of '{image}'"))
    }

    /// Pull `image` unless it is already present locally.
    fn ensure_local(&self, image: &str) -> Result<()> {
        if image == SCRATCH || self.exists(image, false)? {
            return Ok(());
        }
        tracing::info!("pulling {image}");
        self.pull(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_list_parses_name_version_pairs() {
        let pkgs = parse_package_list("bash 5.2.037-1\nlinux 6.12.1.arch1-1\n\nbroken\n");
        assert_eq!(pkgs.len(), 2);
        assert_eq!(pkgs["linux"], "6.12.1.arch1-1");
    }

    #[test]
    fn missing_label_is_resolution_error() {
        let labels = Labels::new();
        let err = require_label(&labels, "localhost/atomic:rootfs", "mirrorlist").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Resolution(_))
        ));
    }
}
