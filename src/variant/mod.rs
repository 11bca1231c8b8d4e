//! Variant naming and on-disk layout.
//!
//! A project root looks like:
//!
//! ```text
//! rootfs.Containerfile           foundational image, tagged `<repo>:rootfs`
//! variant.Containerfile          final labelling stage shared by every variant
//! variants/<name>.Containerfile  one build spec per variant
//! templates/<name>.Containerfile shared specs combined as `<variant>-<template>`
//! overlay/<name>/                files folded into the variant fingerprint
//! ```

pub mod config;

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::error::Error;

pub use config::{parse_all_config, parse_config, variant_names, Config, VariantConfig};

/// Suffix every build spec carries.
pub const SPEC_SUFFIX: &str = ".Containerfile";

/// Foundational variant every other variant builds on by default.
pub const ROOTFS: &str = "rootfs";

/// Names that may never be used for a configured variant.
pub const RESERVED_NAMES: &[&str] = &["check", ROOTFS];

/// How a variant name maps onto a build spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecSource {
    /// `rootfs.Containerfile`.
    Rootfs { spec: PathBuf },
    /// `variants/<name>.Containerfile`.
    Direct { spec: PathBuf },
    /// `templates/<template>.Containerfile` applied on top of `<base>`.
    Templated {
        spec: PathBuf,
        base: String,
        template: String,
    },
}

impl SpecSource {
    pub fn spec(&self) -> &Path {
        match self {
            SpecSource::Rootfs { spec }
            | SpecSource::Direct { spec }
            | SpecSource::Templated { spec, .. } => spec,
        }
    }
}

/// Paths of a project checkout.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn variants_dir(&self) -> PathBuf {
        self.root.join("variants")
    }

    pub fn rootfs_spec(&self) -> PathBuf {
        self.root.join(format!("{ROOTFS}{SPEC_SUFFIX}"))
    }

    pub fn final_spec(&self) -> PathBuf {
        self.root.join(format!("variant{SPEC_SUFFIX}"))
    }

    pub fn variant_spec(&self, variant: &str) -> PathBuf {
        self.variants_dir().join(format!("{variant}{SPEC_SUFFIX}"))
    }

    pub fn template_spec(&self, template: &str) -> PathBuf {
        self.root
            .join("templates")
            .join(format!("{template}{SPEC_SUFFIX}"))
    }

    /// Overlay directory, relative to the root, as it appears in hash parts.
    pub fn overlay_rel(&self, variant: &str) -> String {
        format!("overlay/{variant}/")
    }

    /// Decide which spec builds `variant`.
    ///
    /// A name with a `-` and no spec of its own is `<base>-<template>`, split
    /// on the last `-`. The returned spec is not checked for existence.
    pub fn resolve(&self, variant: &str) -> SpecSource {
        if variant == ROOTFS {
            return SpecSource::Rootfs {
                spec: self.rootfs_spec(),
            };
        }
        let direct = self.variant_spec(variant);
        if !direct.exists() {
            if let Some((base, template)) = variant.rsplit_once('-') {
                return SpecSource::Templated {
                    spec: self.template_spec(template),
                    base: base.to_string(),
                    template: template.to_string(),
                };
            }
        }
        SpecSource::Direct { spec: direct }
    }

    /// Whether fingerprinting `variants` reads a base image label, which
    /// only templated variants do.
    pub fn any_templated<S: AsRef<str>>(&self, variants: &[S]) -> bool {
        variants
            .iter()
            .any(|v| matches!(self.resolve(v.as_ref()), SpecSource::Templated { .. }))
    }

    /// Like [`Layout::resolve`] but fails when the spec file is missing.
    pub fn resolve_existing(&self, variant: &str) -> Result<SpecSource> {
        let source = self.resolve(variant);
        if !source.spec().is_file() {
            return Err(Error::Resolution(format!(
                "no build spec for variant '{}' (expected '{}')",
                variant,
                source.spec().display()
            ))
            .into());
        }
        Ok(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn resolves_rootfs_direct_and_templated() {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path());
        fs::create_dir_all(layout.variants_dir()).unwrap();
        fs::write(layout.variant_spec("gnome-dev"), "FROM x\n").unwrap();

        assert!(matches!(layout.resolve("rootfs"), SpecSource::Rootfs { .. }));
        assert!(matches!(
            layout.resolve("gnome-dev"),
            SpecSource::Direct { .. }
        ));
        match layout.resolve("base-docker") {
            SpecSource::Templated {
                spec,
                base,
                template,
            } => {
                assert_eq!(base, "base");
                assert_eq!(template, "docker");
                assert_eq!(spec, layout.template_spec("docker"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn templated_split_uses_last_separator() {
        let layout = Layout::new("/nonexistent");
        match layout.resolve("kde-plasma-podman") {
            SpecSource::Templated { base, template, .. } => {
                assert_eq!(base, "kde-plasma");
                assert_eq!(template, "podman");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn only_templated_names_need_the_engine() {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path());
        fs::create_dir_all(layout.variants_dir()).unwrap();
        fs::write(layout.variant_spec("base"), "FROM x\n").unwrap();
        fs::write(layout.variant_spec("gnome-dev"), "FROM x\n").unwrap();

        assert!(!layout.any_templated(&["base", "gnome-dev", "rootfs"]));
        assert!(layout.any_templated(&["base", "base-docker"]));
    }

    #[test]
    fn missing_spec_is_a_resolution_error() {
        let layout = Layout::new("/nonexistent");
        let err = layout.resolve_existing("base").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Resolution(_))
        ));
    }
}
