//! Variant build orchestration.
//!
//! Every variant is built twice: once from its own spec into the
//! intermediate tag `localhost/build:<variant>`, then through the shared
//! `variant.Containerfile`, which stamps the os-release labels, the package
//! manifest and the fingerprint onto the published image.
//!
//! - [`args`] - Insertion-ordered build arguments
//! - [`push`] - Publishing with version tags

pub mod args;
pub mod push;

use anyhow::{Context, Result};
use std::path::Path;
use time::OffsetDateTime;

use crate::error::Error;
use crate::hash::Hasher;
use crate::image::{
    base_images, os_release_label, require_label, single_base_image, BuildRequest,
    ImageBackend, MIRRORLIST_LABEL,
};
use crate::settings::Settings;
use crate::variant::{parse_config, Layout, SpecSource, VariantConfig, RESERVED_NAMES, ROOTFS};

pub use args::BuildArgs;
pub use push::push;

/// Tag of the image built from the host's Systemfile during upgrades.
pub const SYSTEM_IMAGE: &str = "localhost/system:latest";

/// os-release fields copied from the parent image into build arguments.
const INHERITED_OS_RELEASE: &[&str] = &[
    "VERSION",
    "VERSION_ID",
    "NAME",
    "PRETTY_NAME",
    "ID",
    "HOME_URL",
    "BUG_REPORT_URL",
];

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuiltImage {
    pub tag: String,
    pub args: BuildArgs,
}

/// `HHMMSS` plus centiseconds of the current UTC time.
pub fn build_id() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:02}{:02}{:02}{}",
        now.hour(),
        now.minute(),
        now.second(),
        now.nanosecond() / 10_000_000
    )
}

fn intermediate_tag(variant: &str) -> String {
    format!("localhost/build:{variant}")
}

pub struct Builder<'a> {
    settings: &'a Settings,
    images: &'a dyn ImageBackend,
    layout: Layout,
}

impl<'a> Builder<'a> {
    pub fn new(settings: &'a Settings, images: &'a dyn ImageBackend) -> Self {
        Self {
            settings,
            images,
            layout: Layout::new(&settings.root),
        }
    }

    fn relative<'p>(&self, path: &'p Path) -> &'p Path {
        path.strip_prefix(&self.settings.root).unwrap_or(path)
    }

    fn request(
        &self,
        tag: &str,
        file: &Path,
        build_args: &BuildArgs,
        use_cache: bool,
    ) -> BuildRequest {
        BuildRequest {
            tag: tag.to_string(),
            file: file.to_path_buf(),
            context: self.settings.root.clone(),
            build_args: build_args.clone(),
            use_cache,
            volumes: vec![format!(
                "{0}:{0}",
                self.settings.package_cache.display()
            )],
            timestamp: self.settings.source_timestamp,
        }
    }

    /// Directives of a direct variant, checked before any image is touched.
    fn direct_config(&self, spec: &Path) -> Result<(String, VariantConfig)> {
        let (key, config) = parse_config(spec)?;
        if RESERVED_NAMES.contains(&key.as_str()) {
            return Err(
                Error::Config(format!("invalid use of protected variant name: {key}")).into(),
            );
        }
        Ok((key, config))
    }

    /// Build `variant` into `<repo>:<variant>`.
    pub fn build(&self, variant: &str, use_cache: bool) -> Result<BuiltImage> {
        let source = self.layout.resolve_existing(variant)?;
        let direct = match &source {
            SpecSource::Direct { spec } => Some(self.direct_config(spec)?),
            _ => None,
        };
        let mut args = BuildArgs::new();
        if let SpecSource::Templated { base, .. } = &source {
            args.insert("BASE_VARIANT_ID", base.as_str());
        }

        single_base_image(source.spec(), &args)?;
        for image in base_images(source.spec(), &args)? {
            println!("Base image {image}");
            self.images.ensure_local(&image)?;
        }

        let build_tag = intermediate_tag(variant);
        self.images
            .build(&self.request(&build_tag, self.relative(source.spec()), &args, use_cache))
            .with_context(|| format!("building intermediate image for '{variant}'"))?;

        if matches!(source, SpecSource::Rootfs { .. }) {
            let tag = self.settings.image(ROOTFS);
            self.images.tag(&build_tag, &tag)?;
            self.images.remove(&build_tag)?;
            return Ok(BuiltImage { tag, args });
        }

        args.insert("BUILD_ID", build_id());
        let fingerprint = Hasher::new(self.settings, self.images).hash(variant)?;
        args.insert("HASH", fingerprint.hex());

        let (parent, labels) = match &source {
            SpecSource::Templated { base, template, .. } => {
                let parent = self.settings.image(base);
                self.images.ensure_local(&parent)?;
                let labels = self.images.labels(&parent, false)?;
                let name = require_label(&labels, &parent, &os_release_label("VARIANT"))?;
                let id = require_label(&labels, &parent, &os_release_label("VARIANT_ID"))?;
                args.insert("VARIANT", format!("{name} ({template})"));
                args.insert("VARIANT_ID", format!("{id}-{template}"));
                (parent, labels)
            }
            _ => {
                let (key, config) =
                    direct.unwrap_or_else(|| (variant.to_string(), VariantConfig::default()));
                let parent = self.settings.image(config.parent());
                self.images.ensure_local(&parent)?;
                let labels = self.images.labels(&parent, false)?;
                args.insert("VARIANT", config.name.clone().unwrap_or_else(|| key.clone()));
                args.insert("VARIANT_ID", key);
                (parent, labels)
            }
        };

        args.insert(
            "MIRRORLIST",
            require_label(&labels, &parent, MIRRORLIST_LABEL)?,
        );
        for key in INHERITED_OS_RELEASE {
            args.insert(*key, require_label(&labels, &parent, &os_release_label(key))?);
        }
        let packages = self
            .images
            .run_output(&build_tag, "/usr/sbin/pacman", &["-Q"])
            .with_context(|| format!("listing packages of '{build_tag}'"))?;
        args.insert("PACKAGES", packages);
        args.insert("BUILD_TAG", build_tag.as_str());

        let tag = self.settings.image(variant);
        let final_spec = self.layout.final_spec();
        let mut request = self.request(&tag, self.relative(&final_spec), &args, true);
        request.volumes.clear();
        self.images
            .build(&request)
            .with_context(|| format!("building final image for '{variant}'"))?;
        self.images.remove(&build_tag)?;

        Ok(BuiltImage { tag, args })
    }

    /// Build the host Systemfile into [`SYSTEM_IMAGE`].
    ///
    /// The base image is always pulled so an upgrade picks up the latest
    /// published variant.
    pub fn build_system(&self, systemfile: &Path, args: BuildArgs) -> Result<BuiltImage> {
        let base_image = single_base_image(systemfile, &args)?;
        if base_image != crate::image::SCRATCH {
            self.images.pull(&base_image)?;
        }

        let context = systemfile.parent().unwrap_or(Path::new("/"));
        let mut request = self.request(SYSTEM_IMAGE, systemfile, &args, true);
        request.context = context.to_path_buf();
        self.images
            .build(&request)
            .with_context(|| format!("building '{}'", systemfile.display()))?;
        Ok(BuiltImage {
            tag: SYSTEM_IMAGE.to_string(),
            args,
        })
    }
}
