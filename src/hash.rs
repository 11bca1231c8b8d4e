//! Variant fingerprints.
//!
//! A fingerprint is a SHA-256 digest fed, in order, with:
//!
//! 1. for templated variants, the `hash` label of the base variant's image;
//! 2. the raw bytes of the build spec;
//! 3. every entry under `overlay/<variant>/`, sorted by path string. Files
//!    contribute their content, directories their path (so renames count),
//!    symlinks their target path. Links are not followed: the overlay is
//!    copied into the image as links, and they often dangle on the host;
//! 4. the configured toolchain sources, sorted.
//!
//! Direct variants do not fold in their parent's fingerprint.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

use crate::image::{require_label, ImageBackend, HASH_LABEL};
use crate::settings::Settings;
use crate::variant::{Layout, SpecSource};

/// Length of the abbreviated fingerprint shown to users.
pub const SHORT_LEN: usize = 9;

const BASE62: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const BASE62_DIGITS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_digest(hasher: Sha256) -> Self {
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn hex(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        short(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// First [`SHORT_LEN`] characters of a hex digest.
pub fn short(hex: &str) -> &str {
    hex.get(..SHORT_LEN).unwrap_or(hex)
}

/// One input of a fingerprint, for `hash --debug`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashPart {
    /// `label`, `spec`, `dir`, `file`, `link` or `tool`.
    pub kind: &'static str,
    pub source: String,
    /// Short digest of this part alone.
    pub short: String,
}

impl fmt::Display for HashPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<5} {}: {}", self.kind, self.source, self.short)
    }
}

pub struct Hasher<'a> {
    settings: &'a Settings,
    layout: Layout,
    images: &'a dyn ImageBackend,
}

impl<'a> Hasher<'a> {
    pub fn new(settings: &'a Settings, images: &'a dyn ImageBackend) -> Self {
        Self {
            settings,
            layout: Layout::new(&settings.root),
            images,
        }
    }

    pub fn hash(&self, variant: &str) -> Result<Fingerprint> {
        let mut digest = Sha256::new();
        self.walk(variant, &mut |_, _, bytes| digest.update(bytes))?;
        Ok(Fingerprint::from_digest(digest))
    }

    /// The inputs of [`Hasher::hash`], in the order they are fed.
    pub fn hash_parts(&self, variant: &str) -> Result<Vec<HashPart>> {
        let mut parts = Vec::new();
        self.walk(variant, &mut |kind, source, bytes| {
            let digest = format!("{:x}", Sha256::digest(bytes));
            parts.push(HashPart {
                kind,
                source: source.to_string(),
                short: short(&digest).to_string(),
            });
        })?;
        Ok(parts)
    }

    fn walk(&self, variant: &str, feed: &mut dyn FnMut(&'static str, &str, &[u8])) -> Result<()> {
        let source = self.layout.resolve_existing(variant)?;

        if let SpecSource::Templated { base, .. } = &source {
            let image = self.settings.image(base);
            let labels = self.images.resolve_labels(&image)?;
            let label = require_label(&labels, &image, HASH_LABEL)?;
            feed("label", &image, label.as_bytes());
        }

        let spec = source.spec();
        let bytes = fs::read(spec)
            .with_context(|| format!("reading build spec '{}'", spec.display()))?;
        feed("spec", &self.relative(spec), &bytes);

        self.walk_overlay(variant, feed)?;

        let mut tools = self.settings.toolchain_files.clone();
        tools.sort();
        for tool in &tools {
            let path = self.settings.root.join(tool);
            let bytes = fs::read(&path)
                .with_context(|| format!("reading toolchain file '{}'", path.display()))?;
            feed("tool", tool, &bytes);
        }
        Ok(())
    }

    fn walk_overlay(
        &self,
        variant: &str,
        feed: &mut dyn FnMut(&'static str, &str, &[u8]),
    ) -> Result<()> {
        let root_key = self.layout.overlay_rel(variant);
        let dir = self.settings.root.join(&root_key);
        if !dir.is_dir() {
            return Ok(());
        }

        let mut entries = Vec::new();
        let walker = WalkDir::new(&dir)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));
        for entry in walker {
            let entry =
                entry.with_context(|| format!("walking overlay '{}'", dir.display()))?;
            let key = if entry.depth() == 0 {
                root_key.clone()
            } else {
                let rel = entry.path().strip_prefix(&dir).with_context(|| {
                    format!("relativizing '{}'", entry.path().display())
                })?;
                format!("{root_key}{}", rel.to_string_lossy())
            };
            entries.push((key, entry));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        for (key, entry) in entries {
            let file_type = entry.file_type();
            if file_type.is_dir() {
                feed("dir", &key, key.as_bytes());
            } else if file_type.is_symlink() {
                let target = fs::read_link(entry.path())
                    .with_context(|| format!("reading link '{}'", entry.path().display()))?;
                feed("link", &key, target.to_string_lossy().as_bytes());
            } else {
                let bytes = fs::read(entry.path())
                    .with_context(|| format!("reading overlay file '{}'", entry.path().display()))?;
                feed("file", &key, &bytes);
            }
        }
        Ok(())
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.settings.root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }
}

/// Fingerprint of the builder tool itself, as base62.
///
/// Every regular file under `files` (relative to `root`, directories walked
/// recursively) is fed in sorted path order.
pub fn builder_hash(root: &Path, files: &[String]) -> Result<String> {
    let mut paths = Vec::new();
    for file in files {
        let path = root.join(file);
        if !path.exists() {
            bail!("builder source '{}' does not exist", path.display());
        }
        for entry in WalkDir::new(&path).follow_links(true) {
            let entry = entry.with_context(|| format!("walking '{}'", path.display()))?;
            if entry.file_type().is_file() {
                paths.push(entry.into_path());
            }
        }
    }
    paths.sort();
    paths.dedup();

    let mut digest = Sha256::new();
    for path in &paths {
        let bytes =
            fs::read(path).with_context(|| format!("reading '{}'", path.display()))?;
        digest.update(&bytes);
    }
    hex_to_base62(&format!("{:x}", digest.finalize()))
}

/// Re-encode a hex digest (optionally `sha256:`-prefixed) in base62.
pub fn hex_to_base62(hex: &str) -> Result<String> {
    let hex = hex.strip_prefix("sha256:").unwrap_or(hex);
    let mut nibbles = hex
        .chars()
        .map(|c| {
            c.to_digit(16)
                .with_context(|| format!("invalid hex digit '{c}' in '{hex}'"))
        })
        .collect::<Result<Vec<u32>>>()?;

    let mut digits = Vec::with_capacity(BASE62_DIGITS);
    for _ in 0..BASE62_DIGITS {
        let mut remainder = 0;
        for nibble in nibbles.iter_mut() {
            let current = remainder * 16 + *nibble;
            *nibble = current / 62;
            remainder = current % 62;
        }
        digits.push(BASE62[remainder as usize] as char);
    }

    let encoded: String = digits.iter().rev().collect();
    let trimmed = encoded.trim_start_matches('0');
    Ok(if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    })
}
