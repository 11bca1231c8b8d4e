//! Process-wide configuration.
//!
//! A single [`Settings`] value is built at startup and handed to every
//! component by reference. Values come from an optional TOML file; anything
//! the file leaves out keeps its default.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Config file looked up at the project root when none is given explicitly.
pub const CONFIG_FILENAME: &str = "atomic-builder.toml";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "ATOMIC_BUILDER_CONFIG";

/// Fixed image timestamp (2025-01-01T00:00:40Z) for reproducible builds.
pub const DEFAULT_SOURCE_TIMESTAMP: i64 = 1_735_689_640;

/// Commits kept per branch when pruning.
pub const DEFAULT_RETAIN_DEPTH: u32 = 5;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Project root holding `variants/`, `templates/`, `overlay/`.
    #[serde(skip)]
    pub root: PathBuf,
    /// Image repository the variants are published under.
    pub image_repo: String,
    /// OS identity: tree-store branch prefix and default stateroot.
    pub os_name: String,
    pub ostree_repo: PathBuf,
    pub sysroot: PathBuf,
    /// Scratch/state directory for the upgrade flow.
    pub system_path: PathBuf,
    pub package_cache: PathBuf,
    pub systemfile: PathBuf,
    pub kernel_commandline: PathBuf,
    pub grub_config: PathBuf,
    pub source_timestamp: i64,
    pub retain_depth: u32,
    /// Builder sources folded into every variant fingerprint, relative to `root`.
    pub toolchain_files: Vec<String>,
    /// Files or directories hashed by `hash-builder`, relative to `root`.
    pub builder_files: Vec<String>,
    pub status_workers: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            image_repo: "localhost/atomic".to_string(),
            os_name: "atomic".to_string(),
            ostree_repo: PathBuf::from("/ostree/repo"),
            sysroot: PathBuf::from("/"),
            system_path: PathBuf::from("/var/lib/system"),
            package_cache: PathBuf::from("/var/cache/pacman"),
            systemfile: PathBuf::from("/etc/system/Systemfile"),
            kernel_commandline: PathBuf::from("/etc/system/commandline"),
            grub_config: PathBuf::from("/boot/efi/EFI/grub/grub.cfg"),
            source_timestamp: DEFAULT_SOURCE_TIMESTAMP,
            retain_depth: DEFAULT_RETAIN_DEPTH,
            toolchain_files: vec![
                "tools/builder/src/build/mod.rs".to_string(),
                "tools/builder/src/build/push.rs".to_string(),
                "tools/builder/src/hash.rs".to_string(),
                "tools/builder/src/image/podman.rs".to_string(),
                "tools/builder/src/lib.rs".to_string(),
            ],
            builder_files: vec!["tools/builder".to_string()],
            status_workers: 50,
        }
    }
}

impl Settings {
    /// Load settings for a project root.
    ///
    /// Resolution order: `explicit`, `$ATOMIC_BUILDER_CONFIG`,
    /// `<root>/atomic-builder.toml`, built-in defaults.
    pub fn load(root: &Path, explicit: Option<&Path>) -> Result<Self> {
        let candidate = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .or_else(|| {
                let default = root.join(CONFIG_FILENAME);
                default.is_file().then_some(default)
            });

        let mut settings = match candidate {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        settings.root = root.to_path_buf();
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config '{}'", path.display()))
    }

    /// `<repo>:<tag>`
    pub fn image(&self, tag: &str) -> String {
        format!("{}:{}", self.image_repo, tag)
    }

    /// `<os_name>/<branch>`
    pub fn branch_ref(&self, branch: &str) -> String {
        format!("{}/{}", self.os_name, branch)
    }

    /// Where the last successfully deployed context fingerprint is recorded.
    pub fn context_hash_path(&self) -> PathBuf {
        self.system_path.join("context-hash")
    }
}
