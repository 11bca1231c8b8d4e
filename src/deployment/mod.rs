//! Deployment registry backed by `ostree admin status --json`.
//!
//! - [`status`] - Per-deployment status blocks computed in parallel
//! - [`usage`] - Disk usage per deployment

pub mod status;
pub mod usage;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::build::BuildArgs;
use crate::error::Error;
use crate::image::{parse_package_list, single_base_image, ImageBackend, PACKAGES_LABEL};
use crate::process::{Cmd, Runner};
use crate::system::parse_os_release;

/// Writable state of a deployment's `/usr`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "String")]
pub enum Unlocked {
    #[default]
    None,
    Hotfix,
    Development,
    Other(String),
}

impl From<String> for Unlocked {
    fn from(value: String) -> Self {
        match value.as_str() {
            "" | "none" => Unlocked::None,
            "hotfix" => Unlocked::Hotfix,
            "development" => Unlocked::Development,
            _ => Unlocked::Other(value),
        }
    }
}

impl fmt::Display for Unlocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unlocked::None => f.write_str("none"),
            Unlocked::Hotfix => f.write_str("hotfix"),
            Unlocked::Development => f.write_str("development"),
            Unlocked::Other(value) => f.write_str(value),
        }
    }
}

/// One deployment slot as reported by the tree store.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Deployment {
    pub index: usize,
    pub checksum: String,
    pub serial: i64,
    pub stateroot: String,
    pub booted: bool,
    pub pending: bool,
    pub rollback: bool,
    pub pinned: bool,
    pub staged: bool,
    pub unlocked: Unlocked,
    #[serde(rename = "finalization-locked")]
    pub finalization_locked: bool,
    #[serde(rename = "soft-reboot-target")]
    pub soft_reboot_target: bool,
    #[serde(skip)]
    pub sysroot: PathBuf,
}

impl Deployment {
    /// `ostree/deploy/<stateroot>/deploy/<checksum>.<serial>`.
    pub fn relative_path(&self) -> PathBuf {
        Path::new("ostree/deploy")
            .join(&self.stateroot)
            .join("deploy")
            .join(format!("{}.{}", self.checksum, self.serial))
    }

    /// [`Deployment::relative_path`] under the sysroot; must be a directory.
    pub fn path(&self) -> Result<PathBuf> {
        let path = self.sysroot.join(self.relative_path());
        if !path.is_dir() {
            return Err(Error::Invariant(format!(
                "deployment {} has no directory at '{}'",
                self.index,
                path.display()
            ))
            .into());
        }
        Ok(path)
    }

    /// `current`, `pending`, `rollback` or empty.
    pub fn kind(&self) -> &'static str {
        if self.booted {
            "current"
        } else if self.pending {
            "pending"
        } else if self.rollback {
            "rollback"
        } else {
            ""
        }
    }

    pub fn os_info(&self) -> Result<BTreeMap<String, String>> {
        let path = self.path()?.join("usr/lib/os-release");
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading '{}'", path.display()))?;
        Ok(parse_os_release(&raw))
    }

    /// The image named by the deployment's Systemfile.
    pub fn base_image(&self) -> Result<String> {
        let systemfile = self.path()?.join("etc/system/Systemfile");
        single_base_image(&systemfile, &BuildArgs::new())
    }

    /// Installed packages read from the deployment's pacman database.
    pub fn packages(&self) -> Result<BTreeMap<String, String>> {
        read_pacman_db(&self.path()?.join("usr/lib/pacman/local"))
    }

    /// Packages listed on the deployment's base image.
    pub fn image_packages(
        &self,
        images: &dyn ImageBackend,
    ) -> Result<BTreeMap<String, String>> {
        let image = self.base_image()?;
        let labels = images.resolve_labels(&image)?;
        Ok(labels
            .get(PACKAGES_LABEL)
            .map(String::as_str)
            .map(parse_package_list)
            .unwrap_or_default())
    }
}

fn read_pacman_db(db: &Path) -> Result<BTreeMap<String, String>> {
    let mut packages = BTreeMap::new();
    if !db.is_dir() {
        return Ok(packages);
    }
    for entry in fs::read_dir(db).with_context(|| format!("reading '{}'", db.display()))? {
        let desc = entry
            .with_context(|| format!("iterating '{}'", db.display()))?
            .path()
            .join("desc");
        if !desc.is_file() {
            continue;
        }
        let raw = fs::read_to_string(&desc)
            .with_context(|| format!("reading '{}'", desc.display()))?;
        let mut lines = raw.lines();
        let (mut name, mut version) = (None, None);
        while let Some(line) = lines.next() {
            match line {
                "%NAME%" => name = lines.next(),
                "%VERSION%" => version = lines.next(),
                _ => {}
            }
        }
        if let (Some(name), Some(version)) = (name, version) {
            packages.insert(name.to_string(), version.to_string());
        }
    }
    Ok(packages)
}

/// Source of the structured deployment snapshot.
pub trait StatusSource {
    /// Raw `ostree admin status --json` output.
    fn status_json(&self) -> Result<Vec<u8>>;
}

pub struct OstreeStatus<'r> {
    runner: &'r dyn Runner,
    sysroot: PathBuf,
}

impl<'r> OstreeStatus<'r> {
    pub fn new(runner: &'r dyn Runner, sysroot: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            sysroot: sysroot.into(),
        }
    }
}

impl StatusSource for OstreeStatus<'_> {
    fn status_json(&self) -> Result<Vec<u8>> {
        self.runner.output(
            Cmd::new("ostree")
                .args(["admin", "status", "--json"])
                .arg(format!("--sysroot={}", self.sysroot.display())),
        )
    }
}

#[derive(Deserialize)]
struct StatusReport {
    #[serde(default)]
    deployments: Vec<Deployment>,
}

pub struct Registry<'a> {
    source: &'a dyn StatusSource,
    sysroot: PathBuf,
}

impl<'a> Registry<'a> {
    pub fn new(source: &'a dyn StatusSource, sysroot: impl Into<PathBuf>) -> Self {
        Self {
            source,
            sysroot: sysroot.into(),
        }
    }

    /// Every deployment, in tree-store order. Queried once per call.
    pub fn list_deployments(&self) -> Result<Vec<Deployment>> {
        let raw = self.source.status_json()?;
        let report: StatusReport =
            serde_json::from_slice(&raw).context("parsing deployment status")?;
        Ok(report
            .deployments
            .into_iter()
            .map(|mut d| {
                d.sysroot = self.sysroot.clone();
                d
            })
            .collect())
    }

    /// The one booted deployment.
    pub fn current_deployment(&self) -> Result<Deployment> {
        let mut booted: Vec<Deployment> = self
            .list_deployments()?
            .into_iter()
            .filter(|d| d.booted)
            .collect();
        if booted.len() != 1 {
            return Err(Error::Invariant(format!(
                "there should be one current deployment, not {}",
                booted.len()
            ))
            .into());
        }
        Ok(booted.remove(0))
    }

    /// Deployment at `index`; negative values count from the end.
    pub fn deployment(&self, index: isize) -> Result<Deployment> {
        let deployments = self.list_deployments()?;
        let len = deployments.len();
        let resolved = if index < 0 {
            len as isize + index
        } else {
            index
        };
        usize::try_from(resolved)
            .ok()
            .and_then(|i| deployments.into_iter().nth(i))
            .ok_or_else(|| {
                Error::DeploymentNotFound {
                    requested: index,
                    resolved,
                    len,
                }
                .into()
            })
    }
}
