//! Facts about the running host.
//!
//! [`SystemProbe`] is the seam the upgrade check reads through; the real
//! [`HostSystem`] answers package questions by running `pacman` and
//! `checkupdates` inside the booted deployment with `systemd-nspawn`.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::deployment::{Registry, StatusSource};
use crate::error::Error;
use crate::process::{Cmd, Runner};
use crate::settings::Settings;
use crate::tree_store::TreeStore;

/// Parse `KEY=value` lines, skipping comments and unquoting values.
pub fn parse_os_release(raw: &str) -> BTreeMap<String, String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            (key.to_string(), value.to_string())
        })
        .collect()
}

pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

pub fn require_root() -> Result<()> {
    if !is_root() {
        return Err(Error::Privilege.into());
    }
    Ok(())
}

/// Contents of the kernel command line file, trimmed; empty when missing.
pub fn read_kernel_commandline(path: &Path) -> Result<String> {
    if !path.exists() {
        return Ok(String::new());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading kernel command line '{}'", path.display()))?;
    Ok(raw.trim().to_string())
}

pub trait SystemProbe {
    fn kernel_commandline(&self) -> Result<String>;

    fn systemfile(&self) -> Result<Vec<u8>>;

    /// `/usr/lib/os-release` of the running system.
    fn os_release(&self) -> Result<BTreeMap<String, String>>;

    /// `pacman -Q` output of the booted deployment.
    fn installed_packages(&self) -> Result<String>;

    /// `checkupdates` output; empty when nothing is pending.
    fn pending_updates(&self) -> Result<String>;

    /// Context fingerprint recorded by the last completed upgrade.
    fn recorded_context_hash(&self) -> Result<Option<String>>;

    fn record_context_hash(&self, hash: &str) -> Result<()>;
}

/// Make sure a tree-store repo is reachable for nspawn and return the
/// directory deployments are pivoted from.
///
/// On an ostree-booted host this is `/`, with `<system_path>/ostree` linked
/// to `/ostree`. Elsewhere an isolated repo is initialised under the system
/// path and `store` is pointed at it.
pub fn prepare_nspawn_root(settings: &Settings, store: &mut TreeStore) -> Result<PathBuf> {
    let system_path = &settings.system_path;
    fs::create_dir_all(system_path)
        .with_context(|| format!("creating '{}'", system_path.display()))?;

    let host_ostree = settings.sysroot.join("ostree");
    if host_ostree.is_dir() {
        let link = system_path.join("ostree");
        if fs::symlink_metadata(&link).is_err() {
            std::os::unix::fs::symlink(&host_ostree, &link)
                .with_context(|| format!("linking '{}'", link.display()))?;
        }
        return Ok(settings.sysroot.clone());
    }

    let ostree = system_path.join("ostree");
    fs::create_dir_all(&ostree).with_context(|| format!("creating '{}'", ostree.display()))?;
    store.set_repo(ostree.join("repo"));
    store.ensure_repo()?;
    Ok(system_path.clone())
}

pub struct HostSystem<'a> {
    settings: &'a Settings,
    runner: &'a dyn Runner,
    status: &'a dyn StatusSource,
    pivot_root: PathBuf,
}

impl<'a> HostSystem<'a> {
    pub fn new(
        settings: &'a Settings,
        runner: &'a dyn Runner,
        status: &'a dyn StatusSource,
        pivot_root: PathBuf,
    ) -> Self {
        Self {
            settings,
            runner,
            status,
            pivot_root,
        }
    }

    /// `systemd-nspawn` invocation running `args` in the booted deployment.
    pub fn nspawn_cmd(&self, args: &[&str]) -> Result<Cmd> {
        let deployment =
            Registry::new(self.status, &self.settings.sysroot).current_deployment()?;
        let system_path = self.settings.system_path.display().to_string();
        let cache = self.settings.package_cache.display().to_string();
        fs::create_dir_all(&self.settings.package_cache)
            .with_context(|| format!("creating '{cache}'"))?;
        let physical_root = self.settings.sysroot.join("sysroot");
        let boot = self.settings.sysroot.join("boot");

        // The `+` bind is resolved inside the container tree, not on the host.
        Ok(Cmd::new("systemd-nspawn")
            .env("SYSTEMD_NSPAWN_LOCK", "0")
            .args(["--volatile=state", "--link-journal=no"])
            .arg(format!("--directory={}", physical_root.display()))
            .arg("--quiet")
            .arg(format!("--bind={system_path}:{system_path}"))
            .arg(format!("--bind={}:/boot", boot.display()))
            .arg("--bind=/run/podman/podman.sock:/run/podman/podman.sock")
            .arg(format!("--bind={cache}:{cache}"))
            .arg(format!(
                "--bind=+/sysroot/ostree/deploy/{}/var:/var",
                deployment.stateroot
            ))
            .arg(format!(
                "--pivot-root={}:/sysroot",
                self.pivot_root.join(deployment.relative_path()).display()
            ))
            .args(args.iter().copied()))
    }
}

impl SystemProbe for HostSystem<'_> {
    fn kernel_commandline(&self) -> Result<String> {
        read_kernel_commandline(&self.settings.kernel_commandline)
    }

    fn systemfile(&self) -> Result<Vec<u8>> {
        let path = &self.settings.systemfile;
        fs::read(path).with_context(|| format!("reading Systemfile '{}'", path.display()))
    }

    fn os_release(&self) -> Result<BTreeMap<String, String>> {
        let path = self.settings.sysroot.join("usr/lib/os-release");
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading '{}'", path.display()))?;
        Ok(parse_os_release(&raw))
    }

    fn installed_packages(&self) -> Result<String> {
        let raw = self.runner.output(self.nspawn_cmd(&["pacman", "-Q"])?)?;
        Ok(String::from_utf8_lossy(&raw).trim().to_string())
    }

    fn pending_updates(&self) -> Result<String> {
        // checkupdates exits 2 when there is nothing to update.
        let captured = self
            .runner
            .capture(self.nspawn_cmd(&["checkupdates"])?, &[0, 2])?;
        Ok(String::from_utf8_lossy(&captured.stdout).trim().to_string())
    }

    fn recorded_context_hash(&self) -> Result<Option<String>> {
        let path = self.settings.context_hash_path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading '{}'", path.display()))?;
        Ok(Some(raw.trim().to_string()))
    }

    fn record_context_hash(&self, hash: &str) -> Result<()> {
        let path = self.settings.context_hash_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating '{}'", parent.display()))?;
        }
        fs::write(&path, format!("{hash}\n"))
            .with_context(|| format!("writing '{}'", path.display()))
    }
}
