//! Host tool checks run before a command starts shelling out.
//!
//! Each command group needs a different set of external programs; checking
//! them up front turns a mid-build "No such file or directory" into a list of
//! what to install.

use anyhow::{bail, Result};

/// A program looked up in `PATH`, with the package that ships it.
pub type Tool = (&'static str, &'static str);

/// Needed by `build`, `push` and `hash`.
pub const IMAGE_TOOLS: &[Tool] = &[("podman", "podman"), ("skopeo", "skopeo")];

/// Needed by commands that touch the deployed system.
pub const HOST_TOOLS: &[Tool] = &[("ostree", "ostree")];

/// Needed by `check` and `upgrade`.
pub const UPGRADE_TOOLS: &[Tool] = &[
    ("podman", "podman"),
    ("skopeo", "skopeo"),
    ("ostree", "ostree"),
    ("systemd-nspawn", "systemd"),
    ("grub-mkconfig", "grub"),
];

pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Fail with every missing tool listed, not just the first.
pub fn check_required_tools(tools: &[Tool]) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(tool, package)| format!("  {tool} (install: {package})"))
        .collect();

    if !missing.is_empty() {
        bail!("Missing required host tools:\n{}", missing.join("\n"));
    }
    Ok(())
}
