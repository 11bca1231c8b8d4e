//! Human-readable deployment status.

use anyhow::{Context, Result};
use rayon::prelude::*;

use super::{Deployment, Unlocked};

/// Status block of one deployment.
pub fn status_block(deployment: &Deployment) -> Result<String> {
    let info = deployment.os_info()?;
    let base = deployment.base_image()?;
    let field = |key: &str| info.get(key).map(String::as_str).unwrap_or("0").to_string();

    let mut status = format!("{}: {}", deployment.index, base);
    let kind = deployment.kind();
    if !kind.is_empty() {
        status.push_str(&format!(" ({kind})"));
    }
    if deployment.pinned {
        status.push_str(" (pinned)");
    }
    status.push_str(&format!(
        "\n  Version:   {}.{}",
        field("VERSION"),
        field("VERSION_ID")
    ));
    status.push_str(&format!("\n  Build:     {}", field("BUILD_ID")));
    status.push_str(&format!("\n  Stateroot: {}", deployment.stateroot));
    if deployment.unlocked != Unlocked::None {
        status.push_str(&format!("\n  Unlocked:  {}", deployment.unlocked));
    }
    Ok(status)
}

/// Status blocks for every deployment, computed on at most `workers`
/// threads. Results keep the input order; a failure only affects its own
/// entry.
pub fn status_blocks(deployments: &[Deployment], workers: usize) -> Result<Vec<Result<String>>> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
        .context("starting status worker pool")?;
    Ok(pool.install(|| {
        deployments
            .par_iter()
            .map(|d| {
                status_block(d).with_context(|| format!("status of deployment {}", d.index))
            })
            .collect()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::tests::{status_json, FixedStatus};
    use crate::deployment::Registry;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn populate(sysroot: &Path, checksum: &str) {
        let dir = sysroot.join(format!("ostree/deploy/atomic/deploy/{checksum}.0"));
        fs::create_dir_all(dir.join("usr/lib")).unwrap();
        fs::create_dir_all(dir.join("etc/system")).unwrap();
        fs::write(
            dir.join("usr/lib/os-release"),
            "VERSION=\"1.0\"\nVERSION_ID=20250101\nBUILD_ID=1234567\n",
        )
        .unwrap();
        fs::write(
            dir.join("etc/system/Systemfile"),
            "FROM ghcr.io/example/atomic:gnome\n",
        )
        .unwrap();
    }

    #[test]
    fn formats_blocks_and_isolates_failures() {
        let tmp = TempDir::new().unwrap();
        populate(tmp.path(), "c0");
        let source = FixedStatus(status_json(&[true, false]));
        let mut deployments = Registry::new(&source, tmp.path()).list_deployments().unwrap();
        deployments[0].pinned = true;
        deployments[0].unlocked = Unlocked::Development;

        let blocks = status_blocks(&deployments, 4).unwrap();
        assert_eq!(
            blocks[0].as_ref().unwrap(),
            "0: ghcr.io/example/atomic:gnome (current) (pinned)\n  \
             Version:   1.0.20250101\n  \
             Build:     1234567\n  \
             Stateroot: atomic\n  \
             Unlocked:  development"
        );
        let err = blocks[1].as_ref().unwrap_err();
        assert!(format!("{err:#}").contains("deployment 1"));
    }
}
