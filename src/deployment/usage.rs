//! Disk usage of deployments.
//!
//! Deployments share most of their files through hard links into the tree
//! store, so the interesting number is the incremental size: what a
//! deployment adds on top of every older one. Files are counted by
//! `(device, inode)` the way `du` does when given several paths.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::Deployment;

const IEC_UNITS: &[&str] = &["KiB", "MiB", "GiB", "TiB", "PiB"];

/// `1536` -> `1.50 KiB`.
pub fn bytes_to_iec(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < IEC_UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", IEC_UNITS[unit])
}

/// Allocated size of everything under `path` not already in `seen`.
pub fn disk_usage(path: &Path, seen: &mut HashSet<(u64, u64)>) -> Result<u64> {
    let mut total = 0;
    for entry in WalkDir::new(path) {
        let entry = entry.with_context(|| format!("walking '{}'", path.display()))?;
        let meta = entry
            .metadata()
            .with_context(|| format!("stat '{}'", entry.path().display()))?;
        if seen.insert((meta.dev(), meta.ino())) {
            total += meta.blocks() * 512;
        }
    }
    Ok(total)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentUsage {
    pub index: usize,
    pub kind: &'static str,
    /// Everything reachable from the deployment.
    pub size: u64,
    /// Bytes not shared with any older deployment.
    pub incremental: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Usage {
    pub deployments: Vec<DeploymentUsage>,
    pub total: u64,
}

impl Usage {
    pub fn lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .deployments
            .iter()
            .map(|d| {
                let mut line = format!(
                    "{}: {} (+{})",
                    d.index,
                    bytes_to_iec(d.size),
                    bytes_to_iec(d.incremental)
                );
                if !d.kind.is_empty() {
                    line.push_str(&format!(" ({})", d.kind));
                }
                line
            })
            .collect();
        lines.push(format!("total: {}", bytes_to_iec(self.total)));
        lines
    }
}

/// Measure `deployments` (newest first, as listed by the tree store).
pub fn usage(deployments: &[Deployment]) -> Result<Usage> {
    let paths = deployments
        .iter()
        .map(|d| d.path())
        .collect::<Result<Vec<PathBuf>>>()?;

    let mut incremental = vec![0; deployments.len()];
    let mut seen = HashSet::new();
    for (i, path) in paths.iter().enumerate().rev() {
        incremental[i] = disk_usage(path, &mut seen)?;
    }

    let mut rows = Vec::with_capacity(deployments.len());
    for ((deployment, path), incremental) in deployments.iter().zip(&paths).zip(incremental) {
        rows.push(DeploymentUsage {
            index: deployment.index,
            kind: deployment.kind(),
            size: disk_usage(path, &mut HashSet::new())?,
            incremental,
        });
    }

    let mut roots: Vec<&Path> = paths.iter().filter_map(|p| p.parent()).collect();
    roots.sort();
    roots.dedup();
    let mut seen = HashSet::new();
    let mut total = 0;
    for root in roots {
        total += disk_usage(root, &mut seen)?;
    }

    Ok(Usage {
        deployments: rows,
        total,
    })
}
