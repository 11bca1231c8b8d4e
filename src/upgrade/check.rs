//! Change detection between the running system and its published image.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

use crate::hash::short;
use crate::image::{os_release_label, parse_package_list, ImageBackend, PACKAGES_LABEL};
use crate::system::SystemProbe;

/// Fingerprint of the local build context: the Systemfile plus the kernel
/// command line baked into the image.
pub fn context_hash(systemfile: &[u8], kernel_commandline: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(systemfile);
    hasher.update(format!("KARGS={kernel_commandline}").as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Parse `checkupdates` lines (`name old -> new`).
fn pending_changes(raw: &str) -> BTreeMap<String, (String, String)> {
    raw.lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts.as_slice() {
                [pkg, from, "->", to] => {
                    Some((pkg.to_string(), (from.to_string(), to.to_string())))
                }
                _ => None,
            }
        })
        .collect()
}

/// Human-readable list of what an upgrade would change.
///
/// Order: context fingerprint, OS version, version changes, additions,
/// removals; each package group sorted by name, duplicates dropped.
pub fn changes(
    image: &str,
    probe: &dyn SystemProbe,
    images: &dyn ImageBackend,
) -> Result<Vec<String>> {
    let mut lines = Vec::new();

    let current = context_hash(&probe.systemfile()?, &probe.kernel_commandline()?);
    let recorded = probe.recorded_context_hash()?;
    if recorded.as_deref() != Some(current.as_str()) {
        let old = recorded.as_deref().map(short).unwrap_or("-");
        lines.push(format!("Systemfile {} -> {}", old, short(&current)));
    }

    let remote = images.labels(image, true)?;
    let local = probe.os_release()?;
    let field = |map: &BTreeMap<String, String>, key: &str| {
        map.get(key).cloned().unwrap_or_else(|| "0".to_string())
    };
    let local_id = field(&local, "VERSION_ID");
    let remote_id = field(&remote, &os_release_label("VERSION_ID"));
    if local_id != remote_id {
        lines.push(format!(
            "{image} {}.{local_id} -> {}.{remote_id}",
            field(&local, "VERSION"),
            field(&remote, &os_release_label("VERSION")),
        ));
    }

    let mut versions = pending_changes(&probe.pending_updates()?);
    let mut additions = BTreeMap::new();
    let mut removals = BTreeMap::new();
    if let Some(raw) = remote.get(PACKAGES_LABEL) {
        let remote_pkgs = parse_package_list(raw);
        let local_pkgs = parse_package_list(&probe.installed_packages()?);

        for (pkg, version) in &local_pkgs {
            if versions.contains_key(pkg) {
                continue;
            }
            match remote_pkgs.get(pkg) {
                None => {
                    removals.insert(pkg.clone(), (version.clone(), "-".to_string()));
                }
                Some(remote_version) if remote_version != version => {
                    versions.insert(pkg.clone(), (version.clone(), remote_version.clone()));
                }
                Some(_) => {}
            }
        }
        for (pkg, version) in &remote_pkgs {
            if !versions.contains_key(pkg) && !local_pkgs.contains_key(pkg) {
                additions.insert(pkg.clone(), ("-".to_string(), version.clone()));
            }
        }
    }

    for group in [versions, additions, removals] {
        lines.extend(
            group
                .into_iter()
                .map(|(pkg, (from, to))| format!("{pkg} {from} -> {to}")),
        );
    }

    let mut seen = HashSet::new();
    lines.retain(|line| seen.insert(line.clone()));
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeBackend, FakeProbe};

    const IMAGE: &str = "ghcr.io/example/atomic:gnome";

    fn remote(version_id: &str, packages: &str) -> FakeBackend {
        FakeBackend::new().with_remote(
            IMAGE,
            &[
                ("os-release.VERSION", "1.0"),
                ("os-release.VERSION_ID", version_id),
                ("packages", packages),
            ],
        )
    }

    #[test]
    fn up_to_date_system_has_no_changes() {
        let probe = FakeProbe::new("FROM x\n", "quiet", "1.0", "7", "bash 5.2-1");
        probe.record_current();
        let images = remote("7", "bash 5.2-1");
        assert!(changes(IMAGE, &probe, &images).unwrap().is_empty());
    }

    #[test]
    fn reports_every_kind_of_change_in_order() {
        let probe = FakeProbe::new("FROM x\n", "quiet", "1.0", "6", "bash 5.1-1\nold 1-1");
        probe.set_pending("linux 6.1-1 -> 6.2-1\n");
        let images = remote("7", "bash 5.2-1\nnew 2-1");
        let expected_hash = context_hash(b"FROM x\n", "quiet");

        assert_eq!(
            changes(IMAGE, &probe, &images).unwrap(),
            vec![
                format!("Systemfile - -> {}", &expected_hash[..9]),
                format!("{IMAGE} 1.0.6 -> 1.0.7"),
                "bash 5.1-1 -> 5.2-1".to_string(),
                "linux 6.1-1 -> 6.2-1".to_string(),
                "new - -> 2-1".to_string(),
                "old 1-1 -> -".to_string(),
            ]
        );
    }

    #[test]
    fn commandline_change_alters_context_hash() {
        assert_ne!(context_hash(b"FROM x\n", "quiet"), context_hash(b"FROM x\n", ""));
        let probe = FakeProbe::new("FROM x\n", "quiet", "1.0", "7", "");
        probe.record("0123456789abcdef");
        let images = remote("7", "");
        let lines = changes(IMAGE, &probe, &images).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("Systemfile 012345678 -> "));
    }
}
