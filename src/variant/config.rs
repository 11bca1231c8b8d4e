//! Variant metadata embedded as comments in build specs.
//!
//! ```text
//! # x-depends=base
//! # x-name=Base with GNOME
//! # x-templates=docker,podman
//! # x-clean
//! FROM ...
//! ```
//!
//! Each directive may appear at most once per file.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use super::{Layout, RESERVED_NAMES, ROOTFS, SPEC_SUFFIX};
use crate::error::Error;

const DEPENDS: &str = "# x-depends=";
const NAME: &str = "# x-name=";
const TEMPLATES: &str = "# x-templates=";
const CLEAN: &str = "# x-clean";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VariantConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depends: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub templates: Vec<String>,
    pub clean: bool,
}

impl VariantConfig {
    /// Parent variant, `rootfs` when no `x-depends` is declared.
    pub fn parent(&self) -> &str {
        self.depends.as_deref().unwrap_or(ROOTFS)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Config {
    pub variants: BTreeMap<String, VariantConfig>,
}

fn directive<'a>(lines: &[&'a str], prefix: &str, path: &Path) -> Result<Option<&'a str>> {
    let mut found = lines.iter().filter_map(|line| line.strip_prefix(prefix));
    let first = found.next();
    if found.next().is_some() {
        return Err(Error::Config(format!(
            "directive '{}' appears more than once in '{}'",
            prefix.trim_start_matches("# "),
            path.display()
        ))
        .into());
    }
    Ok(first)
}

/// Parse one build spec into its variant key and metadata.
pub fn parse_config(path: &Path) -> Result<(String, VariantConfig)> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    let Some(key) = filename.strip_suffix(SPEC_SUFFIX) else {
        return Err(Error::Config(format!(
            "'{}' is not a {} build spec",
            path.display(),
            SPEC_SUFFIX
        ))
        .into());
    };

    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading build spec '{}'", path.display()))?;
    let lines: Vec<&str> = raw.lines().collect();

    let templates = directive(&lines, TEMPLATES, path)?
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let config = VariantConfig {
        depends: directive(&lines, DEPENDS, path)?.map(str::to_string),
        name: directive(&lines, NAME, path)?.map(str::to_string),
        templates,
        clean: directive(&lines, CLEAN, path)?.is_some(),
    };
    Ok((key.to_string(), config))
}

/// Parse every `variants/*.Containerfile` under the project root.
pub fn parse_all_config(layout: &Layout) -> Result<Config> {
    let dir = layout.variants_dir();
    let mut config = Config::default();
    if !dir.is_dir() {
        return Ok(config);
    }

    for entry in
        fs::read_dir(&dir).with_context(|| format!("reading variants '{}'", dir.display()))?
    {
        let path = entry
            .with_context(|| format!("iterating variants '{}'", dir.display()))?
            .path();
        let is_spec = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(SPEC_SUFFIX));
        if !is_spec || !path.is_file() {
            continue;
        }
        let (key, variant) = parse_config(&path)?;
        if key == ROOTFS {
            continue;
        }
        config.variants.insert(key, variant);
    }
    Ok(config)
}

/// Every buildable variant: each configured variant plus its template
/// combinations, sorted.
pub fn variant_names(config: &Config) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for (variant, data) in &config.variants {
        if RESERVED_NAMES.contains(&variant.as_str()) {
            return Err(Error::Config(format!(
                "invalid use of protected variant name: {variant}"
            ))
            .into());
        }
        names.push(variant.clone());
        names.extend(data.templates.iter().map(|t| format!("{variant}-{t}")));
    }
    names.sort();
    Ok(names)
}
