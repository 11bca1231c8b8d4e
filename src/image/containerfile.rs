//! Base image discovery for Containerfiles.
//!
//! Only what the build flow needs: global `ARG` defaults, `FROM` lines with
//! `${VAR}`/`$VAR` substitution, line continuations and stage aliases.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use crate::build::BuildArgs;
use crate::error::Error;

/// Image name that denotes an empty base and is never pulled.
pub const SCRATCH: &str = "scratch";

/// One `FROM` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FromDecl {
    pub image: String,
    pub alias: Option<String>,
    /// Refers to an earlier stage instead of an image.
    pub is_stage: bool,
}

/// Join `\`-continued lines and drop comments/blank lines.
fn logical_lines(raw: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for line in raw.lines() {
        let trimmed = line.trim();
        if current.is_empty() && (trimmed.is_empty() || trimmed.starts_with('#')) {
            continue;
        }
        if let Some(head) = trimmed.strip_suffix('\\') {
            current.push_str(head);
            current.push(' ');
            continue;
        }
        current.push_str(trimmed);
        lines.push(std::mem::take(&mut current));
    }
    if !current.trim().is_empty() {
        lines.push(current);
    }
    lines
}

fn substitute(value: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    let mut rest = value;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        if let Some(braced) = after.strip_prefix('{') {
            if let Some(end) = braced.find('}') {
                let expr = &braced[..end];
                let (name, default) = match expr.split_once(":-") {
                    Some((name, default)) => (name, Some(default)),
                    None => (expr, None),
                };
                match vars.get(name) {
                    Some(v) if !v.is_empty() => out.push_str(v),
                    _ => out.push_str(default.unwrap_or_default()),
                }
                rest = &braced[end + 1..];
                continue;
            }
        }
        let len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        if len == 0 {
            out.push('$');
        } else if let Some(v) = vars.get(&after[..len]) {
            out.push_str(v);
        }
        rest = &after[len..];
    }
    out.push_str(rest);
    out
}

/// Parse the `FROM` declarations of Containerfile text.
pub fn parse_from_lines(raw: &str, build_args: &BuildArgs) -> Vec<FromDecl> {
    let mut vars: BTreeMap<String, String> = BTreeMap::new();
    let mut stages: HashSet<String> = HashSet::new();
    let mut decls = Vec::new();
    let mut seen_from = false;

    for line in logical_lines(raw) {
        let mut words = line.split_whitespace();
        let Some(instruction) = words.next() else {
            continue;
        };
        match instruction.to_ascii_uppercase().as_str() {
            // Only ARGs before the first FROM are in scope for FROM lines.
            "ARG" if !seen_from => {
                for decl in words {
                    let (name, default) = match decl.split_once('=') {
                        Some((name, default)) => (name, Some(default.trim_matches('"'))),
                        None => (decl, None),
                    };
                    let value = build_args
                        .get(name)
                        .map(str::to_string)
                        .or_else(|| default.map(|d| substitute(d, &vars)));
                    if let Some(value) = value {
                        vars.insert(name.to_string(), value);
                    }
                }
            }
            "FROM" => {
                seen_from = true;
                let rest: Vec<&str> = words.filter(|w| !w.starts_with("--")).collect();
                let Some(image) = rest.first() else {
                    continue;
                };
                let image = substitute(image, &vars);
                let alias = match rest.as_slice() {
                    [_, kw, alias, ..] if kw.eq_ignore_ascii_case("as") => {
                        Some(alias.to_string())
                    }
                    _ => None,
                };
                let is_stage = stages.contains(&image);
                if let Some(alias) = &alias {
                    stages.insert(alias.clone());
                }
                decls.push(FromDecl {
                    image,
                    alias,
                    is_stage,
                });
            }
            _ => {}
        }
    }
    decls
}

pub fn parse_from(path: &Path, build_args: &BuildArgs) -> Result<Vec<FromDecl>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading Containerfile '{}'", path.display()))?;
    Ok(parse_from_lines(&raw, build_args))
}

/// External images referenced by `FROM` lines, in declaration order.
pub fn base_images(path: &Path, build_args: &BuildArgs) -> Result<Vec<String>> {
    let mut images: Vec<String> = Vec::new();
    for decl in parse_from(path, build_args)? {
        if decl.is_stage || images.contains(&decl.image) {
            continue;
        }
        images.push(decl.image);
    }
    Ok(images)
}

/// The single base image of a spec. Zero or several `FROM` lines is a
/// resolution error.
pub fn single_base_image(path: &Path, build_args: &BuildArgs) -> Result<String> {
    let decls = parse_from(path, build_args)?;
    match decls.as_slice() {
        [only] => Ok(only.image.clone()),
        [] => Err(Error::Resolution(format!(
            "no FROM statement in '{}'",
            path.display()
        ))
        .into()),
        many => Err(Error::Resolution(format!(
            "multiple FROM statements ({}) are not supported in '{}'",
            many.len(),
            path.display()
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn substitutes_args_and_build_args() {
        let raw = "# x-name=Test\nARG BASE_VARIANT_ID=base\nARG REPO=\"ghcr.io/example/os\"\nFROM ${REPO}:$BASE_VARIANT_ID\nRUN true\n";
        let mut args = BuildArgs::new();
        args.insert("BASE_VARIANT_ID", "gnome");
        let decls = parse_from_lines(raw, &args);
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].image, "ghcr.io/example/os:gnome");
    }

    #[test]
    fn default_expression_and_continuation() {
        let raw = "FROM --platform=linux/amd64 \\\n  ${IMAGE:-docker.io/library/archlinux:latest} AS build\nFROM build\n";
        let decls = parse_from_lines(raw, &BuildArgs::new());
        assert_eq!(decls[0].image, "docker.io/library/archlinux:latest");
        assert_eq!(decls[0].alias.as_deref(), Some("build"));
        assert!(decls[1].is_stage);
    }

    #[test]
    fn stage_references_are_not_base_images() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("multi.Containerfile");
        fs::write(&path, "FROM alpine AS a\nFROM alpine\nFROM a\n").unwrap();
        assert_eq!(
            base_images(&path, &BuildArgs::new()).unwrap(),
            vec!["alpine"]
        );
    }

    #[test]
    fn exactly_one_from_is_required() {
        let tmp = TempDir::new().unwrap();
        let none = tmp.path().join("none");
        fs::write(&none, "RUN true\n").unwrap();
        let two = tmp.path().join("two");
        fs::write(&two, "FROM a\nFROM b\n").unwrap();
        let one = tmp.path().join("one");
        fs::write(&one, "FROM ghcr.io/example/os:base\n").unwrap();

        for path in [&none, &two] {
            let err = single_base_image(path, &BuildArgs::new()).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<Error>(),
                Some(Error::Resolution(_))
            ));
        }
        assert_eq!(
            single_base_image(&one, &BuildArgs::new()).unwrap(),
            "ghcr.io/example/os:base"
        );
    }
}
