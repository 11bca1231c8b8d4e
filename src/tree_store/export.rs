//! Normalize a container export before it is committed.
//!
//! `podman export` produces the full container filesystem. Before it becomes
//! a tree-store commit:
//!
//! - `etc` is dropped entirely (the image ships its defaults in `usr/etc`);
//! - `var`, `dev`, `proc`, `sys`, `run` and `tmp` keep their directory entry
//!   but lose their contents;
//! - every mtime is reset to a fixed epoch.
//!
//! Ownership, modes, link targets and extended attributes pass through.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, Entry, EntryType, Header};

use crate::process::{tool_failure, Feed};

/// Top-level directories removed with everything below them.
pub const DROPPED: &[&str] = &["etc"];

/// Top-level directories kept empty.
pub const EMPTIED: &[&str] = &["var", "dev", "proc", "sys", "run", "tmp"];

fn normal(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

fn keep(path: &Path) -> bool {
    let mut names = path.components().filter_map(|c| match c {
        Component::Normal(name) => Some(name),
        _ => None,
    });
    let Some(top) = names.next() else {
        return false;
    };
    let top = top.to_string_lossy();
    if DROPPED.contains(&top.as_ref()) {
        return false;
    }
    !(EMPTIED.contains(&top.as_ref()) && names.next().is_some())
}

type Xattrs = Vec<(String, Vec<u8>)>;

fn xattrs<R: Read>(entry: &mut Entry<'_, R>) -> Result<Xattrs> {
    let Some(pax) = entry.pax_extensions()? else {
        return Ok(Vec::new());
    };
    Ok(pax
        .filter_map(|ext| ext.ok())
        .filter_map(|ext| {
            let key = ext.key().ok()?;
            key.starts_with("SCHILY.xattr.")
                .then(|| (key.to_string(), ext.value_bytes().to_vec()))
        })
        .collect())
}

fn append_xattrs<W: Write>(builder: &mut Builder<W>, xattrs: &Xattrs, path: &Path) -> Result<()> {
    if xattrs.is_empty() {
        return Ok(());
    }
    builder
        .append_pax_extensions(xattrs.iter().map(|(k, v)| (k.as_str(), v.as_slice())))
        .with_context(|| format!("writing attributes of '{}'", path.display()))
}

/// A regular file removed from the stream, kept in case a hard link
/// elsewhere still refers to it.
struct DroppedFile {
    header: Header,
    xattrs: Xattrs,
    data: Vec<u8>,
}

/// Copy `input` to `output`, applying the rules above. Returns the number of
/// entries written.
///
/// A hard link whose target was dropped becomes a regular file carrying the
/// target's contents. Further links to the same target point at that file.
pub fn normalize<R: Read, W: Write>(input: R, output: W, mtime: u64) -> Result<usize> {
    let mut archive = Archive::new(input);
    let mut builder = Builder::new(output);
    let mut written = 0;
    // Dropped paths map to the first path their contents were seen under.
    let mut aliases: HashMap<PathBuf, PathBuf> = HashMap::new();
    let mut dropped: HashMap<PathBuf, DroppedFile> = HashMap::new();
    let mut relocated: HashMap<PathBuf, PathBuf> = HashMap::new();

    for entry in archive.entries().context("reading export stream")? {
        let mut entry = entry.context("reading export entry")?;
        let path = entry.path().context("decoding entry path")?.into_owned();
        let attrs = xattrs(&mut entry)?;
        let mut header = entry.header().clone();
        header.set_mtime(mtime);
        let kind = header.entry_type();
        let link_target = match kind {
            EntryType::Symlink | EntryType::Link => Some(
                entry
                    .link_name()
                    .context("decoding link target")?
                    .map(|t| t.into_owned())
                    .with_context(|| format!("link '{}' has no target", path.display()))?,
            ),
            _ => None,
        };

        if !keep(&path) {
            match (kind, &link_target) {
                (EntryType::Regular | EntryType::Continuous, _) => {
                    let mut data = Vec::new();
                    entry
                        .read_to_end(&mut data)
                        .with_context(|| format!("reading '{}'", path.display()))?;
                    let key = normal(&path);
                    aliases.insert(key.clone(), key.clone());
                    dropped.insert(key, DroppedFile { header, xattrs: attrs, data });
                }
                (EntryType::Link, Some(target)) => {
                    if let Some(canonical) = aliases.get(&normal(target)).cloned() {
                        aliases.insert(normal(&path), canonical);
                    }
                }
                _ => {}
            }
            continue;
        }

        match (kind, link_target) {
            (EntryType::Link, Some(target)) => {
                let key = aliases.get(&normal(&target)).cloned();
                if let Some(moved) = key.as_ref().and_then(|k| relocated.get(k)) {
                    builder
                        .append_link(&mut header, &path, moved)
                        .with_context(|| format!("writing link '{}'", path.display()))?;
                } else if let Some((key, mut file)) =
                    key.and_then(|k| dropped.remove(&k).map(|file| (k, file)))
                {
                    file.header.set_mtime(mtime);
                    file.header.set_entry_type(EntryType::Regular);
                    append_xattrs(&mut builder, &file.xattrs, &path)?;
                    builder
                        .append_data(&mut file.header, &path, file.data.as_slice())
                        .with_context(|| format!("writing '{}'", path.display()))?;
                    relocated.insert(key, path.clone());
                } else {
                    append_xattrs(&mut builder, &attrs, &path)?;
                    builder
                        .append_link(&mut header, &path, &target)
                        .with_context(|| format!("writing link '{}'", path.display()))?;
                }
            }
            (_, Some(target)) => {
                append_xattrs(&mut builder, &attrs, &path)?;
                builder
                    .append_link(&mut header, &path, &target)
                    .with_context(|| format!("writing link '{}'", path.display()))?;
            }
            (_, None) => {
                append_xattrs(&mut builder, &attrs, &path)?;
                builder
                    .append_data(&mut header, &path, &mut entry)
                    .with_context(|| format!("writing '{}'", path.display()))?;
            }
        }
        written += 1;
    }

    builder.finish().context("finishing normalized stream")?;
    Ok(written)
}

/// Stdin feed that normalizes `export` on the way into a child process.
pub fn normalizing_feed(export: Box<dyn Read + Send>, mtime: u64) -> Feed {
    Box::new(move |stdin: &mut dyn Write| {
        normalize(export, stdin, mtime)
            .map(|_| ())
            .map_err(|err| {
                if let Some(failed) = tool_failure(&*err) {
                    return io::Error::other(failed.clone());
                }
                match err.downcast::<io::Error>() {
                    Ok(io) => io,
                    Err(other) => io::Error::other(format!("{other:#}")),
                }
            })
    })
}
