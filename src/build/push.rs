//! Publish a built variant.

use anyhow::{anyhow, Result};

use crate::image::{os_release_label, ImageBackend};
use crate::settings::Settings;

/// Extra tags derived from the image's os-release labels.
pub fn version_tags(tag: &str, version: Option<&str>, version_id: Option<&str>) -> Vec<String> {
    let Some(version) = version.filter(|v| !v.is_empty()) else {
        return Vec::new();
    };
    let mut tags = Vec::new();
    if let Some(id) = version_id.filter(|id| !id.is_empty() && *id != version) {
        tags.push(format!("{tag}_{version}.{id}"));
    }
    tags.push(format!("{tag}_{version}"));
    tags
}

/// Push `<repo>:<tag>` together with its version tags.
///
/// The version tags are temporary: they are removed locally once every push
/// has finished. Removal failures are collected and reported together.
pub fn push(settings: &Settings, images: &dyn ImageBackend, tag: &str) -> Result<()> {
    let image = settings.image(tag);
    let labels = images.labels(&image, false)?;
    let extra = version_tags(
        tag,
        labels.get(&os_release_label("VERSION")).map(String::as_str),
        labels.get(&os_release_label("VERSION_ID")).map(String::as_str),
    );

    for extra_tag in &extra {
        images.tag(&image, &settings.image(extra_tag))?;
    }
    for target in extra.iter().map(|t| settings.image(t)).chain([image.clone()]) {
        images.push(&target)?;
        println!("Pushed {target}");
    }

    let failures: Vec<String> = extra
        .iter()
        .map(|t| settings.image(t))
        .filter_map(|target| images.remove(&target).err().map(|e| format!("{target}: {e:#}")))
        .collect();
    if !failures.is_empty() {
        return Err(anyhow!("failed to remove tags:\n  {}", failures.join("\n  ")));
    }
    Ok(())
}
