//! `podman`-backed [`ImageBackend`].

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::Read;
use std::sync::Mutex;

use super::{BuildRequest, ImageBackend, Labels};
use crate::process::{Cmd, Runner};

pub struct Podman<'r> {
    runner: &'r dyn Runner,
    /// Label lookups keyed by `(image, remote)`; cleared whenever a local
    /// image is created, retagged or removed.
    labels: Mutex<HashMap<(String, bool), Labels>>,
}

impl<'r> Podman<'r> {
    pub fn new(runner: &'r dyn Runner) -> Self {
        Self {
            runner,
            labels: Mutex::new(HashMap::new()),
        }
    }

    fn podman(&self) -> Cmd {
        Cmd::new("podman")
    }

    fn invalidate(&self) {
        if let Ok(mut cache) = self.labels.lock() {
            cache.clear();
        }
    }
}

/// Parse a label map out of `podman image inspect` or `skopeo inspect`
/// output. A `null` label set is an empty map.
fn parse_labels(raw: &[u8], image: &str) -> Result<Labels> {
    let value: serde_json::Value = serde_json::from_slice(raw)
        .with_context(|| format!("parsing inspect output for '{image}'"))?;
    let labels = match value.get("Labels") {
        Some(inner) => inner.clone(),
        None => value,
    };
    if labels.is_null() {
        return Ok(Labels::new());
    }
    serde_json::from_value(labels).with_context(|| format!("decoding labels of '{image}'"))
}

impl ImageBackend for Podman<'_> {
    fn exists(&self, image: &str, remote: bool) -> Result<bool> {
        let cmd = if remote {
            Cmd::new("skopeo")
                .args(["inspect", "--no-tags"])
                .arg(format!("docker://{image}"))
        } else {
            self.podman().args(["image", "exists", image])
        };
        let captured = self.runner.capture(cmd, &[0, 1, 2])?;
        Ok(captured.code == 0)
    }

    fn labels(&self, image: &str, remote: bool) -> Result<Labels> {
        let key = (image.to_string(), remote);
        if let Some(hit) = self.labels.lock().ok().and_then(|c| c.get(&key).cloned()) {
            return Ok(hit);
        }

        let raw = if remote {
            self.runner.output(
                Cmd::new("skopeo")
                    .args(["inspect", "--no-tags"])
                    .arg(format!("docker://{image}")),
            )?
        } else {
            self.runner.output(
                self.podman()
                    .args(["image", "inspect", "--format={{json .Labels}}", image]),
            )?
        };
        let labels = parse_labels(&raw, image)?;
        if let Ok(mut cache) = self.labels.lock() {
            cache.insert(key, labels.clone());
        }
        Ok(labels)
    }

    fn pull(&self, image: &str) -> Result<()> {
        self.runner.run(self.podman().args(["pull", image]))?;
        self.invalidate();
        Ok(())
    }

    fn build(&self, request: &BuildRequest) -> Result<()> {
        let mut cmd = self
            .podman()
            .arg("build")
            .arg(format!("--tag={}", request.tag))
            .args(request.build_args.to_flags());
        if !request.use_cache {
            cmd = cmd.arg("--no-cache");
        }
        cmd = cmd.args(["--force-rm", "--pull=never"]).args(
            request
                .volumes
                .iter()
                .map(|volume| format!("--volume={volume}")),
        );
        cmd = cmd
            .arg(format!("--file={}", request.file.display()))
            .arg("--format=oci")
            .arg(format!("--timestamp={}", request.timestamp))
            .arg(".")
            .current_dir(&request.context);

        let result = self.runner.run(cmd);
        self.invalidate();
        result
    }

    fn tag(&self, source: &str, target: &str) -> Result<()> {
        self.runner.run(self.podman().args(["tag", source, target]))?;
        self.invalidate();
        Ok(())
    }

    fn remove(&self, image: &str) -> Result<()> {
        self.runner.run(self.podman().args(["rmi", image]))?;
        self.invalidate();
        Ok(())
    }

    fn push(&self, image: &str) -> Result<()> {
        self.runner.run(self.podman().args([
            "push",
            "--retry=5",
            "--compression-format=zstd:chunked",
            image,
        ]))
    }

    fn run_output(&self, image: &str, entrypoint: &str, args: &[&str]) -> Result<String> {
        let cmd = self
            .podman()
            .args(["run", "--rm"])
            .arg(format!("--entrypoint={entrypoint}"))
            .arg(image)
            .args(args.iter().copied());
        let raw = self.runner.output(cmd)?;
        Ok(String::from_utf8_lossy(&raw).trim().to_string())
    }

    fn prune(&self) -> Result<()> {
        self.runner
            .run(self.podman().args(["system", "prune", "-f", "--build"]))
    }

    fn create_container(&self, image: &str) -> Result<String> {
        let raw = self.runner.output(self.podman().args(["create", image]))?;
        let id = String::from_utf8_lossy(&raw).trim().to_string();
        if id.is_empty() {
            anyhow::bail!("podman create returned no container id for '{image}'");
        }
        Ok(id)
    }

    fn export_container(&self, container: &str) -> Result<Box<dyn Read + Send>> {
        self.runner
            .spawn_reader(self.podman().args(["export", container]))
    }

    fn remove_container(&self, container: &str) -> Result<()> {
        self.runner
            .run(self.podman().args(["rm", "--force", container]))
    }
}
