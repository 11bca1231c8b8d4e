//! Content-addressed tree store adapter (`ostree`).
//!
//! Branches live under `<os_name>/<branch>`. Every operation here is a thin
//! wrapper over one or more `ostree` invocations; a non-zero exit from any of
//! them aborts the operation.
//!
//! - [`export`] - Container export normalizer feeding [`TreeStore::commit_stream`]

pub mod export;

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

use crate::deployment::Registry;
use crate::image::ImageBackend;
use crate::process::{Cmd, Feed, Runner};
use crate::settings::Settings;

/// In-tree file whose tokens are appended to the kernel arguments on deploy.
pub const COMMANDLINE_PATH: &str = "/usr/etc/system/commandline";

/// Kernel arguments every deployment gets.
pub const BASE_KARGS: &[&str] = &["root=LABEL=SYS_ROOT", "rw"];

/// `YYYY-MM-DD-HH-MM-SS` of the current UTC time, used as commit subject.
pub fn commit_subject() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}-{:02}-{:02}-{:02}-{:02}-{:02}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

/// Skip list written for one commit, removed when dropped.
struct SkipList {
    path: PathBuf,
}

impl SkipList {
    fn write(dir: &Path, entries: &[String]) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("creating '{}'", dir.display()))?;
        let path = dir.join("skiplist");
        fs::write(&path, entries.join("\n"))
            .with_context(|| format!("writing skip list '{}'", path.display()))?;
        Ok(Self { path })
    }
}

impl Drop for SkipList {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub struct TreeStore<'a> {
    settings: &'a Settings,
    runner: &'a dyn Runner,
    repo: PathBuf,
}

impl<'a> TreeStore<'a> {
    pub fn new(settings: &'a Settings, runner: &'a dyn Runner) -> Self {
        Self {
            settings,
            runner,
            repo: settings.ostree_repo.clone(),
        }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    /// Point every following repo operation at another repository.
    pub fn set_repo(&mut self, repo: impl Into<PathBuf>) {
        self.repo = repo.into();
    }

    fn ostree(&self) -> Cmd {
        Cmd::new("ostree").arg(format!("--repo={}", self.repo.display()))
    }

    /// Initialise the repository unless it already exists.
    pub fn ensure_repo(&self) -> Result<()> {
        if self.repo.join("config").is_file() {
            return Ok(());
        }
        tracing::info!("initialising tree store at {}", self.repo.display());
        self.runner.run(self.ostree().arg("init"))
    }

    fn commit_cmd(&self, branch: &str) -> Cmd {
        self.ostree()
            .args([
                "commit",
                "--generate-composefs-metadata",
                "--generate-sizes",
            ])
            .arg(format!("--branch={}", self.settings.branch_ref(branch)))
            .arg(format!("--subject={}", commit_subject()))
    }

    /// Commit the directory `rootfs` to `branch`.
    ///
    /// `/etc` and every entry of `<rootfs>/var` are skipped in addition to
    /// `extra_excludes`.
    pub fn commit(&self, branch: &str, rootfs: &Path, extra_excludes: &[String]) -> Result<()> {
        let mut skip: Vec<String> = extra_excludes.to_vec();
        skip.push("/etc".to_string());
        let var = rootfs.join("var");
        if var.is_dir() {
            let mut names = Vec::new();
            for entry in fs::read_dir(&var).with_context(|| format!("reading '{}'", var.display()))? {
                let entry = entry.with_context(|| format!("iterating '{}'", var.display()))?;
                names.push(format!("/var/{}", entry.file_name().to_string_lossy()));
            }
            names.sort();
            skip.extend(names);
        }

        let skip_list = SkipList::write(&self.settings.system_path, &skip)?;
        let cmd = self
            .commit_cmd(branch)
            .arg(format!("--tree=dir={}", rootfs.display()))
            .arg(format!("--skip-list={}", skip_list.path.display()));
        self.runner.run(cmd)
    }

    /// Commit a tar stream, fed to ostree's stdin, to `branch`.
    pub fn commit_stream(&self, branch: &str, feed: Feed) -> Result<()> {
        let cmd = self
            .commit_cmd(branch)
            .args([
                "--tree=tar=-",
                "--tar-pathname-filter=^,./",
                "--tar-autocreate-parents",
            ])
            .env("SOURCE_DATE_EPOCH", "0")
            .stdin(feed);
        self.runner.run(cmd)
    }

    /// Kernel arguments for deploying `revision`.
    fn kargs(&self, revision: &str) -> Result<Vec<String>> {
        let mut kargs: Vec<String> = BASE_KARGS.iter().map(|k| k.to_string()).collect();
        let dir = Path::new(COMMANDLINE_PATH)
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        let listing = self
            .runner
            .capture(self.ostree().args(["ls", revision, dir.as_str()]), &[0, 1])?;
        if listing.code != 0 || !String::from_utf8_lossy(&listing.stdout).contains(COMMANDLINE_PATH) {
            return Ok(kargs);
        }

        let raw = self
            .runner
            .output(self.ostree().args(["cat", revision, COMMANDLINE_PATH]))?;
        kargs.extend(
            String::from_utf8_lossy(&raw)
                .split_whitespace()
                .map(str::to_string),
        );
        Ok(kargs)
    }

    /// Deploy the head of `branch` into `sysroot`.
    ///
    /// The stateroot is the OS name when a stateroot of that name exists,
    /// otherwise the booted deployment's.
    pub fn deploy(&self, branch: &str, sysroot: &Path, registry: &Registry) -> Result<()> {
        let revision = self.settings.branch_ref(branch);
        let kargs = self.kargs(&revision)?;

        let os = &self.settings.os_name;
        let stateroot = if sysroot.join("ostree/deploy").join(os).exists() {
            os.clone()
        } else {
            registry
                .current_deployment()
                .context("choosing a stateroot")?
                .stateroot
        };

        let cmd = Cmd::new("ostree")
            .args(["admin", "deploy"])
            .arg(format!("--sysroot={}", sysroot.display()))
            .args(kargs.iter().map(|k| format!("--karg={k}")))
            .arg(format!("--os={os}"))
            .arg(format!("--stateroot={stateroot}"))
            .arg("--retain")
            .arg(revision);
        self.runner.run(cmd)
    }

    /// Keep the newest commits of `branch`, then collect garbage in the
    /// sysroot and the image store.
    pub fn prune(&self, branch: &str, images: &dyn ImageBackend) -> Result<()> {
        let branch_ref = self.settings.branch_ref(branch);
        self.runner.run(
            self.ostree()
                .args(["prune", "--commit-only"])
                .arg(format!(
                    "--retain-branch-depth={}={}",
                    branch_ref, self.settings.retain_depth
                ))
                .arg(format!("--only-branch={branch_ref}"))
                .arg("--keep-younger-than=1 second"),
        )?;
        self.runner
            .run(Cmd::new("ostree").args(["admin", "cleanup"]))?;
        images.prune()
    }

    pub fn undeploy(&self, index: usize) -> Result<()> {
        self.runner.run(
            Cmd::new("ostree")
                .args(["admin", "undeploy"])
                .arg(format!("--sysroot={}", self.settings.sysroot.display()))
                .arg(index.to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::tests::{status_json, FixedStatus};
    use crate::testutil::{FakeBackend, RecordingRunner, Reply};
    use std::io::Write;
    use tempfile::TempDir;

    fn settings(tmp: &TempDir) -> Settings {
        Settings {
            system_path: tmp.path().join("system"),
            sysroot: tmp.path().to_path_buf(),
            ..Settings::default()
        }
    }

    #[test]
    fn commit_skips_etc_and_var_entries() {
        let tmp = TempDir::new().unwrap();
        let settings = settings(&tmp);
        let rootfs = tmp.path().join("rootfs");
        fs::create_dir_all(rootfs.join("var/cache")).unwrap();
        fs::create_dir_all(rootfs.join("var/lib")).unwrap();

        let skip_path = settings.system_path.join("skiplist");
        let captured_path = skip_path.clone();
        let runner = RecordingRunner::with(move |argv| {
            if argv.iter().any(|a| a.starts_with("--skip-list=")) {
                let content = fs::read_to_string(&captured_path).unwrap();
                assert_eq!(content, "/boot\n/etc\n/var/cache\n/var/lib");
            }
            Reply::ok("")
        });
        let store = TreeStore::new(&settings, &runner);
        store.commit("system", &rootfs, &["/boot".to_string()]).unwrap();

        let argv = &runner.calls()[0].argv;
        assert_eq!(argv[1], "--repo=/ostree/repo");
        assert!(argv.contains(&"--branch=atomic/system".to_string()));
        assert!(argv.contains(&format!("--tree=dir={}", rootfs.display())));
        assert!(argv.contains(&"--generate-composefs-metadata".to_string()));
        assert!(!skip_path.exists());
    }

    #[test]
    fn skip_list_is_removed_on_failure() {
        let tmp = TempDir::new().unwrap();
        let settings = settings(&tmp);
        let rootfs = tmp.path().join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();
        let runner = RecordingRunner::with(|_| Reply::code(1));
        let store = TreeStore::new(&settings, &runner);
        assert!(store.commit("system", &rootfs, &[]).is_err());
        assert!(!settings.system_path.join("skiplist").exists());
    }

    #[test]
    fn stream_commit_feeds_stdin_with_fixed_epoch() {
        let tmp = TempDir::new().unwrap();
        let settings = settings(&tmp);
        let runner = RecordingRunner::new();
        let store = TreeStore::new(&settings, &runner);
        store
            .commit_stream(
                "system",
                Box::new(|w: &mut dyn Write| w.write_all(b"tar bytes")),
            )
            .unwrap();
        let call = &runner.calls()[0];
        assert_eq!(call.stdin, b"tar bytes");
        assert!(call.envs.contains(&("SOURCE_DATE_EPOCH".to_string(), "0".to_string())));
        assert!(call.argv.contains(&"--tar-pathname-filter=^,./".to_string()));
    }

    #[test]
    fn deploy_appends_in_tree_kargs_and_uses_booted_stateroot() {
        let tmp = TempDir::new().unwrap();
        let settings = settings(&tmp);
        let runner = RecordingRunner::with(|argv| match argv.get(2).map(String::as_str) {
            Some("ls") => Reply::ok("-00644 0 0 12 /usr/etc/system/commandline\n"),
            Some("cat") => Reply::ok("quiet  splash\n"),
            _ => Reply::ok(""),
        });
        let store = TreeStore::new(&settings, &runner);
        let status = FixedStatus(
            status_json(&[true]).replace("\"stateroot\":\"atomic\"", "\"stateroot\":\"legacy\""),
        );
        let registry = Registry::new(&status, tmp.path());
        store.deploy("system", tmp.path(), &registry).unwrap();

        let lines = runner.command_lines();
        assert_eq!(
            lines.last().unwrap(),
            &format!(
                "ostree admin deploy --sysroot={} --karg=root=LABEL=SYS_ROOT --karg=rw \
                 --karg=quiet --karg=splash --os=atomic --stateroot=legacy --retain atomic/system",
                tmp.path().display()
            )
        );
    }

    #[test]
    fn deploy_prefers_os_stateroot_and_tolerates_missing_commandline() {
        let tmp = TempDir::new().unwrap();
        let settings = settings(&tmp);
        fs::create_dir_all(tmp.path().join("ostree/deploy/atomic")).unwrap();
        let runner = RecordingRunner::with(|argv| match argv.get(2).map(String::as_str) {
            Some("ls") => Reply::code(1),
            _ => Reply::ok(""),
        });
        let store = TreeStore::new(&settings, &runner);
        let status = FixedStatus(status_json(&[]));
        store
            .deploy("system", tmp.path(), &Registry::new(&status, tmp.path()))
            .unwrap();
        let last = runner.command_lines().pop().unwrap();
        assert!(last.contains("--karg=rw --os=atomic --stateroot=atomic"));
    }

    #[test]
    fn prune_retains_depth_then_collects_garbage() {
        let tmp = TempDir::new().unwrap();
        let settings = settings(&tmp);
        let runner = RecordingRunner::new();
        let images = FakeBackend::new();
        TreeStore::new(&settings, &runner).prune("system", &images).unwrap();
        assert_eq!(
            runner.command_lines(),
            vec![
                "ostree --repo=/ostree/repo prune --commit-only \
                 --retain-branch-depth=atomic/system=5 --only-branch=atomic/system \
                 --keep-younger-than=1 second",
                "ostree admin cleanup",
            ]
        );
        assert_eq!(images.ops(), vec!["prune "]);
    }

    #[test]
    fn undeploy_by_index() {
        let settings = Settings::default();
        let runner = RecordingRunner::new();
        TreeStore::new(&settings, &runner).undeploy(2).unwrap();
        assert_eq!(runner.command_lines(), vec!["ostree admin undeploy --sysroot=/ 2"]);
    }

    #[test]
    fn set_repo_redirects_repo_commands() {
        let tmp = TempDir::new().unwrap();
        let settings = settings(&tmp);
        let runner = RecordingRunner::new();
        let mut store = TreeStore::new(&settings, &runner);
        store.set_repo(tmp.path().join("repo"));
        store.ensure_repo().unwrap();
        assert_eq!(
            runner.command_lines(),
            vec![format!("ostree --repo={}/repo init", tmp.path().display())]
        );
    }

    #[test]
    fn subject_is_timestamp() {
        let subject = commit_subject();
        assert_eq!(subject.len(), 19);
        assert_eq!(subject.matches('-').count(), 5);
    }
}
