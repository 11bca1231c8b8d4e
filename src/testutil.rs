//! Fakes shared by unit tests.

use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::io::{self, Cursor, Read};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::Error;
use crate::image::{BuildRequest, ImageBackend, Labels};
use crate::process::{tool_failure, Captured, Cmd, Runner};
use crate::system::SystemProbe;
use crate::upgrade::check::context_hash;

/// One command seen by [`RecordingRunner`].
#[derive(Debug, Clone)]
pub struct Recorded {
    pub argv: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub stdin: Vec<u8>,
}

impl Recorded {
    pub fn line(&self) -> String {
        self.argv.join(" ")
    }
}

/// Scripted outcome of a command.
#[derive(Debug, Clone)]
pub struct Reply {
    pub code: i32,
    pub stdout: Vec<u8>,
}

impl Reply {
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
        }
    }

    pub fn code(code: i32) -> Self {
        Self {
            code,
            stdout: Vec::new(),
        }
    }
}

type Responder = Box<dyn Fn(&[String]) -> Reply + Send + Sync>;

/// Records every command instead of running it.
pub struct RecordingRunner {
    calls: Mutex<Vec<Recorded>>,
    responder: Responder,
}

impl RecordingRunner {
    /// Every command succeeds with empty output.
    pub fn new() -> Self {
        Self::with(|_| Reply::ok(""))
    }

    pub fn with(responder: impl Fn(&[String]) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        }
    }

    pub fn calls(&self) -> Vec<Recorded> {
        self.calls.lock().unwrap().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(Recorded::line).collect()
    }

    /// Like [`crate::process::System`], a failed feed wins over the reply.
    fn record(&self, mut cmd: Cmd) -> Result<Reply> {
        let mut stdin = Vec::new();
        let fed = match cmd.take_feed() {
            Some(feed) => feed(&mut stdin),
            None => Ok(()),
        };
        let argv = cmd.argv();
        let reply = (self.responder)(&argv);
        self.calls.lock().unwrap().push(Recorded {
            argv,
            envs: cmd.get_envs().to_vec(),
            cwd: cmd.get_current_dir().map(PathBuf::from),
            stdin,
        });
        if let Err(err) = fed {
            return Err(match tool_failure(&err) {
                Some(failed) => failed.clone().into(),
                None => err.into(),
            });
        }
        Ok(reply)
    }
}

fn failure(argv_line: String, code: i32) -> anyhow::Error {
    Error::ExternalTool {
        command: argv_line,
        code,
    }
    .into()
}

impl Runner for RecordingRunner {
    fn run_streamed(
        &self,
        cmd: Cmd,
        on_stdout: &mut dyn FnMut(&[u8]),
        _on_stderr: &mut dyn FnMut(&[u8]),
    ) -> Result<()> {
        let line = cmd.command_line();
        let reply = self.record(cmd)?;
        if !reply.stdout.is_empty() {
            on_stdout(&reply.stdout);
        }
        if reply.code != 0 {
            return Err(failure(line, reply.code));
        }
        Ok(())
    }

    fn capture(&self, cmd: Cmd, allowed: &[i32]) -> Result<Captured> {
        let line = cmd.command_line();
        let reply = self.record(cmd)?;
        if !allowed.contains(&reply.code) {
            return Err(failure(line, reply.code));
        }
        Ok(Captured {
            code: reply.code,
            stdout: reply.stdout,
        })
    }

    fn spawn_reader(&self, cmd: Cmd) -> Result<Box<dyn Read + Send>> {
        let line = cmd.command_line();
        let reply = self.record(cmd)?;
        if reply.code != 0 {
            return Err(failure(line, reply.code));
        }
        Ok(Box::new(Cursor::new(reply.stdout)))
    }
}

/// In-memory image store.
#[derive(Default)]
pub struct FakeBackend {
    pub local: Mutex<BTreeMap<String, Labels>>,
    pub remote: Mutex<BTreeMap<String, Labels>>,
    pub builds: Mutex<Vec<BuildRequest>>,
    pub ops: Mutex<Vec<String>>,
    /// Output of every `run_output` call.
    pub run_stdout: String,
    /// Archive streamed by `export_container`.
    pub export: Vec<u8>,
    /// Operation name (`build`, `push`, ...) that fails with exit code 125.
    pub fail_on: Option<&'static str>,
    /// Exit code of an export that dies while its stream is being read.
    pub export_exit: Option<i32>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local(self, image: &str, labels: &[(&str, &str)]) -> Self {
        self.local.lock().unwrap().insert(image.to_string(), to_labels(labels));
        self
    }

    pub fn with_remote(self, image: &str, labels: &[(&str, &str)]) -> Self {
        self.remote.lock().unwrap().insert(image.to_string(), to_labels(labels));
        self
    }

    pub fn set_local_label(&self, image: &str, key: &str, value: &str) {
        self.local
            .lock()
            .unwrap()
            .entry(image.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn builds(&self) -> Vec<BuildRequest> {
        self.builds.lock().unwrap().clone()
    }

    fn op(&self, name: &'static str, detail: &str) -> Result<()> {
        self.ops.lock().unwrap().push(format!("{name} {detail}"));
        if self.fail_on == Some(name) {
            return Err(failure(format!("podman {name} {detail}"), 125));
        }
        Ok(())
    }
}

pub fn to_labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl ImageBackend for FakeBackend {
    fn exists(&self, image: &str, remote: bool) -> Result<bool> {
        let store = if remote { &self.remote } else { &self.local };
        Ok(store.lock().unwrap().contains_key(image))
    }

    fn labels(&self, image: &str, remote: bool) -> Result<Labels> {
        let store = if remote { &self.remote } else { &self.local };
        match store.lock().unwrap().get(image) {
            Some(labels) => Ok(labels.clone()),
            None => bail!("no such image '{image}'"),
        }
    }

    fn pull(&self, image: &str) -> Result<()> {
        self.op("pull", image)?;
        let labels = self.remote.lock().unwrap().get(image).cloned();
        match labels {
            Some(labels) => {
                self.local.lock().unwrap().insert(image.to_string(), labels);
                Ok(())
            }
            None => Err(failure(format!("podman pull {image}"), 125)),
        }
    }

    fn build(&self, request: &BuildRequest) -> Result<()> {
        self.op("build", &request.tag)?;
        self.builds.lock().unwrap().push(request.clone());
        let labels: Labels = request
            .build_args
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.local
            .lock()
            .unwrap()
            .insert(request.tag.clone(), labels);
        Ok(())
    }

    fn tag(&self, source: &str, target: &str) -> Result<()> {
        self.op("tag", &format!("{source} {target}"))?;
        let mut local = self.local.lock().unwrap();
        let labels = local.get(source).cloned().unwrap_or_default();
        local.insert(target.to_string(), labels);
        Ok(())
    }

    fn remove(&self, image: &str) -> Result<()> {
        self.op("rmi", image)?;
        self.local.lock().unwrap().remove(image);
        Ok(())
    }

    fn push(&self, image: &str) -> Result<()> {
        self.op("push", image)
    }

    fn run_output(&self, image: &str, entrypoint: &str, args: &[&str]) -> Result<String> {
        self.op("run", &format!("{image} {entrypoint} {}", args.join(" ")))?;
        Ok(self.run_stdout.clone())
    }

    fn prune(&self) -> Result<()> {
        self.op("prune", "")
    }

    fn create_container(&self, image: &str) -> Result<String> {
        self.op("create", image)?;
        Ok("c0ffee".to_string())
    }

    fn export_container(&self, container: &str) -> Result<Box<dyn Read + Send>> {
        self.op("export", container)?;
        if let Some(code) = self.export_exit {
            return Ok(Box::new(FailedStream {
                command: format!("podman export {container}"),
                code,
            }));
        }
        Ok(Box::new(Cursor::new(self.export.clone())))
    }

    fn remove_container(&self, container: &str) -> Result<()> {
        self.op("rm", container)
    }
}

/// A child's stdout whose process exits non-zero before writing anything.
struct FailedStream {
    command: String,
    code: i32,
}

impl Read for FailedStream {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::other(Error::ExternalTool {
            command: self.command.clone(),
            code: self.code,
        }))
    }
}

/// Host facts held in memory.
pub struct FakeProbe {
    pub systemfile: String,
    pub commandline: String,
    pub os_release: BTreeMap<String, String>,
    pub packages: String,
    pub pending: Mutex<String>,
    pub recorded: Mutex<Option<String>>,
}

impl FakeProbe {
    pub fn new(
        systemfile: &str,
        commandline: &str,
        version: &str,
        version_id: &str,
        packages: &str,
    ) -> Self {
        Self {
            systemfile: systemfile.to_string(),
            commandline: commandline.to_string(),
            os_release: to_labels(&[("VERSION", version), ("VERSION_ID", version_id)]),
            packages: packages.to_string(),
            pending: Mutex::new(String::new()),
            recorded: Mutex::new(None),
        }
    }

    pub fn set_pending(&self, pending: &str) {
        *self.pending.lock().unwrap() = pending.to_string();
    }

    pub fn record(&self, hash: &str) {
        *self.recorded.lock().unwrap() = Some(hash.to_string());
    }

    /// Record the fingerprint of the current Systemfile and command line.
    pub fn record_current(&self) {
        self.record(&context_hash(self.systemfile.as_bytes(), &self.commandline));
    }

    pub fn recorded(&self) -> Option<String> {
        self.recorded.lock().unwrap().clone()
    }
}

impl SystemProbe for FakeProbe {
    fn kernel_commandline(&self) -> Result<String> {
        Ok(self.commandline.clone())
    }

    fn systemfile(&self) -> Result<Vec<u8>> {
        Ok(self.systemfile.clone().into_bytes())
    }

    fn os_release(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.os_release.clone())
    }

    fn installed_packages(&self) -> Result<String> {
        Ok(self.packages.clone())
    }

    fn pending_updates(&self) -> Result<String> {
        Ok(self.pending.lock().unwrap().clone())
    }

    fn recorded_context_hash(&self) -> Result<Option<String>> {
        Ok(self.recorded())
    }

    fn record_context_hash(&self, hash: &str) -> Result<()> {
        self.record(hash);
        Ok(())
    }
}
