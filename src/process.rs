//! Child process execution.
//!
//! Every external tool (podman, ostree, systemd-nspawn, grub-mkconfig) is run
//! through a [`Runner`]. Output is not buffered to completion: one reader
//! thread per stream forwards lines over a channel and the calling thread
//! hands each line to the caller's sinks as soon as it arrives, so long
//! builds can be watched live.
//!
//! Interrupts are not intercepted. A child shares the terminal's process
//! group, receives the same SIGINT and exits; its status is then reported
//! like any other failure (signal exits map to `128 + signal`).

use anyhow::{anyhow, Context, Result};
use std::error::Error as StdError;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;

use crate::error::Error;

/// Writes a child's stdin from a separate thread.
pub type Feed = Box<dyn FnOnce(&mut dyn Write) -> io::Result<()> + Send>;

/// A command line plus its environment. Consumed by [`Runner`] methods.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    cwd: Option<PathBuf>,
    feed: Option<Feed>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            cwd: None,
            feed: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Stream stdin from `feed` while the command runs.
    pub fn stdin(mut self, feed: Feed) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn get_envs(&self) -> &[(String, String)] {
        &self.envs
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn take_feed(&mut self) -> Option<Feed> {
        self.feed.take()
    }

    /// `program` followed by `args`.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Shell-quoted command line for diagnostics.
    pub fn command_line(&self) -> String {
        self.argv()
            .iter()
            .map(|part| quote(part))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl fmt::Debug for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cmd")
            .field("argv", &self.argv())
            .field("envs", &self.envs)
            .field("cwd", &self.cwd)
            .field("feed", &self.feed.is_some())
            .finish()
    }
}

fn quote(part: &str) -> String {
    let plain = !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if plain {
        part.to_string()
    } else {
        format!("'{}'", part.replace('\'', r"'\''"))
    }
}

/// Captured result of a command that was allowed to exit non-zero.
#[derive(Debug, Clone)]
pub struct Captured {
    pub code: i32,
    pub stdout: Vec<u8>,
}

/// Executes commands. [`System`] spawns real processes; tests substitute a
/// recording implementation.
pub trait Runner: Send + Sync {
    /// Run to completion, streaming output lines to the sinks.
    fn run_streamed(
        &self,
        cmd: Cmd,
        on_stdout: &mut dyn FnMut(&[u8]),
        on_stderr: &mut dyn FnMut(&[u8]),
    ) -> Result<()>;

    /// Run and capture stdout. Exit codes outside `allowed` are errors.
    fn capture(&self, cmd: Cmd, allowed: &[i32]) -> Result<Captured>;

    /// Start the command and return its stdout as a stream. Reading past the
    /// end reports a non-zero exit as an I/O error.
    fn spawn_reader(&self, cmd: Cmd) -> Result<Box<dyn Read + Send>>;

    /// Run with output forwarded to this process's stdout/stderr.
    fn run(&self, cmd: Cmd) -> Result<()> {
        self.run_streamed(cmd, &mut bytes_to_stdout, &mut bytes_to_stderr)
    }

    /// Run and return stdout; any non-zero exit is an error.
    fn output(&self, cmd: Cmd) -> Result<Vec<u8>> {
        Ok(self.capture(cmd, &[0])?.stdout)
    }
}

pub fn bytes_to_stdout(line: &[u8]) {
    let mut out = io::stdout().lock();
    let _ = out.write_all(line);
    let _ = out.flush();
}

pub fn bytes_to_stderr(line: &[u8]) {
    let mut err = io::stderr().lock();
    let _ = err.write_all(line);
    let _ = err.flush();
}

/// Spawns real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct System;

enum Line {
    Out(Vec<u8>),
    Err(Vec<u8>),
}

impl Runner for System {
    fn run_streamed(
        &self,
        mut cmd: Cmd,
        on_stdout: &mut dyn FnMut(&[u8]),
        on_stderr: &mut dyn FnMut(&[u8]),
    ) -> Result<()> {
        let command_line = cmd.command_line();
        tracing::debug!("running {command_line}");

        let feed = cmd.take_feed();
        let mut command = cmd.to_command();
        command
            .stdin(if feed.is_some() {
                Stdio::piped()
            } else {
                Stdio::inherit()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .with_context(|| format!("spawning {command_line}"))?;

        let feeder = match feed {
            Some(feed) => {
                let mut stdin = child.stdin.take().context("capturing child stdin")?;
                Some(thread::spawn(move || feed(&mut stdin)))
            }
            None => None,
        };

        let stdout = child.stdout.take().context("capturing child stdout")?;
        let stderr = child.stderr.take().context("capturing child stderr")?;
        let (tx, rx) = mpsc::channel();
        let tx_err = tx.clone();
        let out_reader = thread::spawn(move || forward_lines(stdout, |l| tx.send(Line::Out(l))));
        let err_reader =
            thread::spawn(move || forward_lines(stderr, |l| tx_err.send(Line::Err(l))));

        // Ends once both reader threads have dropped their senders.
        for line in rx {
            match line {
                Line::Out(bytes) => on_stdout(&bytes),
                Line::Err(bytes) => on_stderr(&bytes),
            }
        }
        let _ = out_reader.join();
        let _ = err_reader.join();

        let status = child
            .wait()
            .with_context(|| format!("waiting for {command_line}"))?;

        if let Some(feeder) = feeder {
            let fed = feeder
                .join()
                .map_err(|_| anyhow!("stdin feeder panicked for {command_line}"))?;
            // A broken pipe only means the child stopped reading; its exit
            // status below is the real verdict.
            if let Err(err) = fed {
                if let Some(failed) = tool_failure(&err) {
                    return Err(anyhow::Error::new(failed.clone()))
                        .with_context(|| format!("feeding stdin of {command_line}"));
                }
                if err.kind() != io::ErrorKind::BrokenPipe || status.success() {
                    return Err(err).with_context(|| format!("feeding stdin of {command_line}"));
                }
            }
        }

        check_status(status, command_line)
    }

    fn capture(&self, cmd: Cmd, allowed: &[i32]) -> Result<Captured> {
        let command_line = cmd.command_line();
        tracing::debug!("capturing {command_line}");
        let output = cmd
            .to_command()
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .with_context(|| format!("spawning {command_line}"))?;
        let code = exit_code(output.status);
        if !allowed.contains(&code) {
            return Err(Error::ExternalTool {
                command: command_line,
                code,
            }
            .into());
        }
        Ok(Captured {
            code,
            stdout: output.stdout,
        })
    }

    fn spawn_reader(&self, cmd: Cmd) -> Result<Box<dyn Read + Send>> {
        let command_line = cmd.command_line();
        tracing::debug!("streaming {command_line}");
        let mut child = cmd
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawning {command_line}"))?;
        let stdout = child.stdout.take().context("capturing child stdout")?;
        Ok(Box::new(ChildReader {
            child,
            stdout,
            command_line,
            finished: false,
        }))
    }
}

fn forward_lines<R, F, E>(stream: R, mut send: F)
where
    R: Read,
    F: FnMut(Vec<u8>) -> std::result::Result<(), E>,
{
    let mut reader = BufReader::new(stream);
    loop {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if send(line).is_err() {
                    break;
                }
            }
        }
    }
}

struct ChildReader {
    child: Child,
    stdout: ChildStdout,
    command_line: String,
    finished: bool,
}

impl Read for ChildReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.finished {
            return Ok(0);
        }
        let n = self.stdout.read(buf)?;
        if n == 0 {
            self.finished = true;
            let status = self.child.wait()?;
            if !status.success() {
                return Err(io::Error::other(Error::ExternalTool {
                    command: self.command_line.clone(),
                    code: exit_code(status),
                }));
            }
        }
        Ok(n)
    }
}

impl Drop for ChildReader {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// The [`Error`] carried by `err` or anything it wraps, including the
/// payload of an [`io::Error`] raised while streaming a child's output.
pub fn tool_failure<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a Error> {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(found) = err.downcast_ref::<Error>() {
            return Some(found);
        }
        current = match err.downcast_ref::<io::Error>().and_then(io::Error::get_ref) {
            Some(inner) => Some(inner as &(dyn StdError + 'static)),
            None => err.source(),
        };
    }
    None
}

fn check_status(status: ExitStatus, command: String) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    Err(Error::ExternalTool {
        command,
        code: exit_code(status),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_quotes_only_when_needed() {
        let cmd = Cmd::new("ostree")
            .arg("--repo=/ostree/repo")
            .arg("--keep-younger-than=1 second");
        assert_eq!(
            cmd.command_line(),
            "ostree --repo=/ostree/repo '--keep-younger-than=1 second'"
        );
    }

    #[test]
    fn streams_both_outputs_line_by_line() {
        let mut out = Vec::new();
        let mut err = Vec::new();
        System
            .run_streamed(
                Cmd::new("sh").args(["-c", "echo one; echo two >&2; echo three"]),
                &mut |l| out.push(String::from_utf8_lossy(l).to_string()),
                &mut |l| err.push(String::from_utf8_lossy(l).to_string()),
            )
            .unwrap();
        assert_eq!(out, vec!["one\n", "three\n"]);
        assert_eq!(err, vec!["two\n"]);
    }

    #[test]
    fn failure_keeps_exit_code_and_command() {
        let err = System
            .run_streamed(
                Cmd::new("sh").args(["-c", "exit 7"]),
                &mut |_| {},
                &mut |_| {},
            )
            .unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::ExternalTool { command, code }) => {
                assert_eq!(*code, 7);
                assert!(command.starts_with("sh -c"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn feed_is_written_to_stdin() {
        let mut out = Vec::new();
        System
            .run_streamed(
                Cmd::new("cat").stdin(Box::new(|w: &mut dyn Write| w.write_all(b"fed\n"))),
                &mut |l| out.extend_from_slice(l),
                &mut |_| {},
            )
            .unwrap();
        assert_eq!(out, b"fed\n");
    }

    #[test]
    fn capture_accepts_listed_codes() {
        let captured = System
            .capture(Cmd::new("sh").args(["-c", "echo hi; exit 2"]), &[0, 2])
            .unwrap();
        assert_eq!(captured.code, 2);
        assert_eq!(captured.stdout, b"hi\n");
        assert!(System
            .capture(Cmd::new("sh").args(["-c", "exit 2"]), &[0])
            .is_err());
    }

    #[test]
    fn spawn_reader_surfaces_failure_at_eof() {
        let mut reader = System
            .spawn_reader(Cmd::new("sh").args(["-c", "printf data; exit 4"]))
            .unwrap();
        let mut buf = Vec::new();
        let err = reader.read_to_end(&mut buf).unwrap_err();
        assert_eq!(buf, b"data");
        assert!(err.to_string().contains("exit code 4"));
        assert_eq!(tool_failure(&err).map(Error::exit_code), Some(4));
    }

    #[test]
    fn failed_upstream_of_feed_keeps_its_exit_code() {
        let err = System
            .run_streamed(
                Cmd::new("cat").stdin(Box::new(|_: &mut dyn Write| -> io::Result<()> {
                    Err(io::Error::other(Error::ExternalTool {
                        command: "podman export c0ffee".to_string(),
                        code: 9,
                    }))
                })),
                &mut |_| {},
                &mut |_| {},
            )
            .unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::ExternalTool { command, code }) => {
                assert_eq!(*code, 9);
                assert_eq!(command, "podman export c0ffee");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
