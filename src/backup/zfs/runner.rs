use crate::backup::finish::{check_output, wait_child, Finish, StderrDrain};
use crate::backup::function_path;
use crate::backup::naming::snapshot_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithDebugObjectAndFnName;
use crate::backup::zfs::{DatasetKind, SnapshotSink, SnapshotStream, Zfs};
use bon::Builder;
use function_name::named;
use getset::Getters;
use itertools::Itertools;
use std::borrow::Cow;
use std::fmt::{Display, Formatter};
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;

static ZFS_BIN: &str = "zfs";
static SSH_BIN: &str = "ssh";
pub static DEFAULT_SSH_PORT: u16 = 22;

/// Credentials for running `zfs` on another machine over ssh key auth.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Builder, Getters)]
#[getset(get = "pub")]
pub struct RemoteAuth {
    #[builder(into)]
    host: Arc<str>,
    #[builder(default = DEFAULT_SSH_PORT)]
    port: u16,
    #[builder(into)]
    user: Arc<str>,
    #[builder(into)]
    key: Arc<Path>,
}

impl RemoteAuth {
    /// Splits `host[:port]`, falling back to port 22.
    pub fn split_host(host: &str) -> Option<(&str, u16)> {
        match host.rsplit_once(':') {
            Some((name, port)) if !name.is_empty() => port.parse().ok().map(|p| (name, p)),
            Some(_) => None,
            None if host.is_empty() => None,
            None => Some((host, DEFAULT_SSH_PORT)),
        }
    }
}

impl Display for RemoteAuth {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Where `zfs` commands are executed.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Runner {
    Local,
    Remote(RemoteAuth),
}

impl Runner {
    fn command(&self, args: &[&str]) -> Command {
        match self {
            Runner::Local => {
                let mut command = Command::new(ZFS_BIN);
                command.args(args);
                command
            }
            Runner::Remote(auth) => {
                let mut command = Command::new(SSH_BIN);
                command
                    .args(["-o", "BatchMode=yes", "-i"])
                    .arg(&*auth.key)
                    .arg("-p")
                    .arg(auth.port.to_string())
                    .arg("-l")
                    .arg(&*auth.user)
                    .arg(&*auth.host)
                    .arg("--")
                    .arg(remote_command_line(args));
                command
            }
        }
    }

    /// Human readable command line, used in logs and errors.
    fn describe(&self, args: &[&str]) -> String {
        let line = std::iter::once(ZFS_BIN).chain(args.iter().copied()).join(" ");
        match self {
            Runner::Local => line,
            Runner::Remote(auth) => format!("[{auth}] {line}"),
        }
    }
}

fn remote_command_line(args: &[&str]) -> String {
    std::iter::once(ZFS_BIN)
        .chain(args.iter().copied())
        .map(|arg| shell_escape::unix::escape(Cow::Borrowed(arg)))
        .join(" ")
}

/// [`Zfs`] backed by the `zfs` command line tool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZfsRunner {
    runner: Runner,
}

impl ZfsRunner {
    pub fn new(runner: Runner) -> Self {
        Self { runner }
    }

    pub fn local() -> Self {
        Self::new(Runner::Local)
    }

    #[named]
    fn spawn(&self, args: &[&str], stdin: Stdio, stdout: Stdio) -> Result<Child> {
        tracing::debug!("Spawning {}", self.runner.describe(args));
        self.runner
            .command(args)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .spawn()
            .map_err(Error::from)
            .with_debug_object_and_fn_name(self.runner.clone(), function_path!())
    }

    fn run(&self, args: &[&str]) -> Result<Vec<String>> {
        let output = self
            .spawn(args, Stdio::null(), Stdio::piped())?
            .wait_with_output()?;
        let output = check_output(self.runner.describe(args), output)?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }
}

impl Zfs for ZfsRunner {
    fn list(&self, pattern: &str, kind: DatasetKind, recursive: bool) -> Result<Vec<String>> {
        let kind = kind.to_string();
        let mut args = vec!["list", "-H", "-t", kind.as_str(), "-o", "name"];
        if pattern.contains('*') {
            args.push("-r");
            let needle = pattern.trim_matches('*');
            return Ok(self
                .run(&args)?
                .into_iter()
                .filter(|name| name.contains(needle))
                .collect());
        }
        if recursive {
            args.push("-r");
        }
        if !pattern.is_empty() {
            args.push(pattern);
        }
        self.run(&args)
    }

    fn create_snapshot(&self, dataset: &str, name: &str) -> Result<()> {
        self.run(&["snapshot", &snapshot_path(dataset, name)])
            .map(|_| ())
    }

    fn destroy(&self, target: &str) -> Result<()> {
        self.run(&["destroy", "-r", target]).map(|_| ())
    }

    fn rename(&self, old: &str, new: &str) -> Result<()> {
        self.run(&["rename", old, new]).map(|_| ())
    }

    fn exists_snapshot(&self, dataset: &str, name: &str) -> Result<bool> {
        let snapshot = snapshot_path(dataset, name);
        match self.run(&["list", "-H", "-t", "snapshot", "-o", "name", &snapshot]) {
            Ok(names) => Ok(names.iter().any(|n| n == &snapshot)),
            Err(e) if e.is_missing_dataset() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn send_snapshot(
        &self,
        dataset: &str,
        base: &str,
        head: Option<&str>,
    ) -> Result<Box<dyn SnapshotStream>> {
        let base = snapshot_path(dataset, base);
        let args = match head {
            None => vec!["send".to_string(), base],
            Some(head) => vec![
                "send".to_string(),
                "-i".to_string(),
                base,
                snapshot_path(dataset, head),
            ],
        };
        let args = args.iter().map(String::as_str).collect_vec();
        let mut child = self.spawn(&args, Stdio::null(), Stdio::piped())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("zfs send stdout was not captured"))?;
        let stderr = StderrDrain::spawn(&mut child);
        Ok(Box::new(ChildStream {
            command: self.runner.describe(&args),
            child,
            stdout: Some(stdout),
            stderr,
        }))
    }

    fn receive_snapshot(&self, dataset: &str, snapshot: &str) -> Result<Box<dyn SnapshotSink>> {
        let target = snapshot_path(dataset, snapshot);
        let args = ["recv", "-F", target.as_str()];
        let mut child = self.spawn(&args, Stdio::piped(), Stdio::null())?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("zfs recv stdin was not captured"))?;
        let stderr = StderrDrain::spawn(&mut child);
        Ok(Box::new(ChildSink {
            command: self.runner.describe(&args),
            child,
            stdin: Some(stdin),
            stderr,
        }))
    }

    fn get_property(&self, target: &str, key: &str) -> Result<String> {
        Ok(self
            .run(&["get", "-H", "-o", "value", key, target])?
            .into_iter()
            .next()
            .unwrap_or_else(|| "-".to_string()))
    }

    fn set_property(&self, target: &str, key: &str, value: &str) -> Result<()> {
        self.run(&["set", &format!("{key}={value}"), target])
            .map(|_| ())
    }
}

struct ChildStream {
    command: String,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: StderrDrain,
}

impl Read for ChildStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stdout.as_mut() {
            Some(stdout) => stdout.read(buf),
            None => Ok(0),
        }
    }
}

impl Finish for ChildStream {
    fn finish(self: Box<Self>) -> Result<()> {
        let ChildStream {
            command,
            child,
            stdout,
            stderr,
        } = *self;
        drop(stdout);
        wait_child(command, child, stderr)
    }
}

impl SnapshotStream for ChildStream {
    fn abort(self: Box<Self>) -> Result<()> {
        let ChildStream {
            command,
            mut child,
            stdout,
            stderr: _,
        } = *self;
        drop(stdout);
        // kill only fails when the process was already reaped
        if let Err(e) = child.kill() {
            tracing::debug!("Killing `{command}` failed: {e}");
        }
        child.wait()?;
        Ok(())
    }
}

struct ChildSink {
    command: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stderr: StderrDrain,
}

impl ChildSink {
    fn stdin(&mut self) -> io::Result<&mut ChildStdin> {
        self.stdin
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))
    }
}

impl Write for ChildSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stdin()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stdin()?.flush()
    }
}

impl Finish for ChildSink {
    fn finish(self: Box<Self>) -> Result<()> {
        let ChildSink {
            command,
            child,
            stdin,
            stderr,
        } = *self;
        // closing stdin is the end-of-stream signal for zfs recv
        drop(stdin);
        wait_child(command, child, stderr)
    }
}

impl SnapshotSink for ChildSink {}
