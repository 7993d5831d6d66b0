//! Runs a shell command with its standard streams connected to us.
//!
//! Three shapes are supported:
//!
//! - [`PipeBridge::spawn`]: we write to the program's stdin and read its stdout.
//! - [`PipeBridge::reader`]: some stream we own is fed to the program's stdin,
//!   we read the program's stdout.
//! - [`PipeBridge::writer`]: we write to the program's stdin,
//!   its stdout is drained into some sink we own.
//!
//! In the one-way shapes a background task does the copying.
//! [`PipeBridge::finish`] waits for both the program and that task.

use std::{
    process::{ExitStatus, Stdio},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// A running program and the pipes to it.
///
/// Only [`PipeBridge::finish`] waits for the program (and the copying task) to end.
/// Dropping a bridge kills the program but leaves reaping it to the runtime.
#[derive(Debug)]
pub struct PipeBridge {
    command: String,
    child: Child,

    /// Our end of the program's stdin, if we write to it.
    stdin: Option<ChildStdin>,

    /// Our end of the program's stdout, if we read from it.
    stdout: Option<BufReader<ChildStdout>>,

    /// Bytes of a line not yet terminated.
    /// Kept across reads which time out.
    pending: Vec<u8>,

    /// Copies between the program and an outside stream.
    helper: Option<JoinHandle<std::io::Result<u64>>>,

    /// Aborts the program when it fires.
    watchdog: Option<JoinHandle<()>>,
}

fn shell(command: &str) -> Command {
    #[cfg(unix)]
    let mut shell = {
        let mut shell = Command::new("/bin/sh");
        shell.arg("-c");
        shell
    };

    #[cfg(windows)]
    let mut shell = {
        let mut shell = Command::new("cmd");
        shell.arg("/C");
        shell
    };

    shell.arg(command).kill_on_drop(true);
    shell
}

#[cfg(unix)]
fn abort(pid: u32) {
    use nix::{
        sys::signal::{kill, Signal},
        unistd::Pid,
    };

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGABRT) {
        warn!(%pid, ?e, "Could not abort process");
    }
}

#[cfg(not(unix))]
fn abort(pid: u32) {
    warn!(%pid, "Aborting processes is not supported on this platform");
}

impl PipeBridge {
    fn start(command: &str, stdin: Stdio, stdout: Stdio) -> Result<Self> {
        let mut child = shell(command)
            .stdin(stdin)
            .stdout(stdout)
            .spawn()
            .map_err(|e| Error::Transport(format!("can't run `{command}`: {e}")))?;

        debug!(%command, pid = ?child.id(), "Program started");

        Ok(Self {
            command: command.to_owned(),
            stdin: child.stdin.take(),
            stdout: child.stdout.take().map(BufReader::new),
            child,
            pending: vec![],
            helper: None,
            watchdog: None,
        })
    }

    fn missing_pipe(&self, which: &str) -> Error {
        Error::Transport(format!("`{}`: no {which} pipe", self.command))
    }

    /// Run the command, writing to its stdin and reading its stdout directly.
    pub fn spawn(command: &str) -> Result<Self> {
        Self::start(command, Stdio::piped(), Stdio::piped())
    }

    /// Run the command with `source` copied into its stdin.
    /// Its stdout is read with [`PipeBridge::read_line`].
    pub fn reader<R>(mut source: R, command: &str) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut bridge = Self::start(command, Stdio::piped(), Stdio::piped())?;
        let mut stdin = bridge.stdin.take().ok_or_else(|| bridge.missing_pipe("stdin"))?;

        bridge.helper = Some(tokio::spawn(async move {
            let copied = tokio::io::copy(&mut source, &mut stdin).await?;
            stdin.shutdown().await?;
            Ok(copied)
        }));

        Ok(bridge)
    }

    /// Run the command with its stdout copied into `sink`.
    /// Its stdin is written with [`PipeBridge::write`].
    pub fn writer<W>(mut sink: W, command: &str) -> Result<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut bridge = Self::start(command, Stdio::piped(), Stdio::piped())?;
        let mut stdout = bridge.stdout.take().ok_or_else(|| bridge.missing_pipe("stdout"))?;

        bridge.helper = Some(tokio::spawn(async move {
            let copied = tokio::io::copy(&mut stdout, &mut sink).await?;
            sink.flush().await?;
            Ok(copied)
        }));

        Ok(bridge)
    }

    /// The command this bridge runs.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The process id of the program, if it has not been waited for.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Read one line, without the line terminator.
    ///
    /// `Ok(None)` means the program closed its output.
    /// A line cut short by the end of output is still returned.
    pub async fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        let stdout = match self.stdout.as_mut() {
            Some(stdout) => stdout,
            None => return Err(self.missing_pipe("stdout")),
        };

        let read = tokio::time::timeout(timeout, stdout.read_until(b'\n', &mut self.pending)).await;

        match read {
            Err(_) => Err(Error::Timeout(format!(
                "timeout while reading from `{}`",
                self.command
            ))),
            Ok(Err(e)) => Err(Error::Transport(format!(
                "read error from `{}`: {e}",
                self.command
            ))),
            Ok(Ok(_)) if self.pending.is_empty() => Ok(None),
            Ok(Ok(_)) => {
                let mut bytes = std::mem::take(&mut self.pending);
                if bytes.last() == Some(&b'\n') {
                    bytes.pop();
                }
                if bytes.last() == Some(&b'\r') {
                    bytes.pop();
                }

                let line = String::from_utf8_lossy(&bytes).into_owned();
                trace!(%line, "Line from program");

                Ok(Some(line))
            }
        }
    }

    /// Write bytes to the program's stdin.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let stdin = match self.stdin.as_mut() {
            Some(stdin) => stdin,
            None => return Err(self.missing_pipe("stdin")),
        };

        stdin
            .write_all(bytes)
            .await
            .map_err(|e| Error::Transport(format!("write error to `{}`: {e}", self.command)))
    }

    /// Flush anything buffered towards the program.
    pub async fn flush(&mut self) -> Result<()> {
        let stdin = match self.stdin.as_mut() {
            Some(stdin) => stdin,
            None => return Err(self.missing_pipe("stdin")),
        };

        stdin
            .flush()
            .await
            .map_err(|e| Error::Transport(format!("write error to `{}`: {e}", self.command)))
    }

    /// Close our end of the program's stdin, so the program sees end of input.
    /// Does nothing if already closed.
    pub async fn close_input(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = stdin.shutdown().await {
                trace!(?e, "Shutting down stdin");
            }
        }
    }

    /// Abort the program with `SIGABRT` unless [`PipeBridge::watchdog_stop`]
    /// is called within `after`.
    pub fn watchdog_start(&mut self, after: Duration) {
        self.watchdog_stop();

        let Some(pid) = self.child.id() else {
            return;
        };
        let command = self.command.clone();

        self.watchdog = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            warn!(%command, %pid, "Program did not stop in time, aborting it");
            abort(pid);
        }));
    }

    /// Cancel a running watchdog.
    pub fn watchdog_stop(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
    }

    /// Close all pipes and wait for the program and any copying task to end.
    pub async fn finish(mut self) -> Result<ExitStatus> {
        self.close_input().await;
        self.stdout = None;

        let status = self.child.wait().await;
        self.watchdog_stop();

        if let Some(helper) = self.helper.take() {
            match helper.await {
                Ok(Ok(copied)) => trace!(%copied, "Copying task done"),
                Ok(Err(e)) => debug!(?e, "Copying task failed"),
                Err(e) => warn!(?e, "Copying task join error"),
            }
        }

        let status = status
            .map_err(|e| Error::Transport(format!("can't wait for `{}`: {e}", self.command)))?;
        debug!(command = %self.command, %status, "Program ended");

        Ok(status)
    }
}

impl Drop for PipeBridge {
    fn drop(&mut self) {
        // The child itself is killed on drop (if still running),
        // and reaped by the runtime.
        self.watchdog_stop();
    }
}
