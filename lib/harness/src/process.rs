// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Child process handling shared by the launcher, the sweep and the supervisor.
//!
//! Every child is spawned as the leader of its own process group. Stopping a child signals
//! the whole group, which takes down the worker processes an inference server forks.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::Context as _;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::command::CommandSpec;

/// How long a process group gets between SIGTERM and SIGKILL.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Child writes straight to our stdout/stderr
    Inherit,
    /// Child output is delivered line by line through [`ManagedChild::take_output`]
    Piped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: Stream,
    pub line: String,
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

pub struct ManagedChild {
    name: String,
    pid: Option<u32>,
    child: Child,
    output: Option<mpsc::UnboundedReceiver<OutputLine>>,
}

impl ManagedChild {
    pub fn spawn(name: &str, spec: &CommandSpec, mode: OutputMode) -> anyhow::Result<Self> {
        let mut cmd = spec.to_command();
        cmd.stdin(Stdio::null());
        match mode {
            OutputMode::Inherit => {
                cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
            OutputMode::Piped => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to start {name}: {spec}"))?;
        let pid = child.id();
        tracing::debug!(name, pid, "Spawned child process");

        let output = match mode {
            OutputMode::Inherit => None,
            OutputMode::Piped => {
                let (tx, rx) = mpsc::unbounded_channel();
                if let Some(stdout) = child.stdout.take() {
                    forward_lines(stdout, Stream::Stdout, tx.clone());
                }
                if let Some(stderr) = child.stderr.take() {
                    forward_lines(stderr, Stream::Stderr, tx);
                }
                Some(rx)
            }
        };

        Ok(ManagedChild {
            name: name.to_string(),
            pid,
            child,
            output,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Merged stdout and stderr lines. Closes once both pipes reach EOF.
    /// Only available once, and only for [`OutputMode::Piped`].
    pub fn take_output(&mut self) -> anyhow::Result<mpsc::UnboundedReceiver<OutputLine>> {
        self.output
            .take()
            .with_context(|| format!("Output of {} is not piped or already taken", self.name))
    }

    /// `Some(status)` once the child has exited.
    pub fn try_exited(&mut self) -> anyhow::Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    pub async fn wait(&mut self) -> anyhow::Result<ExitStatus> {
        Ok(self.child.wait().await?)
    }

    /// Wait for the child to exit on its own, or stop it when `cancel` fires.
    pub async fn wait_or_cancel(
        &mut self,
        cancel: &CancellationToken,
        grace: Duration,
    ) -> anyhow::Result<ExitStatus> {
        tokio::select! {
            status = self.child.wait() => Ok(status?),
            _ = cancel.cancelled() => {
                tracing::info!(name = %self.name, "Cancelled, stopping child process");
                self.terminate(grace).await
            }
        }
    }

    /// SIGTERM the process group, then SIGKILL it if the leader is still alive after `grace`.
    /// A child that already exited is left alone.
    pub async fn terminate(&mut self, grace: Duration) -> anyhow::Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            tracing::debug!(name = %self.name, %status, "Child process already exited");
            return Ok(status);
        }

        tracing::info!(name = %self.name, pid = self.pid, "Sending SIGTERM to process group");
        self.signal(Signal::Term)?;

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => Ok(status?),
            Err(_) => {
                tracing::warn!(
                    name = %self.name,
                    pid = self.pid,
                    grace = %humantime::format_duration(grace),
                    "Process group ignored SIGTERM, sending SIGKILL"
                );
                self.signal(Signal::Kill)?;
                Ok(self.child.wait().await?)
            }
        }
    }

    #[cfg(unix)]
    fn signal(&mut self, signal: Signal) -> anyhow::Result<()> {
        let Some(pgid) = self.pid else {
            return Ok(());
        };
        let signum = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // SAFETY: killpg takes plain integers and has no memory side effects.
        let rc = unsafe { libc::killpg(pgid as libc::pid_t, signum) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            // group is already gone
            return Ok(());
        }
        Err(err).with_context(|| format!("killpg({pgid}, {signal:?}) for {}", self.name))
    }

    #[cfg(not(unix))]
    fn signal(&mut self, _signal: Signal) -> anyhow::Result<()> {
        Ok(self.child.start_kill()?)
    }
}

fn forward_lines<R>(
    reader: R,
    stream: Stream,
    tx: mpsc::UnboundedSender<OutputLine>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(256);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if tx.send(OutputLine { stream, line }).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::debug!(?stream, %err, "Stopped reading child output");
                    break;
                }
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_piped_output_is_merged_line_by_line() {
        let spec = CommandSpec::shell("echo one; echo two 1>&2; printf 'three'");
        let mut child = ManagedChild::spawn("echo", &spec, OutputMode::Piped).unwrap();
        let mut rx = child.take_output().unwrap();

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        let status = child.wait().await.unwrap();
        assert!(status.success());

        let stdout: Vec<_> = lines
            .iter()
            .filter(|l| l.stream == Stream::Stdout)
            .map(|l| l.line.as_str())
            .collect();
        assert_eq!(stdout, vec!["one", "three"]);
        assert!(
            lines
                .iter()
                .any(|l| l.stream == Stream::Stderr && l.line == "two")
        );
        assert!(child.take_output().is_err());
    }

    #[tokio::test]
    async fn test_terminate_stops_process_group() {
        let spec = CommandSpec::shell("sleep 30 & sleep 30; wait");
        let mut child = ManagedChild::spawn("sleeper", &spec, OutputMode::Inherit).unwrap();
        let started = Instant::now();
        let status = child.terminate(Duration::from_secs(5)).await.unwrap();
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_sigkill() {
        let spec = CommandSpec::shell("trap '' TERM; sleep 30");
        let mut child = ManagedChild::spawn("stubborn", &spec, OutputMode::Inherit).unwrap();
        // give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = child.terminate(Duration::from_millis(300)).await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_terminate_after_exit_returns_status() {
        let spec = CommandSpec::shell("exit 3");
        let mut child = ManagedChild::spawn("quick", &spec, OutputMode::Inherit).unwrap();
        let first = child.wait().await.unwrap();
        assert_eq!(first.code(), Some(3));
        let again = child.terminate(DEFAULT_STOP_GRACE).await.unwrap();
        assert_eq!(again.code(), Some(3));
    }

    #[tokio::test]
    async fn test_wait_or_cancel() {
        let spec = CommandSpec::shell("sleep 30");
        let mut child = ManagedChild::spawn("sleep", &spec, OutputMode::Inherit).unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let status = child
            .wait_or_cancel(&cancel, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!status.success());
    }
}
