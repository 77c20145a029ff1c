// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Start a service, wait until it is usable, run test scripts against it, stop it.
//!
//! Readiness is two optional gates: a line of service output containing `ready_pattern`, then
//! the `health_url` answering HTTP 200. Stopping always goes through
//! [`ManagedChild::terminate`], so the server's worker processes are stopped with it.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use validator::Validate;

use crate::command::CommandSpec;
use crate::process::{DEFAULT_STOP_GRACE, ManagedChild, OutputLine, OutputMode, Stream};

/// Log line SGLang prints once it accepts requests
pub const SGLANG_READY_PATTERN: &str = "The server is fired up and ready to roll";
pub const DEFAULT_HEALTH_URL: &str = "http://localhost:30000/health";
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestScript {
    pub name: String,
    pub script: String,
}

impl TestScript {
    /// A script that is its own name, as given on the command line.
    pub fn unnamed(script: impl Into<String>) -> Self {
        let script = script.into();
        TestScript {
            name: script.clone(),
            script,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ServiceSpec {
    #[validate(length(min = 1))]
    pub name: String,

    #[validate(length(min = 1))]
    pub start_script: String,

    #[serde(default)]
    pub ready_pattern: Option<String>,

    #[serde(default, alias = "health_check")]
    pub health_url: Option<String>,

    #[serde(default = "default_timeout_secs", alias = "timeout")]
    #[validate(range(min = 1))]
    pub timeout_secs: u64,

    #[serde(default = "default_poll_interval_secs")]
    #[validate(range(min = 1))]
    pub poll_interval_secs: u64,

    /// Pause between the last test and stopping the service
    #[serde(default)]
    pub settle_secs: u64,

    /// Either a JSON object of name to script, or a list of scripts
    #[serde(default, with = "test_scripts")]
    pub test_scripts: Vec<TestScript>,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, start_script: impl Into<String>) -> Self {
        ServiceSpec {
            name: name.into(),
            start_script: start_script.into(),
            ready_pattern: None,
            health_url: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            settle_secs: 0,
            test_scripts: Vec::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestResult {
    #[serde(skip)]
    pub name: String,
    /// `None` when the script was killed by a signal
    pub returncode: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuiteOutcome {
    pub name: String,
    pub success: bool,
    /// Serialized as an object keyed by test name, in run order
    #[serde(serialize_with = "serialize_results")]
    pub test_results: Vec<TestResult>,
}

impl SuiteOutcome {
    fn failed(name: &str, test_results: Vec<TestResult>) -> Self {
        SuiteOutcome {
            name: name.to_string(),
            success: false,
            test_results,
        }
    }
}

fn serialize_results<S: Serializer>(results: &[TestResult], s: S) -> Result<S::Ok, S::Error> {
    let keys = unique_keys(results.iter().map(|r| r.name.as_str()));
    let mut map = s.serialize_map(Some(results.len()))?;
    for (key, result) in keys.iter().zip(results) {
        map.serialize_entry(key, result)?;
    }
    map.end()
}

/// Object keys for test names. A repeated name becomes `name (2)`, `name (3)` and so on.
fn unique_keys<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .into_iter()
        .map(|name| {
            let mut key = name.to_string();
            let mut n = 1;
            while !seen.insert(key.clone()) {
                n += 1;
                key = format!("{name} ({n})");
            }
            key
        })
        .collect()
}

pub struct Supervisor {
    spec: ServiceSpec,
    http: reqwest::Client,
    stop_grace: Duration,
}

struct RunningService {
    child: ManagedChild,
    log_drain: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(spec: ServiceSpec) -> anyhow::Result<Self> {
        spec.validate()?;
        let http = reqwest::Client::builder()
            .timeout(HEALTH_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Supervisor {
            spec,
            http,
            stop_grace: DEFAULT_STOP_GRACE,
        })
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Full lifecycle. Never leaves the service running, whatever happens.
    pub async fn run(&self, cancel: &CancellationToken) -> SuiteOutcome {
        let name = self.spec.name.as_str();

        let mut service = match self.start(cancel).await {
            Ok(service) => service,
            Err(err) => {
                tracing::error!(service = name, %err, "Service failed to start");
                return SuiteOutcome::failed(name, vec![]);
            }
        };

        match self.wait_for_health(cancel).await {
            Ok(true) => {}
            Ok(false) => {
                self.stop(&mut service).await;
                return SuiteOutcome::failed(name, vec![]);
            }
            Err(err) => {
                tracing::error!(service = name, %err, "Health check aborted");
                self.stop(&mut service).await;
                return SuiteOutcome::failed(name, vec![]);
            }
        }

        let (success, test_results) = self.run_tests(&mut service, cancel).await;

        if self.spec.settle_secs > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.spec.settle_secs)) => {}
                _ = cancel.cancelled() => {}
            }
        }
        self.stop(&mut service).await;

        SuiteOutcome {
            name: name.to_string(),
            success,
            test_results,
        }
    }

    async fn start(&self, cancel: &CancellationToken) -> anyhow::Result<RunningService> {
        let name = self.spec.name.as_str();
        tracing::info!(service = name, script = %self.spec.start_script, "Starting service");

        let spec = CommandSpec::shell(&self.spec.start_script);
        let mut child = ManagedChild::spawn(name, &spec, OutputMode::Piped)?;
        tracing::debug!(service = name, pid = ?child.pid(), "Service process started");
        let mut output = child.take_output()?;

        if let Some(pattern) = self.spec.ready_pattern.as_deref() {
            let deadline = Instant::now() + self.spec.timeout();
            let outcome: anyhow::Result<()> = loop {
                tokio::select! {
                    line = output.recv() => match line {
                        Some(line) => {
                            log_service_line(name, line.stream, &line.line);
                            if line.line.contains(pattern) {
                                tracing::info!(service = name, "Service reported ready");
                                break Ok(());
                            }
                        }
                        None => break Err(anyhow::anyhow!(
                            "{name} closed its output before printing '{pattern}'"
                        )),
                    },
                    _ = tokio::time::sleep_until(deadline) => break Err(anyhow::anyhow!(
                        "{name} did not print '{pattern}' within {}",
                        humantime::format_duration(self.spec.timeout())
                    )),
                    _ = cancel.cancelled() => break Err(anyhow::anyhow!("cancelled while starting {name}")),
                }
            };
            if let Err(err) = outcome {
                if let Err(stop_err) = child.terminate(self.stop_grace).await {
                    tracing::error!(service = name, err = %stop_err, "Failed to stop service");
                }
                return Err(err);
            }
        }

        let service_name = name.to_string();
        let log_drain = tokio::spawn(async move {
            while let Some(line) = output.recv().await {
                log_service_line(&service_name, line.stream, &line.line);
            }
        });

        if let Some(status) = child.try_exited()? {
            log_drain.abort();
            anyhow::bail!("{name} exited during startup with {status}");
        }

        Ok(RunningService {
            child,
            log_drain: Some(log_drain),
        })
    }

    /// `Ok(true)` once the health URL answers 200, `Ok(false)` on timeout. Skipped when no URL
    /// is configured.
    async fn wait_for_health(&self, cancel: &CancellationToken) -> anyhow::Result<bool> {
        let name = self.spec.name.as_str();
        let Some(url) = self.spec.health_url.as_deref() else {
            tracing::info!(service = name, "No health check configured, skipping");
            return Ok(true);
        };

        tracing::info!(service = name, url, "Waiting for service health");
        let deadline = Instant::now() + self.spec.timeout();
        loop {
            match self.http.get(url).send().await {
                Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                    tracing::info!(service = name, "Service is healthy");
                    return Ok(true);
                }
                Ok(resp) => {
                    tracing::debug!(service = name, status = %resp.status(), "Service not healthy yet")
                }
                Err(err) => tracing::debug!(service = name, %err, "Service not reachable yet"),
            }

            if Instant::now() >= deadline {
                tracing::error!(
                    service = name,
                    timeout = %humantime::format_duration(self.spec.timeout()),
                    "Service did not become healthy in time"
                );
                return Ok(false);
            }
            let wake = (Instant::now() + self.spec.poll_interval()).min(deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                _ = cancel.cancelled() => anyhow::bail!("cancelled while waiting for {name}"),
            }
        }
    }

    /// Runs every script in order, even after a failure. Returns overall success.
    async fn run_tests(
        &self,
        service: &mut RunningService,
        cancel: &CancellationToken,
    ) -> (bool, Vec<TestResult>) {
        let name = self.spec.name.as_str();
        let mut results = Vec::with_capacity(self.spec.test_scripts.len());
        let mut all_success = true;

        for test in &self.spec.test_scripts {
            if cancel.is_cancelled() {
                tracing::warn!(service = name, "Cancelled, skipping remaining tests");
                return (false, results);
            }
            match service.child.try_exited() {
                Ok(None) => {}
                Ok(Some(status)) => {
                    tracing::error!(service = name, %status, "Service is no longer running, cannot run tests");
                    return (false, results);
                }
                Err(err) => {
                    tracing::error!(service = name, %err, "Could not query service state");
                    return (false, results);
                }
            }

            tracing::info!(service = name, test = %test.name, "==== Running test ====");
            let result = self.run_script(test, cancel).await;
            if !result.stdout.is_empty() {
                tracing::info!(service = name, test = %test.name, "stdout:\n{}", result.stdout);
            }
            if !result.stderr.is_empty() {
                tracing::warn!(service = name, test = %test.name, "stderr:\n{}", result.stderr);
            }
            if result.success {
                tracing::info!(service = name, test = %test.name, "Test passed");
            } else {
                tracing::error!(service = name, test = %test.name, returncode = ?result.returncode, "Test failed");
                all_success = false;
            }
            results.push(result);
        }
        (all_success, results)
    }

    /// Run one script in its own process group, capturing its output. Cancellation stops the
    /// whole group, so anything the script forked goes down with it.
    async fn run_script(&self, test: &TestScript, cancel: &CancellationToken) -> TestResult {
        let failed = |err: anyhow::Error| TestResult {
            name: test.name.clone(),
            returncode: None,
            stdout: String::new(),
            stderr: format!("{err:#}"),
            success: false,
        };

        let spec = CommandSpec::shell(&test.script);
        let mut child = match ManagedChild::spawn(&test.name, &spec, OutputMode::Piped) {
            Ok(child) => child,
            Err(err) => return failed(err),
        };
        let mut output = match child.take_output() {
            Ok(output) => output,
            Err(err) => return failed(err),
        };

        let collect = async move {
            let (mut stdout, mut stderr) = (String::new(), String::new());
            while let Some(OutputLine { stream, line }) = output.recv().await {
                let buf = match stream {
                    Stream::Stdout => &mut stdout,
                    Stream::Stderr => &mut stderr,
                };
                buf.push_str(&line);
                buf.push('\n');
            }
            (stdout, stderr)
        };
        let (status, (stdout, stderr)) =
            tokio::join!(child.wait_or_cancel(cancel, self.stop_grace), collect);

        match status {
            Ok(status) => TestResult {
                name: test.name.clone(),
                returncode: status.code(),
                stdout,
                stderr,
                success: status.success() && !cancel.is_cancelled(),
            },
            Err(err) => failed(err),
        }
    }

    async fn stop(&self, service: &mut RunningService) {
        let name = self.spec.name.as_str();
        match service.child.terminate(self.stop_grace).await {
            Ok(status) => tracing::info!(service = name, %status, "Service stopped"),
            Err(err) => tracing::error!(service = name, %err, "Failed to stop service"),
        }
        if let Some(drain) = service.log_drain.take() {
            // output closes once the whole process group is gone
            if tokio::time::timeout(Duration::from_secs(1), drain).await.is_err() {
                tracing::debug!(service = name, "Service output still open after stop");
            }
        }
    }
}

fn log_service_line(service: &str, stream: Stream, line: &str) {
    match stream {
        Stream::Stdout => tracing::info!(target: "service", service, "{line}"),
        Stream::Stderr => tracing::info!(target: "service", service, stream = "stderr", "{line}"),
    }
}

mod test_scripts {
    use super::*;

    pub fn serialize<S: Serializer>(scripts: &[TestScript], s: S) -> Result<S::Ok, S::Error> {
        let keys = unique_keys(scripts.iter().map(|t| t.name.as_str()));
        let mut map = s.serialize_map(Some(scripts.len()))?;
        for (key, test) in keys.iter().zip(scripts) {
            map.serialize_entry(key, &test.script)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<TestScript>, D::Error> {
        d.deserialize_any(ScriptsVisitor)
    }

    struct ScriptsVisitor;

    impl<'de> Visitor<'de> for ScriptsVisitor {
        type Value = Vec<TestScript>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("an object of test name to script, or a list of scripts")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut scripts = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((name, script)) = map.next_entry::<String, String>()? {
                scripts.push(TestScript { name, script });
            }
            Ok(scripts)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut scripts = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(script) = seq.next_element::<String>()? {
                scripts.push(TestScript::unnamed(script));
            }
            Ok(scripts)
        }
    }
}
