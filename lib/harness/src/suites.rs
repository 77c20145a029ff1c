// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Run a list of service suites and write one JSON report for all of them.

use std::path::Path;

use anyhow::Context;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::supervisor::{ServiceSpec, SuiteOutcome, Supervisor};

const REPORT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse a suites file: a JSON array of service definitions.
pub fn load_suites(path: &Path) -> anyhow::Result<Vec<ServiceSpec>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read suites file {}", path.display()))?;
    let suites: Vec<ServiceSpec> = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid suites file {}", path.display()))?;
    if suites.is_empty() {
        anyhow::bail!("Suites file {} defines no services", path.display());
    }
    Ok(suites)
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub timestamp: String,
    pub total_suites: usize,
    pub success_suites: usize,
    pub suites: Vec<SuiteOutcome>,
}

impl Report {
    pub fn new(suites: Vec<SuiteOutcome>) -> Self {
        Report {
            timestamp: chrono::Local::now()
                .format(REPORT_TIMESTAMP_FORMAT)
                .to_string(),
            total_suites: suites.len(),
            success_suites: suites.iter().filter(|s| s.success).count(),
            suites,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.success_suites == self.total_suites
    }

    /// Pretty-printed JSON, creating parent directories as needed.
    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let body = serde_json::to_string_pretty(self)?;
        std::fs::write(path, body)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        tracing::info!(path = %path.display(), "Wrote test report");
        Ok(())
    }
}

/// One suite at a time, in file order. Every suite runs even after a failure, unless cancelled.
pub async fn run_serial(specs: Vec<ServiceSpec>, cancel: &CancellationToken) -> Report {
    let mut outcomes = Vec::with_capacity(specs.len());
    for spec in specs {
        if cancel.is_cancelled() {
            tracing::warn!(service = %spec.name, "Cancelled, not starting suite");
            outcomes.push(not_run(&spec));
            continue;
        }
        outcomes.push(run_one(spec, cancel).await);
    }
    summarize(outcomes)
}

/// All suites at once, one tokio task each. Outcomes keep file order.
///
/// Services that bind the same port or devices will fight each other; the caller decides
/// whether that is safe.
pub async fn run_parallel(specs: Vec<ServiceSpec>, cancel: &CancellationToken) -> Report {
    let (names, tasks): (Vec<String>, Vec<JoinHandle<SuiteOutcome>>) = specs
        .into_iter()
        .map(|spec| {
            let name = spec.name.clone();
            let cancel = cancel.clone();
            (name, tokio::spawn(async move { run_one(spec, &cancel).await }))
        })
        .unzip();

    let outcomes = futures::future::join_all(tasks)
        .await
        .into_iter()
        .zip(names)
        .map(|(joined, name)| match joined {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(service = %name, %err, "Suite task failed");
                SuiteOutcome {
                    name,
                    success: false,
                    test_results: vec![],
                }
            }
        })
        .collect();
    summarize(outcomes)
}

async fn run_one(spec: ServiceSpec, cancel: &CancellationToken) -> SuiteOutcome {
    let name = spec.name.clone();
    let supervisor = match Supervisor::new(spec) {
        Ok(supervisor) => supervisor,
        Err(err) => {
            tracing::error!(service = %name, %err, "Invalid service definition");
            return SuiteOutcome {
                name,
                success: false,
                test_results: vec![],
            };
        }
    };
    tracing::info!(service = %name, "==== Running suite ====");
    supervisor.run(cancel).await
}

fn not_run(spec: &ServiceSpec) -> SuiteOutcome {
    SuiteOutcome {
        name: spec.name.clone(),
        success: false,
        test_results: vec![],
    }
}

fn summarize(outcomes: Vec<SuiteOutcome>) -> Report {
    let report = Report::new(outcomes);
    tracing::info!(
        total = report.total_suites,
        passed = report.success_suites,
        "Suites finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::TestResult;

    fn outcome(name: &str, success: bool) -> SuiteOutcome {
        SuiteOutcome {
            name: name.to_string(),
            success,
            test_results: vec![TestResult {
                name: "t".to_string(),
                returncode: Some(if success { 0 } else { 1 }),
                stdout: String::new(),
                stderr: String::new(),
                success,
            }],
        }
    }

    #[test]
    fn test_report_counts() {
        let report = Report::new(vec![outcome("a", true), outcome("b", false)]);
        assert_eq!(report.total_suites, 2);
        assert_eq!(report.success_suites, 1);
        assert!(!report.all_succeeded());
        assert!(Report::new(vec![]).all_succeeded());
    }

    #[test]
    fn test_report_json_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports/out.json");
        Report::new(vec![outcome("a", true)]).write(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["timestamp", "total_suites", "success_suites", "suites"]);
        assert_eq!(value["suites"][0]["name"], "a");
        assert_eq!(value["suites"][0]["test_results"]["t"]["returncode"], 0);
        assert!(
            chrono::NaiveDateTime::parse_from_str(
                value["timestamp"].as_str().unwrap(),
                REPORT_TIMESTAMP_FORMAT
            )
            .is_ok()
        );
    }

    #[test]
    fn test_load_suites_rejects_empty_and_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("suites.json");

        std::fs::write(&path, "[]").unwrap();
        assert!(load_suites(&path).is_err());

        std::fs::write(&path, r#"[{"name": "x"}]"#).unwrap();
        assert!(load_suites(&path).is_err());

        std::fs::write(
            &path,
            r#"[{"name": "x", "start_script": "true", "test_scripts": {"a": "true"}}]"#,
        )
        .unwrap();
        let suites = load_suites(&path).unwrap();
        assert_eq!(suites.len(), 1);
        assert_eq!(suites[0].test_scripts[0].name, "a");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_parallel_suites_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let marker = |name: &str| dir.path().join(name).display().to_string();
        // each suite's test only passes once the other suite's service is up
        let suite = |own: &str, other: &str| {
            let mut spec = ServiceSpec::new(own, format!("touch {}; exec sleep 30", marker(own)));
            spec.test_scripts = vec![crate::supervisor::TestScript::unnamed(format!(
                "for i in $(seq 50); do [ -e {} ] && exit 0; sleep 0.1; done; exit 1",
                marker(other)
            ))];
            spec
        };

        let suites = vec![suite("a", "b"), suite("b", "a")];
        let report = run_parallel(suites, &CancellationToken::new()).await;
        assert_eq!(report.total_suites, 2);
        assert!(report.all_succeeded());
        assert_eq!(report.suites[0].name, "a");
        assert_eq!(report.suites[1].name, "b");
    }

    #[tokio::test]
    async fn test_cancelled_serial_run_marks_suites_failed() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = run_serial(vec![ServiceSpec::new("a", "sleep 60")], &cancel).await;
        assert_eq!(report.total_suites, 1);
        assert_eq!(report.success_suites, 0);
    }
}
