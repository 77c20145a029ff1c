// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Kernel time summary for Chrome-trace profiler output (`*.trace.json` or `*.trace.json.gz`).

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use serde::Serialize;
use serde_json::Value;

const KERNEL_CATEGORY: &str = "kernel";
const MAX_DISPLAY_NAME: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("failed to read trace {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path} has no 'traceEvents' array")]
    MissingTraceEvents { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KernelStat {
    pub kernel: String,
    pub total_duration_us: f64,
    pub count: u64,
    pub avg_duration_us: f64,
}

impl KernelStat {
    /// Kernel name cut to a printable length.
    pub fn display_name(&self) -> Cow<'_, str> {
        match self.kernel.char_indices().nth(MAX_DISPLAY_NAME) {
            Some((cut, _)) => Cow::Owned(format!("{}...", &self.kernel[..cut])),
            None => Cow::Borrowed(&self.kernel),
        }
    }
}

/// Load a trace file and summarise its kernel events, largest total time first.
pub fn analyze_kernel_events(path: &Path) -> Result<Vec<KernelStat>, TraceError> {
    let trace = load_trace(path)?;
    let events = trace
        .get("traceEvents")
        .and_then(Value::as_array)
        .ok_or_else(|| TraceError::MissingTraceEvents {
            path: path.to_path_buf(),
        })?;
    let stats = aggregate_kernels(events);
    tracing::debug!(path = %path.display(), events = events.len(), kernels = stats.len(), "Analyzed trace");
    Ok(stats)
}

/// Paths ending in `gz` are gunzipped first.
pub fn load_trace(path: &Path) -> Result<Value, TraceError> {
    let io_err = |source| TraceError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(io_err)?;
    let reader: Box<dyn Read> = if path.to_string_lossy().ends_with("gz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    serde_json::from_reader(BufReader::new(reader)).map_err(|source| {
        if source.is_io() {
            TraceError::Io {
                path: path.to_path_buf(),
                source: source.into(),
            }
        } else {
            TraceError::Json {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

/// Events count only when they are objects with `cat == "kernel"`, a string `name` and a
/// numeric `dur`. Anything else is skipped silently. Ties keep first-seen order.
pub fn aggregate_kernels(events: &[Value]) -> Vec<KernelStat> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut totals: Vec<(&str, f64, u64)> = Vec::new();

    for event in events {
        let Some(event) = event.as_object() else {
            continue;
        };
        if event.get("cat").and_then(Value::as_str) != Some(KERNEL_CATEGORY) {
            continue;
        }
        let (Some(name), Some(dur)) = (
            event.get("name").and_then(Value::as_str),
            event.get("dur").and_then(Value::as_f64),
        ) else {
            continue;
        };

        let slot = *index.entry(name).or_insert_with(|| {
            totals.push((name, 0.0, 0));
            totals.len() - 1
        });
        let entry = &mut totals[slot];
        entry.1 += dur;
        entry.2 += 1;
    }

    let mut stats: Vec<KernelStat> = totals
        .into_iter()
        .map(|(name, total, count)| KernelStat {
            kernel: name.to_string(),
            total_duration_us: round3(total),
            count,
            avg_duration_us: round3(total / count as f64),
        })
        .collect();
    stats.sort_by(|a, b| b.total_duration_us.total_cmp(&a.total_duration_us));
    stats
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use serde_json::json;
    use std::io::Write;

    fn sample_trace() -> Value {
        json!({
            "traceEvents": [
                {"cat": "kernel", "name": "gemm", "dur": 10.0},
                {"cat": "cpu_op", "name": "aten::mm", "dur": 500.0},
                {"cat": "kernel", "name": "softmax", "dur": 3},
                {"cat": "kernel", "name": "gemm", "dur": 20.5},
                {"cat": "kernel", "name": "softmax", "dur": 4},
                {"cat": "kernel", "name": "rope", "dur": "12"},
                {"cat": "kernel", "dur": 7},
                {"cat": "kernel", "name": 42, "dur": 7},
                "not an event",
                {"cat": "kernel", "name": "allreduce", "dur": 1.0 / 3.0},
            ]
        })
    }

    #[test]
    fn test_aggregate_filters_and_sorts() {
        let trace = sample_trace();
        let stats = aggregate_kernels(trace["traceEvents"].as_array().unwrap());

        let names: Vec<&str> = stats.iter().map(|s| s.kernel.as_str()).collect();
        assert_eq!(names, vec!["gemm", "softmax", "allreduce"]);

        assert_eq!(stats[0].count, 2);
        assert_eq!(stats[0].total_duration_us, 30.5);
        assert_eq!(stats[0].avg_duration_us, 15.25);
        assert_eq!(stats[1].total_duration_us, 7.0);
        assert_eq!(stats[1].avg_duration_us, 3.5);
        assert_eq!(stats[2].total_duration_us, 0.333);
    }

    #[test]
    fn test_analyze_plain_and_gzip_files() {
        let dir = tempfile::tempdir().unwrap();
        let body = serde_json::to_vec(&sample_trace()).unwrap();

        let plain = dir.path().join("rank0.trace.json");
        std::fs::write(&plain, &body).unwrap();

        let gz = dir.path().join("rank0.trace.json.gz");
        let mut encoder = GzEncoder::new(File::create(&gz).unwrap(), Compression::default());
        encoder.write_all(&body).unwrap();
        encoder.finish().unwrap();

        let from_plain = analyze_kernel_events(&plain).unwrap();
        let from_gz = analyze_kernel_events(&gz).unwrap();
        assert_eq!(from_plain, from_gz);
        assert_eq!(from_plain.len(), 3);
    }

    #[test]
    fn test_missing_trace_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.json");
        std::fs::write(&path, r#"{"schemaVersion": 1}"#).unwrap();
        assert!(matches!(
            analyze_kernel_events(&path),
            Err(TraceError::MissingTraceEvents { .. })
        ));

        std::fs::write(&path, "{broken").unwrap();
        assert!(matches!(
            analyze_kernel_events(&path),
            Err(TraceError::Json { .. })
        ));

        assert!(matches!(
            analyze_kernel_events(&dir.path().join("absent.json")),
            Err(TraceError::Io { .. })
        ));
    }

    #[test]
    fn test_display_name_truncates_long_kernels() {
        let long = KernelStat {
            kernel: "k".repeat(150),
            total_duration_us: 1.0,
            count: 1,
            avg_duration_us: 1.0,
        };
        let shown = long.display_name();
        assert_eq!(shown.len(), 103);
        assert!(shown.ends_with("..."));

        let short = KernelStat {
            kernel: "flash_fwd".to_string(),
            ..long
        };
        assert_eq!(short.display_name(), "flash_fwd");
    }
}
