// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Concurrency sweep driver for `sglang.bench_serving`.
//!
//! For every concurrency level, in the order given, the benchmark client is run once with a
//! prompt count derived from the level (see [`prompt_count`]). Levels run strictly one after
//! another. A failed level is recorded and the sweep moves on to the next one.
//!
//! With [`SeedPolicy::WallClock`] each level gets the current Unix time as its seed, so two
//! sweeps never replay the same prompts. Within one sweep the seeds strictly increase, see
//! [`SeedSequence`]. Use [`SeedPolicy::Fixed`] for reproducible runs.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use anyhow::Context as _;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use validator::{Validate, ValidationError};

use crate::command::CommandSpec;
use crate::process::{DEFAULT_STOP_GRACE, ManagedChild, OutputLine, OutputMode, Stream};
use crate::server::{DEFAULT_MODEL_PATH, DEFAULT_PORT, DEFAULT_PYTHON};

pub const DEFAULT_CONCURRENCY: [u32; 3] = [8, 16, 32];
const BENCH_MODULE: &str = "sglang.bench_serving";
const DEFAULT_DATASET_PATH: &str = "/data/ShareGPT_V3_unfiltered_cleaned_split.json";

/// Number of prompts sent at a given concurrency.
///
/// Small levels get a fixed floor so short runs still produce stable numbers; above 128 the
/// count scales with the level.
pub fn prompt_count(concurrency: u32) -> u32 {
    match concurrency {
        0..=32 => 64,
        33..=128 => 256,
        c => c.saturating_mul(2),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate, Builder)]
#[builder(
    default,
    setter(into),
    build_fn(private, name = "build_internal"),
    derive(Debug)
)]
#[serde(default)]
pub struct BenchArgs {
    pub python: String,

    /// `--backend` of the benchmark client
    pub backend: String,

    pub model_path: PathBuf,

    pub dataset_name: String,

    #[builder(setter(into, strip_option))]
    pub dataset_path: Option<PathBuf>,

    #[validate(range(min = 1))]
    pub random_input_len: u32,

    #[validate(range(min = 1))]
    pub random_output_len: u32,

    #[validate(range(min = 0.0, max = 1.0))]
    pub random_range_ratio: f64,

    /// Requests per second, unset means `inf` (all requests at once, bounded by concurrency)
    #[validate(range(exclusive_min = 0.0))]
    #[builder(setter(into, strip_option))]
    pub request_rate: Option<f64>,

    #[builder(setter(into, strip_option))]
    pub warmup_requests: Option<u32>,

    pub host: String,

    #[validate(range(min = 1))]
    pub port: u16,

    /// JSONL file the client appends one result record to per run
    pub output_file: PathBuf,
}

impl Default for BenchArgs {
    fn default() -> Self {
        BenchArgs {
            python: DEFAULT_PYTHON.to_string(),
            backend: "sglang".to_string(),
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            dataset_name: "random".to_string(),
            dataset_path: Some(PathBuf::from(DEFAULT_DATASET_PATH)),
            random_input_len: 1024,
            random_output_len: 1024,
            random_range_ratio: 1.0,
            request_rate: None,
            warmup_requests: None,
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            output_file: PathBuf::from("results/{model}.jsonl"),
        }
    }
}

impl BenchArgsBuilder {
    /// Build and validate the benchmark arguments
    pub fn build(&self) -> anyhow::Result<BenchArgs> {
        let args = self.build_internal()?;
        args.validate()?;
        Ok(args)
    }
}

impl BenchArgs {
    pub fn builder() -> BenchArgsBuilder {
        BenchArgsBuilder::default()
    }

    /// Render one `bench_serving` invocation. Flag order is fixed.
    pub fn to_command_spec(&self, step: SweepStep, seed: u64) -> CommandSpec {
        let request_rate = self
            .request_rate
            .map(|r| r.to_string())
            .unwrap_or_else(|| "inf".to_string());

        let mut spec = CommandSpec::new(&self.python);
        spec.arg("-m")
            .arg(BENCH_MODULE)
            .flag("--backend", &self.backend)
            .flag("--model", self.model_path.display())
            .flag("--dataset-name", &self.dataset_name)
            .flag_opt(
                "--dataset-path",
                self.dataset_path.as_ref().map(|p| p.display()),
            )
            .flag("--random-input-len", self.random_input_len)
            .flag("--random-output-len", self.random_output_len)
            .flag("--random-range-ratio", self.random_range_ratio)
            .flag("--num-prompts", step.num_prompts)
            .flag("--max-concurrency", step.concurrency)
            .flag("--request-rate", request_rate)
            .flag("--seed", seed)
            .flag("--output-file", self.output_file.display())
            .flag_opt("--warmup-requests", self.warmup_requests)
            .flag("--host", &self.host)
            .flag("--port", self.port);
        spec
    }
}

/// Where benchmark seeds come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SeedPolicy {
    /// Current Unix time in seconds, sampled per level. Not reproducible.
    #[default]
    WallClock,
    Fixed(u64),
}

impl SeedPolicy {
    pub fn next_seed(&self) -> u64 {
        match self {
            SeedPolicy::WallClock => chrono::Utc::now().timestamp().max(0) as u64,
            SeedPolicy::Fixed(seed) => *seed,
        }
    }
}

/// Seeds for the levels of one sweep, in order.
///
/// Wall-clock seeds are bumped past the previous one when two levels start within the same
/// second.
#[derive(Debug, Clone)]
pub struct SeedSequence {
    policy: SeedPolicy,
    last: Option<u64>,
}

impl SeedSequence {
    pub fn new(policy: SeedPolicy) -> Self {
        SeedSequence { policy, last: None }
    }

    pub fn next_seed(&mut self) -> u64 {
        let sampled = self.policy.next_seed();
        let seed = match (self.policy, self.last) {
            (SeedPolicy::WallClock, Some(last)) => sampled.max(last.saturating_add(1)),
            _ => sampled,
        };
        self.last = Some(seed);
        seed
    }
}

impl FromStr for SeedPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "wall_clock" | "wall-clock" | "time" => Ok(SeedPolicy::WallClock),
            n => n
                .parse::<u64>()
                .map(SeedPolicy::Fixed)
                .map_err(|_| anyhow::anyhow!("Invalid seed '{n}', expected 'wall-clock' or an integer")),
        }
    }
}

impl fmt::Display for SeedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeedPolicy::WallClock => write!(f, "wall-clock"),
            SeedPolicy::Fixed(seed) => write!(f, "{seed}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SweepSettings {
    /// Concurrency levels, run in exactly this order
    #[validate(length(min = 1), custom(function = "validate_levels"))]
    pub concurrency: Vec<u32>,

    pub seed: SeedPolicy,

    /// When set, each level's combined output is also written to a timestamped log file here
    pub log_dir: Option<PathBuf>,
}

impl Default for SweepSettings {
    fn default() -> Self {
        SweepSettings {
            concurrency: DEFAULT_CONCURRENCY.to_vec(),
            seed: SeedPolicy::WallClock,
            log_dir: None,
        }
    }
}

fn validate_levels(levels: &[u32]) -> Result<(), ValidationError> {
    if levels.contains(&0) {
        return Err(ValidationError::new("concurrency_must_be_positive"));
    }
    Ok(())
}

/// Parse `8,16,32` into concurrency levels.
pub fn parse_concurrency_list(s: &str) -> anyhow::Result<Vec<u32>> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u32>()
                .map_err(|e| anyhow::anyhow!("Invalid concurrency '{part}': {e}"))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepStep {
    pub concurrency: u32,
    pub num_prompts: u32,
}

impl SweepStep {
    pub fn new(concurrency: u32) -> Self {
        SweepStep {
            concurrency,
            num_prompts: prompt_count(concurrency),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SweepPlan {
    bench: BenchArgs,
    settings: SweepSettings,
    model_name: String,
}

impl SweepPlan {
    pub fn new(bench: BenchArgs, settings: SweepSettings, model_name: impl Into<String>) -> Self {
        SweepPlan {
            bench,
            settings,
            model_name: model_name.into(),
        }
    }

    pub fn bench(&self) -> &BenchArgs {
        &self.bench
    }

    pub fn settings(&self) -> &SweepSettings {
        &self.settings
    }

    /// One step per configured level, same order, duplicates kept.
    pub fn steps(&self) -> Vec<SweepStep> {
        self.settings
            .concurrency
            .iter()
            .copied()
            .map(SweepStep::new)
            .collect()
    }

    pub fn seeds(&self) -> SeedSequence {
        SeedSequence::new(self.settings.seed)
    }

    pub fn command_for(&self, step: SweepStep, seed: u64) -> CommandSpec {
        self.bench.to_command_spec(step, seed)
    }

    /// `{log_dir}/{timestamp}_{model}_c{concurrency}_in{in}_out{out}.log`. The file actually
    /// written gets a `_{n}` suffix when that name is already taken.
    pub fn log_file_for(&self, step: SweepStep, timestamp: &str) -> Option<PathBuf> {
        self.settings.log_dir.as_ref().map(|dir| {
            dir.join(format!(
                "{timestamp}_{}_c{}_in{}_out{}.log",
                sanitize(&self.model_name),
                step.concurrency,
                self.bench.random_input_len,
                self.bench.random_output_len
            ))
        })
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    pub concurrency: u32,
    pub num_prompts: u32,
    pub seed: u64,
    /// `None` when the client was killed by a signal
    pub exit_code: Option<i32>,
    pub success: bool,
    pub log_file: Option<PathBuf>,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub steps: Vec<StepOutcome>,
    pub cancelled: bool,
}

impl SweepReport {
    pub fn all_succeeded(&self) -> bool {
        !self.cancelled && self.steps.iter().all(|s| s.success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(|s| !s.success)
    }
}

/// Run every step of the plan in order. Only spawn failures and I/O errors on our own files
/// abort the sweep; a benchmark that exits non-zero is recorded and the next level runs.
pub async fn run_sweep(plan: &SweepPlan, cancel: &CancellationToken) -> anyhow::Result<SweepReport> {
    ensure_parent_dir(&plan.bench.output_file).await?;
    if let Some(dir) = &plan.settings.log_dir {
        tokio::fs::create_dir_all(dir).await?;
    }

    let steps = plan.steps();
    let total = steps.len();
    let mut seeds = plan.seeds();
    let mut report = SweepReport::default();

    for (idx, step) in steps.into_iter().enumerate() {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        let seed = seeds.next_seed();
        tracing::info!(
            step = idx + 1,
            total,
            concurrency = step.concurrency,
            num_prompts = step.num_prompts,
            seed,
            "Running benchmark"
        );
        let outcome = run_step(plan, step, seed, cancel).await?;
        if outcome.success {
            tracing::info!(
                concurrency = outcome.concurrency,
                elapsed = %humantime::format_duration(std::time::Duration::from_secs_f64(outcome.elapsed_secs.round())),
                "Benchmark finished"
            );
        } else {
            tracing::warn!(
                concurrency = outcome.concurrency,
                exit_code = ?outcome.exit_code,
                "Benchmark failed, continuing with next level"
            );
        }
        report.steps.push(outcome);
    }

    if cancel.is_cancelled() {
        report.cancelled = true;
    }
    Ok(report)
}

async fn run_step(
    plan: &SweepPlan,
    step: SweepStep,
    seed: u64,
    cancel: &CancellationToken,
) -> anyhow::Result<StepOutcome> {
    let spec = plan.command_for(step, seed);
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    let (log_file, log) = match plan.log_file_for(step, &timestamp) {
        Some(path) => {
            let (path, file) = create_log_file(&path).await?;
            (Some(path), Some(file))
        }
        None => (None, None),
    };
    tracing::debug!(command = %spec, log_file = ?log_file, "Benchmark command");

    let started = Instant::now();
    let mut child = ManagedChild::spawn("bench_serving", &spec, OutputMode::Piped)?;
    tracing::debug!(
        pid = ?child.pid(),
        concurrency = step.concurrency,
        "Benchmark client started"
    );
    let output = child.take_output()?;
    let relay = tokio::spawn(relay_output(output, log));

    let status = child.wait_or_cancel(cancel, DEFAULT_STOP_GRACE).await?;
    match relay.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(%err, "Failed writing benchmark log"),
        Err(err) => tracing::warn!(%err, "Benchmark output relay task failed"),
    }

    Ok(StepOutcome {
        concurrency: step.concurrency,
        num_prompts: step.num_prompts,
        seed,
        exit_code: status.code(),
        success: status.success(),
        log_file,
        elapsed_secs: started.elapsed().as_secs_f64(),
    })
}

/// Create `path`, or `{stem}_{n}.log` for the first free `n` when a level with the same name
/// already logged within this second.
async fn create_log_file(path: &Path) -> anyhow::Result<(PathBuf, tokio::fs::File)> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut candidate = path.to_path_buf();
    let mut n = 0u32;
    loop {
        let opened = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await;
        match opened {
            Ok(file) => return Ok((candidate, file)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                n += 1;
                candidate = path.with_file_name(format!("{stem}_{n}.log"));
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to create log file {}", candidate.display()));
            }
        }
    }
}

/// Echo child output to our stdout/stderr and, when a log file is given, write it there too.
async fn relay_output(
    mut output: mpsc::UnboundedReceiver<OutputLine>,
    log: Option<tokio::fs::File>,
) -> std::io::Result<()> {
    let mut log = log.map(tokio::io::BufWriter::new);

    while let Some(OutputLine { stream, line }) = output.recv().await {
        match stream {
            Stream::Stdout => println!("{line}"),
            Stream::Stderr => eprintln!("{line}"),
        }
        if let Some(log) = log.as_mut() {
            log.write_all(line.as_bytes()).await?;
            log.write_all(b"\n").await?;
        }
    }

    if let Some(mut log) = log {
        log.flush().await?;
    }
    Ok(())
}

async fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 64)]
    #[case(8, 64)]
    #[case(32, 64)]
    #[case(33, 256)]
    #[case(64, 256)]
    #[case(128, 256)]
    #[case(129, 258)]
    #[case(256, 512)]
    #[case(1024, 2048)]
    fn test_prompt_count(#[case] concurrency: u32, #[case] expected: u32) {
        assert_eq!(prompt_count(concurrency), expected);
    }

    #[test]
    fn test_steps_keep_configured_order() {
        let settings = SweepSettings {
            concurrency: vec![32, 8, 8, 256, 16],
            ..Default::default()
        };
        let plan = SweepPlan::new(BenchArgs::default(), settings, "m");
        let steps = plan.steps();
        let levels: Vec<u32> = steps.iter().map(|s| s.concurrency).collect();
        let prompts: Vec<u32> = steps.iter().map(|s| s.num_prompts).collect();
        assert_eq!(levels, vec![32, 8, 8, 256, 16]);
        assert_eq!(prompts, vec![64, 64, 64, 512, 64]);
    }

    #[test]
    fn test_default_sweep_levels() {
        let plan = SweepPlan::new(BenchArgs::default(), SweepSettings::default(), "m");
        let levels: Vec<u32> = plan.steps().iter().map(|s| s.concurrency).collect();
        assert_eq!(levels, vec![8, 16, 32]);
    }

    #[test]
    fn test_bench_command_line() {
        let bench = BenchArgs::builder()
            .model_path("/models/Qwen3-8B")
            .random_input_len(2048u32)
            .random_output_len(256u32)
            .warmup_requests(2u32)
            .output_file("results/qwen.jsonl")
            .build()
            .unwrap();
        let spec = bench.to_command_spec(SweepStep::new(64), 1234);
        assert_eq!(spec.program, "python3");
        assert_eq!(&spec.args[..2], &["-m", "sglang.bench_serving"]);
        assert_eq!(spec.value_of("--backend"), Some("sglang"));
        assert_eq!(spec.value_of("--model"), Some("/models/Qwen3-8B"));
        assert_eq!(spec.value_of("--dataset-name"), Some("random"));
        assert_eq!(spec.value_of("--random-input-len"), Some("2048"));
        assert_eq!(spec.value_of("--random-output-len"), Some("256"));
        assert_eq!(spec.value_of("--random-range-ratio"), Some("1"));
        assert_eq!(spec.value_of("--num-prompts"), Some("256"));
        assert_eq!(spec.value_of("--max-concurrency"), Some("64"));
        assert_eq!(spec.value_of("--request-rate"), Some("inf"));
        assert_eq!(spec.value_of("--seed"), Some("1234"));
        assert_eq!(spec.value_of("--output-file"), Some("results/qwen.jsonl"));
        assert_eq!(spec.value_of("--warmup-requests"), Some("2"));
        assert_eq!(spec.value_of("--host"), Some("127.0.0.1"));
        assert_eq!(spec.value_of("--port"), Some("30000"));
    }

    #[test]
    fn test_request_rate_and_dataset_path_optional() {
        let mut bench = BenchArgs::default();
        bench.request_rate = Some(4.5);
        bench.dataset_path = None;
        let spec = bench.to_command_spec(SweepStep::new(8), 1);
        assert_eq!(spec.value_of("--request-rate"), Some("4.5"));
        assert!(!spec.has_arg("--dataset-path"));
        assert!(!spec.has_arg("--warmup-requests"));
    }

    #[test]
    fn test_bench_builder_validation() {
        assert!(BenchArgs::builder().random_range_ratio(1.5).build().is_err());
        assert!(BenchArgs::builder().random_input_len(0u32).build().is_err());
        assert!(BenchArgs::builder().request_rate(0.0).build().is_err());
        assert!(BenchArgs::builder().random_range_ratio(0.0).build().is_ok());
    }

    #[test]
    fn test_seed_policy() {
        assert_eq!(SeedPolicy::Fixed(42).next_seed(), 42);
        let before = chrono::Utc::now().timestamp() as u64;
        let seed = SeedPolicy::WallClock.next_seed();
        let after = chrono::Utc::now().timestamp() as u64;
        assert!(before <= seed && seed <= after);

        assert_eq!("wall-clock".parse::<SeedPolicy>().unwrap(), SeedPolicy::WallClock);
        assert_eq!("7".parse::<SeedPolicy>().unwrap(), SeedPolicy::Fixed(7));
        assert!("soon".parse::<SeedPolicy>().is_err());
        assert_eq!(SeedPolicy::Fixed(7).to_string(), "7");
    }

    #[test]
    fn test_wall_clock_seeds_strictly_increase() {
        let mut seeds = SeedSequence::new(SeedPolicy::WallClock);
        let drawn: Vec<u64> = (0..5).map(|_| seeds.next_seed()).collect();
        assert!(drawn.windows(2).all(|w| w[0] < w[1]), "{drawn:?}");

        let mut fixed = SeedSequence::new(SeedPolicy::Fixed(9));
        assert_eq!((fixed.next_seed(), fixed.next_seed()), (9, 9));
    }

    #[tokio::test]
    async fn test_log_file_name_taken_gets_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t_m_c8_in1_out1.log");

        let (first, _) = create_log_file(&path).await.unwrap();
        let (second, _) = create_log_file(&path).await.unwrap();
        let (third, _) = create_log_file(&path).await.unwrap();
        assert_eq!(first, path);
        assert_eq!(second, dir.path().join("t_m_c8_in1_out1_1.log"));
        assert_eq!(third, dir.path().join("t_m_c8_in1_out1_2.log"));
    }

    #[test]
    fn test_parse_concurrency_list() {
        assert_eq!(parse_concurrency_list("8,16, 32").unwrap(), vec![8, 16, 32]);
        assert_eq!(parse_concurrency_list("64").unwrap(), vec![64]);
        assert!(parse_concurrency_list("8,x").is_err());
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = SweepSettings::default();
        assert!(settings.validate().is_ok());
        settings.concurrency = vec![];
        assert!(settings.validate().is_err());
        settings.concurrency = vec![8, 0];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_log_file_name() {
        let settings = SweepSettings {
            log_dir: Some(PathBuf::from("logs")),
            ..Default::default()
        };
        let plan = SweepPlan::new(BenchArgs::default(), settings, "DeepSeek R1/fp8");
        let path = plan
            .log_file_for(SweepStep::new(16), "20250101_120000")
            .unwrap();
        assert_eq!(
            path,
            PathBuf::from("logs/20250101_120000_DeepSeek_R1_fp8_c16_in1024_out1024.log")
        );

        let no_logs = SweepPlan::new(BenchArgs::default(), SweepSettings::default(), "m");
        assert!(no_logs.log_file_for(SweepStep::new(16), "t").is_none());
    }

    #[test]
    fn test_report_success() {
        let ok = StepOutcome {
            concurrency: 8,
            num_prompts: 64,
            seed: 1,
            exit_code: Some(0),
            success: true,
            log_file: None,
            elapsed_secs: 1.0,
        };
        let mut report = SweepReport {
            steps: vec![ok.clone()],
            cancelled: false,
        };
        assert!(report.all_succeeded());
        report.steps.push(StepOutcome {
            success: false,
            exit_code: Some(1),
            ..ok
        });
        assert!(!report.all_succeeded());
        assert_eq!(report.failed().count(), 1);
    }
}
