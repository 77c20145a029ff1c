// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use sgl_harness::HarnessConfig;
use sgl_harness::SeedPolicy;
use sgl_harness::supervisor::{
    DEFAULT_HEALTH_URL, DEFAULT_POLL_INTERVAL_SECS, DEFAULT_TIMEOUT_SECS, SGLANG_READY_PATTERN,
    ServiceSpec, TestScript,
};
use sgl_harness::sweep::parse_concurrency_list;

#[derive(Parser, Debug, Clone)]
#[command(name = "sgl-harness", version, about = "Launch, benchmark and supervise SGLang")]
pub struct Cli {
    /// TOML configuration file, layered over /etc/sgl-harness/harness.toml
    #[arg(long, global = true, value_name = "TOML")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the inference server in the foreground
    Serve(ServeFlags),

    /// Run bench_serving once per concurrency level
    Sweep(SweepFlags),

    /// Convert JSONL benchmark results to CSV next to the input
    Convert {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },

    /// Start a service, run test scripts against it, stop it
    Supervise(SuperviseFlags),

    /// Run every service suite from a JSON file
    Suites {
        /// JSON array of service definitions
        #[arg(long)]
        config_file: PathBuf,

        #[arg(long)]
        parallel: bool,

        /// Write a JSON report here
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Summarise kernel time in a Chrome trace (.json or .json.gz)
    Kernels {
        trace_file: PathBuf,

        /// Only show the N most expensive kernels
        #[arg(long)]
        top: Option<usize>,

        /// Print JSON instead of the numbered list
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct ServeFlags {
    #[command(flatten)]
    pub server: ServerFlags,

    /// Print the command line and exit
    #[arg(long)]
    pub dry_run: bool,
}

/// Overrides for `[server]`. Unset flags keep the configured value.
#[derive(Args, Debug, Clone, Default)]
pub struct ServerFlags {
    #[arg(long)]
    pub python: Option<String>,

    #[arg(long)]
    pub model_path: Option<PathBuf>,

    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub served_model_name: Option<String>,

    #[arg(long)]
    pub tp_size: Option<u32>,

    #[arg(long)]
    pub dp_size: Option<u32>,

    #[arg(long)]
    pub enable_ep_moe: bool,

    #[arg(long)]
    pub chunked_prefill_size: Option<u32>,

    #[arg(long)]
    pub max_prefill_tokens: Option<u32>,

    #[arg(long)]
    pub context_length: Option<u32>,

    #[arg(long)]
    pub max_running_requests: Option<u32>,

    #[arg(long)]
    pub mem_fraction_static: Option<f64>,

    #[arg(long)]
    pub page_size: Option<u32>,

    #[arg(long)]
    pub disable_radix_cache: bool,

    #[arg(long)]
    pub attention_backend: Option<String>,

    #[arg(long)]
    pub enable_torch_compile: bool,

    #[arg(long)]
    pub disable_cuda_graph: bool,

    #[arg(long, value_name = "BOOL")]
    pub trust_remote_code: Option<bool>,

    /// Export SGLANG_USE_AITER=1 to the server
    #[arg(long)]
    pub alt_attention_kernels: bool,
}

impl ServerFlags {
    pub fn apply(&self, config: &mut HarnessConfig) {
        let server = &mut config.server;
        if let Some(python) = &self.python {
            server.python = python.clone();
        }
        if let Some(model_path) = &self.model_path {
            server.model_path = model_path.clone();
        }
        if let Some(host) = &self.host {
            server.host = host.clone();
        }
        if let Some(port) = self.port {
            server.port = port;
        }
        if let Some(name) = &self.served_model_name {
            server.served_model_name = Some(name.clone());
        }
        if let Some(tp_size) = self.tp_size {
            server.tp_size = tp_size;
        }
        if self.dp_size.is_some() {
            server.dp_size = self.dp_size;
        }
        server.enable_ep_moe |= self.enable_ep_moe;
        if self.chunked_prefill_size.is_some() {
            server.chunked_prefill_size = self.chunked_prefill_size;
        }
        if self.max_prefill_tokens.is_some() {
            server.max_prefill_tokens = self.max_prefill_tokens;
        }
        if self.context_length.is_some() {
            server.context_length = self.context_length;
        }
        if self.max_running_requests.is_some() {
            server.max_running_requests = self.max_running_requests;
        }
        if self.mem_fraction_static.is_some() {
            server.mem_fraction_static = self.mem_fraction_static;
        }
        if self.page_size.is_some() {
            server.page_size = self.page_size;
        }
        server.disable_radix_cache |= self.disable_radix_cache;
        if let Some(backend) = &self.attention_backend {
            server.attention_backend = Some(backend.clone());
        }
        server.enable_torch_compile |= self.enable_torch_compile;
        server.disable_cuda_graph |= self.disable_cuda_graph;
        if let Some(trust) = self.trust_remote_code {
            server.trust_remote_code = trust;
        }
        server.alt_attention_kernels |= self.alt_attention_kernels;
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct SweepFlags {
    #[command(flatten)]
    pub bench: BenchFlags,

    /// Comma separated levels, run in this order, e.g. 8,16,32
    #[arg(long, value_name = "LIST")]
    pub concurrency: Option<String>,

    /// `wall-clock` (default) or a fixed integer seed
    #[arg(long)]
    pub seed: Option<SeedPolicy>,

    /// Write each level's output to a timestamped log file in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Print the command lines and exit
    #[arg(long)]
    pub dry_run: bool,
}

impl SweepFlags {
    pub fn apply(&self, config: &mut HarnessConfig) -> anyhow::Result<()> {
        self.bench.apply(config);
        if let Some(levels) = &self.concurrency {
            config.sweep.concurrency = parse_concurrency_list(levels)?;
        }
        if let Some(seed) = self.seed {
            config.sweep.seed = seed;
        }
        if let Some(dir) = &self.log_dir {
            config.sweep.log_dir = Some(dir.clone());
        }
        Ok(())
    }
}

/// Overrides for `[bench]`.
#[derive(Args, Debug, Clone, Default)]
pub struct BenchFlags {
    #[arg(long)]
    pub python: Option<String>,

    #[arg(long)]
    pub backend: Option<String>,

    #[arg(long)]
    pub model_path: Option<PathBuf>,

    #[arg(long)]
    pub dataset_name: Option<String>,

    #[arg(long)]
    pub dataset_path: Option<PathBuf>,

    #[arg(long)]
    pub random_input_len: Option<u32>,

    #[arg(long)]
    pub random_output_len: Option<u32>,

    #[arg(long)]
    pub random_range_ratio: Option<f64>,

    /// Requests per second; omit for `inf`
    #[arg(long)]
    pub request_rate: Option<f64>,

    #[arg(long)]
    pub warmup_requests: Option<u32>,

    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    /// JSONL results file, `{model}` is replaced by the model name
    #[arg(long)]
    pub output_file: Option<PathBuf>,
}

impl BenchFlags {
    pub fn apply(&self, config: &mut HarnessConfig) {
        let bench = &mut config.bench;
        if let Some(python) = &self.python {
            bench.python = python.clone();
        }
        if let Some(backend) = &self.backend {
            bench.backend = backend.clone();
        }
        if let Some(model_path) = &self.model_path {
            bench.model_path = model_path.clone();
        }
        if let Some(dataset_name) = &self.dataset_name {
            bench.dataset_name = dataset_name.clone();
        }
        if let Some(dataset_path) = &self.dataset_path {
            bench.dataset_path = Some(dataset_path.clone());
        }
        if let Some(len) = self.random_input_len {
            bench.random_input_len = len;
        }
        if let Some(len) = self.random_output_len {
            bench.random_output_len = len;
        }
        if let Some(ratio) = self.random_range_ratio {
            bench.random_range_ratio = ratio;
        }
        if self.request_rate.is_some() {
            bench.request_rate = self.request_rate;
        }
        if self.warmup_requests.is_some() {
            bench.warmup_requests = self.warmup_requests;
        }
        if let Some(host) = &self.host {
            bench.host = host.clone();
        }
        if let Some(port) = self.port {
            bench.port = port;
        }
        if let Some(output_file) = &self.output_file {
            bench.output_file = output_file.clone();
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct SuperviseFlags {
    /// Shell command that starts the service
    #[arg(long)]
    pub start_script: String,

    /// Test commands, run in order once the service is healthy
    #[arg(long, num_args = 1.., required = true)]
    pub test_scripts: Vec<String>,

    #[arg(long, default_value = DEFAULT_HEALTH_URL)]
    pub health_url: String,

    /// Skip the HTTP health check
    #[arg(long, conflicts_with = "health_url")]
    pub no_health_check: bool,

    /// Service output line that means it is ready
    #[arg(long, default_value = SGLANG_READY_PATTERN)]
    pub ready_pattern: String,

    /// Do not wait for a ready line
    #[arg(long, conflicts_with = "ready_pattern")]
    pub no_ready_pattern: bool,

    /// Seconds to wait for the ready line and again for health
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout: u64,

    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_SECS)]
    pub poll_interval: u64,

    /// Seconds to keep the service up after the last test
    #[arg(long, default_value_t = 0)]
    pub settle: u64,

    /// Write a JSON report here
    #[arg(long)]
    pub report: Option<PathBuf>,
}

impl SuperviseFlags {
    pub fn service_spec(&self) -> ServiceSpec {
        let mut spec = ServiceSpec::new("sglang", &self.start_script);
        spec.ready_pattern = (!self.no_ready_pattern).then(|| self.ready_pattern.clone());
        spec.health_url = (!self.no_health_check).then(|| self.health_url.clone());
        spec.timeout_secs = self.timeout;
        spec.poll_interval_secs = self.poll_interval;
        spec.settle_secs = self.settle;
        spec.test_scripts = self
            .test_scripts
            .iter()
            .map(TestScript::unnamed)
            .collect();
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_sweep_flags_override_config() {
        let cli = Cli::parse_from([
            "sgl-harness",
            "sweep",
            "--concurrency",
            "64,8,64",
            "--seed",
            "42",
            "--random-input-len",
            "2048",
            "--output-file",
            "out/{model}.jsonl",
        ]);
        let Command::Sweep(flags) = cli.command else {
            panic!("expected sweep");
        };

        let mut config = HarnessConfig::default();
        flags.apply(&mut config).unwrap();
        assert_eq!(config.sweep.concurrency, vec![64, 8, 64]);
        assert_eq!(config.sweep.seed, SeedPolicy::Fixed(42));
        assert_eq!(config.bench.random_input_len, 2048);
        assert_eq!(config.bench.random_output_len, 1024);
        assert_eq!(config.bench.output_file, PathBuf::from("out/{model}.jsonl"));
    }

    #[test]
    fn test_sweep_model_path_names_results() {
        let cli = Cli::parse_from(["sgl-harness", "sweep", "--model-path", "/models/Qwen3-8B"]);
        let Command::Sweep(flags) = cli.command else {
            panic!("expected sweep");
        };

        temp_env::with_var_unset("MODEL_NAME", || {
            let mut config = HarnessConfig::default();
            flags.apply(&mut config).unwrap();
            let config = config.finalize().unwrap();
            assert_eq!(config.bench.model_path, PathBuf::from("/models/Qwen3-8B"));
            assert_eq!(config.bench.output_file, PathBuf::from("results/Qwen3-8B.jsonl"));
            assert_eq!(config.bench_model_name(), "Qwen3-8B");
        });
    }

    #[test]
    fn test_serve_flags_leave_unset_values() {
        let cli = Cli::parse_from([
            "sgl-harness",
            "--config",
            "harness.toml",
            "serve",
            "--tp-size",
            "4",
            "--alt-attention-kernels",
            "--trust-remote-code",
            "false",
            "--dry-run",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("harness.toml")));
        let Command::Serve(flags) = cli.command else {
            panic!("expected serve");
        };
        assert!(flags.dry_run);

        let mut config = HarnessConfig::default();
        flags.server.apply(&mut config);
        assert_eq!(config.server.tp_size, 4);
        assert!(config.server.alt_attention_kernels);
        assert!(!config.server.trust_remote_code);
        assert_eq!(config.server.mem_fraction_static, Some(0.9));
        assert_eq!(config.server.port, 30000);
    }

    #[test]
    fn test_supervise_defaults() {
        let cli = Cli::parse_from([
            "sgl-harness",
            "supervise",
            "--start-script",
            "bash start.sh",
            "--test-scripts",
            "bash a.sh",
            "bash b.sh",
        ]);
        let Command::Supervise(flags) = cli.command else {
            panic!("expected supervise");
        };
        let spec = flags.service_spec();
        assert_eq!(spec.health_url.as_deref(), Some(DEFAULT_HEALTH_URL));
        assert_eq!(spec.ready_pattern.as_deref(), Some(SGLANG_READY_PATTERN));
        assert_eq!(spec.timeout_secs, 300);
        assert_eq!(spec.test_scripts.len(), 2);
        assert_eq!(spec.test_scripts[1].name, "bash b.sh");
    }

    #[test]
    fn test_supervise_without_checks() {
        let cli = Cli::parse_from([
            "sgl-harness",
            "supervise",
            "--start-script",
            "x",
            "--test-scripts",
            "y",
            "--no-health-check",
            "--no-ready-pattern",
        ]);
        let Command::Supervise(flags) = cli.command else {
            panic!("expected supervise");
        };
        let spec = flags.service_spec();
        assert!(spec.health_url.is_none());
        assert!(spec.ready_pattern.is_none());
    }
}
