// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Inference server launcher.
//!
//! [`ServerArgs`] is the flag table for `sglang.launch_server`. Unset optional flags are left
//! off the command line entirely so the server falls back to its own defaults.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitStatus;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use sgl_harness_config::environment_names::server as env_server;
use tokio_util::sync::CancellationToken;
use validator::Validate;

use crate::command::CommandSpec;
use crate::process::{DEFAULT_STOP_GRACE, ManagedChild, OutputMode};

pub const DEFAULT_PYTHON: &str = "python3";
pub const DEFAULT_MODEL_PATH: &str = "/models/DeepSeek-R1";
pub const DEFAULT_PORT: u16 = 30000;
const DEFAULT_HOST: &str = "0.0.0.0";
const LAUNCH_MODULE: &str = "sglang.launch_server";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate, Builder)]
#[builder(
    default,
    setter(into),
    build_fn(private, name = "build_internal"),
    derive(Debug)
)]
#[serde(default)]
pub struct ServerArgs {
    /// Python interpreter used to run the server module
    pub python: String,

    pub model_path: PathBuf,

    pub host: String,

    #[validate(range(min = 1))]
    pub port: u16,

    /// Name exposed on the OpenAI API. Falls back to `MODEL_NAME` when unset.
    #[builder(setter(into, strip_option))]
    pub served_model_name: Option<String>,

    /// Tensor parallel degree
    #[validate(range(min = 1))]
    pub tp_size: u32,

    /// Data parallel degree
    #[validate(range(min = 1))]
    #[builder(setter(into, strip_option))]
    pub dp_size: Option<u32>,

    /// Expert parallel MoE
    pub enable_ep_moe: bool,

    #[builder(setter(into, strip_option))]
    pub chunked_prefill_size: Option<u32>,

    #[builder(setter(into, strip_option))]
    pub max_prefill_tokens: Option<u32>,

    #[builder(setter(into, strip_option))]
    pub context_length: Option<u32>,

    #[validate(range(min = 1))]
    #[builder(setter(into, strip_option))]
    pub max_running_requests: Option<u32>,

    /// Fraction of device memory reserved for weights and KV cache
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    #[builder(setter(into, strip_option))]
    pub mem_fraction_static: Option<f64>,

    #[validate(range(min = 1))]
    #[builder(setter(into, strip_option))]
    pub page_size: Option<u32>,

    pub disable_radix_cache: bool,

    #[builder(setter(into, strip_option))]
    pub attention_backend: Option<String>,

    pub enable_torch_compile: bool,

    pub disable_cuda_graph: bool,

    pub trust_remote_code: bool,

    /// Export `SGLANG_USE_AITER=1` to the server
    pub alt_attention_kernels: bool,

    /// Additional environment for the server process
    pub env: BTreeMap<String, String>,
}

impl Default for ServerArgs {
    fn default() -> Self {
        ServerArgs {
            python: DEFAULT_PYTHON.to_string(),
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            served_model_name: None,
            tp_size: 8,
            dp_size: None,
            enable_ep_moe: false,
            chunked_prefill_size: Some(16384),
            max_prefill_tokens: None,
            context_length: None,
            max_running_requests: Some(128),
            mem_fraction_static: Some(0.9),
            page_size: None,
            disable_radix_cache: false,
            attention_backend: None,
            enable_torch_compile: false,
            disable_cuda_graph: false,
            trust_remote_code: true,
            alt_attention_kernels: false,
            env: BTreeMap::new(),
        }
    }
}

impl ServerArgsBuilder {
    /// Build and validate the server arguments
    pub fn build(&self) -> anyhow::Result<ServerArgs> {
        let args = self.build_internal()?;
        args.validate()?;
        Ok(args)
    }
}

impl ServerArgs {
    pub fn builder() -> ServerArgsBuilder {
        ServerArgsBuilder::default()
    }

    /// Render the `launch_server` invocation. Flag order is fixed.
    pub fn to_command_spec(&self) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.python);
        spec.arg("-m")
            .arg(LAUNCH_MODULE)
            .flag("--model-path", self.model_path.display())
            .flag("--host", &self.host)
            .flag("--port", self.port)
            .flag_opt("--served-model-name", self.served_model_name.as_deref())
            .flag("--tp-size", self.tp_size)
            .flag_opt("--dp-size", self.dp_size)
            .toggle("--enable-ep-moe", self.enable_ep_moe)
            .flag_opt("--chunked-prefill-size", self.chunked_prefill_size)
            .flag_opt("--max-prefill-tokens", self.max_prefill_tokens)
            .flag_opt("--context-length", self.context_length)
            .flag_opt("--max-running-requests", self.max_running_requests)
            .flag_opt("--mem-fraction-static", self.mem_fraction_static)
            .flag_opt("--page-size", self.page_size)
            .toggle("--disable-radix-cache", self.disable_radix_cache)
            .flag_opt("--attention-backend", self.attention_backend.as_deref())
            .toggle("--enable-torch-compile", self.enable_torch_compile)
            .toggle("--disable-cuda-graph", self.disable_cuda_graph)
            .toggle("--trust-remote-code", self.trust_remote_code);

        if self.alt_attention_kernels {
            spec.env(env_server::SGLANG_USE_AITER, "1");
        }
        for (key, value) in &self.env {
            spec.env(key, value);
        }
        spec
    }

    /// `http://host:port` as seen from a client on the same machine.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", client_host(&self.host), self.port)
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.base_url())
    }
}

/// Wildcard bind addresses are not connectable, use loopback instead.
pub fn client_host(host: &str) -> &str {
    match host {
        "0.0.0.0" | "" => "127.0.0.1",
        "::" | "[::]" => "[::1]",
        other => other,
    }
}

/// Run the server in the foreground until it exits or `cancel` fires.
/// The exit status is returned as-is; nothing about it is interpreted here.
pub async fn launch(args: &ServerArgs, cancel: &CancellationToken) -> anyhow::Result<ExitStatus> {
    let spec = args.to_command_spec();
    tracing::info!(
        command = %spec,
        url = %args.base_url(),
        health = %args.health_url(),
        "Launching inference server"
    );

    let mut child = ManagedChild::spawn("sglang-server", &spec, OutputMode::Inherit)?;
    let status = child.wait_or_cancel(cancel, DEFAULT_STOP_GRACE).await?;

    if status.success() {
        tracing::info!(%status, "Inference server exited");
    } else {
        tracing::warn!(%status, "Inference server exited with failure");
    }
    Ok(status)
}
