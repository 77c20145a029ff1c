// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use sgl_harness_config::env_non_empty;
use sgl_harness_config::environment_names::{harness as env_harness, model as env_model};
use validator::Validate;

use crate::server::ServerArgs;
use crate::sweep::{BenchArgs, SweepSettings};

/// System-wide configuration file, read when present
pub const SYSTEM_CONFIG_PATH: &str = "/etc/sgl-harness/harness.toml";

/// Placeholder in result and log paths replaced by the model name
pub const MODEL_PLACEHOLDER: &str = "{model}";

const DEFAULT_MODEL_NAME: &str = "model";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HarnessConfig {
    #[validate(nested)]
    pub server: ServerArgs,

    #[validate(nested)]
    pub bench: BenchArgs,

    #[validate(nested)]
    pub sweep: SweepSettings,
}

impl HarnessConfig {
    /// Layered configuration: defaults, the system file, `config_path` (or `SGLH_CONFIG_PATH`),
    /// then `SGLH_*` environment variables. Nested keys use `__`, so `SGLH_SERVER__PORT`
    /// sets `server.port`.
    pub fn figment(config_path: Option<&Path>) -> Figment {
        let mut figment = Figment::new()
            .merge(Serialized::defaults(HarnessConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH));

        if let Some(path) = config_path
            .map(Path::to_path_buf)
            .or_else(|| env_non_empty(env_harness::SGLH_CONFIG_PATH).map(PathBuf::from))
        {
            figment = figment.merge(Toml::file(path));
        }

        figment.merge(
            Env::prefixed(env_harness::PREFIX)
                .filter_map(|k| {
                    let full_key = format!("{}{}", env_harness::PREFIX, k.as_str());
                    // filters out empty environment variables
                    match std::env::var(&full_key) {
                        Ok(v) if !v.is_empty() => Some(k.into()),
                        _ => None,
                    }
                })
                .split("__"),
        )
    }

    /// Load, resolve `{model}` placeholders, and validate.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        Self::extract(config_path)?.finalize()
    }

    /// Layered values only, nothing resolved or validated. Use this when more overrides are
    /// applied before [`HarnessConfig::finalize`].
    ///
    /// An explicit config file that does not exist is an error; the system file is optional.
    pub fn extract(config_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = config_path.filter(|p| !p.exists()) {
            anyhow::bail!("Config file {} does not exist", path.display());
        }
        Self::figment(config_path)
            .extract()
            .context("Failed to load harness configuration")
    }

    pub fn finalize(mut self) -> Result<Self> {
        self.resolve();
        self.validate()?;
        Ok(self)
    }

    /// Name of the served model: `server.served_model_name`, then `MODEL_NAME`, then the last
    /// component of `server.model_path`.
    pub fn model_name(&self) -> String {
        self.server
            .served_model_name
            .clone()
            .or_else(|| env_non_empty(env_model::MODEL_NAME))
            .or_else(|| file_name(&self.server.model_path))
            .unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string())
    }

    /// Name of the benchmarked model, used in result and log file names.
    ///
    /// Same as [`HarnessConfig::model_name`] while the benchmark targets the server's model.
    /// Otherwise `MODEL_NAME`, then the last component of `bench.model_path`.
    pub fn bench_model_name(&self) -> String {
        if self.bench.model_path == self.server.model_path {
            return self.model_name();
        }
        env_non_empty(env_model::MODEL_NAME)
            .or_else(|| file_name(&self.bench.model_path))
            .unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string())
    }

    /// Fill the served model name from `MODEL_NAME` and expand `{model}` in the result file and
    /// the log directory. Calling it twice is harmless.
    pub fn resolve(&mut self) {
        if self.server.served_model_name.is_none() {
            self.server.served_model_name = env_non_empty(env_model::MODEL_NAME);
        }
        let model = self.bench_model_name();
        self.bench.output_file = expand_model(&self.bench.output_file, &model);
        if let Some(dir) = self.sweep.log_dir.as_mut() {
            *dir = expand_model(dir, &model);
        }
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

fn expand_model(path: &Path, model: &str) -> PathBuf {
    let raw = path.to_string_lossy();
    if raw.contains(MODEL_PLACEHOLDER) {
        PathBuf::from(raw.replace(MODEL_PLACEHOLDER, model))
    } else {
        path.to_path_buf()
    }
}
