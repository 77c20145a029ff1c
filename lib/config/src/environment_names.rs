// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Environment variable name constants.
//!
//! ## Organization
//!
//! - **Logging**: log filter, format and timestamp settings
//! - **Harness**: configuration file location and the prefix for layered settings
//! - **Model**: variables shared with the operator's shell scripts
//! - **Server**: variables exported into the inference server process

/// Logging environment variables
pub mod logging {
    /// Log filter (e.g., "debug", "sgl_harness=trace,info")
    pub const SGLH_LOG: &str = "SGLH_LOG";

    /// Path to a TOML logging configuration file
    pub const SGLH_LOGGING_CONFIG_PATH: &str = "SGLH_LOGGING_CONFIG_PATH";

    /// Enable JSONL logging format
    pub const SGLH_LOGGING_JSONL: &str = "SGLH_LOGGING_JSONL";

    /// Disable ANSI terminal colors in logs
    pub const SGLH_DISABLE_ANSI_LOGGING: &str = "SGLH_DISABLE_ANSI_LOGGING";

    /// Use local timezone for logging timestamps (default is UTC)
    pub const SGLH_LOG_USE_LOCAL_TZ: &str = "SGLH_LOG_USE_LOCAL_TZ";
}

/// Harness configuration environment variables
pub mod harness {
    /// Prefix for layered configuration, nested keys are separated by `__`
    /// (e.g. `SGLH_SERVER__PORT`)
    pub const PREFIX: &str = "SGLH_";

    /// Path to a TOML configuration file, same as `--config`
    pub const SGLH_CONFIG_PATH: &str = "SGLH_CONFIG_PATH";
}

/// Model variables
pub mod model {
    /// Name of the model under test. Used as the served model name and substituted
    /// for `{model}` in result and log paths.
    pub const MODEL_NAME: &str = "MODEL_NAME";
}

/// Variables exported to the inference server
pub mod server {
    /// Switches the server onto its alternate attention kernel backend
    pub const SGLANG_USE_AITER: &str = "SGLANG_USE_AITER";
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_no_duplicate_env_var_names() {
        let mut seen = HashSet::new();
        let vars = [
            logging::SGLH_LOG,
            logging::SGLH_LOGGING_CONFIG_PATH,
            logging::SGLH_LOGGING_JSONL,
            logging::SGLH_DISABLE_ANSI_LOGGING,
            logging::SGLH_LOG_USE_LOCAL_TZ,
            harness::SGLH_CONFIG_PATH,
            model::MODEL_NAME,
            server::SGLANG_USE_AITER,
        ];

        for var in &vars {
            if !seen.insert(var) {
                panic!("Duplicate environment variable name: {}", var);
            }
        }
    }

    #[test]
    fn test_naming_conventions() {
        assert!(logging::SGLH_LOG.starts_with(harness::PREFIX));
        assert!(logging::SGLH_LOGGING_JSONL.starts_with(harness::PREFIX));
        assert!(harness::SGLH_CONFIG_PATH.starts_with(harness::PREFIX));
        assert!(server::SGLANG_USE_AITER.starts_with("SGLANG_"));
    }
}
