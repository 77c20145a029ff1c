// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Configuration utilities shared by the harness library and CLI.
//!
//! Truthy environment parsing lives here together with the names of every
//! environment variable the harness reads or exports, see [`environment_names`].

pub mod environment_names;

/// Check if a string is truthy.
///
/// Truthy values: "1", "true", "on", "yes" (case-insensitive). Anything else is `false`.
pub fn is_truthy(val: &str) -> bool {
    matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "on" | "yes")
}

/// Check if an environment variable is set to a truthy value.
pub fn env_is_truthy(env: &str) -> bool {
    match std::env::var(env) {
        Ok(val) => is_truthy(val.as_str()),
        Err(_) => false,
    }
}

/// Read an environment variable, treating an empty value the same as an unset one.
pub fn env_non_empty(env: &str) -> Option<String> {
    match std::env::var(env) {
        Ok(val) if !val.trim().is_empty() => Some(val),
        _ => None,
    }
}
