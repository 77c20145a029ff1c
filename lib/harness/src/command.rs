// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! A process invocation as plain data.
//!
//! Both the server launcher and the benchmark sweep build a [`CommandSpec`] from their flag
//! tables. Keeping the invocation as a value makes it printable for `--dry-run` and lets tests
//! assert on the exact argument vector without spawning anything.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment for the child, on top of the inherited environment
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        CommandSpec {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// `sh -c <script>`, the equivalent of running a script line through a shell.
    pub fn shell(script: impl Into<String>) -> Self {
        let mut spec = CommandSpec::new("sh");
        spec.arg("-c").arg(script);
        spec
    }

    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    /// `--name value`
    pub fn flag(&mut self, name: &str, value: impl ToString) -> &mut Self {
        self.args.push(name.to_string());
        self.args.push(value.to_string());
        self
    }

    /// `--name value` only when the value is set.
    pub fn flag_opt<T: ToString>(&mut self, name: &str, value: Option<T>) -> &mut Self {
        if let Some(value) = value {
            self.flag(name, value);
        }
        self
    }

    /// Bare `--name` only when `on` is true.
    pub fn toggle(&mut self, name: &str, on: bool) -> &mut Self {
        if on {
            self.args.push(name.to_string());
        }
        self
    }

    pub fn env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Value following `name` in the argument list, if present.
    pub fn value_of(&self, name: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == name)
            .and_then(|idx| self.args.get(idx + 1))
            .map(String::as_str)
    }

    pub fn has_arg(&self, name: &str) -> bool {
        self.args.iter().any(|a| a == name)
    }

    /// Build a tokio command. On Unix the child leads a new process group so that
    /// [`crate::process::ManagedChild`] can signal everything it forks.
    pub fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args).envs(&self.env).kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let tokens = self
            .env
            .iter()
            .map(|(k, v)| Cow::Owned(format!("{k}={}", quote(v))))
            .chain(std::iter::once(quote(&self.program)))
            .chain(self.args.iter().map(|a| quote(a)));
        for token in tokens {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            f.write_str(&token)?;
        }
        Ok(())
    }
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | ':' | '=' | ',' | '-')
}

/// Single-quote a token for POSIX shells when it contains anything outside the safe set.
fn quote(token: &str) -> Cow<'_, str> {
    if !token.is_empty() && token.chars().all(is_shell_safe) {
        Cow::Borrowed(token)
    } else {
        Cow::Owned(format!("'{}'", token.replace('\'', r"'\''")))
    }
}
