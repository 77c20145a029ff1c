// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tooling around an SGLang inference server: launch it with a fixed flag table, sweep
//! `bench_serving` over concurrency levels, convert the JSONL results to CSV, supervise a
//! service while test scripts run against it, and summarise profiler kernel traces.

pub mod command;
pub mod config;
pub mod convert;
pub mod logging;
pub mod process;
pub mod server;
pub mod suites;
pub mod supervisor;
pub mod sweep;
pub mod trace;

pub use command::CommandSpec;
pub use config::HarnessConfig;
pub use server::ServerArgs;
pub use supervisor::{ServiceSpec, SuiteOutcome, Supervisor};
pub use sweep::{BenchArgs, SeedPolicy, SeedSequence, SweepPlan, SweepReport, SweepSettings};

pub use tokio_util::sync::CancellationToken;
