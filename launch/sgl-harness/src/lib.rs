// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;
use std::process::{ExitCode, ExitStatus};

use anyhow::Context as _;
use sgl_harness::suites::{self, Report};
use sgl_harness::sweep::{SweepPlan, run_sweep};
use sgl_harness::{CancellationToken, HarnessConfig, Supervisor, convert, server, trace};

mod flags;
pub use flags::{Cli, Command};

pub async fn run(cli: Cli, cancel: CancellationToken) -> anyhow::Result<ExitCode> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Serve(flags) => {
            let mut config = HarnessConfig::extract(config_path)?;
            flags.server.apply(&mut config);
            let config = config.finalize()?;

            if flags.dry_run {
                println!("{}", config.server.to_command_spec());
                return Ok(ExitCode::SUCCESS);
            }
            let status = server::launch(&config.server, &cancel).await?;
            Ok(exit_code_of(status))
        }

        Command::Sweep(flags) => {
            let mut config = HarnessConfig::extract(config_path)?;
            flags.apply(&mut config)?;
            let config = config.finalize()?;
            let model_name = config.bench_model_name();
            let plan = SweepPlan::new(config.bench, config.sweep, model_name);

            if flags.dry_run {
                let mut seeds = plan.seeds();
                for step in plan.steps() {
                    println!("{}", plan.command_for(step, seeds.next_seed()));
                }
                return Ok(ExitCode::SUCCESS);
            }

            let report = run_sweep(&plan, &cancel).await?;
            for step in report.failed() {
                tracing::error!(
                    concurrency = step.concurrency,
                    exit_code = ?step.exit_code,
                    log_file = ?step.log_file,
                    "Benchmark level failed"
                );
            }
            tracing::info!(
                levels = report.steps.len(),
                failed = report.failed().count(),
                results = %plan.bench().output_file.display(),
                "Sweep finished"
            );
            Ok(success_code(report.all_succeeded()))
        }

        Command::Convert { inputs } => {
            for input in &inputs {
                let (output, rows) = convert::convert_file(input)
                    .with_context(|| format!("Failed to convert {}", input.display()))?;
                println!("{} -> {} ({rows} rows)", input.display(), output.display());
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Supervise(flags) => {
            let supervisor = Supervisor::new(flags.service_spec())?;
            let outcome = supervisor.run(&cancel).await;
            let report = Report::new(vec![outcome]);
            if let Some(path) = &flags.report {
                report.write(path)?;
            }
            Ok(success_code(report.all_succeeded()))
        }

        Command::Suites {
            config_file,
            parallel,
            report,
        } => {
            let specs = suites::load_suites(&config_file)?;
            tracing::info!(
                suites = specs.len(),
                mode = if parallel { "parallel" } else { "serial" },
                "Starting test suites"
            );
            let result = if parallel {
                suites::run_parallel(specs, &cancel).await
            } else {
                suites::run_serial(specs, &cancel).await
            };
            if let Some(path) = &report {
                // a report that cannot be written does not change the verdict
                if let Err(err) = result.write(path) {
                    tracing::error!(%err, "Failed to save test report");
                }
            }
            Ok(success_code(result.all_succeeded()))
        }

        Command::Kernels {
            trace_file,
            top,
            json,
        } => {
            print_kernels(&trace_file, top, json)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_kernels(path: &Path, top: Option<usize>, json: bool) -> anyhow::Result<()> {
    let mut stats = trace::analyze_kernel_events(path)?;
    if let Some(top) = top {
        stats.truncate(top);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    if stats.is_empty() {
        println!("No kernel events found");
        return Ok(());
    }

    let rule = "-".repeat(120);
    println!("{} kernels:", stats.len());
    println!("{rule}");
    for (i, stat) in stats.iter().enumerate() {
        println!("{}. Kernel: {}", i + 1, stat.display_name());
        println!("   Total: {} us", stat.total_duration_us);
        println!("   Count: {}", stat.count);
        println!("   Average: {} us", stat.avg_duration_us);
        println!("{rule}");
    }
    Ok(())
}

fn success_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn exit_code_of(status: ExitStatus) -> ExitCode {
    ExitCode::from(exit_value(status))
}

/// The server's own exit code; `128 + signal` when it was killed by a signal.
fn exit_value(status: ExitStatus) -> u8 {
    if let Some(code) = status.code() {
        return code.clamp(0, 255) as u8;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return (128 + signal).clamp(0, 255) as u8;
        }
    }
    1
}
